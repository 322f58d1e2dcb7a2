//! Mapping from gocryptfs exit statuses to semantic outcomes.

use crate::error::CloakError;

/// Exit code gocryptfs uses when interrupted by `SIGINT`.
pub const EXIT_INTERRUPTED: i32 = 15;

/// Which gocryptfs invocation produced an exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOperation {
    /// `gocryptfs -init`.
    Create,
    /// `gocryptfs -passwd`.
    ChangePassword,
    /// `gocryptfs -passwd -masterkey`.
    ResetPassword,
    /// `gocryptfs-xray -dumpmasterkey`.
    RevealMasterkey,
    /// Foreground mount.
    Unlock,
}

/// Raw exit status plus captured output of a finished child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code when the child exited normally.
    pub code: Option<i32>,
    /// Terminating signal when the child was killed.
    pub signal: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ExitReport {
    /// Best available diagnostic text for an unclassified failure.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_owned();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_owned();
        }
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(signal)) => format!("terminated by signal {signal}"),
            (None, None) => "process exited without status".to_owned(),
        }
    }
}

/// Semantic outcome of one finished child.
#[derive(Debug)]
pub enum ExitClassification {
    /// Exit code 0.
    Success,
    /// Deliberate shutdown via `SIGINT` during unlock.
    Interrupted,
    /// A failure listed in the exit-code table.
    Failure(CloakError),
    /// Any other status, carrying the captured diagnostic.
    Unknown(String),
}

impl ExitClassification {
    /// Converts into a `Result`, treating anything but success as an error.
    pub fn into_result(self) -> Result<(), CloakError> {
        match self {
            Self::Success => Ok(()),
            Self::Failure(error) => Err(error),
            Self::Interrupted => Err(CloakError::Unknown(format!(
                "process interrupted (exit code {EXIT_INTERRUPTED})"
            ))),
            Self::Unknown(diagnostic) => Err(CloakError::Unknown(diagnostic)),
        }
    }
}

/// Classifies one exit report for the operation that produced it.
pub fn classify_exit(operation: MountOperation, report: &ExitReport) -> ExitClassification {
    let Some(code) = report.code else {
        return ExitClassification::Unknown(report.diagnostic());
    };
    if code == 0 {
        return ExitClassification::Success;
    }

    let failure = match (operation, code) {
        (MountOperation::Create, 6) => Some(CloakError::VaultDirNotEmpty),
        (MountOperation::Create, 22) => Some(CloakError::VaultPasswordEmpty),
        (MountOperation::Create, 24) => Some(CloakError::VaultInitConfFailed),
        (
            MountOperation::ChangePassword
            | MountOperation::ResetPassword
            | MountOperation::RevealMasterkey
            | MountOperation::Unlock,
            12,
        ) => Some(CloakError::WrongPassword),
        (
            MountOperation::ChangePassword
            | MountOperation::ResetPassword
            | MountOperation::RevealMasterkey
            | MountOperation::Unlock,
            23,
        ) => Some(CloakError::CantOpenVaultConf),
        (
            MountOperation::ChangePassword
            | MountOperation::ResetPassword
            | MountOperation::RevealMasterkey,
            24,
        ) => Some(CloakError::VaultUpdateConfFailed),
        (MountOperation::Unlock, 10) => Some(CloakError::MountpointNotEmpty),
        (MountOperation::Unlock, EXIT_INTERRUPTED) => return ExitClassification::Interrupted,
        _ => None,
    };

    match failure {
        Some(error) => ExitClassification::Failure(error),
        None => ExitClassification::Unknown(report.diagnostic()),
    }
}

#[cfg(test)]
mod unit_tests {
    use super::{classify_exit, ExitClassification, ExitReport, MountOperation};
    use crate::error::CloakError;

    fn exited(code: i32) -> ExitReport {
        ExitReport {
            code: Some(code),
            ..ExitReport::default()
        }
    }

    fn failure(operation: MountOperation, code: i32) -> CloakError {
        match classify_exit(operation, &exited(code)) {
            ExitClassification::Failure(error) => error,
            other => panic!("expected classified failure for {code}, got {other:?}"),
        }
    }

    #[test]
    fn unlock_table() {
        assert!(matches!(
            failure(MountOperation::Unlock, 10),
            CloakError::MountpointNotEmpty
        ));
        assert!(matches!(
            failure(MountOperation::Unlock, 12),
            CloakError::WrongPassword
        ));
        assert!(matches!(
            failure(MountOperation::Unlock, 23),
            CloakError::CantOpenVaultConf
        ));
        assert!(matches!(
            classify_exit(MountOperation::Unlock, &exited(15)),
            ExitClassification::Interrupted
        ));
    }

    #[test]
    fn create_table() {
        assert!(matches!(
            failure(MountOperation::Create, 6),
            CloakError::VaultDirNotEmpty
        ));
        assert!(matches!(
            failure(MountOperation::Create, 22),
            CloakError::VaultPasswordEmpty
        ));
        assert!(matches!(
            failure(MountOperation::Create, 24),
            CloakError::VaultInitConfFailed
        ));
    }

    #[test]
    fn password_tables_match_for_change_and_reset() {
        for operation in [MountOperation::ChangePassword, MountOperation::ResetPassword] {
            assert!(matches!(failure(operation, 12), CloakError::WrongPassword));
            assert!(matches!(failure(operation, 23), CloakError::CantOpenVaultConf));
            assert!(matches!(
                failure(operation, 24),
                CloakError::VaultUpdateConfFailed
            ));
        }
    }

    #[test]
    fn codes_are_scoped_to_their_operation() {
        assert!(matches!(
            classify_exit(MountOperation::Create, &exited(12)),
            ExitClassification::Unknown(_)
        ));
        assert!(matches!(
            classify_exit(MountOperation::Create, &exited(15)),
            ExitClassification::Unknown(_)
        ));
        assert!(matches!(
            classify_exit(MountOperation::Unlock, &exited(24)),
            ExitClassification::Unknown(_)
        ));
    }

    #[test]
    fn zero_is_success_for_every_operation() {
        for operation in [
            MountOperation::Create,
            MountOperation::ChangePassword,
            MountOperation::ResetPassword,
            MountOperation::RevealMasterkey,
            MountOperation::Unlock,
        ] {
            assert!(matches!(
                classify_exit(operation, &exited(0)),
                ExitClassification::Success
            ));
        }
    }

    #[test]
    fn unknown_prefers_stderr_then_stdout_then_status() {
        let report = ExitReport {
            code: Some(99),
            signal: None,
            stdout: "from stdout".to_owned(),
            stderr: "  from stderr\n".to_owned(),
        };
        match classify_exit(MountOperation::Unlock, &report) {
            ExitClassification::Unknown(text) => assert_eq!(text, "from stderr"),
            other => panic!("unexpected {other:?}"),
        }

        let report = ExitReport {
            stderr: " \n".to_owned(),
            ..report
        };
        match classify_exit(MountOperation::Unlock, &report) {
            ExitClassification::Unknown(text) => assert_eq!(text, "from stdout"),
            other => panic!("unexpected {other:?}"),
        }

        match classify_exit(MountOperation::Unlock, &exited(99)) {
            ExitClassification::Unknown(text) => assert_eq!(text, "exit code 99"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn killed_by_signal_is_unknown() {
        let report = ExitReport {
            code: None,
            signal: Some(9),
            ..ExitReport::default()
        };
        match classify_exit(MountOperation::Unlock, &report) {
            ExitClassification::Unknown(text) => assert_eq!(text, "terminated by signal 9"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn interrupted_into_result_is_an_error() {
        assert!(ExitClassification::Interrupted.into_result().is_err());
        assert!(ExitClassification::Success.into_result().is_ok());
    }
}
