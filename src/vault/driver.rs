//! Argument construction and one-shot invocations of the gocryptfs tools.

use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};

use chrono::Utc;

use crate::{
    error::{CloakError, Result},
    types::{Password, Vault, GOCRYPTFS_CONF_FILE},
};

use super::{
    exit_code::{classify_exit, MountOperation},
    locator::{resolve_binary, GOCRYPTFS_BINARY, GOCRYPTFS_XRAY_BINARY},
    process::run_with_stdin,
};

const CONF_BACKUP_SUFFIX: &str = ".bak";
const BACKUP_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f UTC";

/// Resolved gocryptfs executables.
///
/// A missing binary is not an error until an operation needs it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GocryptfsDriver {
    gocryptfs: Option<PathBuf>,
    xray: Option<PathBuf>,
}

impl GocryptfsDriver {
    /// Resolves both binaries, honoring explicitly configured paths.
    pub fn locate(gocryptfs: Option<&Path>, xray: Option<&Path>) -> Self {
        Self {
            gocryptfs: resolve_binary(gocryptfs, GOCRYPTFS_BINARY),
            xray: resolve_binary(xray, GOCRYPTFS_XRAY_BINARY),
        }
    }

    /// Uses the given binaries as-is.
    pub fn with_binaries(gocryptfs: Option<PathBuf>, xray: Option<PathBuf>) -> Self {
        Self { gocryptfs, xray }
    }

    /// Path of `gocryptfs`, or [`CloakError::MissingGocryptfsBinary`].
    pub fn gocryptfs_binary(&self) -> Result<&Path> {
        self.gocryptfs
            .as_deref()
            .ok_or(CloakError::MissingGocryptfsBinary)
    }

    /// Path of `gocryptfs-xray`, or [`CloakError::MissingXrayBinary`].
    pub fn xray_binary(&self) -> Result<&Path> {
        self.xray.as_deref().ok_or(CloakError::MissingXrayBinary)
    }

    /// Arguments for a foreground mount of `vault` at `mountpoint`.
    pub fn unlock_args(vault: &Vault, mountpoint: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-fg".into()];
        if cfg!(target_os = "macos") {
            let volume_name = vault
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            args.push("-ko".into());
            args.push(format!("volname={volume_name},local,auto_xattr,noappledouble").into());
        }
        if vault.readonly {
            args.push("-ro".into());
        }
        args.push("--".into());
        args.push(vault.path.clone().into_os_string());
        args.push(mountpoint.into());
        args
    }

    /// Runs `gocryptfs -init` on an empty directory.
    pub fn init(&self, cipher_dir: &Path, password: &Password) -> Result<()> {
        let binary = self.gocryptfs_binary()?;
        let args = vec!["-init".into(), "--".into(), cipher_dir.as_os_str().to_owned()];
        let payload = password.expose(|text| Password::new(format!("{text}\n")));
        let report = run_with_stdin(binary, &args, payload, "gocryptfs -init")
            .map_err(|error| map_spawn_error(error, CloakError::MissingGocryptfsBinary))?;
        classify_exit(MountOperation::Create, &report).into_result()
    }

    /// Replaces the password using the current one.
    pub fn change_password(
        &self,
        cipher_dir: &Path,
        old_password: &Password,
        new_password: &Password,
    ) -> Result<()> {
        let binary = self.gocryptfs_binary()?;
        let args = vec!["-passwd".into(), "--".into(), cipher_dir.as_os_str().to_owned()];
        let payload = old_password.expose(|old| {
            new_password.expose(|new| Password::new(format!("{old}\n{new}\n")))
        });
        let report = run_with_stdin(binary, &args, payload, "gocryptfs -passwd")
            .map_err(|error| map_spawn_error(error, CloakError::MissingGocryptfsBinary))?;
        classify_exit(MountOperation::ChangePassword, &report).into_result()
    }

    /// Replaces the password using the master key.
    ///
    /// gocryptfs leaves the previous config at `gocryptfs.conf.bak`; that
    /// file is renamed with a timestamp so a later reset cannot clobber it.
    pub fn reset_password(
        &self,
        cipher_dir: &Path,
        masterkey: &Password,
        new_password: &Password,
    ) -> Result<()> {
        let binary = self.gocryptfs_binary()?;
        let mut args: Vec<OsString> = vec!["-passwd".into(), "-masterkey".into()];
        masterkey.expose(|key| args.push(key.into()));
        args.push("--".into());
        args.push(cipher_dir.as_os_str().to_owned());
        let payload = new_password.expose(|new| Password::new(format!("{new}\n{new}\n")));
        let report = run_with_stdin(binary, &args, payload, "gocryptfs -passwd -masterkey")
            .map_err(|error| map_spawn_error(error, CloakError::MissingGocryptfsBinary))?;
        classify_exit(MountOperation::ResetPassword, &report).into_result()?;
        rotate_conf_backup(cipher_dir)
    }

    /// Prints the master key with `gocryptfs-xray -dumpmasterkey`.
    pub fn dump_masterkey(&self, cipher_dir: &Path, password: &Password) -> Result<String> {
        let binary = self.xray_binary()?;
        let args = vec![
            "-dumpmasterkey".into(),
            cipher_dir.join(GOCRYPTFS_CONF_FILE).into_os_string(),
        ];
        let payload = password.expose(|text| Password::new(format!("{text}\n")));
        let report = run_with_stdin(binary, &args, payload, "gocryptfs-xray")
            .map_err(|error| map_spawn_error(error, CloakError::MissingXrayBinary))?;
        classify_exit(MountOperation::RevealMasterkey, &report).into_result()?;
        Ok(report.stdout.trim().to_owned())
    }
}

fn map_spawn_error(error: io::Error, missing: CloakError) -> CloakError {
    match error.kind() {
        io::ErrorKind::NotFound => missing,
        io::ErrorKind::BrokenPipe => CloakError::StdinPipe,
        _ => CloakError::ProcessStart(error),
    }
}

/// Renames `gocryptfs.conf.bak` to a timestamped name; a missing backup is fine.
pub fn rotate_conf_backup(cipher_dir: &Path) -> Result<()> {
    let backup = cipher_dir.join(format!("{GOCRYPTFS_CONF_FILE}{CONF_BACKUP_SUFFIX}"));
    let stamped = cipher_dir.join(format!(
        "{GOCRYPTFS_CONF_FILE}{CONF_BACKUP_SUFFIX}.{}",
        Utc::now().format(BACKUP_TIMESTAMP_FORMAT)
    ));
    match fs::rename(&backup, &stamped) {
        Ok(()) => {
            tracing::debug!(backup = %stamped.display(), "kept previous vault configuration");
            Ok(())
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}

#[cfg(test)]
mod unit_tests {
    use std::ffi::OsString;

    use super::{rotate_conf_backup, GocryptfsDriver};
    use crate::{error::CloakError, types::Vault};

    fn vault(readonly: bool) -> Vault {
        Vault {
            id: 1,
            path: "/data/secret".into(),
            mountpoint: String::new(),
            autoreveal: false,
            readonly,
        }
    }

    #[test]
    fn unlock_args_end_with_separator_path_and_mountpoint() {
        let args = GocryptfsDriver::unlock_args(&vault(false), "/tmp/abc");
        assert_eq!(args.first(), Some(&OsString::from("-fg")));
        let tail: Vec<_> = args[args.len() - 3..].to_vec();
        assert_eq!(
            tail,
            vec![
                OsString::from("--"),
                OsString::from("/data/secret"),
                OsString::from("/tmp/abc")
            ]
        );
        assert!(!args.contains(&OsString::from("-ro")));
    }

    #[test]
    fn readonly_adds_ro_before_separator() {
        let args = GocryptfsDriver::unlock_args(&vault(true), "/tmp/abc");
        let ro = args.iter().position(|arg| arg == "-ro").unwrap();
        let separator = args.iter().position(|arg| arg == "--").unwrap();
        assert!(ro < separator);
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn macos_passes_volume_name() {
        let args = GocryptfsDriver::unlock_args(&vault(false), "/Volumes/abc");
        assert!(args.contains(&OsString::from(
            "volname=secret,local,auto_xattr,noappledouble"
        )));
    }

    #[test]
    fn missing_binaries_map_to_their_errors() {
        let driver = GocryptfsDriver::with_binaries(None, None);
        assert!(matches!(
            driver.gocryptfs_binary(),
            Err(CloakError::MissingGocryptfsBinary)
        ));
        assert!(matches!(
            driver.xray_binary(),
            Err(CloakError::MissingXrayBinary)
        ));
    }

    #[test]
    fn rotate_backup_without_backup_is_ok() {
        let temp_dir = tempfile::tempdir().unwrap();
        rotate_conf_backup(temp_dir.path()).unwrap();
    }

    #[test]
    fn rotate_backup_renames_with_timestamp() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(temp_dir.path().join("gocryptfs.conf.bak"), "{}").unwrap();
        rotate_conf_backup(temp_dir.path()).unwrap();

        assert!(!temp_dir.path().join("gocryptfs.conf.bak").exists());
        let names: Vec<String> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("gocryptfs.conf.bak."));
        assert!(names[0].ends_with(" UTC"));
    }
}
