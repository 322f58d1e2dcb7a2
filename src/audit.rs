use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    fs_secure::{create_private_file_if_missing, set_permissions, PRIVATE_FILE_MODE},
    types::VaultId,
};

/// Vault lifecycle events recorded in the audit log.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Existing gocryptfs directory was registered.
    VaultAdded {
        /// Vault id.
        vault_id: VaultId,
        /// Encrypted directory.
        path: PathBuf,
    },
    /// New gocryptfs directory was initialized and registered.
    VaultCreated {
        /// Vault id.
        vault_id: VaultId,
        /// Encrypted directory.
        path: PathBuf,
    },
    /// Vault record was removed.
    VaultRemoved {
        /// Vault id.
        vault_id: VaultId,
    },
    /// Mount process survived the readiness window.
    VaultUnlocked {
        /// Vault id.
        vault_id: VaultId,
        /// Mountpoint in use.
        mountpoint: String,
    },
    /// Mount process failed during the readiness window.
    VaultUnlockFailed {
        /// Vault id.
        vault_id: VaultId,
        /// Failure message.
        reason: String,
    },
    /// Lock was requested for a running mount.
    VaultLocked {
        /// Vault id.
        vault_id: VaultId,
    },
    /// Auto-reveal, read-only, or mountpoint options changed.
    VaultOptionsUpdated {
        /// Vault id.
        vault_id: VaultId,
    },
    /// Password was changed using the old password.
    VaultPasswordChanged {
        /// Vault id.
        vault_id: VaultId,
    },
    /// Password was reset using the master key.
    VaultPasswordReset {
        /// Vault id.
        vault_id: VaultId,
    },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct AuditLine {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: AuditEvent,
}

/// JSONL append-only audit log writer.
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// Opens (creating if missing) the audit log at `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let file_path = path.as_ref().to_path_buf();
        create_private_file_if_missing(&file_path, b"")?;
        set_permissions(&file_path, PRIVATE_FILE_MODE)?;
        Ok(Self { path: file_path })
    }

    /// Appends one event as a JSON line.
    pub fn log(&self, event: AuditEvent) -> Result<()> {
        let line = AuditLine {
            timestamp: Utc::now(),
            event,
        };

        let mut encoded = serde_json::to_vec(&line)?;
        encoded.push(b'\n');
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(&encoded)?;
        Ok(())
    }

    /// Appends one event, logging instead of failing on I/O errors.
    pub fn record(&self, event: AuditEvent) {
        if let Err(error) = self.log(event) {
            tracing::warn!(path = %self.path.display(), %error, "failed to append audit event");
        }
    }

    /// Reads every event back in append order.
    pub fn events(&self) -> Result<Vec<(DateTime<Utc>, AuditEvent)>> {
        let raw = std::fs::read_to_string(&self.path)?;
        let mut events = Vec::new();
        for line in raw.lines().filter(|line| !line.trim().is_empty()) {
            let parsed = serde_json::from_str::<AuditLine>(line)?;
            events.push((parsed.timestamp, parsed.event));
        }
        Ok(events)
    }

    /// Returns the audit file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
