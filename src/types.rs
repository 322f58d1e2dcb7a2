use std::path::PathBuf;

use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};

/// Store-assigned vault identifier.
pub type VaultId = i64;

/// One registered vault record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vault {
    /// Store-assigned identifier.
    pub id: VaultId,
    /// Encrypted (cipher) directory holding `gocryptfs.conf`.
    pub path: PathBuf,
    /// Persisted mountpoint; empty means one is generated per unlock.
    #[serde(default)]
    pub mountpoint: String,
    /// Open the mountpoint in the file manager after unlock.
    #[serde(default)]
    pub autoreveal: bool,
    /// Mount read-only.
    #[serde(default)]
    pub readonly: bool,
}

impl Vault {
    /// Returns the path of this vault's `gocryptfs.conf`.
    pub fn conf_path(&self) -> PathBuf {
        self.path.join(GOCRYPTFS_CONF_FILE)
    }
}

/// Name of the gocryptfs configuration file inside a vault directory.
pub const GOCRYPTFS_CONF_FILE: &str = "gocryptfs.conf";

/// Field values for a vault record that does not exist yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewVault {
    /// Encrypted directory.
    pub path: PathBuf,
    /// Initial mountpoint.
    pub mountpoint: String,
    /// Initial auto-reveal flag.
    pub autoreveal: bool,
    /// Initial read-only flag.
    pub readonly: bool,
}

/// Partial update for a locked vault's options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultOptions {
    /// New auto-reveal flag.
    pub autoreveal: Option<bool>,
    /// New read-only flag.
    pub readonly: Option<bool>,
    /// New mountpoint; an empty string clears it.
    pub mountpoint: Option<String>,
}

/// Observable mount state of a vault.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VaultState {
    /// No mount process is running.
    Locked,
    /// A mount process is running.
    Unlocked,
}

impl VaultState {
    /// Returns the wire label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Locked => "locked",
            Self::Unlocked => "unlocked",
        }
    }
}

impl std::fmt::Display for VaultState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A vault record together with its current state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultInfo {
    /// Stored record.
    #[serde(flatten)]
    pub vault: Vault,
    /// Current state.
    pub state: VaultState,
    /// Mountpoint in use while unlocked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_mountpoint: Option<String>,
}

/// Redacting wrapper for passwords and master keys.
pub struct Password {
    inner: Secret<String>,
}

impl Password {
    /// Wraps a secret string.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            inner: Secret::new(value.into()),
        }
    }

    /// Exposes the secret text to a closure.
    pub fn expose<F, R>(&self, function: F) -> R
    where
        F: FnOnce(&str) -> R,
    {
        function(self.inner.expose_secret())
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Password([REDACTED])")
    }
}
