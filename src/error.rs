use std::io;

use thiserror::Error;

use crate::types::VaultState;

/// Top-level application errors.
#[derive(Debug, Error)]
pub enum CloakError {
    /// No vault record exists for the requested id.
    #[error("vault does not exist")]
    VaultNotExist,
    /// The vault already has a running mount process.
    #[error("vault is already unlocked")]
    AlreadyUnlocked,
    /// The vault has no running mount process.
    #[error("vault is already locked")]
    AlreadyLocked,
    /// gocryptfs refused to mount over a non-empty directory.
    #[error("mountpoint is not empty")]
    MountpointNotEmpty,
    /// gocryptfs rejected the supplied password.
    #[error("password incorrect")]
    WrongPassword,
    /// The vault's `gocryptfs.conf` could not be opened for reading.
    #[error("cannot open vault configuration")]
    CantOpenVaultConf,
    /// The vault's `gocryptfs.conf` could not be rewritten.
    #[error("cannot write updated vault configuration")]
    VaultUpdateConfFailed,
    /// Vault initialization target directory is not empty.
    #[error("vault directory is not empty")]
    VaultDirNotEmpty,
    /// Vault initialization was given an empty password.
    #[error("password must not be empty")]
    VaultPasswordEmpty,
    /// Vault initialization could not write its configuration.
    #[error("cannot write vault configuration")]
    VaultInitConfFailed,
    /// The mountpoint directory could not be created.
    #[error("failed to create mountpoint directory")]
    MountpointCreateFailed,
    /// The directory for a new vault could not be created.
    #[error("failed to create vault directory: {0}")]
    VaultMkdirFailed(String),
    /// The `gocryptfs` binary could not be located.
    #[error("required binary not found: gocryptfs")]
    MissingGocryptfsBinary,
    /// The `gocryptfs-xray` binary could not be located.
    #[error("required binary not found: gocryptfs-xray")]
    MissingXrayBinary,
    /// No usable FUSE runtime is installed.
    #[error("FUSE is not available on this system")]
    MissingFuse,
    /// A user-supplied path does not exist.
    #[error("path does not exist")]
    PathNotExist,
    /// The child process could not be spawned.
    #[error("failed to start process: {0}")]
    ProcessStart(#[source] io::Error),
    /// The child process stdin pipe could not be opened.
    #[error("failed to open process input pipe")]
    StdinPipe,
    /// A tool failed in a way the exit-code table does not cover.
    #[error("unknown error: {0}")]
    Unknown(String),
    /// Input was syntactically valid but semantically unsupported.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// JSON serialization error.
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// A typed result used across the crate.
pub type Result<T> = std::result::Result<T, CloakError>;

/// A coordinator failure paired with the vault state observed when it failed.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct StatefulError {
    /// Vault state after the failed operation.
    pub state: VaultState,
    /// Underlying failure.
    #[source]
    pub error: CloakError,
}

impl StatefulError {
    /// Tags `error` with the given vault state.
    pub fn new(state: VaultState, error: CloakError) -> Self {
        Self { state, error }
    }

    /// Tags `error` with the locked state.
    pub fn locked(error: CloakError) -> Self {
        Self::new(VaultState::Locked, error)
    }
}

impl From<StatefulError> for CloakError {
    fn from(value: StatefulError) -> Self {
        value.error
    }
}

/// Generic invalid-input error.
pub const ERROR_CODE_INVALID_INPUT: &str = "E100";
/// Missing runtime dependency, binary, or FUSE.
pub const ERROR_CODE_MISSING_RUNTIME: &str = "E103";
/// Vault id lookup failed.
pub const ERROR_CODE_NOT_FOUND: &str = "E200";
/// User-supplied path does not exist.
pub const ERROR_CODE_PATH_NOT_EXIST: &str = "E201";
/// Vault is already unlocked.
pub const ERROR_CODE_ALREADY_UNLOCKED: &str = "E300";
/// Vault is already locked.
pub const ERROR_CODE_ALREADY_LOCKED: &str = "E301";
/// Password rejected by gocryptfs.
pub const ERROR_CODE_WRONG_PASSWORD: &str = "E400";
/// Mountpoint directory is not usable.
pub const ERROR_CODE_MOUNTPOINT: &str = "E401";
/// Vault configuration could not be read or written.
pub const ERROR_CODE_VAULT_CONF: &str = "E402";
/// Vault initialization was rejected.
pub const ERROR_CODE_VAULT_INIT: &str = "E403";
/// Child process could not be started.
pub const ERROR_CODE_PROCESS: &str = "E404";
/// Tool failed with an unclassified exit status.
pub const ERROR_CODE_UNKNOWN_TOOL_FAILURE: &str = "E499";
/// Filesystem or stream I/O failed.
pub const ERROR_CODE_IO: &str = "E900";
/// Internal serialization failure.
pub const ERROR_CODE_INTERNAL: &str = "E999";

const ERROR_EXPLANATION_E100: &str = r#"E100 invalid input

The request was well-formed but one of its values is unsupported.

Common fixes:
  - Run `cloak help <command>` for exact argument usage.
  - Check `.cloak.toml` with `cloak config validate`."#;
const ERROR_EXPLANATION_E103: &str = r#"E103 missing runtime dependency

A required binary or the FUSE runtime was not found.

Recovery:
  - Install gocryptfs (and gocryptfs-xray for master key export).
  - Install FUSE (`fusermount` on Linux, macFUSE on macOS).
  - Or pin binaries in `.cloak.toml` under `[binaries]`."#;
const ERROR_EXPLANATION_E200: &str = r#"E200 vault not found

No vault is registered under the given id.

Recovery:
  cloak vault list"#;
const ERROR_EXPLANATION_E201: &str = r#"E201 path does not exist

The path passed to `vault add` does not point at a gocryptfs vault.

Recovery:
  - Pass the vault's `gocryptfs.conf` or the directory containing it."#;
const ERROR_EXPLANATION_E300: &str = r#"E300 vault already unlocked

The vault has a running mount process.

Recovery:
  cloak vault lock <id>"#;
const ERROR_EXPLANATION_E301: &str = r#"E301 vault already locked

The vault has no running mount process."#;
const ERROR_EXPLANATION_E400: &str = r#"E400 password incorrect

gocryptfs rejected the password for this vault.

Recovery:
  - Retry with the correct password.
  - If the password is lost, reset it with the master key:
    cloak vault reset-password <id> --masterkey <key>"#;
const ERROR_EXPLANATION_E401: &str = r#"E401 mountpoint unusable

The mountpoint is not empty or could not be created.

Recovery:
  - Empty the configured mountpoint directory.
  - Or clear it so a temporary one is generated:
    cloak vault options <id> --mountpoint ''"#;
const ERROR_EXPLANATION_E402: &str = r#"E402 vault configuration unreadable or unwritable

gocryptfs could not read or rewrite `gocryptfs.conf`.

Recovery:
  - Check permissions of the vault directory and its `gocryptfs.conf`."#;
const ERROR_EXPLANATION_E403: &str = r#"E403 vault initialization rejected

gocryptfs refused to initialize the directory.

Recovery:
  - Use an empty directory and a non-empty password."#;
const ERROR_EXPLANATION_E404: &str = r#"E404 process start failed

The gocryptfs process could not be launched or fed its password."#;
const ERROR_EXPLANATION_E499: &str = r#"E499 unclassified tool failure

gocryptfs exited with a status cloak does not recognize. The message
contains the tool's own diagnostic output."#;
const ERROR_EXPLANATION_E900: &str = r#"E900 I/O failure

Filesystem or stream operations failed.

Recovery:
  - Verify `--root` exists and is writable.
  - Check file permissions and available disk space."#;
const ERROR_EXPLANATION_E999: &str = r#"E999 internal runtime failure

An internal serialization error occurred.

Recovery:
  - Retry once with the same inputs.
  - Inspect `vaults.json` under the runtime root for corruption."#;

const KNOWN_ERROR_CODES: [&str; 14] = [
    ERROR_CODE_INVALID_INPUT,
    ERROR_CODE_MISSING_RUNTIME,
    ERROR_CODE_NOT_FOUND,
    ERROR_CODE_PATH_NOT_EXIST,
    ERROR_CODE_ALREADY_UNLOCKED,
    ERROR_CODE_ALREADY_LOCKED,
    ERROR_CODE_WRONG_PASSWORD,
    ERROR_CODE_MOUNTPOINT,
    ERROR_CODE_VAULT_CONF,
    ERROR_CODE_VAULT_INIT,
    ERROR_CODE_PROCESS,
    ERROR_CODE_UNKNOWN_TOOL_FAILURE,
    ERROR_CODE_IO,
    ERROR_CODE_INTERNAL,
];

/// Returns the stable error code for a runtime error.
pub fn classify_error_code(error: &CloakError) -> &'static str {
    match error {
        CloakError::InvalidInput(_) => ERROR_CODE_INVALID_INPUT,
        CloakError::MissingGocryptfsBinary
        | CloakError::MissingXrayBinary
        | CloakError::MissingFuse => ERROR_CODE_MISSING_RUNTIME,
        CloakError::VaultNotExist => ERROR_CODE_NOT_FOUND,
        CloakError::PathNotExist => ERROR_CODE_PATH_NOT_EXIST,
        CloakError::AlreadyUnlocked => ERROR_CODE_ALREADY_UNLOCKED,
        CloakError::AlreadyLocked => ERROR_CODE_ALREADY_LOCKED,
        CloakError::WrongPassword => ERROR_CODE_WRONG_PASSWORD,
        CloakError::MountpointNotEmpty | CloakError::MountpointCreateFailed => {
            ERROR_CODE_MOUNTPOINT
        }
        CloakError::CantOpenVaultConf | CloakError::VaultUpdateConfFailed => {
            ERROR_CODE_VAULT_CONF
        }
        CloakError::VaultDirNotEmpty
        | CloakError::VaultPasswordEmpty
        | CloakError::VaultInitConfFailed
        | CloakError::VaultMkdirFailed(_) => ERROR_CODE_VAULT_INIT,
        CloakError::ProcessStart(_) | CloakError::StdinPipe => ERROR_CODE_PROCESS,
        CloakError::Unknown(_) => ERROR_CODE_UNKNOWN_TOOL_FAILURE,
        CloakError::Io(_) => ERROR_CODE_IO,
        CloakError::Serde(_) => ERROR_CODE_INTERNAL,
    }
}

/// Normalizes a user-provided error code for lookups.
pub fn normalize_error_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Returns an explanation block for a known error code.
pub fn explain_error_code(raw: &str) -> Option<&'static str> {
    let normalized = normalize_error_code(raw);
    match normalized.as_str() {
        ERROR_CODE_INVALID_INPUT => Some(ERROR_EXPLANATION_E100),
        ERROR_CODE_MISSING_RUNTIME => Some(ERROR_EXPLANATION_E103),
        ERROR_CODE_NOT_FOUND => Some(ERROR_EXPLANATION_E200),
        ERROR_CODE_PATH_NOT_EXIST => Some(ERROR_EXPLANATION_E201),
        ERROR_CODE_ALREADY_UNLOCKED => Some(ERROR_EXPLANATION_E300),
        ERROR_CODE_ALREADY_LOCKED => Some(ERROR_EXPLANATION_E301),
        ERROR_CODE_WRONG_PASSWORD => Some(ERROR_EXPLANATION_E400),
        ERROR_CODE_MOUNTPOINT => Some(ERROR_EXPLANATION_E401),
        ERROR_CODE_VAULT_CONF => Some(ERROR_EXPLANATION_E402),
        ERROR_CODE_VAULT_INIT => Some(ERROR_EXPLANATION_E403),
        ERROR_CODE_PROCESS => Some(ERROR_EXPLANATION_E404),
        ERROR_CODE_UNKNOWN_TOOL_FAILURE => Some(ERROR_EXPLANATION_E499),
        ERROR_CODE_IO => Some(ERROR_EXPLANATION_E900),
        ERROR_CODE_INTERNAL => Some(ERROR_EXPLANATION_E999),
        _ => None,
    }
}

/// Stable list of explainable error codes.
pub fn known_error_codes() -> &'static [&'static str] {
    &KNOWN_ERROR_CODES
}
