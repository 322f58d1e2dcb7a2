use std::{
    fs,
    path::{Component, Path, PathBuf},
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use serde::{Deserialize, Serialize};

use crate::{
    error::{CloakError, Result},
    vault::{MountSettings, MountpointPolicy, RevealTiming},
};

const CONFIG_VERSION_V1: u32 = 1;
const FALLBACK_ROOT: &str = ".cloak";
const DATA_DIR_NAME: &str = "cloak";
const DEFAULT_DAEMON_BIND: &str = "127.0.0.1:7789";
const DEFAULT_DAEMON_IO_TIMEOUT_SECONDS: u64 = 5;
const DEFAULT_DAEMON_REQUEST_LIMIT_BYTES: usize = 16 * 1024;
const DEFAULT_GRACE_PERIOD_MS: u64 = 1000;
const DEFAULT_REVEAL_TIMEOUT_MS: u64 = 5000;
const DEFAULT_REVEAL_POLL_MS: u64 = 100;

/// Default bootstrap config file name.
pub const CONFIG_FILE_NAME: &str = ".cloak.toml";
/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "CLOAK_CONFIG";

/// Source used to select the effective config file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConfigSource {
    /// Selected via `--config` CLI flag.
    Flag,
    /// Selected via `CLOAK_CONFIG` environment variable.
    Env,
    /// Selected by walking from the current working directory to root.
    Discovered,
    /// No config file selected.
    None,
}

/// Resolved config selection before parsing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigSelection {
    /// Source used for selection.
    pub source: ConfigSource,
    /// Selected path when a config file was found.
    pub path: Option<PathBuf>,
}

/// Raw TOML shape for one `.cloak.toml` file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CloakConfigFile {
    /// Schema version.
    pub version: u32,
    /// Optional path overrides.
    #[serde(default)]
    pub paths: ConfigPathsFile,
    /// Daemon defaults.
    #[serde(default)]
    pub daemon: DaemonConfigFile,
    /// Mount timing and placement.
    #[serde(default)]
    pub mount: MountConfigFile,
    /// Explicit tool locations.
    #[serde(default)]
    pub binaries: BinariesConfigFile,
}

/// Raw `[paths]` section from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigPathsFile {
    /// Runtime root override.
    pub root: Option<String>,
}

/// Raw `[daemon]` section from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfigFile {
    /// Bind address for daemon mode.
    pub bind: Option<String>,
    /// Read/write timeout in seconds.
    pub io_timeout_seconds: Option<u64>,
    /// Maximum request size in bytes.
    pub request_limit_bytes: Option<usize>,
}

/// Raw `[mount]` section from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MountConfigFile {
    /// Readiness window in milliseconds.
    pub grace_period_ms: Option<u64>,
    /// Auto-reveal give-up time in milliseconds.
    pub reveal_timeout_ms: Option<u64>,
    /// Auto-reveal poll interval in milliseconds.
    pub reveal_poll_ms: Option<u64>,
    /// Parent directory for generated mountpoints.
    pub base_dir: Option<String>,
}

/// Raw `[binaries]` section from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BinariesConfigFile {
    /// Path to `gocryptfs`.
    pub gocryptfs: Option<String>,
    /// Path to `gocryptfs-xray`.
    pub gocryptfs_xray: Option<String>,
}

/// Effective daemon defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonBootstrapConfig {
    /// Loopback bind address.
    pub bind: String,
    /// Read/write timeout in seconds.
    pub io_timeout_seconds: u64,
    /// Maximum request size in bytes.
    pub request_limit_bytes: usize,
}

impl Default for DaemonBootstrapConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_DAEMON_BIND.to_owned(),
            io_timeout_seconds: DEFAULT_DAEMON_IO_TIMEOUT_SECONDS,
            request_limit_bytes: DEFAULT_DAEMON_REQUEST_LIMIT_BYTES,
        }
    }
}

/// Effective mount settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountBootstrapConfig {
    /// Readiness window in milliseconds.
    pub grace_period_ms: u64,
    /// Auto-reveal give-up time in milliseconds.
    pub reveal_timeout_ms: u64,
    /// Auto-reveal poll interval in milliseconds.
    pub reveal_poll_ms: u64,
    /// Parent directory override for generated mountpoints.
    pub base_dir: Option<PathBuf>,
}

impl Default for MountBootstrapConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            reveal_timeout_ms: DEFAULT_REVEAL_TIMEOUT_MS,
            reveal_poll_ms: DEFAULT_REVEAL_POLL_MS,
            base_dir: None,
        }
    }
}

impl MountBootstrapConfig {
    /// Converts into the settings the vault manager runs with.
    pub fn to_settings(&self) -> MountSettings {
        let policy = match &self.base_dir {
            Some(base_dir) => MountpointPolicy::with_base_dir(base_dir),
            None => MountpointPolicy::platform_default(),
        };
        MountSettings {
            grace_period: Duration::from_millis(self.grace_period_ms),
            reveal: RevealTiming {
                timeout: Duration::from_millis(self.reveal_timeout_ms),
                poll_interval: Duration::from_millis(self.reveal_poll_ms),
            },
            policy,
        }
    }
}

/// Explicit tool locations; `None` means discover by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BinariesConfig {
    /// Path to `gocryptfs`.
    pub gocryptfs: Option<PathBuf>,
    /// Path to `gocryptfs-xray`.
    pub gocryptfs_xray: Option<PathBuf>,
}

/// Effective and validated `.cloak.toml` configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloakConfig {
    /// Absolute config file path.
    pub source_path: PathBuf,
    /// Effective runtime root.
    pub root: PathBuf,
    /// Effective daemon defaults.
    pub daemon: DaemonBootstrapConfig,
    /// Effective mount settings.
    pub mount: MountBootstrapConfig,
    /// Explicit tool locations.
    pub binaries: BinariesConfig,
}

impl CloakConfig {
    /// Loads and validates a config file from disk.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let cwd = std::env::current_dir()?;
        let absolute_path = absolutize_path(path.as_ref(), &cwd);
        if !absolute_path.exists() {
            return Err(CloakError::InvalidInput(format!(
                "config file does not exist: {}",
                absolute_path.display()
            )));
        }

        validate_config_file_permissions(&absolute_path)?;
        let raw = fs::read_to_string(&absolute_path)?;
        Self::parse_from_str(&raw, &absolute_path)
    }

    /// Parses and validates config from TOML text.
    pub fn parse_from_str(raw: &str, source_path: impl AsRef<Path>) -> Result<Self> {
        let parsed = toml::from_str::<CloakConfigFile>(raw)
            .map_err(|error| CloakError::InvalidInput(format!("invalid config TOML: {error}")))?;
        build_config(parsed, source_path.as_ref())
    }
}

/// Default runtime root: `$XDG_DATA_HOME/cloak`, else `~/.local/share/cloak`.
pub fn default_root() -> PathBuf {
    if let Some(data_home) = std::env::var_os("XDG_DATA_HOME").filter(|value| !value.is_empty()) {
        return PathBuf::from(data_home).join(DATA_DIR_NAME);
    }
    if let Some(home) = std::env::var_os("HOME").filter(|value| !value.is_empty()) {
        return PathBuf::from(home)
            .join(".local")
            .join("share")
            .join(DATA_DIR_NAME);
    }
    PathBuf::from(FALLBACK_ROOT)
}

/// Resolves one config path based on precedence rules.
pub fn resolve_config_path(
    explicit_path: Option<&Path>,
    env_path: Option<&str>,
    no_config: bool,
    cwd: impl AsRef<Path>,
) -> Result<ConfigSelection> {
    if no_config {
        return Ok(ConfigSelection {
            source: ConfigSource::None,
            path: None,
        });
    }

    let cwd = cwd.as_ref();
    if let Some(path) = explicit_path {
        return Ok(ConfigSelection {
            source: ConfigSource::Flag,
            path: Some(regular_candidate(path, cwd)?),
        });
    }

    if let Some(value) = env_path {
        if value.trim().is_empty() {
            return Err(CloakError::InvalidInput(format!(
                "{CONFIG_ENV_VAR} cannot be empty"
            )));
        }
        return Ok(ConfigSelection {
            source: ConfigSource::Env,
            path: Some(regular_candidate(Path::new(value), cwd)?),
        });
    }

    if let Some(discovered) = discover_config(cwd) {
        return Ok(ConfigSelection {
            source: ConfigSource::Discovered,
            path: Some(discovered),
        });
    }

    Ok(ConfigSelection {
        source: ConfigSource::None,
        path: None,
    })
}

fn regular_candidate(path: &Path, cwd: &Path) -> Result<PathBuf> {
    let candidate = absolutize_path(path, cwd);
    if !is_regular_config_candidate(&candidate) {
        return Err(CloakError::InvalidInput(format!(
            "config file must be a regular file: {}",
            candidate.display()
        )));
    }
    Ok(candidate)
}

/// Discovers `.cloak.toml` by walking from `start_dir` to filesystem root.
pub fn discover_config(start_dir: impl AsRef<Path>) -> Option<PathBuf> {
    let mut current = start_dir.as_ref();
    loop {
        let candidate = current.join(CONFIG_FILE_NAME);
        if is_regular_config_candidate(&candidate) {
            return Some(candidate);
        }

        let parent = current.parent()?;
        current = parent;
    }
}

fn build_config(raw: CloakConfigFile, source_path: &Path) -> Result<CloakConfig> {
    if raw.version != CONFIG_VERSION_V1 {
        return Err(CloakError::InvalidInput(format!(
            "unsupported config version {} (expected {})",
            raw.version, CONFIG_VERSION_V1
        )));
    }

    let source_path = absolutize_path(source_path, &std::env::current_dir()?);
    let source_dir = source_path.parent().unwrap_or(Path::new("."));

    let root = match raw.paths.root.as_deref() {
        Some(literal) => resolve_path_value(literal, source_dir, "paths.root")?,
        None => default_root(),
    };

    Ok(CloakConfig {
        source_path: source_path.clone(),
        root,
        daemon: resolve_daemon_config(&raw.daemon)?,
        mount: resolve_mount_config(&raw.mount, source_dir)?,
        binaries: BinariesConfig {
            gocryptfs: resolve_optional_path(
                raw.binaries.gocryptfs.as_deref(),
                source_dir,
                "binaries.gocryptfs",
            )?,
            gocryptfs_xray: resolve_optional_path(
                raw.binaries.gocryptfs_xray.as_deref(),
                source_dir,
                "binaries.gocryptfs_xray",
            )?,
        },
    })
}

/// Validates a daemon bind literal: loopback with a non-zero port.
pub fn validate_daemon_bind(bind: &str) -> Result<std::net::SocketAddr> {
    let bind_addr = bind.parse::<std::net::SocketAddr>().map_err(|error| {
        CloakError::InvalidInput(format!("invalid daemon bind address: {error}"))
    })?;
    if bind_addr.port() == 0 {
        return Err(CloakError::InvalidInput(
            "daemon bind port must be non-zero".to_owned(),
        ));
    }
    if !bind_addr.ip().is_loopback() {
        return Err(CloakError::InvalidInput(
            "daemon bind address must be loopback".to_owned(),
        ));
    }
    Ok(bind_addr)
}

fn resolve_daemon_config(raw: &DaemonConfigFile) -> Result<DaemonBootstrapConfig> {
    let bind = raw
        .bind
        .clone()
        .unwrap_or_else(|| DEFAULT_DAEMON_BIND.to_owned());
    validate_daemon_bind(&bind)?;

    let io_timeout_seconds = positive(
        raw.io_timeout_seconds
            .unwrap_or(DEFAULT_DAEMON_IO_TIMEOUT_SECONDS),
        "daemon.io_timeout_seconds",
    )?;
    let request_limit_bytes = raw
        .request_limit_bytes
        .unwrap_or(DEFAULT_DAEMON_REQUEST_LIMIT_BYTES);
    if request_limit_bytes == 0 {
        return Err(CloakError::InvalidInput(
            "daemon.request_limit_bytes must be greater than zero".to_owned(),
        ));
    }

    Ok(DaemonBootstrapConfig {
        bind,
        io_timeout_seconds,
        request_limit_bytes,
    })
}

fn resolve_mount_config(raw: &MountConfigFile, source_dir: &Path) -> Result<MountBootstrapConfig> {
    let grace_period_ms = positive(
        raw.grace_period_ms.unwrap_or(DEFAULT_GRACE_PERIOD_MS),
        "mount.grace_period_ms",
    )?;
    let reveal_timeout_ms = positive(
        raw.reveal_timeout_ms.unwrap_or(DEFAULT_REVEAL_TIMEOUT_MS),
        "mount.reveal_timeout_ms",
    )?;
    let reveal_poll_ms = positive(
        raw.reveal_poll_ms.unwrap_or(DEFAULT_REVEAL_POLL_MS),
        "mount.reveal_poll_ms",
    )?;
    if reveal_poll_ms > reveal_timeout_ms {
        return Err(CloakError::InvalidInput(
            "mount.reveal_poll_ms must not exceed mount.reveal_timeout_ms".to_owned(),
        ));
    }

    Ok(MountBootstrapConfig {
        grace_period_ms,
        reveal_timeout_ms,
        reveal_poll_ms,
        base_dir: resolve_optional_path(raw.base_dir.as_deref(), source_dir, "mount.base_dir")?,
    })
}

fn positive(value: u64, label: &str) -> Result<u64> {
    if value == 0 {
        return Err(CloakError::InvalidInput(format!(
            "{label} must be greater than zero"
        )));
    }
    Ok(value)
}

fn resolve_optional_path(
    value: Option<&str>,
    source_dir: &Path,
    label: &str,
) -> Result<Option<PathBuf>> {
    value
        .map(|literal| resolve_path_value(literal, source_dir, label))
        .transpose()
}

fn resolve_path_value(value: &str, source_dir: &Path, label: &str) -> Result<PathBuf> {
    if value.trim().is_empty() {
        return Err(CloakError::InvalidInput(format!("{label} cannot be empty")));
    }

    let expanded = expand_home(value)?;
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        source_dir.join(expanded)
    };

    if let Ok(canonical) = fs::canonicalize(&absolute) {
        return Ok(canonical);
    }
    Ok(normalize_path(&absolute))
}

fn expand_home(value: &str) -> Result<PathBuf> {
    if value == "~" || value.starts_with("~/") {
        let home = std::env::var_os("HOME")
            .ok_or_else(|| CloakError::InvalidInput("HOME is not set".to_owned()))?;
        let home = PathBuf::from(home);
        return Ok(match value.strip_prefix("~/") {
            Some(rest) => home.join(rest),
            None => home,
        });
    }

    if value.starts_with('~') {
        return Err(CloakError::InvalidInput(
            "only '~' and '~/' home expansion are supported".to_owned(),
        ));
    }

    Ok(PathBuf::from(value))
}

fn normalize_path(path: &Path) -> PathBuf {
    let is_absolute = path.is_absolute();
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() && !is_absolute {
                    normalized.push("..");
                }
            }
            Component::Normal(part) => normalized.push(part),
        }
    }

    if normalized.as_os_str().is_empty() {
        if is_absolute {
            PathBuf::from(std::path::MAIN_SEPARATOR.to_string())
        } else {
            PathBuf::from(".")
        }
    } else {
        normalized
    }
}

fn absolutize_path(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize_path(path)
    } else {
        normalize_path(&cwd.join(path))
    }
}

fn validate_config_file_permissions(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.file_type().is_symlink() || !metadata.file_type().is_file() {
        return Err(CloakError::InvalidInput(format!(
            "config path must be a regular file: {}",
            path.display()
        )));
    }

    #[cfg(unix)]
    {
        // Binary paths come from this file, so others must not be able to edit it.
        if metadata.permissions().mode() & 0o022 != 0 {
            return Err(CloakError::InvalidInput(format!(
                "config file must not be group/world writable: {}",
                path.display()
            )));
        }
    }

    Ok(())
}

fn is_regular_config_candidate(path: &Path) -> bool {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return false;
    };
    !metadata.file_type().is_symlink() && metadata.file_type().is_file()
}

#[cfg(test)]
mod unit_tests {
    use std::path::Path;

    use super::{absolutize_path, normalize_path, positive};

    #[test]
    fn normalize_collapses_dot_segments() {
        assert_eq!(
            normalize_path(Path::new("/a/./b/../c")),
            Path::new("/a/c").to_path_buf()
        );
        assert_eq!(normalize_path(Path::new("../x")), Path::new("../x"));
        assert_eq!(normalize_path(Path::new("/..")), Path::new("/"));
    }

    #[test]
    fn absolutize_joins_relative_to_cwd() {
        assert_eq!(
            absolutize_path(Path::new("conf/.cloak.toml"), Path::new("/work")),
            Path::new("/work/conf/.cloak.toml")
        );
    }

    #[test]
    fn zero_is_rejected() {
        assert!(positive(0, "x").is_err());
        assert_eq!(positive(3, "x").unwrap(), 3);
    }
}
