use std::env::VarError;
use std::path::PathBuf;

use crate::{
    config::{
        default_root, discover_config, resolve_config_path, BinariesConfig, CloakConfig,
        ConfigSelection, ConfigSource, DaemonBootstrapConfig, MountBootstrapConfig,
        CONFIG_ENV_VAR,
    },
    error::{explain_error_code, known_error_codes, CloakError, Result},
    paths::CloakPaths,
    vault::GocryptfsDriver,
};

use super::{
    client, daemon,
    output::{self, OutputStatus},
    Cli, Command, ConfigCommand,
};

#[derive(Debug, Clone)]
struct EffectiveCliState {
    paths: CloakPaths,
    loaded_config: Option<CloakConfig>,
    daemon: DaemonBootstrapConfig,
    mount: MountBootstrapConfig,
    binaries: BinariesConfig,
}

impl EffectiveCliState {
    fn driver(&self) -> GocryptfsDriver {
        GocryptfsDriver::locate(
            self.binaries.gocryptfs.as_deref(),
            self.binaries.gocryptfs_xray.as_deref(),
        )
    }
}

#[derive(Debug, serde::Serialize)]
struct VersionOutput {
    name: &'static str,
    version: &'static str,
}

pub(crate) fn run(cli: Cli) -> Result<i32> {
    match &cli.command {
        Command::Version { json } => return run_version(*json),
        Command::Explain { code } => return run_explain(code),
        _ => {}
    }

    let state = load_effective_state(&cli)?;
    match cli.command {
        Command::Version { .. } | Command::Explain { .. } => {}
        Command::Daemon {
            bind,
            check,
            max_requests,
        } => {
            let bind = bind.unwrap_or_else(|| state.daemon.bind.clone());
            daemon::run_daemon(
                &state.paths,
                &bind,
                daemon::DaemonRuntimeOptions {
                    io_timeout_seconds: state.daemon.io_timeout_seconds,
                    request_limit_bytes: state.daemon.request_limit_bytes,
                },
                state.driver(),
                state.mount.to_settings(),
                check,
                max_requests,
            )?;
        }
        Command::Config { command } => match command {
            ConfigCommand::Validate => return run_config_validate(&state),
        },
        Command::Vault { bind, command } => {
            let bind = bind.unwrap_or_else(|| state.daemon.bind.clone());
            return client::run_vault_command(&bind, state.daemon.io_timeout_seconds, command);
        }
    }
    Ok(0)
}

fn run_version(json: bool) -> Result<i32> {
    let output = VersionOutput {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    };
    let line = if json {
        serde_json::to_string(&output)?
    } else {
        format!("{} {}", output.name, output.version)
    };
    stdout_line_exit_code(&line)
}

fn run_explain(code: &str) -> Result<i32> {
    match explain_error_code(code) {
        Some(explanation) => stdout_line_exit_code(explanation),
        None => Err(CloakError::InvalidInput(format!(
            "unknown error code '{}'; known codes: {}",
            code.trim(),
            known_error_codes().join(", ")
        ))),
    }
}

fn run_config_validate(state: &EffectiveCliState) -> Result<i32> {
    let driver = state.driver();
    if let Err(error) = daemon::check_runtime(&driver) {
        stderr_line_ignore_broken_pipe(&format!("warning: {error}"));
    }
    if driver.xray_binary().is_err() {
        stderr_line_ignore_broken_pipe(
            "warning: gocryptfs-xray not found; master key export is unavailable",
        );
    }
    let source = state
        .loaded_config
        .as_ref()
        .map(|config| config.source_path.display().to_string())
        .unwrap_or_else(|| "defaults".to_owned());
    stdout_line_exit_code(&format!("ok ({source})"))
}

fn stdout_line_exit_code(line: &str) -> Result<i32> {
    match output::stdout_line(line) {
        Ok(OutputStatus::Written | OutputStatus::BrokenPipe) => Ok(0),
        Err(error) => Err(CloakError::Io(error)),
    }
}

fn stderr_line_ignore_broken_pipe(line: &str) {
    let _ = output::stderr_line(line);
}

fn load_effective_state(cli: &Cli) -> Result<EffectiveCliState> {
    let current_dir = std::env::current_dir()?;
    let env_path = read_config_env_var()?;
    let mut selection = resolve_config_path(
        cli.config.as_deref(),
        env_path.as_deref(),
        cli.no_config,
        &current_dir,
    )?;
    if selection.path.is_none() && !cli.no_config {
        if let Some(root_override) = cli.root.as_deref() {
            let discovery_start = if root_override.is_absolute() {
                root_override.to_path_buf()
            } else {
                current_dir.join(root_override)
            };
            if let Some(discovered) = discover_config(discovery_start) {
                selection = ConfigSelection {
                    source: ConfigSource::Discovered,
                    path: Some(discovered),
                };
            }
        }
    }
    let loaded_config = match selection.path {
        Some(path) => {
            tracing::debug!(path = %path.display(), source = ?selection.source, "loading config");
            Some(CloakConfig::load_from_path(path)?)
        }
        None => None,
    };

    let root: PathBuf = cli
        .root
        .clone()
        .or_else(|| loaded_config.as_ref().map(|config| config.root.clone()))
        .unwrap_or_else(default_root);
    let daemon = loaded_config
        .as_ref()
        .map(|config| config.daemon.clone())
        .unwrap_or_default();
    let mount = loaded_config
        .as_ref()
        .map(|config| config.mount.clone())
        .unwrap_or_default();
    let binaries = loaded_config
        .as_ref()
        .map(|config| config.binaries.clone())
        .unwrap_or_default();

    Ok(EffectiveCliState {
        paths: CloakPaths::new(root),
        loaded_config,
        daemon,
        mount,
        binaries,
    })
}

fn read_config_env_var() -> Result<Option<String>> {
    match std::env::var(CONFIG_ENV_VAR) {
        Ok(value) => Ok(Some(value)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(CloakError::InvalidInput(format!(
            "{CONFIG_ENV_VAR} must be valid UTF-8"
        ))),
    }
}
