mod client;
mod commands;
mod daemon;
mod output;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::{error::Result, types::VaultId};

const VAULT_ID_ARG_HELP: &str = "Vault id from `cloak vault list` (example: `3`).";
const ERROR_CODE_ARG_HELP: &str = "Error code from CLI stderr (example: `E400`).";
const CLI_AFTER_HELP: &str = r#"Examples:
  cloak daemon
  cloak vault add ~/Private/gocryptfs.conf
  printf 'hunter2\n' | cloak vault unlock 1 --password-stdin
  cloak vault lock 1
  cloak explain E400

Version:
  cloak --version
  cloak version --json

More help:
  cloak help <command>
  cloak help vault
"#;
const DAEMON_COMMAND_AFTER_HELP: &str = r#"Examples:
  cloak daemon
  cloak daemon --bind 127.0.0.1:7789
  cloak daemon --check

Notes:
  - The daemon owns every mount process. Stopping it locks all vaults.
  - Only loopback bind addresses are accepted.
"#;
const VERSION_COMMAND_AFTER_HELP: &str = r#"Examples:
  cloak --version
  cloak version
  cloak version --json
"#;
const EXPLAIN_COMMAND_AFTER_HELP: &str = r#"Examples:
  cloak explain E400
  cloak explain e301

Tip:
  Error codes are shown in stderr output, for example `error[E400]: ...`.
"#;
const VAULT_COMMAND_AFTER_HELP: &str = r#"Examples:
  cloak vault list
  cloak vault create ~/Vaults Documents --password-stdin
  cloak vault unlock 1 --password-stdin
  cloak vault options 1 --autoreveal true --mountpoint ''
  cloak vault lock 1

Notes:
  - Every vault command talks to a running `cloak daemon`.
  - Password flags are visible in the process list; prefer `--password-stdin`.
"#;
const UNLOCK_COMMAND_AFTER_HELP: &str = r#"Examples:
  printf 'hunter2\n' | cloak vault unlock 1 --password-stdin

Recovery:
  E400 means the password was rejected; E401 means the mountpoint is unusable.
  Run `cloak explain <code>` for details.
"#;
const PASSWD_COMMAND_AFTER_HELP: &str = r#"Examples:
  printf 'old\nnew\n' | cloak vault passwd 1 --password-stdin

Notes:
  - The vault must be locked.
  - With `--password-stdin`, the current password is read first, then the new one.
"#;
const RESET_PASSWORD_COMMAND_AFTER_HELP: &str = r#"Examples:
  printf 'new\n' | cloak vault reset-password 1 --masterkey <key> --password-stdin

Notes:
  - The vault must be locked.
  - The previous configuration is kept as `gocryptfs.conf.bak.<timestamp>`.
"#;

/// Top-level command line parser.
#[derive(Debug, Parser)]
#[command(
    name = "cloak",
    version,
    about = "Unlock, lock, and reveal gocryptfs vaults through a local supervisor daemon.",
    after_help = CLI_AFTER_HELP,
    infer_subcommands = true,
    arg_required_else_help = true,
    next_line_help = true
)]
pub struct Cli {
    /// Runtime root override (vault records and audit log).
    /// Default: `$XDG_DATA_HOME/cloak` or `~/.local/share/cloak`.
    #[arg(long)]
    pub root: Option<PathBuf>,
    /// Config file override path.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Disable config loading and discovery.
    #[arg(long)]
    pub no_config: bool,
    /// Subcommand.
    #[command(subcommand)]
    pub command: Command,
}

/// Supported CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs the supervisor daemon in the foreground.
    #[command(after_help = DAEMON_COMMAND_AFTER_HELP)]
    Daemon {
        /// Loopback bind address override.
        #[arg(long)]
        bind: Option<String>,
        /// Validate the bind address and runtime, then exit.
        #[arg(long)]
        check: bool,
        /// Stop after this many connections (0 = unlimited).
        #[arg(long, hide = true, default_value_t = 0)]
        max_requests: usize,
    },
    /// Prints version information.
    #[command(visible_alias = "ver", after_help = VERSION_COMMAND_AFTER_HELP)]
    Version {
        /// Emit JSON.
        #[arg(long)]
        json: bool,
    },
    /// Explains a stable error code with recovery guidance.
    #[command(after_help = EXPLAIN_COMMAND_AFTER_HELP)]
    Explain {
        /// Code to explain.
        #[arg(help = ERROR_CODE_ARG_HELP)]
        code: String,
    },
    /// Config file commands.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Vault commands sent to the running daemon.
    #[command(after_help = VAULT_COMMAND_AFTER_HELP)]
    Vault {
        /// Daemon address override.
        #[arg(long)]
        bind: Option<String>,
        /// Vault subcommand.
        #[command(subcommand)]
        command: VaultCommand,
    },
}

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parses the effective config and checks runtime dependencies.
    Validate,
}

/// Password sources shared by vault commands.
#[derive(Debug, Clone, Default, Args)]
pub struct PasswordArgs {
    /// Password literal.
    #[arg(long)]
    pub password: Option<String>,
    /// Read missing passwords from stdin, one per line.
    #[arg(long)]
    pub password_stdin: bool,
}

/// Vault subcommands.
#[derive(Debug, Subcommand)]
pub enum VaultCommand {
    /// Lists vaults and their state.
    #[command(visible_alias = "ls")]
    List,
    /// Lists active mountpoints.
    Mountpoints,
    /// Registers an existing vault by its `gocryptfs.conf` or directory.
    Add {
        /// Path to `gocryptfs.conf` or the vault directory.
        path: PathBuf,
    },
    /// Initializes a new vault at `<parent>/<name>` and registers it.
    Create {
        /// Existing parent directory.
        parent: PathBuf,
        /// New directory name.
        name: String,
        /// Password source.
        #[command(flatten)]
        secret: PasswordArgs,
    },
    /// Forgets a vault, locking it first when needed.
    Remove {
        /// Vault id.
        #[arg(help = VAULT_ID_ARG_HELP)]
        id: VaultId,
    },
    /// Mounts a vault.
    #[command(after_help = UNLOCK_COMMAND_AFTER_HELP)]
    Unlock {
        /// Vault id.
        #[arg(help = VAULT_ID_ARG_HELP)]
        id: VaultId,
        /// Password source.
        #[command(flatten)]
        secret: PasswordArgs,
    },
    /// Unmounts a vault.
    Lock {
        /// Vault id.
        #[arg(help = VAULT_ID_ARG_HELP)]
        id: VaultId,
    },
    /// Changes options of a locked vault.
    Options {
        /// Vault id.
        #[arg(help = VAULT_ID_ARG_HELP)]
        id: VaultId,
        /// Open the mountpoint after unlock.
        #[arg(long)]
        autoreveal: Option<bool>,
        /// Mount read-only.
        #[arg(long)]
        readonly: Option<bool>,
        /// Fixed mountpoint; an empty value clears it.
        #[arg(long)]
        mountpoint: Option<String>,
    },
    /// Changes the password of a locked vault.
    #[command(after_help = PASSWD_COMMAND_AFTER_HELP)]
    Passwd {
        /// Vault id.
        #[arg(help = VAULT_ID_ARG_HELP)]
        id: VaultId,
        /// Current password source.
        #[command(flatten)]
        secret: PasswordArgs,
        /// New password literal.
        #[arg(long)]
        new_password: Option<String>,
    },
    /// Resets the password of a locked vault with its master key.
    #[command(after_help = RESET_PASSWORD_COMMAND_AFTER_HELP)]
    ResetPassword {
        /// Vault id.
        #[arg(help = VAULT_ID_ARG_HELP)]
        id: VaultId,
        /// Master key as printed by `cloak vault masterkey`.
        #[arg(long)]
        masterkey: String,
        /// New password source.
        #[command(flatten)]
        secret: PasswordArgs,
    },
    /// Prints the vault's master key.
    Masterkey {
        /// Vault id.
        #[arg(help = VAULT_ID_ARG_HELP)]
        id: VaultId,
        /// Password source.
        #[command(flatten)]
        secret: PasswordArgs,
    },
    /// Opens the mountpoint of an unlocked vault in the file manager.
    Reveal {
        /// Vault id.
        #[arg(help = VAULT_ID_ARG_HELP)]
        id: VaultId,
    },
    /// Opens the encrypted directory in the file manager.
    RevealVault {
        /// Vault id.
        #[arg(help = VAULT_ID_ARG_HELP)]
        id: VaultId,
    },
}

/// Executes one parsed command and returns the process exit code.
pub fn run(cli: Cli) -> Result<i32> {
    commands::run(cli)
}

#[cfg(test)]
mod unit_tests {
    use super::{Cli, Command, ConfigCommand, VaultCommand};
    use clap::{error::ErrorKind, CommandFactory, Parser};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn version_flag_is_handled_by_clap() {
        let error = Cli::try_parse_from(["cloak", "--version"]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::DisplayVersion);
    }

    #[test]
    fn no_arguments_prints_help() {
        let error = Cli::try_parse_from(["cloak"]).unwrap_err();
        assert_eq!(
            error.kind(),
            ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        );
    }

    #[test]
    fn parse_vault_unlock_with_password_stdin() {
        let cli = Cli::try_parse_from(["cloak", "vault", "unlock", "4", "--password-stdin"]).unwrap();
        match cli.command {
            Command::Vault {
                bind: None,
                command: VaultCommand::Unlock { id, secret },
            } => {
                assert_eq!(id, 4);
                assert!(secret.password_stdin);
                assert!(secret.password.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parse_vault_options_accepts_empty_mountpoint() {
        let cli = Cli::try_parse_from([
            "cloak",
            "vault",
            "options",
            "2",
            "--autoreveal",
            "true",
            "--mountpoint",
            "",
        ])
        .unwrap();
        match cli.command {
            Command::Vault {
                command:
                    VaultCommand::Options {
                        id,
                        autoreveal,
                        readonly,
                        mountpoint,
                    },
                ..
            } => {
                assert_eq!(id, 2);
                assert_eq!(autoreveal, Some(true));
                assert_eq!(readonly, None);
                assert_eq!(mountpoint.as_deref(), Some(""));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parse_inferred_subcommand_prefix() {
        let cli = Cli::try_parse_from(["cloak", "conf", "validate"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Config {
                command: ConfigCommand::Validate
            }
        ));
    }

    #[test]
    fn vault_id_must_be_numeric() {
        assert!(Cli::try_parse_from(["cloak", "vault", "lock", "abc"]).is_err());
    }

    #[test]
    fn version_alias_parses() {
        let cli = Cli::try_parse_from(["cloak", "ver", "--json"]).unwrap();
        assert!(matches!(cli.command, Command::Version { json: true }));
    }
}
