//! One-shot requests from `cloak vault ...` to the running daemon.

use std::{
    io::{self, BufRead},
    net::{SocketAddr, TcpStream},
    time::Duration,
};

use crate::{
    config::validate_daemon_bind,
    error::{CloakError, Result},
};

use super::{
    daemon::{read_json_line, write_json_line, DaemonRequest, DaemonResponse},
    output::{self, OutputStatus},
    PasswordArgs, VaultCommand,
};

const RESPONSE_LIMIT_BYTES: usize = 4 * 1024 * 1024;
// Unlock waits out the readiness window on the daemon side.
const MIN_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Supplies passwords from flags, then from stdin lines when allowed.
pub(crate) struct SecretReader<R> {
    stdin_enabled: bool,
    lines: R,
}

impl SecretReader<io::StdinLock<'static>> {
    fn from_stdin(stdin_enabled: bool) -> Self {
        Self::new(stdin_enabled, io::stdin().lock())
    }
}

impl<R: BufRead> SecretReader<R> {
    pub(crate) fn new(stdin_enabled: bool, lines: R) -> Self {
        Self {
            stdin_enabled,
            lines,
        }
    }

    /// Returns `provided` or the next stdin line.
    pub(crate) fn next(&mut self, provided: Option<String>, flag: &str) -> Result<String> {
        if let Some(value) = provided {
            return Ok(value);
        }
        if !self.stdin_enabled {
            return Err(CloakError::InvalidInput(format!(
                "missing {flag}; pass it or use --password-stdin"
            )));
        }
        let mut line = String::new();
        if self.lines.read_line(&mut line)? == 0 {
            return Err(CloakError::InvalidInput(format!(
                "stdin closed before {flag} was read"
            )));
        }
        while line.ends_with(['\n', '\r']) {
            line.pop();
        }
        Ok(line)
    }
}

/// Builds the wire request for one vault subcommand.
pub(crate) fn build_request<R: BufRead>(
    command: VaultCommand,
    secrets: &mut impl FnMut(bool) -> SecretReader<R>,
) -> Result<DaemonRequest> {
    let request = match command {
        VaultCommand::List => DaemonRequest::List,
        VaultCommand::Mountpoints => DaemonRequest::Mountpoints,
        VaultCommand::Add { path } => DaemonRequest::Add {
            path: absolute(path)?,
        },
        VaultCommand::Create {
            parent,
            name,
            secret: PasswordArgs {
                password,
                password_stdin,
            },
        } => DaemonRequest::Create {
            parent: absolute(parent)?,
            name,
            password: secrets(password_stdin).next(password, "--password")?,
        },
        VaultCommand::Remove { id } => DaemonRequest::Remove { id },
        VaultCommand::Unlock {
            id,
            secret: PasswordArgs {
                password,
                password_stdin,
            },
        } => DaemonRequest::Unlock {
            id,
            password: secrets(password_stdin).next(password, "--password")?,
        },
        VaultCommand::Lock { id } => DaemonRequest::Lock { id },
        VaultCommand::Options {
            id,
            autoreveal,
            readonly,
            mountpoint,
        } => DaemonRequest::UpdateOptions {
            id,
            autoreveal,
            readonly,
            mountpoint,
        },
        VaultCommand::Passwd {
            id,
            secret: PasswordArgs {
                password,
                password_stdin,
            },
            new_password,
        } => {
            let mut reader = secrets(password_stdin);
            let password = reader.next(password, "--password")?;
            let new_password = reader.next(new_password, "--new-password")?;
            DaemonRequest::ChangePassword {
                id,
                password,
                new_password,
            }
        }
        VaultCommand::ResetPassword {
            id,
            masterkey,
            secret: PasswordArgs {
                password,
                password_stdin,
            },
        } => DaemonRequest::ResetPassword {
            id,
            masterkey,
            new_password: secrets(password_stdin).next(password, "--password")?,
        },
        VaultCommand::Masterkey {
            id,
            secret: PasswordArgs {
                password,
                password_stdin,
            },
        } => DaemonRequest::RevealMasterkey {
            id,
            password: secrets(password_stdin).next(password, "--password")?,
        },
        VaultCommand::Reveal { id } => DaemonRequest::RevealMountpoint { id },
        VaultCommand::RevealVault { id } => DaemonRequest::RevealVault { id },
    };
    Ok(request)
}

fn absolute(path: std::path::PathBuf) -> Result<std::path::PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    Ok(std::env::current_dir()?.join(path))
}

/// Sends one request and prints the reply; returns the exit code.
pub(crate) fn run_vault_command(
    bind: &str,
    io_timeout_seconds: u64,
    command: VaultCommand,
) -> Result<i32> {
    let address = validate_daemon_bind(bind)?;
    let request = build_request(command, &mut SecretReader::from_stdin)?;
    let timeout = Duration::from_secs(io_timeout_seconds).max(MIN_RESPONSE_TIMEOUT);
    let response = send_request(address, &request, timeout)?;
    print_response(response)
}

fn send_request(
    address: SocketAddr,
    request: &DaemonRequest,
    timeout: Duration,
) -> Result<DaemonResponse> {
    let mut stream = TcpStream::connect_timeout(&address, timeout).map_err(|error| {
        CloakError::InvalidInput(format!(
            "cannot reach cloak daemon at {address} ({error}); start it with `cloak daemon`"
        ))
    })?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    tracing::debug!(%address, ?request, "sending daemon request");
    write_json_line(&mut stream, request)?;

    let bytes = read_json_line(&mut stream, RESPONSE_LIMIT_BYTES)?;
    serde_json::from_slice::<DaemonResponse>(&bytes)
        .map_err(|error| CloakError::InvalidInput(format!("invalid daemon response: {error}")))
}

fn print_response(response: DaemonResponse) -> Result<i32> {
    match response {
        DaemonResponse::Ok { message, data } => {
            let text = match data {
                Some(data) => serde_json::to_string_pretty(&data)?,
                None => message,
            };
            match output::stdout_line(&text) {
                Ok(OutputStatus::Written | OutputStatus::BrokenPipe) => Ok(0),
                Err(error) => Err(CloakError::Io(error)),
            }
        }
        DaemonResponse::Error { error, code, state } => {
            let line = match state {
                Some(state) => format!("error[{code}]: {error} (vault is {state})"),
                None => format!("error[{code}]: {error}"),
            };
            let _ = output::stderr_line(&line);
            Ok(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{build_request, SecretReader};
    use crate::cli::{daemon::DaemonRequest, PasswordArgs, VaultCommand};

    fn reader(input: &'static str) -> impl FnMut(bool) -> SecretReader<&'static [u8]> {
        move |stdin_enabled| SecretReader::new(stdin_enabled, input.as_bytes())
    }

    #[test]
    fn passwd_reads_old_then_new_from_stdin() {
        let request = build_request(
            VaultCommand::Passwd {
                id: 1,
                secret: PasswordArgs {
                    password: None,
                    password_stdin: true,
                },
                new_password: None,
            },
            &mut reader("old-pw\r\nnew-pw\n"),
        )
        .unwrap();
        match request {
            DaemonRequest::ChangePassword {
                id,
                password,
                new_password,
            } => {
                assert_eq!(id, 1);
                assert_eq!(password, "old-pw");
                assert_eq!(new_password, "new-pw");
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn flag_password_wins_over_stdin() {
        let request = build_request(
            VaultCommand::Unlock {
                id: 2,
                secret: PasswordArgs {
                    password: Some("flag".to_owned()),
                    password_stdin: true,
                },
            },
            &mut reader("stdin\n"),
        )
        .unwrap();
        assert!(matches!(
            request,
            DaemonRequest::Unlock { ref password, .. } if password == "flag"
        ));
    }

    #[test]
    fn missing_password_without_stdin_is_invalid_input() {
        let error = build_request(
            VaultCommand::Masterkey {
                id: 2,
                secret: PasswordArgs::default(),
            },
            &mut reader(""),
        )
        .unwrap_err();
        assert!(error.to_string().contains("missing --password"));
    }

    #[test]
    fn relative_add_path_is_made_absolute() {
        let request = build_request(
            VaultCommand::Add {
                path: "vault/gocryptfs.conf".into(),
            },
            &mut reader(""),
        )
        .unwrap();
        match request {
            DaemonRequest::Add { path } => assert!(path.is_absolute()),
            other => panic!("unexpected request {other:?}"),
        }
    }
}
