use std::{
    io::{BufRead, BufReader, Read, Write},
    net::{TcpListener, TcpStream},
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::{
    audit::AuditLog,
    config::validate_daemon_bind,
    error::{classify_error_code, CloakError, Result, StatefulError},
    fs_secure::ensure_private_dir,
    paths::CloakPaths,
    store::{JsonVaultStore, VaultStore},
    types::{Password, VaultId, VaultOptions, VaultState},
    vault::{
        locator::is_fuse_available, FileManagerRevealer, GocryptfsDriver, MountSettings,
        Revealer, VaultManager,
    },
};

use super::output::{self, OutputStatus};

const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(serde::Serialize, serde::Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", deny_unknown_fields)]
pub(crate) enum DaemonRequest {
    Ping,
    List,
    Mountpoints,
    Add {
        path: PathBuf,
    },
    Create {
        parent: PathBuf,
        name: String,
        password: String,
    },
    Remove {
        id: VaultId,
    },
    Unlock {
        id: VaultId,
        password: String,
    },
    Lock {
        id: VaultId,
    },
    UpdateOptions {
        id: VaultId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        autoreveal: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        readonly: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mountpoint: Option<String>,
    },
    ChangePassword {
        id: VaultId,
        password: String,
        new_password: String,
    },
    ResetPassword {
        id: VaultId,
        masterkey: String,
        new_password: String,
    },
    RevealMasterkey {
        id: VaultId,
        password: String,
    },
    RevealMountpoint {
        id: VaultId,
    },
    RevealVault {
        id: VaultId,
    },
}

impl DaemonRequest {
    fn action(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::List => "list",
            Self::Mountpoints => "mountpoints",
            Self::Add { .. } => "add",
            Self::Create { .. } => "create",
            Self::Remove { .. } => "remove",
            Self::Unlock { .. } => "unlock",
            Self::Lock { .. } => "lock",
            Self::UpdateOptions { .. } => "update_options",
            Self::ChangePassword { .. } => "change_password",
            Self::ResetPassword { .. } => "reset_password",
            Self::RevealMasterkey { .. } => "reveal_masterkey",
            Self::RevealMountpoint { .. } => "reveal_mountpoint",
            Self::RevealVault { .. } => "reveal_vault",
        }
    }
}

// Requests carry passwords.
impl std::fmt::Debug for DaemonRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DaemonRequest({})", self.action())
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub(crate) enum DaemonResponse {
    Ok {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        error: String,
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<VaultState>,
    },
}

impl DaemonResponse {
    fn from_failure(failure: RequestFailure) -> Self {
        Self::Error {
            code: classify_error_code(&failure.error).to_owned(),
            error: failure.error.to_string(),
            state: failure.state,
        }
    }
}

/// A request error, tagged with the vault state when the operation reports one.
#[derive(Debug)]
struct RequestFailure {
    error: CloakError,
    state: Option<VaultState>,
}

impl From<CloakError> for RequestFailure {
    fn from(error: CloakError) -> Self {
        Self { error, state: None }
    }
}

impl From<StatefulError> for RequestFailure {
    fn from(value: StatefulError) -> Self {
        Self {
            error: value.error,
            state: Some(value.state),
        }
    }
}

impl From<serde_json::Error> for RequestFailure {
    fn from(error: serde_json::Error) -> Self {
        CloakError::from(error).into()
    }
}

type RequestOutcome = std::result::Result<(String, Option<serde_json::Value>), RequestFailure>;

#[derive(Debug, Clone, Copy)]
pub(crate) struct DaemonRuntimeOptions {
    pub io_timeout_seconds: u64,
    pub request_limit_bytes: usize,
}

type DaemonManager = VaultManager<JsonVaultStore, FileManagerRevealer>;

pub(crate) fn run_daemon(
    paths: &CloakPaths,
    bind: &str,
    options: DaemonRuntimeOptions,
    driver: GocryptfsDriver,
    settings: MountSettings,
    check: bool,
    max_requests: usize,
) -> Result<()> {
    enforce_daemon_root_strictness(paths)?;
    let bind_addr = validate_daemon_bind(bind)?;
    if check {
        let listener = TcpListener::bind(bind_addr)?;
        drop(listener);
        check_runtime(&driver)?;
        emit_stdout_line("ok")?;
        return Ok(());
    }

    let store = JsonVaultStore::new(paths.vaults_file())?;
    let audit_log = AuditLog::new(paths.audit_file())?;
    let manager: Arc<DaemonManager> = Arc::new(
        VaultManager::new(store, FileManagerRevealer, driver, settings).with_audit_log(audit_log),
    );
    install_shutdown_handler(Arc::clone(&manager));

    let listener = TcpListener::bind(bind_addr)?;
    let listening_addr = listener.local_addr()?;
    tracing::info!(address = %listening_addr, root = %paths.root().display(), "daemon listening");
    emit_stdout_line(&format!("listening: {listening_addr}"))?;

    let mut workers = Vec::new();
    let mut handled_requests = 0_usize;
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(%error, "daemon accept failed");
                continue;
            }
        };
        let manager = Arc::clone(&manager);
        workers.push(thread::spawn(move || serve_connection(&manager, stream, options)));

        handled_requests += 1;
        if max_requests > 0 && handled_requests >= max_requests {
            break;
        }
        workers.retain(|worker| !worker.is_finished());
    }

    for worker in workers {
        let _ = worker.join();
    }
    Ok(())
}

fn install_shutdown_handler(manager: Arc<DaemonManager>) {
    let result = ctrlc::set_handler(move || {
        let signalled = manager.lock_all();
        tracing::info!(count = signalled, "shutting down, locking vaults");
        let deadline = Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        while !manager.list_active_mountpoints().is_empty() && Instant::now() < deadline {
            thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }
        std::process::exit(0);
    });
    if let Err(error) = result {
        tracing::warn!(%error, "failed to install shutdown handler");
    }
}

fn serve_connection<S, R>(
    manager: &VaultManager<S, R>,
    mut stream: TcpStream,
    options: DaemonRuntimeOptions,
) where
    S: VaultStore,
    R: Revealer + 'static,
{
    let io_timeout = Some(Duration::from_secs(options.io_timeout_seconds));
    if let Err(error) = stream
        .set_read_timeout(io_timeout)
        .and_then(|()| stream.set_write_timeout(io_timeout))
    {
        tracing::warn!(%error, "daemon timeout setup failed");
        return;
    }

    if let Err(error) = handle_daemon_connection(manager, &mut stream, options.request_limit_bytes)
    {
        let _ = write_daemon_response(&mut stream, &DaemonResponse::from_failure(error.into()));
    }
}

#[cfg(unix)]
fn assert_private_directory(path: &Path, label: &str) -> Result<()> {
    let mode = std::fs::metadata(path)?.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(CloakError::InvalidInput(format!(
            "{label} must not be group/world accessible: {}",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn assert_private_directory(_path: &Path, _label: &str) -> Result<()> {
    Ok(())
}

fn enforce_daemon_root_strictness(paths: &CloakPaths) -> Result<()> {
    ensure_private_dir(paths.root())?;
    assert_private_directory(paths.root(), "runtime root")
}

/// Fails with the first missing runtime dependency.
pub(crate) fn check_runtime(driver: &GocryptfsDriver) -> Result<()> {
    if !is_fuse_available() {
        return Err(CloakError::MissingFuse);
    }
    driver.gocryptfs_binary()?;
    Ok(())
}

fn emit_stdout_line(line: &str) -> Result<()> {
    match output::stdout_line(line) {
        Ok(OutputStatus::Written | OutputStatus::BrokenPipe) => Ok(()),
        Err(error) => Err(CloakError::Io(error)),
    }
}

fn handle_daemon_connection<S, R, T>(
    manager: &VaultManager<S, R>,
    stream: &mut T,
    request_limit_bytes: usize,
) -> Result<()>
where
    S: VaultStore,
    R: Revealer + 'static,
    T: Read + Write,
{
    let request = read_daemon_request(stream, request_limit_bytes)?;
    let response = execute_daemon_request(manager, request);
    write_daemon_response(stream, &response)
}

pub(crate) fn read_daemon_request<R>(
    stream: &mut R,
    request_limit_bytes: usize,
) -> Result<DaemonRequest>
where
    R: Read,
{
    let mut bytes = read_json_line(stream, request_limit_bytes)?;
    while matches!(bytes.last(), Some(b'\n' | b'\r')) {
        bytes.pop();
    }
    if bytes.is_empty() {
        return Err(CloakError::InvalidInput("empty daemon request".to_owned()));
    }

    serde_json::from_slice::<DaemonRequest>(&bytes)
        .map_err(|error| CloakError::InvalidInput(format!("invalid daemon request: {error}")))
}

/// Reads one newline-terminated frame of at most `limit` bytes.
pub(crate) fn read_json_line<R>(stream: &mut R, limit: usize) -> Result<Vec<u8>>
where
    R: Read,
{
    let mut reader = BufReader::new(stream.take((limit + 1) as u64));
    let mut bytes = Vec::new();
    reader.read_until(b'\n', &mut bytes)?;

    if bytes.is_empty() {
        return Err(CloakError::InvalidInput("empty daemon request".to_owned()));
    }
    if bytes.len() > limit {
        return Err(CloakError::InvalidInput(format!(
            "daemon request too large (max {limit} bytes)"
        )));
    }
    Ok(bytes)
}

pub(crate) fn write_daemon_response<W>(stream: &mut W, response: &DaemonResponse) -> Result<()>
where
    W: Write,
{
    write_json_line(stream, response)
}

/// Writes `value` as one JSON line and flushes.
pub(crate) fn write_json_line<W, T>(stream: &mut W, value: &T) -> Result<()>
where
    W: Write,
    T: serde::Serialize,
{
    let payload = serde_json::to_vec(value)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

fn execute_daemon_request<S, R>(manager: &VaultManager<S, R>, request: DaemonRequest) -> DaemonResponse
where
    S: VaultStore,
    R: Revealer + 'static,
{
    let action = request.action();
    if !matches!(request, DaemonRequest::Ping) {
        if let Err(error) = check_runtime(manager.driver()) {
            tracing::warn!(action, %error, "rejecting request, runtime dependency missing");
            return DaemonResponse::from_failure(error.into());
        }
    }

    match execute_daemon_request_inner(manager, request) {
        Ok((message, data)) => DaemonResponse::Ok { message, data },
        Err(failure) => {
            tracing::debug!(action, error = %failure.error, "request failed");
            DaemonResponse::from_failure(failure)
        }
    }
}

fn execute_daemon_request_inner<S, R>(
    manager: &VaultManager<S, R>,
    request: DaemonRequest,
) -> RequestOutcome
where
    S: VaultStore,
    R: Revealer + 'static,
{
    match request {
        DaemonRequest::Ping => Ok(("pong".to_owned(), None)),
        DaemonRequest::List => {
            let vaults = manager.list()?;
            Ok(("ok".to_owned(), Some(serde_json::to_value(vaults)?)))
        }
        DaemonRequest::Mountpoints => {
            let mountpoints = manager.list_active_mountpoints();
            Ok(("ok".to_owned(), Some(serde_json::to_value(mountpoints)?)))
        }
        DaemonRequest::Add { path } => {
            let vault = manager.add_vault(&path)?;
            Ok(("added".to_owned(), Some(serde_json::to_value(vault)?)))
        }
        DaemonRequest::Create {
            parent,
            name,
            password,
        } => {
            let vault = manager.create_vault(&parent, &name, &Password::new(password))?;
            Ok(("created".to_owned(), Some(serde_json::to_value(vault)?)))
        }
        DaemonRequest::Remove { id } => {
            manager.remove_vault(id)?;
            Ok(("removed".to_owned(), None))
        }
        DaemonRequest::Unlock { id, password } => {
            let state = manager.unlock(id, &Password::new(password))?;
            Ok((state.to_string(), Some(state_payload(id, state))))
        }
        DaemonRequest::Lock { id } => {
            let state = manager.lock(id)?;
            Ok((state.to_string(), Some(state_payload(id, state))))
        }
        DaemonRequest::UpdateOptions {
            id,
            autoreveal,
            readonly,
            mountpoint,
        } => {
            let vault = manager.update_options(
                id,
                VaultOptions {
                    autoreveal,
                    readonly,
                    mountpoint,
                },
            )?;
            Ok(("updated".to_owned(), Some(serde_json::to_value(vault)?)))
        }
        DaemonRequest::ChangePassword {
            id,
            password,
            new_password,
        } => {
            manager.change_password(id, &Password::new(password), &Password::new(new_password))?;
            Ok(("password changed".to_owned(), None))
        }
        DaemonRequest::ResetPassword {
            id,
            masterkey,
            new_password,
        } => {
            manager.reset_password(id, &Password::new(masterkey), &Password::new(new_password))?;
            Ok(("password reset".to_owned(), None))
        }
        DaemonRequest::RevealMasterkey { id, password } => {
            let masterkey = manager.reveal_masterkey(id, &Password::new(password))?;
            Ok((
                "ok".to_owned(),
                Some(serde_json::json!({ "masterkey": masterkey })),
            ))
        }
        DaemonRequest::RevealMountpoint { id } => {
            manager.reveal_mountpoint(id)?;
            Ok(("revealed".to_owned(), None))
        }
        DaemonRequest::RevealVault { id } => {
            manager.reveal_vault(id)?;
            Ok(("revealed".to_owned(), None))
        }
    }
}

fn state_payload(id: VaultId, state: VaultState) -> serde_json::Value {
    serde_json::json!({ "id": id, "state": state })
}
