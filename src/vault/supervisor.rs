//! Ownership of running mount processes.
//!
//! The supervisor holds the only table of active mounts. Every read or write
//! goes through [`SupervisorGuard`], so a caller that checks "is this vault
//! mounted" and then starts a process does both under one lock acquisition.
//! Entries are inserted by [`SupervisorGuard::start`] and removed only by the
//! per-process exit watcher.

use std::{
    collections::{BTreeMap, HashMap},
    ffi::OsString,
    path::PathBuf,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::Duration,
};

use crate::{
    error::{CloakError, Result},
    types::{Password, VaultId},
};

use super::{
    exit_code::{classify_exit, ExitClassification, ExitReport, MountOperation},
    mountpoint::AllocatedMountpoint,
    process::{exit_report, pipe_secret, spawn_piped, OutputCapture},
};

#[derive(Debug)]
struct ActiveMount {
    pid: u32,
    mountpoint: AllocatedMountpoint,
}

#[derive(Debug, Default)]
struct MountTable {
    entries: HashMap<VaultId, ActiveMount>,
}

/// Owner of the active mount table.
#[derive(Debug, Default, Clone)]
pub struct ProcessSupervisor {
    table: Arc<Mutex<MountTable>>,
}

impl ProcessSupervisor {
    /// Creates an empty supervisor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the exclusive table lock.
    pub fn lock(&self) -> SupervisorGuard<'_> {
        SupervisorGuard {
            table: lock_table(&self.table),
            shared: &self.table,
        }
    }
}

fn lock_table(table: &Mutex<MountTable>) -> MutexGuard<'_, MountTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What to launch for one vault.
pub struct StartRequest {
    /// Vault the process belongs to.
    pub vault_id: VaultId,
    /// Executable path.
    pub executable: PathBuf,
    /// Complete argument list.
    pub args: Vec<OsString>,
    /// Text written to the child's stdin.
    pub secret: Password,
    /// Mountpoint this process will serve.
    pub mountpoint: AllocatedMountpoint,
}

/// Exclusive access to the active mount table.
pub struct SupervisorGuard<'a> {
    table: MutexGuard<'a, MountTable>,
    shared: &'a Arc<Mutex<MountTable>>,
}

impl SupervisorGuard<'_> {
    /// Returns true while a mount process for `vault_id` is tracked.
    pub fn is_active(&self, vault_id: VaultId) -> bool {
        self.table.entries.contains_key(&vault_id)
    }

    /// Mountpoint of the tracked process for `vault_id`.
    pub fn mountpoint(&self, vault_id: VaultId) -> Option<&str> {
        self.table
            .entries
            .get(&vault_id)
            .map(|entry| entry.mountpoint.path.as_str())
    }

    /// Snapshot of every tracked vault and its mountpoint.
    pub fn active_mountpoints(&self) -> BTreeMap<VaultId, String> {
        self.table
            .entries
            .iter()
            .map(|(vault_id, entry)| (*vault_id, entry.mountpoint.path.clone()))
            .collect()
    }

    /// Launches the mount process and its exit watcher.
    ///
    /// The caller must have checked [`Self::is_active`] under this same
    /// guard. On spawn failure nothing is recorded and releasing the
    /// mountpoint stays the caller's job.
    pub fn start(&mut self, request: StartRequest) -> Result<Completion> {
        let StartRequest {
            vault_id,
            executable,
            args,
            secret,
            mountpoint,
        } = request;
        if self.is_active(vault_id) {
            return Err(CloakError::AlreadyUnlocked);
        }

        let mut child = spawn_piped(&executable, &args).map_err(|error| {
            tracing::error!(
                vault_id,
                executable = %executable.display(),
                %error,
                "failed to start mount process"
            );
            CloakError::ProcessStart(error)
        })?;
        let pid = child.id();
        let capture = OutputCapture::attach(&mut child);
        let Some(stdin) = child.stdin.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CloakError::StdinPipe);
        };
        pipe_secret(stdin, secret, "gocryptfs");

        tracing::debug!(vault_id, pid, mountpoint = %mountpoint.path, "mount process started");
        self.table.entries.insert(
            vault_id,
            ActiveMount {
                pid,
                mountpoint: mountpoint.clone(),
            },
        );

        let (sender, receiver) = mpsc::sync_channel(0);
        let shared = Arc::clone(self.shared);
        thread::spawn(move || {
            let status = child.wait();
            let report = exit_report(status, capture.collect());
            retire(&shared, vault_id, pid, &mountpoint);
            log_exit(vault_id, pid, &mountpoint.path, &report);
            deliver(sender, report);
        });

        Ok(Completion { pid, receiver })
    }

    /// Sends `SIGINT` to the tracked process; the watcher does the cleanup.
    pub fn signal_stop(&self, vault_id: VaultId) -> Result<()> {
        let entry = self
            .table
            .entries
            .get(&vault_id)
            .ok_or(CloakError::AlreadyLocked)?;
        interrupt(entry.pid)
    }

    /// Sends `SIGINT` to every tracked process, returning how many were signalled.
    pub fn signal_all(&self) -> usize {
        let mut signalled = 0;
        for (vault_id, entry) in &self.table.entries {
            match interrupt(entry.pid) {
                Ok(()) => signalled += 1,
                Err(error) => {
                    tracing::warn!(vault_id, pid = entry.pid, %error, "failed to signal mount process");
                }
            }
        }
        signalled
    }
}

fn retire(
    shared: &Mutex<MountTable>,
    vault_id: VaultId,
    pid: u32,
    mountpoint: &AllocatedMountpoint,
) {
    let mut table = lock_table(shared);
    if table
        .entries
        .get(&vault_id)
        .is_some_and(|entry| entry.pid == pid)
    {
        table.entries.remove(&vault_id);
    }
    mountpoint.release();
}

fn deliver(sender: SyncSender<ExitReport>, report: ExitReport) {
    // Blocks until the receiver takes the report or is dropped.
    let _ = sender.send(report);
}

fn log_exit(vault_id: VaultId, pid: u32, mountpoint: &str, report: &ExitReport) {
    match classify_exit(MountOperation::Unlock, report) {
        ExitClassification::Interrupted => {
            tracing::info!(vault_id, pid, mountpoint, "vault locked");
        }
        ExitClassification::Success => {
            tracing::debug!(
                vault_id,
                pid,
                mountpoint,
                "mount process exited without error, probably unmounted manually"
            );
        }
        ExitClassification::Failure(error) => {
            tracing::debug!(vault_id, pid, mountpoint, code = report.code, %error, "mount refused");
        }
        ExitClassification::Unknown(diagnostic) => {
            tracing::error!(
                vault_id,
                pid,
                mountpoint,
                code = report.code,
                signal = report.signal,
                %diagnostic,
                "mount process exited unexpectedly"
            );
        }
    }
}

#[cfg(unix)]
fn interrupt(pid: u32) -> Result<()> {
    use nix::{
        errno::Errno,
        sys::signal::{kill, Signal},
        unistd::Pid,
    };

    let raw_pid = i32::try_from(pid)
        .map_err(|_| CloakError::InvalidInput(format!("process id out of range: {pid}")))?;
    match kill(Pid::from_raw(raw_pid), Signal::SIGINT) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(CloakError::Io(errno.into())),
    }
}

#[cfg(not(unix))]
fn interrupt(pid: u32) -> Result<()> {
    Err(CloakError::InvalidInput(format!(
        "cannot interrupt process {pid}: signals are unsupported on this platform"
    )))
}

/// One-shot handle for the exit report of a started process.
///
/// The watcher writes at most one report and then drops its sender. A
/// caller that stops waiting must call [`Completion::drain_in_background`]
/// so the watcher never blocks on delivery.
#[derive(Debug)]
pub struct Completion {
    pid: u32,
    receiver: Receiver<ExitReport>,
}

impl Completion {
    /// Process id of the started child.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Waits up to `timeout` for the process to exit.
    ///
    /// Returns `None` when the process is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ExitReport> {
        match self.receiver.recv_timeout(timeout) {
            Ok(report) => Some(report),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(ExitReport {
                stderr: "process watcher stopped without reporting".to_owned(),
                ..ExitReport::default()
            }),
        }
    }

    /// Blocks until the process exits.
    pub fn wait(self) -> Option<ExitReport> {
        self.receiver.recv().ok()
    }

    /// Moves the receiver to a thread that discards the eventual report.
    pub fn drain_in_background(self) {
        let Self { pid, receiver } = self;
        thread::spawn(move || {
            if let Ok(report) = receiver.recv() {
                tracing::trace!(pid, code = report.code, "drained late exit report");
            }
        });
    }
}
