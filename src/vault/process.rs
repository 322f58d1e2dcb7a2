//! Child-process plumbing shared by the supervisor and one-shot tool runs.

use std::{
    ffi::OsString,
    io::{self, Read, Write},
    path::Path,
    process::{Child, ChildStdin, Command, ExitStatus, Stdio},
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    thread,
    time::{Duration, Instant},
};

use crate::types::Password;

use super::exit_code::ExitReport;

const EXEC_BUSY_RETRY_ATTEMPTS: usize = 20;
const EXEC_BUSY_RETRY_DELAY: Duration = Duration::from_millis(10);
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Stdout,
    Stderr,
}

/// Collects a child's stdout and stderr on background threads.
pub(crate) struct OutputCapture {
    receiver: Receiver<(StreamKind, String)>,
    pending: usize,
}

impl OutputCapture {
    /// Starts reader threads for whatever output pipes `child` has.
    pub(crate) fn attach(child: &mut Child) -> Self {
        let (sender, receiver) = mpsc::channel();
        let mut pending = 0;
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(StreamKind::Stdout, stdout, sender.clone());
            pending += 1;
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(StreamKind::Stderr, stderr, sender);
            pending += 1;
        }
        Self { receiver, pending }
    }

    /// Waits briefly for both streams to close and returns `(stdout, stderr)`.
    ///
    /// A grandchild that inherited the pipes can keep them open forever, so
    /// collection gives up after a bounded drain window.
    pub(crate) fn collect(self) -> (String, String) {
        let deadline = Instant::now() + OUTPUT_DRAIN_TIMEOUT;
        let mut stdout = String::new();
        let mut stderr = String::new();
        for _ in 0..self.pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok((StreamKind::Stdout, text)) => stdout = text,
                Ok((StreamKind::Stderr, text)) => stderr = text,
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
            }
        }
        (stdout, stderr)
    }
}

fn spawn_reader<R>(kind: StreamKind, mut stream: R, sender: mpsc::Sender<(StreamKind, String)>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut bytes = Vec::new();
        let _ = stream.read_to_end(&mut bytes);
        let _ = sender.send((kind, String::from_utf8_lossy(&bytes).into_owned()));
    });
}

/// Spawns `executable` with piped stdio.
pub(crate) fn spawn_piped(executable: &Path, args: &[OsString]) -> io::Result<Child> {
    retry_exec_busy(|| {
        Command::new(executable)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    })
}

/// Writes `payload` to the child's stdin on its own thread, then closes it.
pub(crate) fn pipe_secret(mut stdin: ChildStdin, payload: Password, label: &'static str) {
    thread::spawn(move || {
        if let Err(error) = payload.expose(|text| stdin.write_all(text.as_bytes())) {
            tracing::warn!(process = label, %error, "failed to pipe secret to process stdin");
        }
        drop(stdin);
    });
}

/// Builds an exit report from a finished child's status.
pub(crate) fn exit_report(status: io::Result<ExitStatus>, output: (String, String)) -> ExitReport {
    let (stdout, stderr) = output;
    match status {
        Ok(status) => ExitReport {
            code: status.code(),
            signal: exit_signal(&status),
            stdout,
            stderr,
        },
        Err(error) => ExitReport {
            code: None,
            signal: None,
            stdout,
            stderr: format!("failed to wait for process: {error}"),
        },
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Runs a short-lived tool to completion, feeding `payload` on stdin.
pub(crate) fn run_with_stdin(
    executable: &Path,
    args: &[OsString],
    payload: Password,
    label: &'static str,
) -> io::Result<ExitReport> {
    let mut child = spawn_piped(executable, args)?;
    let capture = OutputCapture::attach(&mut child);
    match child.stdin.take() {
        Some(stdin) => pipe_secret(stdin, payload, label),
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "process stdin was not captured",
            ));
        }
    }
    let status = child.wait();
    Ok(exit_report(status, capture.collect()))
}

fn retry_exec_busy<T, F>(mut operation: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let mut last_error = None;
    for attempt in 0..EXEC_BUSY_RETRY_ATTEMPTS {
        match operation() {
            Ok(value) => return Ok(value),
            Err(error) if is_exec_busy_error(&error) && attempt + 1 < EXEC_BUSY_RETRY_ATTEMPTS => {
                last_error = Some(error);
                thread::sleep(EXEC_BUSY_RETRY_DELAY);
            }
            Err(error) => return Err(error),
        }
    }

    Err(last_error.unwrap_or_else(|| io::Error::other("command execution failed")))
}

fn is_exec_busy_error(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::ExecutableFileBusy || error.raw_os_error() == Some(26)
}
