//! Opening vault paths in the desktop file manager.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crate::error::Result;

/// Shows a path to the user.
pub trait Revealer: Send + Sync {
    /// Opens `path` in the platform file manager.
    fn reveal(&self, path: &Path) -> Result<()>;
}

/// [`Revealer`] backed by the platform opener (`xdg-open`, `open`, ...).
#[derive(Debug, Default, Clone, Copy)]
pub struct FileManagerRevealer;

impl Revealer for FileManagerRevealer {
    fn reveal(&self, path: &Path) -> Result<()> {
        open::that_detached(path)?;
        Ok(())
    }
}

/// Polling schedule for the auto-reveal watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevealTiming {
    /// Total time to wait for the mountpoint to appear.
    pub timeout: Duration,
    /// Delay between checks.
    pub poll_interval: Duration,
}

impl Default for RevealTiming {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Starts a detached thread that reveals `mountpoint` once it is a directory.
///
/// Gives up silently (with a warning) after `timing.timeout`.
pub fn spawn_auto_reveal<R>(revealer: Arc<R>, mountpoint: PathBuf, timing: RevealTiming)
where
    R: Revealer + ?Sized + 'static,
{
    thread::spawn(move || {
        let deadline = Instant::now() + timing.timeout;
        loop {
            if mountpoint.is_dir() {
                if let Err(error) = revealer.reveal(&mountpoint) {
                    tracing::warn!(mountpoint = %mountpoint.display(), %error, "failed to reveal mountpoint");
                }
                return;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    mountpoint = %mountpoint.display(),
                    timeout = ?timing.timeout,
                    "mountpoint did not appear, skipping auto-reveal"
                );
                return;
            }
            thread::sleep(timing.poll_interval);
        }
    });
}
