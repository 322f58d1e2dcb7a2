//! Mount lifecycle for gocryptfs vaults.

/// gocryptfs argument construction and one-shot tool runs.
pub mod driver;
/// Exit status classification.
pub mod exit_code;
/// Binary and FUSE discovery.
pub mod locator;
/// Mountpoint allocation.
pub mod mountpoint;
/// Revealing paths in the file manager.
pub mod reveal;
/// Active mount table and exit watchers.
pub mod supervisor;

mod manager;
pub(crate) mod process;

pub use driver::GocryptfsDriver;
pub use exit_code::{classify_exit, ExitClassification, ExitReport, MountOperation};
pub use manager::{MountSettings, VaultManager, DEFAULT_GRACE_PERIOD};
pub use mountpoint::{AllocatedMountpoint, MountpointPolicy};
pub use reveal::{FileManagerRevealer, RevealTiming, Revealer};
pub use supervisor::{Completion, ProcessSupervisor, StartRequest};
