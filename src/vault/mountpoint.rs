//! Mountpoint selection for one unlock attempt.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    error::{CloakError, Result},
    fs_secure::create_private_dir,
    types::Vault,
};

#[cfg(target_os = "macos")]
const MACOS_VOLUMES_DIR: &str = "/Volumes";

/// Where generated mountpoints live and who creates them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountpointPolicy {
    /// Parent directory for generated mountpoints.
    pub base_dir: PathBuf,
    /// Whether cloak must create the directory before mounting.
    pub creates_dir: bool,
}

impl MountpointPolicy {
    /// Platform default: `/Volumes` (created by macFUSE) on macOS, the temp
    /// directory (created here) elsewhere.
    pub fn platform_default() -> Self {
        #[cfg(target_os = "macos")]
        {
            Self {
                base_dir: PathBuf::from(MACOS_VOLUMES_DIR),
                creates_dir: false,
            }
        }
        #[cfg(not(target_os = "macos"))]
        {
            Self {
                base_dir: std::env::temp_dir(),
                creates_dir: true,
            }
        }
    }

    /// Platform default with a different base directory.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::platform_default()
        }
    }

    /// Picks the mountpoint for `vault`.
    ///
    /// A non-blank persisted mountpoint is returned verbatim and never
    /// created. Otherwise a random child of `base_dir` is chosen and, when
    /// this policy creates directories, created with owner-only access.
    pub fn allocate(&self, vault: &Vault) -> Result<AllocatedMountpoint> {
        if !vault.mountpoint.trim().is_empty() {
            return Ok(AllocatedMountpoint {
                path: vault.mountpoint.clone(),
                created: false,
            });
        }

        let path = self.base_dir.join(random_mountpoint_name());
        if !self.creates_dir {
            return Ok(AllocatedMountpoint {
                path: path.to_string_lossy().into_owned(),
                created: false,
            });
        }

        if let Err(error) = create_private_dir(&path) {
            tracing::error!(
                vault_id = vault.id,
                mountpoint = %path.display(),
                %error,
                "failed to create mountpoint directory"
            );
            return Err(CloakError::MountpointCreateFailed);
        }
        Ok(AllocatedMountpoint {
            path: path.to_string_lossy().into_owned(),
            created: true,
        })
    }
}

impl Default for MountpointPolicy {
    fn default() -> Self {
        Self::platform_default()
    }
}

/// Mountpoint chosen for one unlock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedMountpoint {
    /// Mountpoint passed to gocryptfs.
    pub path: String,
    /// True when the allocator created the directory and owns its removal.
    pub created: bool,
}

impl AllocatedMountpoint {
    /// Removes the directory if this allocation created it.
    pub fn release(&self) {
        if !self.created {
            return;
        }
        if let Err(error) = fs::remove_dir(Path::new(&self.path)) {
            tracing::error!(mountpoint = %self.path, %error, "failed to remove mountpoint directory");
        }
    }
}

fn random_mountpoint_name() -> String {
    format!("{:x}", rand::random::<u32>() >> 1)
}

#[cfg(test)]
mod unit_tests {
    use super::random_mountpoint_name;

    #[test]
    fn random_names_are_lowercase_hex() {
        for _ in 0..32 {
            let name = random_mountpoint_name();
            assert!(!name.is_empty() && name.len() <= 8);
            assert!(name
                .chars()
                .all(|character| character.is_ascii_digit() || ('a'..='f').contains(&character)));
            assert!(u32::from_str_radix(&name, 16).unwrap() <= i32::MAX as u32);
        }
    }
}
