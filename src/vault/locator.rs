//! Runtime discovery of gocryptfs binaries and FUSE support.

use std::path::{Path, PathBuf};

/// Default gocryptfs executable name.
pub const GOCRYPTFS_BINARY: &str = "gocryptfs";
/// Default gocryptfs-xray executable name.
pub const GOCRYPTFS_XRAY_BINARY: &str = "gocryptfs-xray";

#[cfg(target_os = "macos")]
const MACFUSE_LOADERS: [&str; 2] = [
    "/Library/Filesystems/macfuse.fs/Contents/Resources/load_macfuse",
    "/Library/Filesystems/osxfuse.fs/Contents/Resources/load_osxfuse",
];
#[cfg(not(target_os = "macos"))]
const FUSERMOUNT_BINARIES: [&str; 2] = ["fusermount", "fusermount3"];

/// Resolves `binary` to an executable path.
///
/// A binary shipped next to the running executable wins over one on `PATH`.
/// Names containing a directory component are checked as given.
pub fn locate_binary(binary: &str) -> Option<PathBuf> {
    let candidate = Path::new(binary);
    if candidate
        .parent()
        .is_some_and(|parent| !parent.as_os_str().is_empty())
    {
        return is_executable_file(candidate).then(|| candidate.to_path_buf());
    }

    if let Some(sibling) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(binary)))
    {
        if is_executable_file(&sibling) {
            return Some(sibling);
        }
    }

    search_path(binary)
}

/// Resolves an optional configured path, falling back to discovery by name.
pub fn resolve_binary(configured: Option<&Path>, default_name: &str) -> Option<PathBuf> {
    match configured {
        Some(path) => is_executable_file(path).then(|| path.to_path_buf()),
        None => locate_binary(default_name),
    }
}

/// Reports whether a FUSE runtime is installed.
pub fn is_fuse_available() -> bool {
    #[cfg(target_os = "macos")]
    {
        MACFUSE_LOADERS.iter().any(|loader| Path::new(loader).is_file())
    }
    #[cfg(not(target_os = "macos"))]
    {
        FUSERMOUNT_BINARIES
            .iter()
            .any(|binary| search_path(binary).is_some())
    }
}

fn search_path(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for directory in std::env::split_paths(&path_var) {
        let path_candidate = directory.join(binary);
        if is_executable_file(&path_candidate) {
            return Some(path_candidate);
        }
        #[cfg(windows)]
        {
            for suffix in [".exe", ".cmd", ".bat"] {
                let suffixed = directory.join(format!("{binary}{suffix}"));
                if is_executable_file(&suffixed) {
                    return Some(suffixed);
                }
            }
        }
    }
    None
}

fn is_executable_file(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(all(test, unix))]
mod unit_tests {
    use std::{fs, os::unix::fs::PermissionsExt};

    use super::{locate_binary, resolve_binary};

    #[test]
    fn explicit_paths_must_be_executable() {
        let temp_dir = tempfile::tempdir().unwrap();
        let script = temp_dir.path().join("gocryptfs");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(locate_binary(script.to_str().unwrap()).is_none());

        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(locate_binary(script.to_str().unwrap()), Some(script.clone()));
        assert_eq!(resolve_binary(Some(&script), "unused"), Some(script));
    }

    #[test]
    fn configured_missing_path_does_not_fall_back() {
        assert!(resolve_binary(Some("/nonexistent/gocryptfs".as_ref()), "sh").is_none());
    }

    #[test]
    fn shell_is_found_on_path() {
        assert!(locate_binary("sh").is_some());
    }
}
