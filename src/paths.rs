use std::path::{Path, PathBuf};

/// Canonical path layout for cloak runtime files.
#[derive(Debug, Clone)]
pub struct CloakPaths {
    root: PathBuf,
}

impl CloakPaths {
    /// Creates a path layout rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Vault records JSON file.
    pub fn vaults_file(&self) -> PathBuf {
        self.root.join("vaults.json")
    }

    /// Audit log JSONL file.
    pub fn audit_file(&self) -> PathBuf {
        self.root.join("audit.jsonl")
    }
}
