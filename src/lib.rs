#![deny(missing_docs)]
//! Cloak supervises gocryptfs mount processes for a set of registered vaults.

/// Audit log module.
pub mod audit;
/// Command-line interface.
pub mod cli;
/// Bootstrap config parsing and validation.
pub mod config;
/// Error types.
pub mod error;
/// Secure filesystem helpers.
pub mod fs_secure;
/// Shared runtime path layout.
pub mod paths;
/// Vault record persistence.
pub mod store;
/// Shared types.
pub mod types;
/// Mount lifecycle for gocryptfs vaults.
pub mod vault;
