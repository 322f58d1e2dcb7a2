use std::{
    collections::BTreeMap,
    fs,
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use crate::{
    audit::{AuditEvent, AuditLog},
    error::{CloakError, Result, StatefulError},
    fs_secure::create_private_dir,
    store::VaultStore,
    types::{
        NewVault, Password, Vault, VaultId, VaultInfo, VaultOptions, VaultState,
        GOCRYPTFS_CONF_FILE,
    },
};

use super::{
    driver::GocryptfsDriver,
    exit_code::{classify_exit, ExitClassification, MountOperation},
    mountpoint::MountpointPolicy,
    reveal::{spawn_auto_reveal, RevealTiming, Revealer},
    supervisor::{ProcessSupervisor, StartRequest},
};

/// Default readiness window for a fresh mount process.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(1000);

/// Timing and placement knobs for unlock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSettings {
    /// How long a fresh mount process must survive to count as unlocked.
    pub grace_period: Duration,
    /// Auto-reveal polling schedule.
    pub reveal: RevealTiming,
    /// Where generated mountpoints go.
    pub policy: MountpointPolicy,
}

impl Default for MountSettings {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            reveal: RevealTiming::default(),
            policy: MountpointPolicy::platform_default(),
        }
    }
}

/// Coordinator for vault records and their mount processes.
///
/// One instance is shared by every request handler; all mount state lives in
/// its [`ProcessSupervisor`].
pub struct VaultManager<S, R>
where
    S: VaultStore,
    R: Revealer + 'static,
{
    store: S,
    revealer: Arc<R>,
    driver: GocryptfsDriver,
    supervisor: ProcessSupervisor,
    settings: MountSettings,
    audit_log: Option<AuditLog>,
}

impl<S, R> VaultManager<S, R>
where
    S: VaultStore,
    R: Revealer + 'static,
{
    /// Constructs a manager with no audit log.
    pub fn new(store: S, revealer: R, driver: GocryptfsDriver, settings: MountSettings) -> Self {
        Self {
            store,
            revealer: Arc::new(revealer),
            driver,
            supervisor: ProcessSupervisor::new(),
            settings,
            audit_log: None,
        }
    }

    /// Records lifecycle events to `audit_log`.
    pub fn with_audit_log(mut self, audit_log: AuditLog) -> Self {
        self.audit_log = Some(audit_log);
        self
    }

    /// Resolved gocryptfs binaries.
    pub fn driver(&self) -> &GocryptfsDriver {
        &self.driver
    }

    /// Starts a mount process and waits out the readiness window.
    pub fn unlock(
        &self,
        vault_id: VaultId,
        password: &Password,
    ) -> std::result::Result<VaultState, StatefulError> {
        let (vault, mountpoint, completion) = {
            let mut guard = self.supervisor.lock();
            if guard.is_active(vault_id) {
                return Err(StatefulError::new(
                    VaultState::Unlocked,
                    CloakError::AlreadyUnlocked,
                ));
            }
            let vault = self.store.get(vault_id).map_err(StatefulError::locked)?;
            let executable = self
                .driver
                .gocryptfs_binary()
                .map_err(StatefulError::locked)?
                .to_path_buf();
            let mountpoint = self
                .settings
                .policy
                .allocate(&vault)
                .map_err(StatefulError::locked)?;
            let request = StartRequest {
                vault_id,
                executable,
                args: GocryptfsDriver::unlock_args(&vault, &mountpoint.path),
                secret: password.expose(|text| Password::new(text)),
                mountpoint: mountpoint.clone(),
            };
            match guard.start(request) {
                Ok(completion) => (vault, mountpoint.path, completion),
                Err(error) => {
                    mountpoint.release();
                    self.record_unlock_failure(vault_id, &error);
                    return Err(StatefulError::locked(error));
                }
            }
        };

        if let Some(report) = completion.wait_timeout(self.settings.grace_period) {
            let error = match classify_exit(MountOperation::Unlock, &report) {
                ExitClassification::Failure(error) => error,
                ExitClassification::Unknown(diagnostic) => CloakError::Unknown(diagnostic),
                ExitClassification::Success | ExitClassification::Interrupted => {
                    CloakError::Unknown(report.diagnostic())
                }
            };
            tracing::warn!(vault_id, code = report.code, %error, "unlock failed");
            self.record_unlock_failure(vault_id, &error);
            return Err(StatefulError::locked(error));
        }

        completion.drain_in_background();
        tracing::info!(vault_id, mountpoint = %mountpoint, "vault unlocked");
        self.record(AuditEvent::VaultUnlocked {
            vault_id,
            mountpoint: mountpoint.clone(),
        });
        if vault.autoreveal {
            spawn_auto_reveal(
                Arc::clone(&self.revealer),
                PathBuf::from(mountpoint),
                self.settings.reveal,
            );
        }
        Ok(VaultState::Unlocked)
    }

    /// Asks the mount process to exit. Cleanup happens on the watcher thread.
    pub fn lock(&self, vault_id: VaultId) -> std::result::Result<VaultState, StatefulError> {
        let guard = self.supervisor.lock();
        match guard.signal_stop(vault_id) {
            Ok(()) => {
                drop(guard);
                self.record(AuditEvent::VaultLocked { vault_id });
                Ok(VaultState::Locked)
            }
            Err(error @ CloakError::AlreadyLocked) => Err(StatefulError::locked(error)),
            Err(error) => Err(StatefulError::new(VaultState::Unlocked, error)),
        }
    }

    /// Returns true while a mount process is tracked for `vault_id`.
    pub fn is_unlocked(&self, vault_id: VaultId) -> bool {
        self.supervisor.lock().is_active(vault_id)
    }

    /// Mountpoints of every unlocked vault.
    pub fn list_active_mountpoints(&self) -> BTreeMap<VaultId, String> {
        self.supervisor.lock().active_mountpoints()
    }

    /// Signals every mount process; returns how many were signalled.
    pub fn lock_all(&self) -> usize {
        let signalled = self.supervisor.lock().signal_all();
        if signalled > 0 {
            tracing::info!(count = signalled, "locking all vaults");
        }
        signalled
    }

    /// Every stored vault with its current state.
    pub fn list(&self) -> Result<Vec<VaultInfo>> {
        let vaults = self.store.list()?;
        let guard = self.supervisor.lock();
        Ok(vaults
            .into_iter()
            .map(|vault| {
                let active_mountpoint = guard.mountpoint(vault.id).map(str::to_owned);
                let state = if active_mountpoint.is_some() {
                    VaultState::Unlocked
                } else {
                    VaultState::Locked
                };
                VaultInfo {
                    vault,
                    state,
                    active_mountpoint,
                }
            })
            .collect())
    }

    /// Registers an existing vault from its `gocryptfs.conf` (or its directory).
    pub fn add_vault(&self, path: &Path) -> Result<Vault> {
        let conf_path = if path.is_dir() {
            path.join(GOCRYPTFS_CONF_FILE)
        } else {
            path.to_path_buf()
        };
        if !conf_path.is_file() {
            return Err(CloakError::PathNotExist);
        }
        let vault_dir = conf_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let vault_dir = fs::canonicalize(&vault_dir)?;

        let vault = self.store.create(NewVault {
            path: vault_dir,
            ..NewVault::default()
        })?;
        tracing::debug!(vault_id = vault.id, path = %vault.path.display(), "added existing vault");
        self.record(AuditEvent::VaultAdded {
            vault_id: vault.id,
            path: vault.path.clone(),
        });
        Ok(vault)
    }

    /// Initializes `parent/name` as a new gocryptfs vault and registers it.
    pub fn create_vault(&self, parent: &Path, name: &str, password: &Password) -> Result<Vault> {
        validate_vault_dir_name(name)?;
        if !parent.is_dir() {
            return Err(CloakError::PathNotExist);
        }
        let vault_dir = parent.join(name);
        create_private_dir(&vault_dir).map_err(|error| {
            tracing::error!(path = %vault_dir.display(), %error, "failed to create vault directory");
            CloakError::VaultMkdirFailed(error.to_string())
        })?;
        self.driver.init(&vault_dir, password)?;

        let vault = self.store.create(NewVault {
            path: fs::canonicalize(&vault_dir)?,
            ..NewVault::default()
        })?;
        tracing::debug!(vault_id = vault.id, path = %vault.path.display(), "created vault");
        self.record(AuditEvent::VaultCreated {
            vault_id: vault.id,
            path: vault.path.clone(),
        });
        Ok(vault)
    }

    /// Forgets a vault, locking it first if needed. The encrypted directory stays.
    pub fn remove_vault(&self, vault_id: VaultId) -> Result<()> {
        let guard = self.supervisor.lock();
        if guard.is_active(vault_id) {
            guard.signal_stop(vault_id)?;
        }
        self.store.delete(vault_id)?;
        drop(guard);
        tracing::debug!(vault_id, "vault removed");
        self.record(AuditEvent::VaultRemoved { vault_id });
        Ok(())
    }

    /// Applies option changes to a locked vault.
    pub fn update_options(&self, vault_id: VaultId, options: VaultOptions) -> Result<Vault> {
        let guard = self.supervisor.lock();
        if guard.is_active(vault_id) {
            return Err(CloakError::AlreadyUnlocked);
        }
        let mut vault = self.store.get(vault_id)?;
        if let Some(autoreveal) = options.autoreveal {
            vault.autoreveal = autoreveal;
        }
        if let Some(readonly) = options.readonly {
            vault.readonly = readonly;
        }
        if let Some(mountpoint) = options.mountpoint {
            vault.mountpoint = mountpoint.trim().to_owned();
        }
        self.store.update(&vault)?;
        drop(guard);
        self.record(AuditEvent::VaultOptionsUpdated { vault_id });
        Ok(vault)
    }

    /// Changes a locked vault's password.
    pub fn change_password(
        &self,
        vault_id: VaultId,
        old_password: &Password,
        new_password: &Password,
    ) -> Result<()> {
        let vault = self.locked_vault(vault_id)?;
        self.driver
            .change_password(&vault.path, old_password, new_password)?;
        tracing::info!(vault_id, "vault password changed");
        self.record(AuditEvent::VaultPasswordChanged { vault_id });
        Ok(())
    }

    /// Resets a locked vault's password using its master key.
    pub fn reset_password(
        &self,
        vault_id: VaultId,
        masterkey: &Password,
        new_password: &Password,
    ) -> Result<()> {
        let vault = self.locked_vault(vault_id)?;
        self.driver
            .reset_password(&vault.path, masterkey, new_password)?;
        tracing::info!(vault_id, "vault password reset with master key");
        self.record(AuditEvent::VaultPasswordReset { vault_id });
        Ok(())
    }

    /// Decrypts and returns the vault's master key.
    pub fn reveal_masterkey(&self, vault_id: VaultId, password: &Password) -> Result<String> {
        let vault = self.store.get(vault_id)?;
        self.driver.dump_masterkey(&vault.path, password)
    }

    /// Opens the active mountpoint of an unlocked vault.
    pub fn reveal_mountpoint(&self, vault_id: VaultId) -> Result<()> {
        let mountpoint = self
            .supervisor
            .lock()
            .mountpoint(vault_id)
            .map(PathBuf::from)
            .ok_or(CloakError::AlreadyLocked)?;
        self.reveal_dir(&mountpoint)
    }

    /// Opens the encrypted directory of a vault.
    pub fn reveal_vault(&self, vault_id: VaultId) -> Result<()> {
        let vault = self.store.get(vault_id)?;
        self.reveal_dir(&vault.path)
    }

    fn reveal_dir(&self, path: &Path) -> Result<()> {
        if !path.is_dir() {
            tracing::warn!(path = %path.display(), "cannot reveal missing directory");
            return Err(CloakError::PathNotExist);
        }
        self.revealer.reveal(path)
    }

    fn locked_vault(&self, vault_id: VaultId) -> Result<Vault> {
        let guard = self.supervisor.lock();
        if guard.is_active(vault_id) {
            return Err(CloakError::AlreadyUnlocked);
        }
        self.store.get(vault_id)
    }

    fn record_unlock_failure(&self, vault_id: VaultId, error: &CloakError) {
        self.record(AuditEvent::VaultUnlockFailed {
            vault_id,
            reason: error.to_string(),
        });
    }

    fn record(&self, event: AuditEvent) {
        if let Some(audit_log) = &self.audit_log {
            audit_log.record(event);
        }
    }
}

fn validate_vault_dir_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(CloakError::InvalidInput(format!(
            "vault name must be a single directory name: {name:?}"
        ))),
    }
}
