use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{CloakError, Result},
    fs_secure::{create_private_file_if_missing, write_private_file_atomic},
    types::{NewVault, Vault, VaultId},
};

const EMPTY_STORE: &[u8] = br#"{"next_id":1,"vaults":[]}"#;

/// Record store for vault metadata.
pub trait VaultStore: Send + Sync {
    /// Loads one vault; [`CloakError::VaultNotExist`] when missing.
    fn get(&self, id: VaultId) -> Result<Vault>;
    /// Replaces an existing vault record.
    fn update(&self, vault: &Vault) -> Result<()>;
    /// Inserts a new record and assigns its id.
    fn create(&self, vault: NewVault) -> Result<Vault>;
    /// Deletes a record.
    fn delete(&self, id: VaultId) -> Result<()>;
    /// Lists all records ordered by id.
    fn list(&self) -> Result<Vec<Vault>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    next_id: VaultId,
    vaults: Vec<Vault>,
}

/// Vault records kept in one JSON file.
pub struct JsonVaultStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonVaultStore {
    /// Opens the store at `path`, creating an empty one if missing.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let file_path = path.as_ref().to_path_buf();
        create_private_file_if_missing(&file_path, EMPTY_STORE)?;
        Ok(Self {
            path: file_path,
            write_lock: Mutex::new(()),
        })
    }

    fn load(&self) -> Result<StoreFile> {
        let bytes = fs::read(&self.path)?;
        let mut file: StoreFile = serde_json::from_slice(&bytes)?;
        let max_id = file.vaults.iter().map(|vault| vault.id).max().unwrap_or(0);
        if file.next_id <= max_id {
            file.next_id = max_id + 1;
        }
        Ok(file)
    }

    fn save(&self, file: &StoreFile) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(file)?;
        write_private_file_atomic(&self.path, &bytes)
    }

    fn modify<T>(&self, change: impl FnOnce(&mut StoreFile) -> Result<T>) -> Result<T> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut file = self.load()?;
        let value = change(&mut file)?;
        self.save(&file)?;
        Ok(value)
    }
}

impl VaultStore for JsonVaultStore {
    fn get(&self, id: VaultId) -> Result<Vault> {
        self.load()?
            .vaults
            .into_iter()
            .find(|vault| vault.id == id)
            .ok_or(CloakError::VaultNotExist)
    }

    fn update(&self, vault: &Vault) -> Result<()> {
        self.modify(|file| {
            let slot = file
                .vaults
                .iter_mut()
                .find(|existing| existing.id == vault.id)
                .ok_or(CloakError::VaultNotExist)?;
            *slot = vault.clone();
            Ok(())
        })
    }

    fn create(&self, vault: NewVault) -> Result<Vault> {
        self.modify(|file| {
            let id = file.next_id.max(1);
            file.next_id = id + 1;
            let record = Vault {
                id,
                path: vault.path,
                mountpoint: vault.mountpoint,
                autoreveal: vault.autoreveal,
                readonly: vault.readonly,
            };
            file.vaults.push(record.clone());
            Ok(record)
        })
    }

    fn delete(&self, id: VaultId) -> Result<()> {
        self.modify(|file| {
            let before = file.vaults.len();
            file.vaults.retain(|vault| vault.id != id);
            if file.vaults.len() == before {
                return Err(CloakError::VaultNotExist);
            }
            Ok(())
        })
    }

    fn list(&self) -> Result<Vec<Vault>> {
        let mut vaults = self.load()?.vaults;
        vaults.sort_by_key(|vault| vault.id);
        Ok(vaults)
    }
}

#[cfg(test)]
mod unit_tests {
    use super::{JsonVaultStore, VaultStore};
    use crate::{error::CloakError, types::NewVault};

    fn new_vault(path: &str) -> NewVault {
        NewVault {
            path: path.into(),
            ..NewVault::default()
        }
    }

    #[test]
    fn create_assigns_increasing_ids_and_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file = temp_dir.path().join("vaults.json");
        let store = JsonVaultStore::new(&file).unwrap();
        let first = store.create(new_vault("/a")).unwrap();
        let second = store.create(new_vault("/b")).unwrap();
        assert_eq!((first.id, second.id), (1, 2));

        let reopened = JsonVaultStore::new(&file).unwrap();
        assert_eq!(reopened.list().unwrap().len(), 2);
        assert_eq!(reopened.get(2).unwrap().path, std::path::PathBuf::from("/b"));
    }

    #[test]
    fn deleted_ids_are_not_reused() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonVaultStore::new(temp_dir.path().join("vaults.json")).unwrap();
        let first = store.create(new_vault("/a")).unwrap();
        store.delete(first.id).unwrap();
        let second = store.create(new_vault("/b")).unwrap();
        assert_eq!(second.id, 2);
    }

    #[test]
    fn missing_records_map_to_vault_not_exist() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonVaultStore::new(temp_dir.path().join("vaults.json")).unwrap();
        assert!(matches!(store.get(9), Err(CloakError::VaultNotExist)));
        assert!(matches!(store.delete(9), Err(CloakError::VaultNotExist)));

        let mut ghost = store.create(new_vault("/a")).unwrap();
        ghost.id = 42;
        assert!(matches!(store.update(&ghost), Err(CloakError::VaultNotExist)));
    }

    #[test]
    fn update_replaces_options() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonVaultStore::new(temp_dir.path().join("vaults.json")).unwrap();
        let mut vault = store.create(new_vault("/a")).unwrap();
        vault.readonly = true;
        vault.mountpoint = "/mnt/a".to_owned();
        store.update(&vault).unwrap();
        assert_eq!(store.get(vault.id).unwrap(), vault);
    }
}
