//! Local persistence seen by the services
//!
//! Services hold an `Arc<dyn WalletStore>` and reach it through
//! [`run_blocking`], so SQLite work never runs on a runtime worker.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use keybox_core::{AccountId, Error, RecoveryState, Result, SpendingKeyset};
use keybox_storage_sqlite::{
    load_or_create_salt, Database, EncryptionKey, KeysetStatus, KeysetStorage,
    RecoveryStateStorage, StoredKeyset,
};
use parking_lot::Mutex;

/// Recovery state and keyset persistence for accounts
pub trait WalletStore: Send + Sync {
    /// Persisted recovery state, `NotStarted` when none
    fn load_recovery_state(&self, account_id: &AccountId) -> Result<RecoveryState>;

    /// Replace the persisted recovery state
    fn save_recovery_state(&self, account_id: &AccountId, state: &RecoveryState) -> Result<()>;

    /// Every keyset of the account, oldest first
    fn list_keysets(&self, account_id: &AccountId) -> Result<Vec<StoredKeyset>>;

    /// The active keyset
    fn active_keyset(&self, account_id: &AccountId) -> Result<Option<StoredKeyset>>;

    /// Store a keyset
    fn insert_keyset(
        &self,
        account_id: &AccountId,
        keyset: &SpendingKeyset,
        status: KeysetStatus,
    ) -> Result<()>;

    /// Atomically activate `new_keyset` and retire `expected_active`.
    ///
    /// Fails with `StaleRotation` if `expected_active` is no longer active.
    fn commit_rotation(
        &self,
        account_id: &AccountId,
        expected_active: &str,
        new_keyset: &SpendingKeyset,
    ) -> Result<()>;
}

/// Run a store operation on the blocking pool
pub async fn run_blocking<T, F>(store: &Arc<dyn WalletStore>, op: F) -> Result<T>
where
    F: FnOnce(&dyn WalletStore) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|e| Error::Storage(format!("store task join error: {}", e)))?
}

/// Store backed by the encrypted SQLite database
pub struct SqliteStore {
    db: Mutex<Database>,
}

impl SqliteStore {
    /// Wrap an open database
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    /// Open (or create) `path`, deriving the key from `passphrase` and the
    /// salt stored beside the database
    pub fn open(path: &Path, passphrase: &str) -> Result<Self> {
        let salt_path = path.with_extension("salt");
        let salt = load_or_create_salt(&salt_path)?;
        let key = EncryptionKey::from_passphrase(passphrase, &salt)?;
        let db = Database::open(path, &key)?;
        tracing::info!("Opened wallet database at {}", path.display());
        Ok(Self::new(db))
    }
}

impl WalletStore for SqliteStore {
    fn load_recovery_state(&self, account_id: &AccountId) -> Result<RecoveryState> {
        let db = self.db.lock();
        Ok(RecoveryStateStorage::new(&db).load_recovery_state(account_id)?)
    }

    fn save_recovery_state(&self, account_id: &AccountId, state: &RecoveryState) -> Result<()> {
        let db = self.db.lock();
        Ok(RecoveryStateStorage::new(&db).save_recovery_state(account_id, state)?)
    }

    fn list_keysets(&self, account_id: &AccountId) -> Result<Vec<StoredKeyset>> {
        let db = self.db.lock();
        Ok(KeysetStorage::new(&db).list_keysets(account_id)?)
    }

    fn active_keyset(&self, account_id: &AccountId) -> Result<Option<StoredKeyset>> {
        let db = self.db.lock();
        Ok(KeysetStorage::new(&db).active_keyset(account_id)?)
    }

    fn insert_keyset(
        &self,
        account_id: &AccountId,
        keyset: &SpendingKeyset,
        status: KeysetStatus,
    ) -> Result<()> {
        let db = self.db.lock();
        Ok(KeysetStorage::new(&db).insert_keyset(account_id, keyset, status)?)
    }

    fn commit_rotation(
        &self,
        account_id: &AccountId,
        expected_active: &str,
        new_keyset: &SpendingKeyset,
    ) -> Result<()> {
        let db = self.db.lock();
        Ok(KeysetStorage::new(&db).commit_rotation(account_id, expected_active, new_keyset)?)
    }
}

#[derive(Default)]
struct MemoryState {
    recovery: HashMap<AccountId, RecoveryState>,
    keysets: HashMap<AccountId, Vec<StoredKeyset>>,
    failing_writes: u32,
}

/// In-memory store with the same conflict rules as [`SqliteStore`]
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` recovery-state writes, simulating a crash before the
    /// write reached disk
    pub fn fail_next_writes(&self, n: u32) {
        self.state.lock().failing_writes = n;
    }
}

impl WalletStore for MemoryStore {
    fn load_recovery_state(&self, account_id: &AccountId) -> Result<RecoveryState> {
        Ok(self
            .state
            .lock()
            .recovery
            .get(account_id)
            .cloned()
            .unwrap_or_default())
    }

    fn save_recovery_state(&self, account_id: &AccountId, state: &RecoveryState) -> Result<()> {
        let mut inner = self.state.lock();
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(Error::Storage("disk I/O error".to_string()));
        }
        inner.recovery.insert(account_id.clone(), state.clone());
        Ok(())
    }

    fn list_keysets(&self, account_id: &AccountId) -> Result<Vec<StoredKeyset>> {
        Ok(self
            .state
            .lock()
            .keysets
            .get(account_id)
            .cloned()
            .unwrap_or_default())
    }

    fn active_keyset(&self, account_id: &AccountId) -> Result<Option<StoredKeyset>> {
        Ok(self
            .state
            .lock()
            .keysets
            .get(account_id)
            .and_then(|keysets| keysets.iter().find(|k| k.is_active()).cloned()))
    }

    fn insert_keyset(
        &self,
        account_id: &AccountId,
        keyset: &SpendingKeyset,
        status: KeysetStatus,
    ) -> Result<()> {
        let mut inner = self.state.lock();
        let keysets = inner.keysets.entry(account_id.clone()).or_default();
        let clash = keysets.iter().any(|k| {
            k.keyset.local_id == keyset.local_id
                || k.keyset.f8e_spending_keyset.keyset_id == keyset.f8e_spending_keyset.keyset_id
                || (status == KeysetStatus::Active && k.is_active())
        });
        if clash {
            return Err(Error::StaleRotation(format!(
                "keyset {} conflicts with a stored keyset for account {}",
                keyset.local_id, account_id
            )));
        }
        keysets.push(StoredKeyset {
            keyset: keyset.clone(),
            status,
            created_at: Utc::now(),
        });
        Ok(())
    }

    fn commit_rotation(
        &self,
        account_id: &AccountId,
        expected_active: &str,
        new_keyset: &SpendingKeyset,
    ) -> Result<()> {
        let mut inner = self.state.lock();
        let keysets = inner.keysets.entry(account_id.clone()).or_default();

        let current = keysets
            .iter()
            .find(|k| k.is_active())
            .map(|k| k.keyset.local_id.clone());
        if current.as_deref() != Some(expected_active) {
            return Err(Error::StaleRotation(format!(
                "active keyset is {:?}, expected {}",
                current, expected_active
            )));
        }
        if keysets.iter().any(|k| {
            k.keyset.local_id == new_keyset.local_id
                || k.keyset.f8e_spending_keyset.keyset_id
                    == new_keyset.f8e_spending_keyset.keyset_id
        }) {
            return Err(Error::StaleRotation(format!(
                "keyset {} is already stored",
                new_keyset.local_id
            )));
        }

        for stored in keysets.iter_mut() {
            if stored.keyset.local_id == expected_active {
                stored.status = KeysetStatus::Retired;
            }
        }
        keysets.push(StoredKeyset {
            keyset: new_keyset.clone(),
            status: KeysetStatus::Active,
            created_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keybox_core::testing::test_keyset;
    use keybox_params::NetworkType;

    fn account() -> AccountId {
        AccountId::new("acct-store")
    }

    fn check_rotation_rules(store: &dyn WalletStore) {
        let first = test_keyset(1, NetworkType::Regtest);
        let second = test_keyset(2, NetworkType::Regtest);
        let third = test_keyset(3, NetworkType::Regtest);

        store
            .insert_keyset(&account(), &first, KeysetStatus::Active)
            .unwrap();
        assert!(matches!(
            store.insert_keyset(&account(), &second, KeysetStatus::Active),
            Err(Error::StaleRotation(_))
        ));

        store
            .commit_rotation(&account(), &first.local_id, &second)
            .unwrap();
        assert!(matches!(
            store.commit_rotation(&account(), &first.local_id, &third),
            Err(Error::StaleRotation(_))
        ));

        let active = store.active_keyset(&account()).unwrap().unwrap();
        assert_eq!(active.keyset, second);
        let all = store.list_keysets(&account()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.iter().filter(|k| k.is_active()).count(), 1);
    }

    #[test]
    fn test_memory_store_rotation_rules() {
        check_rotation_rules(&MemoryStore::new());
    }

    #[test]
    fn test_sqlite_store_rotation_rules() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("wallet.db"), "correct horse").unwrap();
        check_rotation_rules(&store);
    }

    #[test]
    fn test_sqlite_store_reopen_keeps_recovery_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.db");
        let state = RecoveryState::Cancelled(keybox_core::CancelledRecovery {
            action_id: "action-3".to_string(),
            lost_factor: keybox_core::LostFactor::App,
            cancelled_by: Some(keybox_core::Factor::Hardware),
            cancelled_at: Utc::now(),
        });

        {
            let store = SqliteStore::open(&path, "pw").unwrap();
            store.save_recovery_state(&account(), &state).unwrap();
        }
        let store = SqliteStore::open(&path, "pw").unwrap();
        assert_eq!(store.load_recovery_state(&account()).unwrap(), state);
        assert!(SqliteStore::open(&path, "wrong").is_err());
    }

    #[test]
    fn test_memory_store_failing_write() {
        let store = MemoryStore::new();
        store.fail_next_writes(1);
        assert!(store
            .save_recovery_state(&account(), &RecoveryState::NotStarted)
            .is_err());
        assert!(store
            .save_recovery_state(&account(), &RecoveryState::NotStarted)
            .is_ok());
    }

    #[tokio::test]
    async fn test_run_blocking() {
        let store: Arc<dyn WalletStore> = Arc::new(MemoryStore::new());
        let state = run_blocking(&store, |s| s.load_recovery_state(&account()))
            .await
            .unwrap();
        assert_eq!(state, RecoveryState::NotStarted);
    }
}
