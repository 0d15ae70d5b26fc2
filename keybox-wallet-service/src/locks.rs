//! Per-account writer locks

use std::collections::HashMap;
use std::sync::Arc;

use keybox_core::AccountId;
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per account.
///
/// Every write to an account's recovery state or keysets happens under its
/// lock. Reads and network polls do not take it.
#[derive(Clone, Default)]
pub struct AccountLocks {
    locks: Arc<RwLock<HashMap<AccountId, Arc<Mutex<()>>>>>,
}

impl AccountLocks {
    /// Empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, account_id: &AccountId) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().get(account_id) {
            return Arc::clone(lock);
        }
        Arc::clone(self.locks.write().entry(account_id.clone()).or_default())
    }

    /// Wait for the account's writer lock
    pub async fn acquire(&self, account_id: &AccountId) -> OwnedMutexGuard<()> {
        self.lock_for(account_id).lock_owned().await
    }

    /// Writer lock if nobody holds it
    pub fn try_acquire(&self, account_id: &AccountId) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(account_id).try_lock_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_is_per_account() {
        let locks = AccountLocks::new();
        let a = AccountId::new("a");
        let b = AccountId::new("b");

        let guard = locks.acquire(&a).await;
        assert!(locks.try_acquire(&a).is_none());
        assert!(locks.try_acquire(&b).is_some());
        drop(guard);
        assert!(locks.try_acquire(&a).is_some());
    }

    #[tokio::test]
    async fn test_clones_share_locks() {
        let locks = AccountLocks::new();
        let other = locks.clone();
        let a = AccountId::new("a");

        let _guard = locks.acquire(&a).await;
        assert!(other.try_acquire(&a).is_none());
    }
}
