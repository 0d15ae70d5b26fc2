//! Key rotation after a completed recovery

use std::sync::Arc;

use bitcoin::bip32::Xpub;
use keybox_core::retry::jitter_duration;
use keybox_core::{
    with_retry, AccountId, CompletedRecovery, Error, Keybox, LostFactor, RecoveryState, Result,
    RetryConfig, SpendingKeyset,
};
use keybox_f8e::{CreateKeysetRequest, KeysetService, RemoteKeyset};
use keybox_storage_sqlite::KeysetStatus;
use tracing::{debug, info, warn};

use crate::locks::AccountLocks;
use crate::store::{run_blocking, WalletStore};

/// Current keybox of an account from the local store
pub async fn load_active_keybox(store: &Arc<dyn WalletStore>, account_id: &AccountId) -> Result<Keybox> {
    let id = account_id.clone();
    let active = run_blocking(store, move |s| s.active_keyset(&id)).await?;
    match active {
        Some(stored) => Ok(Keybox::new(account_id.clone(), stored.keyset)),
        None => Err(Error::NoActiveKeyset(account_id.to_string())),
    }
}

/// Replaces the lost factor's key in the active keyset
pub struct KeyRotationService {
    account_id: AccountId,
    keysets: Arc<dyn KeysetService>,
    store: Arc<dyn WalletStore>,
    locks: AccountLocks,
    retry: RetryConfig,
}

impl KeyRotationService {
    /// Create a rotation service
    pub fn new(
        account_id: AccountId,
        keysets: Arc<dyn KeysetService>,
        store: Arc<dyn WalletStore>,
        locks: AccountLocks,
        retry: RetryConfig,
    ) -> Self {
        Self {
            account_id,
            keysets,
            store,
            locks,
            retry,
        }
    }

    /// Register the first keyset of an account as active
    pub async fn import_keyset(&self, keyset: SpendingKeyset) -> Result<()> {
        let _guard = self.locks.acquire(&self.account_id).await;
        let id = self.account_id.clone();
        run_blocking(&self.store, move |s| {
            s.insert_keyset(&id, &keyset, KeysetStatus::Active)
        })
        .await
    }

    /// Build, register and activate the keyset that replaces the lost factor.
    ///
    /// On any error the active keyset is unchanged. A retry after the server
    /// registered the keyset adopts that keyset instead of registering again.
    pub async fn rotate_spending_key(
        &self,
        completed: &CompletedRecovery,
        new_factor_public_key: Xpub,
    ) -> Result<SpendingKeyset> {
        let _guard = self.locks.acquire(&self.account_id).await;

        let id = self.account_id.clone();
        let (state, stored) = run_blocking(&self.store, move |s| {
            Ok((s.load_recovery_state(&id)?, s.list_keysets(&id)?))
        })
        .await?;

        match &state {
            RecoveryState::Completed(c) if c.action_id == completed.action_id => {
                if let Some(recorded) = &c.new_factor_public_key {
                    if recorded.public_key != new_factor_public_key.public_key {
                        return Err(Error::InvalidKey(format!(
                            "rotation key differs from the key recovery {} was started with",
                            c.action_id
                        )));
                    }
                }
            }
            other => {
                return Err(Error::InvalidStateTransition(format!(
                    "rotation for {} requires a completed recovery, state is {}",
                    completed.action_id,
                    other.name()
                )))
            }
        }

        let active = stored
            .iter()
            .find(|k| k.is_active())
            .map(|k| k.keyset.clone())
            .ok_or_else(|| Error::NoActiveKeyset(self.account_id.to_string()))?;

        let (app_key, hardware_key) = match completed.lost_factor {
            LostFactor::App => (new_factor_public_key, active.hardware_key),
            LostFactor::Hardware => (active.app_key, new_factor_public_key),
        };
        let request = CreateKeysetRequest {
            completed_action_id: completed.action_id.clone(),
            network: active.network_type,
            app_spending_public_key: app_key,
            hardware_spending_public_key: hardware_key,
        };

        let remote = self.remote_keysets().await;
        let landed = remote.iter().find(|k| k.active && k.matches_request(&request));
        let f8e_keyset = match landed {
            Some(keyset) if keyset.keyset_id == active.f8e_spending_keyset.keyset_id => {
                debug!("Rotation for {} already committed as {}", completed.action_id, active.local_id);
                return Ok(active);
            }
            Some(keyset) => {
                info!(
                    "Resuming rotation for {}: server keyset {} already registered",
                    completed.action_id, keyset.keyset_id
                );
                keyset.f8e_spending_keyset()
            }
            None => {
                if stored.iter().any(|k| k.keyset.contains_key(&new_factor_public_key)) {
                    return Err(Error::KeyReuse(format!(
                        "new {} key already belongs to a local keyset",
                        completed.lost_factor
                    )));
                }
                if remote.iter().any(|k| k.contains_key(&new_factor_public_key)) {
                    return Err(Error::KeyReuse(format!(
                        "new {} key already belongs to a keyset on the server",
                        completed.lost_factor
                    )));
                }
                self.create_keyset(&request).await?
            }
        };

        let new_keyset = SpendingKeyset::new(active.network_type, app_key, hardware_key, f8e_keyset);
        let id = self.account_id.clone();
        let expected = active.local_id.clone();
        let to_commit = new_keyset.clone();
        run_blocking(&self.store, move |s| s.commit_rotation(&id, &expected, &to_commit)).await?;

        info!(
            "Rotated {} key for account {}: keyset {} replaces {}",
            completed.lost_factor, self.account_id, new_keyset.local_id, active.local_id
        );
        Ok(new_keyset)
    }

    /// Server keysets, or none if the listing is unavailable
    async fn remote_keysets(&self) -> Vec<RemoteKeyset> {
        match with_retry(&self.retry, "list keysets", || {
            self.keysets.list_keysets(&self.account_id)
        })
        .await
        {
            Ok(keysets) => keysets,
            Err(e) => {
                warn!("Could not list server keysets for {}: {}", self.account_id, e);
                Vec::new()
            }
        }
    }

    /// Register the keyset, adopting it if an earlier attempt landed
    async fn create_keyset(&self, request: &CreateKeysetRequest) -> Result<keybox_core::F8eSpendingKeyset> {
        let mut attempt = 0;
        let mut backoff = self.retry.initial_backoff;
        let mut ambiguous = false;

        loop {
            match self.keysets.create_keyset(&self.account_id, request).await {
                Ok(keyset) => return Ok(keyset),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(e);
                    }
                    ambiguous = true;
                    warn!("create keyset failed (attempt {}), retrying: {}", attempt, e);
                    tokio::time::sleep(jitter_duration(backoff)).await;
                    backoff = self.retry.next_backoff(backoff);
                }
                Err(e @ Error::StaleRotation(_)) if ambiguous => {
                    let landed = self
                        .remote_keysets()
                        .await
                        .into_iter()
                        .find(|k| k.active && k.matches_request(request));
                    return match landed {
                        Some(keyset) => {
                            info!("Earlier keyset registration landed as {}", keyset.keyset_id);
                            Ok(keyset.f8e_spending_keyset())
                        }
                        None => Err(e),
                    };
                }
                Err(e) => return Err(e),
            }
        }
    }
}
