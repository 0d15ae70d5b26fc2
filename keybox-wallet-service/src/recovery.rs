//! Recovery protocol orchestration
//!
//! [`RecoveryService`] drives one account's lost-factor recovery against the
//! remote authority. Writes (start, cancel, complete, reconciliation results)
//! are serialized through the account's writer lock; network polls run
//! without it and only fold their result in if the state they were taken
//! against is still current.
//!
//! The persisted state is written before every remote call whose outcome
//! could be lost, so a restart resumes from `Completing` and resolves it by
//! polling instead of completing twice.

use std::sync::Arc;
use std::time::Duration;

use bitcoin::bip32::Xpub;
use keybox_core::{
    AccountId, ActiveRecovery, AuthorizationStrategy, Clock, CompletedRecovery,
    CreatePrivilegedActionRequest, Error, Factor, LostFactor, ProofOfPossession,
    RecoveryEvent, RecoveryState, RemoteActionStatus, Result,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::locks::AccountLocks;
use crate::registry::PrivilegedActionRegistry;
use crate::store::{run_blocking, WalletStore};

/// Result of a poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryStatus {
    /// State after reconciliation
    pub state: RecoveryState,
    /// What the poll changed
    pub event: RecoveryEvent,
    /// Time left in the delay window, for active recoveries
    pub remaining_delay: Option<Duration>,
}

/// Recovery state machine for one account
pub struct RecoveryService {
    account_id: AccountId,
    registry: Arc<PrivilegedActionRegistry>,
    store: Arc<dyn WalletStore>,
    locks: AccountLocks,
    clock: Arc<dyn Clock>,
    state_tx: watch::Sender<RecoveryState>,
}

impl RecoveryService {
    /// Load the account's persisted recovery state
    pub async fn open(
        account_id: AccountId,
        registry: Arc<PrivilegedActionRegistry>,
        store: Arc<dyn WalletStore>,
        locks: AccountLocks,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let id = account_id.clone();
        let state = run_blocking(&store, move |s| s.load_recovery_state(&id)).await?;
        debug!("Loaded recovery state {} for account {}", state.name(), account_id);

        let (state_tx, _) = watch::channel(state);
        Ok(Self {
            account_id,
            registry,
            store,
            locks,
            clock,
            state_tx,
        })
    }

    /// Account this service drives
    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    /// Last published state
    pub fn state(&self) -> RecoveryState {
        self.state_tx.borrow().clone()
    }

    /// Receive every published state change
    pub fn subscribe(&self) -> watch::Receiver<RecoveryState> {
        self.state_tx.subscribe()
    }

    /// Start recovering `lost_factor`.
    ///
    /// `proof` must prove the surviving factor. An in-flight recovery of the
    /// same kind on the authority is adopted instead of duplicated.
    pub async fn start_recovery(
        &self,
        lost_factor: LostFactor,
        proof: ProofOfPossession,
        new_factor_public_key: Option<Xpub>,
    ) -> Result<RecoveryState> {
        let _guard = self.locks.acquire(&self.account_id).await;
        let state = self.load().await?;

        if !state.can_start() {
            return Err(Error::RecoveryAlreadyInProgress(format!(
                "{} recovery {} is {}",
                state.active().map(|a| a.lost_factor.to_string()).unwrap_or_default(),
                state.action_id().unwrap_or_default(),
                state.name()
            )));
        }
        if !proof.proves(lost_factor.surviving_factor()) {
            return Err(Error::MissingProof(format!(
                "{} recovery requires {} proof",
                lost_factor,
                lost_factor.surviving_factor()
            )));
        }

        let request = CreatePrivilegedActionRequest {
            privileged_action_type: lost_factor.action_type(),
            proof,
            new_factor_public_key,
        };
        let created = self.registry.create(&self.account_id, &request).await?;
        if created.action.status.is_terminal() {
            return Err(Error::InvariantViolation(format!(
                "adopted terminal action {}",
                created.action.instance.id
            )));
        }

        let now = self.clock.now();
        let active = ActiveRecovery {
            action: created.action.instance,
            lost_factor,
            new_factor_public_key,
            started_at: now,
        };
        let authorized = created.action.status == RemoteActionStatus::Authorized;
        let next = RecoveryState::begin(active, authorized, now);

        info!(
            "{} {} recovery {} for account {} ({})",
            if created.adopted { "Adopted" } else { "Started" },
            lost_factor,
            next.action_id().unwrap_or_default(),
            self.account_id,
            next.name()
        );
        self.persist(&next).await?;
        Ok(next)
    }

    /// Refresh from the remote authority
    pub async fn poll(&self) -> Result<RecoveryStatus> {
        let snapshot = self.state();
        let action_id = match snapshot.active() {
            Some(active) => active.action.id.clone(),
            None => return Ok(self.status(snapshot, RecoveryEvent::Unchanged)),
        };

        let remote = self.registry.poll(&self.account_id, &action_id).await?;

        let _guard = self.locks.acquire(&self.account_id).await;
        let current = self.load().await?;
        if current.name() != snapshot.name() || current.action_id() != snapshot.action_id() {
            debug!(
                "Discarding poll of {}: state moved from {} to {}",
                action_id,
                snapshot.name(),
                current.name()
            );
            return Ok(self.status(current, RecoveryEvent::Unchanged));
        }

        let reconciliation = current.reconcile(remote.as_ref(), self.clock.now())?;
        self.apply(&current, reconciliation.state.clone(), reconciliation.event)
            .await?;
        Ok(self.status(reconciliation.state, reconciliation.event))
    }

    /// Reconcile persisted state after a restart
    pub async fn resume(&self) -> Result<RecoveryStatus> {
        let _guard = self.locks.acquire(&self.account_id).await;
        let state = self.load().await?;
        self.state_tx.send_replace(state.clone());

        if state.active().is_none() {
            return Ok(self.status(state, RecoveryEvent::Unchanged));
        }
        info!(
            "Resuming {} recovery {} for account {}",
            state.name(),
            state.action_id().unwrap_or_default(),
            self.account_id
        );
        let (state, event) = self.refresh_locked(&state).await?;
        Ok(self.status(state, event))
    }

    /// Cancel the active recovery as `canceling_factor`
    pub async fn cancel(&self, canceling_factor: Factor) -> Result<RecoveryState> {
        let _guard = self.locks.acquire(&self.account_id).await;
        let state = self.load().await?;

        let active = match state.active() {
            Some(active) => active,
            None if state.is_terminal() => {
                return Err(Error::AlreadyTerminal(format!(
                    "recovery {} is {}",
                    state.action_id().unwrap_or_default(),
                    state.name()
                )))
            }
            None => return Err(Error::NoRecoveryInProgress),
        };

        let token = match &active.action.authorization_strategy {
            AuthorizationStrategy::DelayAndNotify {
                cancellation_token, ..
            } => Some(cancellation_token.as_str()),
            AuthorizationStrategy::OutOfBand => None,
        };

        let result = self
            .registry
            .cancel(&self.account_id, &active.action.id, token, canceling_factor)
            .await;

        match result {
            Ok(()) => {
                let next = state.cancel_locally(canceling_factor, self.clock.now())?;
                info!(
                    "Recovery {} cancelled by {} for account {}",
                    active.action.id, canceling_factor, self.account_id
                );
                self.persist(&next).await?;
                Ok(next)
            }
            Err(e @ (Error::AlreadyTerminal(_) | Error::TokenAlreadyConsumed(_))) => {
                warn!("Cancel of {} rejected as terminal, re-polling: {}", active.action.id, e);
                let (next, _) = self.refresh_locked(&state).await?;
                match next {
                    RecoveryState::Cancelled(_) => Ok(next),
                    _ => Err(e),
                }
            }
            Err(e @ Error::TokenInvalid(_)) => {
                error!("Cancellation token rejected for {}: {}", active.action.id, e);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Complete the recovery once authorized
    pub async fn complete(&self, proof: ProofOfPossession) -> Result<CompletedRecovery> {
        let _guard = self.locks.acquire(&self.account_id).await;
        let loaded = self.load().await?;

        // A completion in flight is never re-issued; polling tells whether it landed
        let state = match loaded {
            RecoveryState::InProgress(_) | RecoveryState::Completing(_) => {
                let (refreshed, _) = self.refresh_locked(&loaded).await?;
                if let (RecoveryState::Completing(_), RecoveryState::Completed(completed)) =
                    (&loaded, &refreshed)
                {
                    return Ok(completed.clone());
                }
                refreshed
            }
            other => other,
        };

        let active = match &state {
            RecoveryState::ReadyToComplete(active) => active.clone(),
            RecoveryState::InProgress(active) => {
                let remaining = active
                    .action
                    .authorization_strategy
                    .remaining_delay(self.clock.now());
                return Err(Error::RecoveryNotReady {
                    remaining_secs: remaining.as_secs(),
                });
            }
            RecoveryState::Completed(completed) => {
                return Err(Error::AlreadyTerminal(format!(
                    "recovery {} already completed",
                    completed.action_id
                )))
            }
            RecoveryState::Cancelled(cancelled) => {
                return Err(Error::AlreadyTerminal(format!(
                    "recovery {} was cancelled",
                    cancelled.action_id
                )))
            }
            RecoveryState::NotStarted => return Err(Error::NoRecoveryInProgress),
            RecoveryState::Completing(active) => {
                return Err(Error::InvariantViolation(format!(
                    "recovery {} still completing after reconciliation",
                    active.action.id
                )))
            }
        };

        if proof.is_empty() {
            return Err(Error::MissingProof("completion requires proof".to_string()));
        }

        let completing = state.begin_completing()?;
        self.persist(&completing).await?;

        let token = match &active.action.authorization_strategy {
            AuthorizationStrategy::DelayAndNotify {
                completion_token, ..
            } => Some(completion_token.as_str()),
            AuthorizationStrategy::OutOfBand => None,
        };

        let result = self
            .registry
            .complete(&self.account_id, &active.action.id, token, &proof)
            .await;

        match result {
            Ok(receipt) => {
                let next = completing.finish_completing(&receipt)?;
                info!(
                    "Recovery {} completed for account {}",
                    active.action.id, self.account_id
                );
                self.persist(&next).await?;
                match next {
                    RecoveryState::Completed(completed) => Ok(completed),
                    other => Err(Error::InvariantViolation(format!(
                        "completion produced {}",
                        other.name()
                    ))),
                }
            }
            Err(e) if e.is_transient() => {
                warn!(
                    "Completion of {} is unresolved, will reconcile on next poll: {}",
                    active.action.id, e
                );
                Err(e)
            }
            Err(e) => {
                warn!("Completion of {} failed, re-polling: {}", active.action.id, e);
                match self.refresh_locked(&completing).await {
                    Ok((RecoveryState::Completed(completed), _)) => Ok(completed),
                    Ok(_) => Err(e),
                    Err(poll_err) => {
                        warn!("Re-poll after failed completion failed: {}", poll_err);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Poll and reconcile while the writer lock is held
    async fn refresh_locked(&self, state: &RecoveryState) -> Result<(RecoveryState, RecoveryEvent)> {
        let action_id = match state.action_id() {
            Some(id) if state.active().is_some() => id.to_string(),
            _ => return Ok((state.clone(), RecoveryEvent::Unchanged)),
        };
        let remote = self.registry.poll(&self.account_id, &action_id).await?;
        let reconciliation = state.reconcile(remote.as_ref(), self.clock.now())?;
        self.apply(state, reconciliation.state.clone(), reconciliation.event)
            .await?;
        Ok((reconciliation.state, reconciliation.event))
    }

    async fn apply(&self, previous: &RecoveryState, next: RecoveryState, event: RecoveryEvent) -> Result<()> {
        match event {
            RecoveryEvent::Unchanged => {}
            RecoveryEvent::BecameReady
            | RecoveryEvent::CompletionConfirmed
            | RecoveryEvent::CompletedElsewhere => info!(
                "Recovery {} for account {}: {}",
                next.action_id().unwrap_or_default(),
                self.account_id,
                event.describe().unwrap_or_default()
            ),
            RecoveryEvent::ReadinessRevoked
            | RecoveryEvent::CancelledElsewhere { .. }
            | RecoveryEvent::CompletionNotApplied => warn!(
                "Recovery {} for account {}: {} (was {})",
                next.action_id().unwrap_or_default(),
                self.account_id,
                event.describe().unwrap_or_default(),
                previous.name()
            ),
        }

        if next != *previous {
            self.persist(&next).await?;
        }
        Ok(())
    }

    async fn load(&self) -> Result<RecoveryState> {
        let id = self.account_id.clone();
        run_blocking(&self.store, move |s| s.load_recovery_state(&id)).await
    }

    async fn persist(&self, state: &RecoveryState) -> Result<()> {
        let id = self.account_id.clone();
        let to_save = state.clone();
        run_blocking(&self.store, move |s| s.save_recovery_state(&id, &to_save)).await?;
        self.state_tx.send_replace(state.clone());
        Ok(())
    }

    fn status(&self, state: RecoveryState, event: RecoveryEvent) -> RecoveryStatus {
        let remaining_delay = state.remaining_delay(self.clock.now());
        RecoveryStatus {
            state,
            event,
            remaining_delay,
        }
    }
}
