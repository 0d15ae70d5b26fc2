//! Privileged Action Registry
//!
//! Thin layer over [`PrivilegedActionService`] that owns retry policy and the
//! rules for ambiguous writes. The registry never touches local state.
//!
//! Creation is not idempotent remotely, so the registry adopts an in-flight
//! instance of the same type instead of creating a second one, and re-checks
//! for one after every transient create failure. When a retried cancel or
//! complete is answered with a terminal error after an earlier attempt failed
//! ambiguously, the registry polls to learn whether its own attempt landed.

use std::sync::Arc;

use keybox_core::retry::jitter_duration;
use keybox_core::{
    with_retry, AccountId, Clock, CompletionReceipt, CreatePrivilegedActionRequest, Error,
    Factor, PrivilegedActionType, ProofOfPossession, RemoteAction, RemoteActionStatus, Result,
    RetryConfig,
};
use keybox_f8e::PrivilegedActionService;
use tracing::{debug, info, warn};

/// Outcome of [`PrivilegedActionRegistry::create`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedAction {
    /// Remote view of the instance
    pub action: RemoteAction,
    /// Whether an already in-flight instance was adopted
    pub adopted: bool,
}

/// Client-side registry of privileged actions
pub struct PrivilegedActionRegistry {
    service: Arc<dyn PrivilegedActionService>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
}

impl PrivilegedActionRegistry {
    /// Create a registry
    pub fn new(
        service: Arc<dyn PrivilegedActionService>,
        clock: Arc<dyn Clock>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            service,
            clock,
            retry,
        }
    }

    /// Non-terminal instance of `action_type`, if the authority has one
    pub async fn in_flight(
        &self,
        account_id: &AccountId,
        action_type: PrivilegedActionType,
    ) -> Result<Option<RemoteAction>> {
        let actions = with_retry(&self.retry, "list privileged actions", || {
            self.service.list_privileged_actions(account_id, action_type)
        })
        .await?;

        Ok(actions
            .into_iter()
            .filter(|a| a.instance.privileged_action_type == action_type)
            .find(|a| !a.status.is_terminal()))
    }

    /// Create an action, or adopt the one already in flight
    pub async fn create(
        &self,
        account_id: &AccountId,
        request: &CreatePrivilegedActionRequest,
    ) -> Result<CreatedAction> {
        let action_type = request.privileged_action_type;

        if let Some(existing) = self.in_flight(account_id, action_type).await? {
            info!(
                "Adopting in-flight {} action {} for account {}",
                action_type, existing.instance.id, account_id
            );
            return Ok(adopted(existing));
        }

        let mut attempt = 0;
        let mut backoff = self.retry.initial_backoff;
        loop {
            match self
                .service
                .create_privileged_action(account_id, request)
                .await
            {
                Ok(instance) => {
                    instance.validate()?;
                    info!(
                        "Created {} action {} for account {}",
                        action_type, instance.id, account_id
                    );
                    return Ok(CreatedAction {
                        action: RemoteAction {
                            instance,
                            status: RemoteActionStatus::Pending,
                            canceled_by: None,
                        },
                        adopted: false,
                    });
                }
                Err(Error::ActionInFlight(msg)) => {
                    return match self.in_flight(account_id, action_type).await? {
                        Some(existing) => Ok(adopted(existing)),
                        None => Err(Error::ActionInFlight(msg)),
                    };
                }
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(e);
                    }
                    warn!(
                        "create {} failed (attempt {}), checking for a landed write: {}",
                        action_type, attempt, e
                    );
                    tokio::time::sleep(jitter_duration(backoff)).await;
                    backoff = self.retry.next_backoff(backoff);

                    if let Some(existing) = self.in_flight(account_id, action_type).await? {
                        info!(
                            "Earlier create of {} landed as {}",
                            action_type, existing.instance.id
                        );
                        return Ok(adopted(existing));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Current remote view; `None` once the action is terminal and purged
    pub async fn poll(&self, account_id: &AccountId, action_id: &str) -> Result<Option<RemoteAction>> {
        let remote = with_retry(&self.retry, "poll privileged action", || {
            self.service.get_privileged_action(account_id, action_id)
        })
        .await?;

        if let Some(remote) = &remote {
            debug!("Polled {}: {:?}", action_id, remote.status);
        } else {
            debug!("Polled {}: no longer known remotely", action_id);
        }
        Ok(remote)
    }

    /// Cancel an action
    pub async fn cancel(
        &self,
        account_id: &AccountId,
        action_id: &str,
        cancellation_token: Option<&str>,
        canceled_by: Factor,
    ) -> Result<()> {
        let mut attempt = 0;
        let mut backoff = self.retry.initial_backoff;
        let mut ambiguous = false;

        loop {
            let result = self
                .service
                .cancel_privileged_action(account_id, action_id, cancellation_token, canceled_by)
                .await;

            match result {
                Ok(()) => {
                    info!("Cancelled {} as {}", action_id, canceled_by);
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(e);
                    }
                    ambiguous = true;
                    warn!("cancel {} failed (attempt {}), retrying: {}", action_id, attempt, e);
                    tokio::time::sleep(jitter_duration(backoff)).await;
                    backoff = self.retry.next_backoff(backoff);
                }
                Err(e @ (Error::AlreadyTerminal(_) | Error::TokenAlreadyConsumed(_))) if ambiguous => {
                    return match self.poll(account_id, action_id).await? {
                        Some(remote) if remote.status == RemoteActionStatus::Canceled => {
                            info!("Earlier cancel of {} landed", action_id);
                            Ok(())
                        }
                        _ => Err(e),
                    };
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Complete an authorized action
    pub async fn complete(
        &self,
        account_id: &AccountId,
        action_id: &str,
        completion_token: Option<&str>,
        proof: &ProofOfPossession,
    ) -> Result<CompletionReceipt> {
        let mut attempt = 0;
        let mut backoff = self.retry.initial_backoff;
        let mut ambiguous = false;

        loop {
            let result = self
                .service
                .complete_privileged_action(account_id, action_id, completion_token, proof)
                .await;

            match result {
                Ok(receipt) => {
                    if receipt.action_id != action_id {
                        return Err(Error::InvariantViolation(format!(
                            "completion receipt for {} when completing {}",
                            receipt.action_id, action_id
                        )));
                    }
                    info!("Completed {}", action_id);
                    return Ok(receipt);
                }
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(e);
                    }
                    ambiguous = true;
                    warn!("complete {} failed (attempt {}), retrying: {}", action_id, attempt, e);
                    tokio::time::sleep(jitter_duration(backoff)).await;
                    backoff = self.retry.next_backoff(backoff);
                }
                Err(e @ (Error::AlreadyTerminal(_) | Error::TokenAlreadyConsumed(_))) if ambiguous => {
                    return match self.poll(account_id, action_id).await? {
                        Some(remote) if remote.status == RemoteActionStatus::Completed => {
                            info!("Earlier completion of {} landed", action_id);
                            Ok(CompletionReceipt {
                                action_id: action_id.to_string(),
                                privileged_action_type: remote.instance.privileged_action_type,
                                completed_at: self.clock.now(),
                            })
                        }
                        _ => Err(e),
                    };
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn adopted(action: RemoteAction) -> CreatedAction {
    CreatedAction {
        action,
        adopted: true,
    }
}
