//! Recovery protocol state
//!
//! Pure transitions of the lost-factor recovery state machine. The remote
//! authority is the source of truth: [`RecoveryState::reconcile`] folds a
//! polled [`RemoteAction`] into the local state and reports what changed.
//! I/O, locking and persistence live in the wallet service.

use std::fmt;
use std::time::Duration;

use bitcoin::bip32::Xpub;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::keys::Factor;
use crate::privileged_action::{
    CompletionReceipt, PrivilegedActionInstance, PrivilegedActionType, RemoteAction,
    RemoteActionStatus,
};
use crate::{Error, Result};

/// Factor being recovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LostFactor {
    /// App lost; hardware survives
    App,
    /// Hardware lost; app survives
    Hardware,
}

impl LostFactor {
    /// Privileged action that recovers this factor
    pub const fn action_type(&self) -> PrivilegedActionType {
        match self {
            LostFactor::App => PrivilegedActionType::LostAppRecovery,
            LostFactor::Hardware => PrivilegedActionType::LostHardwareRecovery,
        }
    }

    /// The factor being replaced
    pub const fn factor(&self) -> Factor {
        match self {
            LostFactor::App => Factor::App,
            LostFactor::Hardware => Factor::Hardware,
        }
    }

    /// The customer factor that must prove possession
    pub const fn surviving_factor(&self) -> Factor {
        match self {
            LostFactor::App => Factor::Hardware,
            LostFactor::Hardware => Factor::App,
        }
    }

    /// Lost factor recovered by an action type, if it is a recovery
    pub const fn from_action_type(action_type: PrivilegedActionType) -> Option<Self> {
        match action_type {
            PrivilegedActionType::LostAppRecovery => Some(LostFactor::App),
            PrivilegedActionType::LostHardwareRecovery => Some(LostFactor::Hardware),
            PrivilegedActionType::ResetFingerprint => None,
        }
    }
}

impl fmt::Display for LostFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.factor().fmt(f)
    }
}

/// A recovery that has not reached a terminal state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRecovery {
    /// Privileged action snapshot from the last poll
    pub action: PrivilegedActionInstance,
    /// Factor being replaced
    pub lost_factor: LostFactor,
    /// Replacement key supplied when the recovery started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_factor_public_key: Option<Xpub>,
    /// When this device started or adopted the recovery
    pub started_at: DateTime<Utc>,
}

/// A finished recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedRecovery {
    /// Completed privileged action
    pub action_id: String,
    /// Factor that was replaced
    pub lost_factor: LostFactor,
    /// Replacement key supplied when the recovery started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_factor_public_key: Option<Xpub>,
    /// When completion was observed
    pub completed_at: DateTime<Utc>,
}

/// A cancelled recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelledRecovery {
    /// Cancelled privileged action
    pub action_id: String,
    /// Factor that was being replaced
    pub lost_factor: LostFactor,
    /// Who cancelled, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_by: Option<Factor>,
    /// When cancellation was observed
    pub cancelled_at: DateTime<Utc>,
}

/// Recovery state for one account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "recovery", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryState {
    /// No recovery
    #[default]
    NotStarted,
    /// Waiting for authorization
    InProgress(ActiveRecovery),
    /// Authorization satisfied; completion may be requested
    ReadyToComplete(ActiveRecovery),
    /// Completion requested, outcome not yet observed
    Completing(ActiveRecovery),
    /// Completed
    Completed(CompletedRecovery),
    /// Cancelled
    Cancelled(CancelledRecovery),
}

/// What a reconciliation changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryEvent {
    /// Nothing observable changed
    Unchanged,
    /// Authorization became satisfied
    BecameReady,
    /// Remote reports the action pending and not yet satisfied
    ReadinessRevoked,
    /// Cancelled outside this device's control
    CancelledElsewhere {
        /// Cancelling factor, when known
        by: Option<Factor>,
    },
    /// Completed by another device
    CompletedElsewhere,
    /// Our completion request was applied
    CompletionConfirmed,
    /// Our completion request never landed
    CompletionNotApplied,
}

impl RecoveryEvent {
    /// User-visible description, if the event is worth surfacing
    pub fn describe(&self) -> Option<String> {
        match self {
            RecoveryEvent::Unchanged => None,
            RecoveryEvent::BecameReady => Some("recovery is ready to complete".to_string()),
            RecoveryEvent::ReadinessRevoked => {
                Some("recovery is still waiting for authorization".to_string())
            }
            RecoveryEvent::CancelledElsewhere { by: Some(factor) } => {
                Some(format!("recovery was cancelled by {}", factor))
            }
            RecoveryEvent::CancelledElsewhere { by: None } => {
                Some("recovery was cancelled".to_string())
            }
            RecoveryEvent::CompletedElsewhere => {
                Some("recovery was completed on another device".to_string())
            }
            RecoveryEvent::CompletionConfirmed => Some("recovery completed".to_string()),
            RecoveryEvent::CompletionNotApplied => {
                Some("recovery completion did not go through".to_string())
            }
        }
    }
}

/// Outcome of reconciling against the remote authority
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// New local state
    pub state: RecoveryState,
    /// What changed
    pub event: RecoveryEvent,
}

impl Reconciliation {
    fn unchanged(state: &RecoveryState) -> Self {
        Self {
            state: state.clone(),
            event: RecoveryEvent::Unchanged,
        }
    }
}

impl RecoveryState {
    /// Short state name for logs
    pub fn name(&self) -> &'static str {
        match self {
            RecoveryState::NotStarted => "NotStarted",
            RecoveryState::InProgress(_) => "InProgress",
            RecoveryState::ReadyToComplete(_) => "ReadyToComplete",
            RecoveryState::Completing(_) => "Completing",
            RecoveryState::Completed(_) => "Completed",
            RecoveryState::Cancelled(_) => "Cancelled",
        }
    }

    /// Active recovery, if any
    pub fn active(&self) -> Option<&ActiveRecovery> {
        match self {
            RecoveryState::InProgress(active)
            | RecoveryState::ReadyToComplete(active)
            | RecoveryState::Completing(active) => Some(active),
            _ => None,
        }
    }

    /// Privileged action this state refers to
    pub fn action_id(&self) -> Option<&str> {
        match self {
            RecoveryState::NotStarted => None,
            RecoveryState::InProgress(a)
            | RecoveryState::ReadyToComplete(a)
            | RecoveryState::Completing(a) => Some(&a.action.id),
            RecoveryState::Completed(c) => Some(&c.action_id),
            RecoveryState::Cancelled(c) => Some(&c.action_id),
        }
    }

    /// Completed or cancelled
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecoveryState::Completed(_) | RecoveryState::Cancelled(_))
    }

    /// Whether a new recovery may be started from this state
    pub fn can_start(&self) -> bool {
        self.active().is_none()
    }

    /// Remaining delay for an active recovery
    pub fn remaining_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.active()
            .map(|a| a.action.authorization_strategy.remaining_delay(now))
    }

    /// Initial state for a newly created or adopted recovery
    pub fn begin(active: ActiveRecovery, remote_authorized: bool, now: DateTime<Utc>) -> Self {
        if active
            .action
            .authorization_strategy
            .is_satisfied_at(now, remote_authorized)
        {
            RecoveryState::ReadyToComplete(active)
        } else {
            RecoveryState::InProgress(active)
        }
    }

    /// ReadyToComplete -> Completing
    pub fn begin_completing(&self) -> Result<Self> {
        match self {
            RecoveryState::ReadyToComplete(active) => Ok(RecoveryState::Completing(active.clone())),
            RecoveryState::Completed(c) => Err(Error::AlreadyTerminal(format!(
                "recovery {} already completed",
                c.action_id
            ))),
            RecoveryState::Cancelled(c) => Err(Error::AlreadyTerminal(format!(
                "recovery {} already cancelled",
                c.action_id
            ))),
            other => Err(Error::InvalidStateTransition(format!(
                "cannot complete from {}",
                other.name()
            ))),
        }
    }

    /// Completing -> Completed, on a receipt for the same action
    pub fn finish_completing(&self, receipt: &CompletionReceipt) -> Result<Self> {
        match self {
            RecoveryState::Completing(active) if active.action.id == receipt.action_id => {
                Ok(RecoveryState::Completed(CompletedRecovery {
                    action_id: receipt.action_id.clone(),
                    lost_factor: active.lost_factor,
                    new_factor_public_key: active.new_factor_public_key,
                    completed_at: receipt.completed_at,
                }))
            }
            RecoveryState::Completing(active) => Err(Error::InvariantViolation(format!(
                "completion receipt for {} while completing {}",
                receipt.action_id, active.action.id
            ))),
            other => Err(Error::InvalidStateTransition(format!(
                "completion receipt in state {}",
                other.name()
            ))),
        }
    }

    /// Active -> Cancelled after a successful local cancel
    pub fn cancel_locally(&self, by: Factor, now: DateTime<Utc>) -> Result<Self> {
        match self.active() {
            Some(active) => Ok(cancelled(active, Some(by), now)),
            None if self.is_terminal() => Err(Error::AlreadyTerminal(format!(
                "recovery is {}",
                self.name()
            ))),
            None => Err(Error::NoRecoveryInProgress),
        }
    }

    /// Fold the remote view of the current action into local state.
    ///
    /// `remote` is `None` when the remote authority no longer knows the
    /// action (terminal and purged).
    pub fn reconcile(&self, remote: Option<&RemoteAction>, now: DateTime<Utc>) -> Result<Reconciliation> {
        let active = match self.active() {
            Some(active) => active,
            None => return Ok(Reconciliation::unchanged(self)),
        };
        let completing = matches!(self, RecoveryState::Completing(_));

        let remote = match remote {
            Some(remote) => remote,
            None if completing => {
                return Ok(Reconciliation {
                    state: completed(active, now),
                    event: RecoveryEvent::CompletionConfirmed,
                })
            }
            None => {
                return Ok(Reconciliation {
                    state: cancelled(active, None, now),
                    event: RecoveryEvent::CancelledElsewhere { by: None },
                })
            }
        };

        if remote.instance.id != active.action.id {
            return Err(Error::InvariantViolation(format!(
                "polled action {} while tracking {}",
                remote.instance.id, active.action.id
            )));
        }
        let local_type = active.action.authorization_strategy.strategy_type();
        let remote_type = remote.instance.authorization_strategy.strategy_type();
        if local_type != remote_type {
            return Err(Error::InvariantViolation(format!(
                "strategy of {} changed from {:?} to {:?}",
                active.action.id, local_type, remote_type
            )));
        }
        remote.instance.validate()?;

        match remote.status {
            RemoteActionStatus::Canceled => Ok(Reconciliation {
                state: cancelled(active, remote.canceled_by, now),
                event: RecoveryEvent::CancelledElsewhere {
                    by: remote.canceled_by,
                },
            }),
            RemoteActionStatus::Completed => Ok(Reconciliation {
                state: completed(active, now),
                event: if completing {
                    RecoveryEvent::CompletionConfirmed
                } else {
                    RecoveryEvent::CompletedElsewhere
                },
            }),
            RemoteActionStatus::Pending | RemoteActionStatus::Authorized => {
                let refreshed = ActiveRecovery {
                    action: remote.instance.clone(),
                    ..active.clone()
                };
                let authorized = remote.status == RemoteActionStatus::Authorized;
                let next = RecoveryState::begin(refreshed, authorized, now);
                let event = match (self, &next) {
                    (RecoveryState::Completing(_), _) => RecoveryEvent::CompletionNotApplied,
                    (RecoveryState::InProgress(_), RecoveryState::ReadyToComplete(_)) => {
                        RecoveryEvent::BecameReady
                    }
                    (RecoveryState::ReadyToComplete(_), RecoveryState::InProgress(_)) => {
                        RecoveryEvent::ReadinessRevoked
                    }
                    _ => RecoveryEvent::Unchanged,
                };
                Ok(Reconciliation { state: next, event })
            }
        }
    }
}

fn cancelled(active: &ActiveRecovery, by: Option<Factor>, now: DateTime<Utc>) -> RecoveryState {
    RecoveryState::Cancelled(CancelledRecovery {
        action_id: active.action.id.clone(),
        lost_factor: active.lost_factor,
        cancelled_by: by,
        cancelled_at: now,
    })
}

fn completed(active: &ActiveRecovery, now: DateTime<Utc>) -> RecoveryState {
    RecoveryState::Completed(CompletedRecovery {
        action_id: active.action.id.clone(),
        lost_factor: active.lost_factor,
        new_factor_public_key: active.new_factor_public_key,
        completed_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::AuthorizationStrategy;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 10, 8, 0, 0).unwrap()
    }

    fn instance(id: &str) -> PrivilegedActionInstance {
        PrivilegedActionInstance {
            id: id.to_string(),
            privileged_action_type: PrivilegedActionType::LostHardwareRecovery,
            authorization_strategy: AuthorizationStrategy::DelayAndNotify {
                delay_start_time: t0(),
                delay_end_time: t0() + chrono::Duration::days(7),
                cancellation_token: "cancel".to_string(),
                completion_token: "complete".to_string(),
            },
        }
    }

    fn active(id: &str) -> ActiveRecovery {
        ActiveRecovery {
            action: instance(id),
            lost_factor: LostFactor::Hardware,
            new_factor_public_key: None,
            started_at: t0(),
        }
    }

    fn remote(id: &str, status: RemoteActionStatus) -> RemoteAction {
        RemoteAction {
            instance: instance(id),
            status,
            canceled_by: None,
        }
    }

    #[test]
    fn test_pending_inside_window_stays_in_progress() {
        let state = RecoveryState::InProgress(active("pa-1"));
        let now = t0() + chrono::Duration::days(1);
        let result = state
            .reconcile(Some(&remote("pa-1", RemoteActionStatus::Pending)), now)
            .unwrap();
        assert!(matches!(result.state, RecoveryState::InProgress(_)));
        assert_eq!(result.event, RecoveryEvent::Unchanged);
        assert_eq!(
            result.state.remaining_delay(now),
            Some(Duration::from_secs(6 * 86_400))
        );
    }

    #[test]
    fn test_window_elapsed_becomes_ready() {
        let state = RecoveryState::InProgress(active("pa-1"));
        let now = t0() + chrono::Duration::days(7) + chrono::Duration::seconds(1);
        let result = state
            .reconcile(Some(&remote("pa-1", RemoteActionStatus::Pending)), now)
            .unwrap();
        assert!(matches!(result.state, RecoveryState::ReadyToComplete(_)));
        assert_eq!(result.event, RecoveryEvent::BecameReady);
    }

    #[test]
    fn test_remote_cancel_wins_over_elapsed_window() {
        let state = RecoveryState::ReadyToComplete(active("pa-1"));
        let mut canceled = remote("pa-1", RemoteActionStatus::Canceled);
        canceled.canceled_by = Some(Factor::App);
        let now = t0() + chrono::Duration::days(30);
        let result = state.reconcile(Some(&canceled), now).unwrap();
        match &result.state {
            RecoveryState::Cancelled(c) => assert_eq!(c.cancelled_by, Some(Factor::App)),
            other => panic!("unexpected state {:?}", other),
        }
        assert_eq!(
            result.event.describe().unwrap(),
            "recovery was cancelled by app"
        );
    }

    #[test]
    fn test_purged_action_is_cancelled_unless_completing() {
        let now = t0() + chrono::Duration::days(2);
        let in_progress = RecoveryState::InProgress(active("pa-1"));
        let result = in_progress.reconcile(None, now).unwrap();
        assert!(matches!(result.state, RecoveryState::Cancelled(_)));

        let completing = RecoveryState::Completing(active("pa-1"));
        let result = completing.reconcile(None, now).unwrap();
        assert!(matches!(result.state, RecoveryState::Completed(_)));
        assert_eq!(result.event, RecoveryEvent::CompletionConfirmed);
    }

    #[test]
    fn test_completing_not_applied_returns_to_ready() {
        let state = RecoveryState::Completing(active("pa-1"));
        let now = t0() + chrono::Duration::days(8);
        let result = state
            .reconcile(Some(&remote("pa-1", RemoteActionStatus::Pending)), now)
            .unwrap();
        assert!(matches!(result.state, RecoveryState::ReadyToComplete(_)));
        assert_eq!(result.event, RecoveryEvent::CompletionNotApplied);
    }

    #[test]
    fn test_terminal_states_ignore_remote() {
        let state = RecoveryState::Completed(CompletedRecovery {
            action_id: "pa-1".to_string(),
            lost_factor: LostFactor::Hardware,
            new_factor_public_key: None,
            completed_at: t0(),
        });
        let result = state
            .reconcile(Some(&remote("pa-1", RemoteActionStatus::Canceled)), t0())
            .unwrap();
        assert_eq!(result.state, state);
        assert_eq!(result.event, RecoveryEvent::Unchanged);
    }

    #[test]
    fn test_strategy_variant_change_is_invariant_violation() {
        let state = RecoveryState::InProgress(active("pa-1"));
        let mut changed = remote("pa-1", RemoteActionStatus::Pending);
        changed.instance.authorization_strategy = AuthorizationStrategy::OutOfBand;
        assert!(matches!(
            state.reconcile(Some(&changed), t0()),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_mismatched_id_is_invariant_violation() {
        let state = RecoveryState::InProgress(active("pa-1"));
        assert!(matches!(
            state.reconcile(Some(&remote("pa-2", RemoteActionStatus::Pending)), t0()),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_begin_completing_rules() {
        assert!(RecoveryState::ReadyToComplete(active("pa-1"))
            .begin_completing()
            .is_ok());
        assert!(matches!(
            RecoveryState::InProgress(active("pa-1")).begin_completing(),
            Err(Error::InvalidStateTransition(_))
        ));
        let cancelled_state = RecoveryState::InProgress(active("pa-1"))
            .cancel_locally(Factor::Hardware, t0())
            .unwrap();
        assert!(matches!(
            cancelled_state.begin_completing(),
            Err(Error::AlreadyTerminal(_))
        ));
    }

    #[test]
    fn test_state_json_round_trip() {
        let state = RecoveryState::InProgress(active("pa-9"));
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"state\":\"IN_PROGRESS\""));
        let back: RecoveryState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
