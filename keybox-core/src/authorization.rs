//! Authorization strategies for privileged actions
//!
//! A privileged action is authorized either out of band (the remote authority
//! records a proof received over a side channel) or by delay-and-notify (the
//! action becomes completable once a server-enforced window elapses, during
//! which every factor is notified and may cancel).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Discriminant shared by all strategy variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthorizationStrategyType {
    /// Approval through a side channel
    OutOfBand,
    /// Time-delayed approval with notification
    DelayAndNotify,
}

/// How a privileged action becomes authorized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "authorization_strategy_type",
    rename_all = "SCREAMING_SNAKE_CASE"
)]
pub enum AuthorizationStrategy {
    /// Approval through a side channel; no delay is enforced
    OutOfBand,
    /// Completable once `delay_end_time` has passed
    DelayAndNotify {
        /// When the window opened
        delay_start_time: DateTime<Utc>,
        /// When the action becomes completable
        delay_end_time: DateTime<Utc>,
        /// Opaque token that cancels the action
        cancellation_token: String,
        /// Opaque token that completes the action
        completion_token: String,
    },
}

impl AuthorizationStrategy {
    /// Shared discriminant
    pub fn strategy_type(&self) -> AuthorizationStrategyType {
        match self {
            AuthorizationStrategy::OutOfBand => AuthorizationStrategyType::OutOfBand,
            AuthorizationStrategy::DelayAndNotify { .. } => {
                AuthorizationStrategyType::DelayAndNotify
            }
        }
    }

    /// Time left before the action is completable, never negative.
    ///
    /// Always zero for out-of-band strategies.
    pub fn remaining_delay(&self, now: DateTime<Utc>) -> Duration {
        match self {
            AuthorizationStrategy::OutOfBand => Duration::ZERO,
            AuthorizationStrategy::DelayAndNotify { delay_end_time, .. } => {
                (*delay_end_time - now).to_std().unwrap_or(Duration::ZERO)
            }
        }
    }

    /// Whether the action may be completed at `now`.
    ///
    /// `remote_authorized` is the remote authority's verdict; for out-of-band
    /// strategies it is the only signal.
    pub fn is_satisfied_at(&self, now: DateTime<Utc>, remote_authorized: bool) -> bool {
        match self {
            AuthorizationStrategy::OutOfBand => remote_authorized,
            AuthorizationStrategy::DelayAndNotify { delay_end_time, .. } => {
                remote_authorized || now >= *delay_end_time
            }
        }
    }

    /// Fraction of the delay window elapsed, in `[0, 1]`
    pub fn delay_progress(&self, now: DateTime<Utc>) -> f64 {
        match self {
            AuthorizationStrategy::OutOfBand => 1.0,
            AuthorizationStrategy::DelayAndNotify {
                delay_start_time,
                delay_end_time,
                ..
            } => {
                let total = (*delay_end_time - *delay_start_time).num_milliseconds();
                if total <= 0 {
                    return 1.0;
                }
                let elapsed = (now - *delay_start_time).num_milliseconds();
                (elapsed as f64 / total as f64).clamp(0.0, 1.0)
            }
        }
    }

    /// Cancellation token; out-of-band actions carry none
    pub fn cancellation_token(&self) -> Result<&str> {
        match self {
            AuthorizationStrategy::DelayAndNotify {
                cancellation_token, ..
            } => Ok(cancellation_token),
            AuthorizationStrategy::OutOfBand => Err(Error::InvariantViolation(
                "out-of-band action has no cancellation token".to_string(),
            )),
        }
    }

    /// Completion token; out-of-band actions carry none
    pub fn completion_token(&self) -> Result<&str> {
        match self {
            AuthorizationStrategy::DelayAndNotify {
                completion_token, ..
            } => Ok(completion_token),
            AuthorizationStrategy::OutOfBand => Err(Error::InvariantViolation(
                "out-of-band action has no completion token".to_string(),
            )),
        }
    }

    /// Check structural invariants
    pub fn validate(&self) -> Result<()> {
        match self {
            AuthorizationStrategy::OutOfBand => Ok(()),
            AuthorizationStrategy::DelayAndNotify {
                delay_start_time,
                delay_end_time,
                cancellation_token,
                completion_token,
            } => {
                if delay_end_time <= delay_start_time {
                    return Err(Error::InvariantViolation(format!(
                        "delay end {} is not after delay start {}",
                        delay_end_time, delay_start_time
                    )));
                }
                if cancellation_token.is_empty() {
                    return Err(Error::InvariantViolation(
                        "empty cancellation token".to_string(),
                    ));
                }
                if completion_token.is_empty() {
                    return Err(Error::InvariantViolation(
                        "empty completion token".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}
