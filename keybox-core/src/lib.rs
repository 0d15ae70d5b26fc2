//! Keybox wallet core
//!
//! This crate implements the domain model of the 2-of-3 wallet's recovery
//! core: spending keysets, privileged-action authorization strategies, the
//! recovery state machine and its reconciliation rules, fee policy and sweep
//! construction. It performs no I/O apart from retry sleeps.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod authorization;
pub mod clock;
pub mod error;
pub mod fees;
pub mod keys;
pub mod privileged_action;
pub mod recovery;
pub mod retry;
pub mod sweep;

#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;

pub use authorization::{AuthorizationStrategy, AuthorizationStrategyType};
#[cfg(any(test, feature = "test-helpers"))]
pub use clock::ManualClock;
pub use clock::{Clock, SystemClock};
pub use error::{Error, ErrorCategory, Result};
pub use fees::{FeeCalculator, FeePriority, MAX_FEE, MIN_RELAY_FEE_RATE, P2WSH_OUTPUT_DUST_LIMIT};
pub use keys::{AccountId, F8eSpendingKeyset, Factor, KeyChain, Keybox, SpendingKeyset};
pub use privileged_action::{
    CompletionReceipt, CreatePrivilegedActionRequest, PrivilegedActionInstance,
    PrivilegedActionType, ProofOfPossession, RemoteAction, RemoteActionStatus,
};
pub use recovery::{
    ActiveRecovery, CancelledRecovery, CompletedRecovery, LostFactor, Reconciliation,
    RecoveryEvent, RecoveryState,
};
pub use retry::{with_retry, RetryConfig};
pub use sweep::{KeysetFunds, SpendableUtxo, Sweep, SweepGenerator, SweepPsbt};
