//! Error types for Keybox Core
//!
//! Error taxonomy for the recovery protocol, privileged actions, key
//! rotation and sweep construction.
//!
//! Three families matter to callers:
//! - transient errors ([`Error::is_transient`]) are retried with backoff;
//! - protocol violations ([`Error::is_protocol_violation`]) are fatal and
//!   surfaced to the user;
//! - [`Error::InvariantViolation`] signals a local bug and aborts the
//!   operation.

use std::fmt;

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Keybox Core errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network error (timeouts, connection resets)
    #[error("Network error: {0}")]
    Network(String),

    /// Remote authority answered with a server-side failure
    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// Remote rejected a request for a non-protocol reason
    #[error("Remote rejected request: {0}")]
    RemoteRejected(String),

    /// Requested resource does not exist remotely
    #[error("Not found: {0}")]
    NotFound(String),

    /// Cancellation or completion token is invalid
    #[error("Token invalid: {0}")]
    TokenInvalid(String),

    /// Token was already used
    #[error("Token already consumed: {0}")]
    TokenAlreadyConsumed(String),

    /// Privileged action is already cancelled or completed
    #[error("Already terminal: {0}")]
    AlreadyTerminal(String),

    /// Rotation raced a concurrent rotation
    #[error("Stale rotation: {0}")]
    StaleRotation(String),

    /// Proposed key already appears in a known keyset
    #[error("Key reuse: {0}")]
    KeyReuse(String),

    /// A privileged action of this type is already in flight
    #[error("Privileged action already in flight: {0}")]
    ActionInFlight(String),

    /// A recovery is already active for this account
    #[error("Recovery already in progress: {0}")]
    RecoveryAlreadyInProgress(String),

    /// No recovery is active for this account
    #[error("No recovery in progress")]
    NoRecoveryInProgress,

    /// Recovery delay has not elapsed yet
    #[error("Recovery not ready: {remaining_secs}s remaining")]
    RecoveryNotReady {
        /// Seconds left in the delay window
        remaining_secs: u64,
    },

    /// Operation not valid in the current recovery state
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// Proof of possession missing or insufficient
    #[error("Missing proof: {0}")]
    MissingProof(String),

    /// Local invariant broken (bug)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Key derivation error
    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    /// Invalid key
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// No active keyset for the account
    #[error("No active keyset: {0}")]
    NoActiveKeyset(String),

    /// Sweep built against a keyset that is no longer active
    #[error("Stale sweep: {0}")]
    StaleSweep(String),

    /// Invalid amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Fee calculation error
    #[error("Fee calculation error: {0}")]
    FeeCalculation(String),

    /// Fee too high
    #[error("Fee too high: {0}")]
    FeeTooHigh(String),

    /// Transaction building error
    #[error("Transaction build error: {0}")]
    TransactionBuild(String),

    /// Transaction signing error
    #[error("Transaction signing error: {0}")]
    TransactionSigning(String),

    /// Transaction broadcast failed
    #[error("Broadcast failed: {0}")]
    BroadcastFailed(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the error is worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::RemoteUnavailable(_))
    }

    /// Fatal protocol errors that must never be retried
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::TokenInvalid(_)
                | Error::TokenAlreadyConsumed(_)
                | Error::AlreadyTerminal(_)
                | Error::StaleRotation(_)
                | Error::KeyReuse(_)
        )
    }

    /// Check if error is a user-facing error (vs internal error)
    pub fn is_user_error(&self) -> bool {
        self.is_protocol_violation()
            || matches!(
                self,
                Error::RecoveryAlreadyInProgress(_)
                    | Error::RecoveryNotReady { .. }
                    | Error::MissingProof(_)
                    | Error::StaleSweep(_)
                    | Error::NoRecoveryInProgress
                    | Error::Network(_)
                    | Error::BroadcastFailed(_)
            )
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Error::TokenInvalid(_) => {
                "The server rejected this request. Please restart the app and try again.".to_string()
            }
            Error::TokenAlreadyConsumed(_) | Error::AlreadyTerminal(_) => {
                "This recovery has already been completed or cancelled.".to_string()
            }
            Error::StaleRotation(_) => {
                "Your keys were changed on another device. Please refresh and try again.".to_string()
            }
            Error::KeyReuse(_) => {
                "This key was used before and cannot be used again. Please pair a new device.".to_string()
            }
            Error::RecoveryAlreadyInProgress(_) => {
                "A recovery is already in progress for this wallet.".to_string()
            }
            Error::RecoveryNotReady { remaining_secs } => {
                format!(
                    "Recovery is not ready yet. {} remaining.",
                    format_remaining(*remaining_secs)
                )
            }
            Error::MissingProof(_) => {
                "Please confirm with your remaining device to continue.".to_string()
            }
            Error::StaleSweep(_) => {
                "Your wallet keys changed. Please review the transfer again.".to_string()
            }
            Error::NoRecoveryInProgress => "There is no recovery in progress.".to_string(),
            Error::Network(_) => {
                "Unable to connect to the network. Please check your connection and try again.".to_string()
            }
            Error::BroadcastFailed(_) => {
                "Failed to broadcast transaction. The network may be congested. Please try again.".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Get error category for logging/metrics
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Network(_)
            | Error::RemoteUnavailable(_)
            | Error::RemoteRejected(_)
            | Error::NotFound(_) => ErrorCategory::Network,
            Error::TokenInvalid(_)
            | Error::TokenAlreadyConsumed(_)
            | Error::AlreadyTerminal(_)
            | Error::ActionInFlight(_) => ErrorCategory::Authorization,
            Error::RecoveryAlreadyInProgress(_)
            | Error::NoRecoveryInProgress
            | Error::RecoveryNotReady { .. }
            | Error::InvalidStateTransition(_)
            | Error::MissingProof(_) => ErrorCategory::Recovery,
            Error::StaleRotation(_)
            | Error::KeyReuse(_)
            | Error::KeyDerivation(_)
            | Error::InvalidKey(_)
            | Error::NoActiveKeyset(_) => ErrorCategory::Keys,
            Error::StaleSweep(_)
            | Error::InvalidAmount(_)
            | Error::FeeCalculation(_)
            | Error::FeeTooHigh(_)
            | Error::TransactionBuild(_)
            | Error::TransactionSigning(_)
            | Error::BroadcastFailed(_) => ErrorCategory::Sweep,
            Error::Storage(_) => ErrorCategory::Storage,
            Error::InvariantViolation(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Other(_) => ErrorCategory::Internal,
        }
    }
}

fn format_remaining(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m {}s", minutes, secs % 60)
    }
}

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network-related errors
    Network,
    /// Privileged action authorization errors
    Authorization,
    /// Recovery state errors
    Recovery,
    /// Key and keyset errors
    Keys,
    /// Sweep construction and broadcast errors
    Sweep,
    /// Storage-related errors
    Storage,
    /// Internal/system errors
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Network => write!(f, "Network"),
            ErrorCategory::Authorization => write!(f, "Authorization"),
            ErrorCategory::Recovery => write!(f, "Recovery"),
            ErrorCategory::Keys => write!(f, "Keys"),
            ErrorCategory::Sweep => write!(f, "Sweep"),
            ErrorCategory::Storage => write!(f, "Storage"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("reset".to_string()).is_transient());
        assert!(Error::RemoteUnavailable("503".to_string()).is_transient());
        assert!(!Error::TokenInvalid("bad".to_string()).is_transient());
        assert!(!Error::AlreadyTerminal("done".to_string()).is_transient());
        assert!(!Error::InvariantViolation("bug".to_string()).is_transient());
    }

    #[test]
    fn test_protocol_violations_are_fatal() {
        for error in [
            Error::TokenInvalid("t".to_string()),
            Error::TokenAlreadyConsumed("t".to_string()),
            Error::AlreadyTerminal("t".to_string()),
            Error::StaleRotation("t".to_string()),
            Error::KeyReuse("t".to_string()),
        ] {
            assert!(error.is_protocol_violation());
            assert!(!error.is_transient());
            assert!(error.is_user_error());
        }
    }

    #[test]
    fn test_user_messages() {
        let msg = Error::RecoveryNotReady { remaining_secs: 6 * 86_400 + 3_600 }.user_message();
        assert!(msg.contains("6d 1h"));

        let msg = Error::KeyReuse("xpub".to_string()).user_message();
        assert!(msg.contains("cannot be used again"));
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(Error::Network("x".to_string()).category(), ErrorCategory::Network);
        assert_eq!(
            Error::TokenInvalid("x".to_string()).category(),
            ErrorCategory::Authorization
        );
        assert_eq!(Error::KeyReuse("x".to_string()).category(), ErrorCategory::Keys);
        assert_eq!(Error::StaleSweep("x".to_string()).category(), ErrorCategory::Sweep);
        assert_eq!(Error::NoRecoveryInProgress.category(), ErrorCategory::Recovery);
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Authorization.to_string(), "Authorization");
        assert_eq!(ErrorCategory::Sweep.to_string(), "Sweep");
    }
}
