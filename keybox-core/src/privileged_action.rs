//! Privileged actions
//!
//! Security-sensitive operations (lost-factor recovery, fingerprint reset)
//! that the remote authority only performs once an authorization strategy is
//! satisfied. Instances are terminal once cancelled or completed and their ids
//! are never reused.

use std::fmt;

use bitcoin::bip32::Xpub;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::authorization::AuthorizationStrategy;
use crate::keys::Factor;
use crate::{Error, Result};

/// Kind of privileged action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrivilegedActionType {
    /// Replace enrolled hardware fingerprints
    ResetFingerprint,
    /// Recover after losing the hardware device
    LostHardwareRecovery,
    /// Recover after losing the app
    LostAppRecovery,
}

impl PrivilegedActionType {
    /// Wire name
    pub const fn as_str(&self) -> &'static str {
        match self {
            PrivilegedActionType::ResetFingerprint => "RESET_FINGERPRINT",
            PrivilegedActionType::LostHardwareRecovery => "LOST_HARDWARE_RECOVERY",
            PrivilegedActionType::LostAppRecovery => "LOST_APP_RECOVERY",
        }
    }
}

impl fmt::Display for PrivilegedActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A privileged action as issued by the remote authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivilegedActionInstance {
    /// Server-assigned id
    pub id: String,
    /// Kind of action
    pub privileged_action_type: PrivilegedActionType,
    /// How the action gets authorized
    pub authorization_strategy: AuthorizationStrategy,
}

impl PrivilegedActionInstance {
    /// Check id and strategy invariants
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvariantViolation(
                "privileged action has empty id".to_string(),
            ));
        }
        self.authorization_strategy.validate()
    }
}

/// Lifecycle status reported by the remote authority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteActionStatus {
    /// Waiting for authorization
    Pending,
    /// Out-of-band proof recorded or delay elapsed server-side
    Authorized,
    /// Completed; terminal
    Completed,
    /// Cancelled; terminal
    Canceled,
}

impl RemoteActionStatus {
    /// Whether the status is terminal
    pub const fn is_terminal(&self) -> bool {
        matches!(self, RemoteActionStatus::Completed | RemoteActionStatus::Canceled)
    }
}

/// The remote authority's view of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAction {
    /// Instance as currently stored remotely
    pub instance: PrivilegedActionInstance,
    /// Lifecycle status
    pub status: RemoteActionStatus,
    /// Factor that cancelled the action, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canceled_by: Option<Factor>,
}

/// Proof that the caller holds a surviving factor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOfPossession {
    /// Signature by the app key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_signature: Option<String>,
    /// Signature by the hardware key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_signature: Option<String>,
}

impl ProofOfPossession {
    /// Proof from the app only
    pub fn app(signature: impl Into<String>) -> Self {
        Self {
            app_signature: Some(signature.into()),
            hardware_signature: None,
        }
    }

    /// Proof from the hardware only
    pub fn hardware(signature: impl Into<String>) -> Self {
        Self {
            app_signature: None,
            hardware_signature: Some(signature.into()),
        }
    }

    /// Whether a non-empty proof for `factor` is present
    pub fn proves(&self, factor: Factor) -> bool {
        let signature = match factor {
            Factor::App => &self.app_signature,
            Factor::Hardware => &self.hardware_signature,
            Factor::Server => return false,
        };
        signature.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Whether any factor is proven
    pub fn is_empty(&self) -> bool {
        !self.proves(Factor::App) && !self.proves(Factor::Hardware)
    }
}

/// Request to open a privileged action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePrivilegedActionRequest {
    /// Kind of action
    pub privileged_action_type: PrivilegedActionType,
    /// Proof of a surviving factor
    pub proof: ProofOfPossession,
    /// Replacement factor key, for recoveries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_factor_public_key: Option<Xpub>,
}

/// Result of a successful completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReceipt {
    /// Completed instance
    pub action_id: String,
    /// Kind of action
    pub privileged_action_type: PrivilegedActionType,
    /// When the remote authority recorded completion
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_type_wire_names() {
        let json = serde_json::to_string(&PrivilegedActionType::LostHardwareRecovery).unwrap();
        assert_eq!(json, "\"LOST_HARDWARE_RECOVERY\"");
        assert_eq!(
            PrivilegedActionType::ResetFingerprint.to_string(),
            "RESET_FINGERPRINT"
        );
    }

    #[test]
    fn test_proof_of_possession() {
        assert!(ProofOfPossession::default().is_empty());
        assert!(ProofOfPossession::hardware("sig").proves(Factor::Hardware));
        assert!(!ProofOfPossession::hardware("sig").proves(Factor::App));
        assert!(ProofOfPossession::app("").is_empty());
    }

    #[test]
    fn test_instance_validation() {
        let instance = PrivilegedActionInstance {
            id: String::new(),
            privileged_action_type: PrivilegedActionType::ResetFingerprint,
            authorization_strategy: AuthorizationStrategy::OutOfBand,
        };
        assert!(matches!(
            instance.validate(),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_remote_action_decodes_without_canceled_by() {
        let json = r#"{
            "instance": {
                "id": "pa-1",
                "privileged_action_type": "RESET_FINGERPRINT",
                "authorization_strategy": {"authorization_strategy_type": "OUT_OF_BAND"}
            },
            "status": "AUTHORIZED"
        }"#;
        let remote: RemoteAction = serde_json::from_str(json).unwrap();
        assert_eq!(remote.status, RemoteActionStatus::Authorized);
        assert!(remote.canceled_by.is_none());
        assert!(!remote.status.is_terminal());
    }
}
