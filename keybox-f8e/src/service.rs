//! Remote authority service traits

use async_trait::async_trait;
use bitcoin::bip32::Xpub;
use keybox_core::{
    AccountId, CompletionReceipt, CreatePrivilegedActionRequest, F8eSpendingKeyset, Factor,
    PrivilegedActionInstance, PrivilegedActionType, ProofOfPossession, RemoteAction, Result,
    SpendingKeyset,
};
use keybox_params::NetworkType;
use serde::{Deserialize, Serialize};

/// Privileged action endpoints.
///
/// Creation is not idempotent on the server: callers check for an in-flight
/// instance of the same type before creating another.
#[async_trait]
pub trait PrivilegedActionService: Send + Sync {
    /// Create a privileged action
    async fn create_privileged_action(
        &self,
        account_id: &AccountId,
        request: &CreatePrivilegedActionRequest,
    ) -> Result<PrivilegedActionInstance>;

    /// Actions of one type the server still knows about
    async fn list_privileged_actions(
        &self,
        account_id: &AccountId,
        action_type: PrivilegedActionType,
    ) -> Result<Vec<RemoteAction>>;

    /// Current view of an action; `None` once terminal and purged
    async fn get_privileged_action(
        &self,
        account_id: &AccountId,
        action_id: &str,
    ) -> Result<Option<RemoteAction>>;

    /// Cancel an action. Out-of-band actions carry no token.
    async fn cancel_privileged_action(
        &self,
        account_id: &AccountId,
        action_id: &str,
        cancellation_token: Option<&str>,
        canceled_by: Factor,
    ) -> Result<()>;

    /// Complete an authorized action
    async fn complete_privileged_action(
        &self,
        account_id: &AccountId,
        action_id: &str,
        completion_token: Option<&str>,
        proof: &ProofOfPossession,
    ) -> Result<CompletionReceipt>;
}

/// Keyset endpoints
#[async_trait]
pub trait KeysetService: Send + Sync {
    /// Register a rotated keyset; the server contributes its spending key
    async fn create_keyset(
        &self,
        account_id: &AccountId,
        request: &CreateKeysetRequest,
    ) -> Result<F8eSpendingKeyset>;

    /// Every keyset the server has on record for the account
    async fn list_keysets(&self, account_id: &AccountId) -> Result<Vec<RemoteKeyset>>;
}

/// Keyset registration after a completed recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateKeysetRequest {
    /// Recovery action that authorizes the rotation
    pub completed_action_id: String,
    /// Network of the keys
    pub network: NetworkType,
    /// App key of the new keyset
    pub app_spending_public_key: Xpub,
    /// Hardware key of the new keyset
    pub hardware_spending_public_key: Xpub,
}

/// Server record of a keyset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteKeyset {
    /// Server keyset id
    pub keyset_id: String,
    /// Network
    pub network: NetworkType,
    /// App key
    pub app_spending_public_key: Xpub,
    /// Hardware key
    pub hardware_spending_public_key: Xpub,
    /// Server key
    pub server_spending_public_key: Xpub,
    /// Whether the server considers it the active keyset
    #[serde(default)]
    pub active: bool,
    /// Recovery that authorized this keyset, absent for the account's first keyset
    #[serde(default)]
    pub completed_action_id: Option<String>,
}

impl RemoteKeyset {
    /// Whether `key` is one of this keyset's keys
    pub fn contains_key(&self, key: &Xpub) -> bool {
        [
            &self.app_spending_public_key,
            &self.hardware_spending_public_key,
            &self.server_spending_public_key,
        ]
        .iter()
        .any(|k| k.public_key == key.public_key)
    }

    /// Whether this is the keyset `request` would create
    pub fn matches_request(&self, request: &CreateKeysetRequest) -> bool {
        self.network == request.network
            && self.app_spending_public_key.public_key == request.app_spending_public_key.public_key
            && self.hardware_spending_public_key.public_key
                == request.hardware_spending_public_key.public_key
            && self.completed_action_id.as_deref() == Some(request.completed_action_id.as_str())
    }

    /// Server half
    pub fn f8e_spending_keyset(&self) -> F8eSpendingKeyset {
        F8eSpendingKeyset {
            keyset_id: self.keyset_id.clone(),
            spending_public_key: self.server_spending_public_key,
        }
    }

    /// Full keyset, identified locally by its server id
    pub fn spending_keyset(&self) -> SpendingKeyset {
        SpendingKeyset {
            local_id: self.keyset_id.clone(),
            network_type: self.network,
            app_key: self.app_spending_public_key,
            hardware_key: self.hardware_spending_public_key,
            f8e_spending_keyset: self.f8e_spending_keyset(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keybox_core::testing::test_xpub;

    #[test]
    fn test_remote_keyset_contains_key() {
        let keyset = RemoteKeyset {
            keyset_id: "ks".to_string(),
            network: NetworkType::Regtest,
            app_spending_public_key: test_xpub(1),
            hardware_spending_public_key: test_xpub(2),
            server_spending_public_key: test_xpub(3),
            active: true,
            completed_action_id: None,
        };
        assert!(keyset.contains_key(&test_xpub(2)));
        assert!(!keyset.contains_key(&test_xpub(4)));
        assert_eq!(keyset.f8e_spending_keyset().spending_public_key, test_xpub(3));
    }

    #[test]
    fn test_remote_keyset_matches_only_its_own_request() {
        let keyset = RemoteKeyset {
            keyset_id: "ks".to_string(),
            network: NetworkType::Regtest,
            app_spending_public_key: test_xpub(1),
            hardware_spending_public_key: test_xpub(2),
            server_spending_public_key: test_xpub(3),
            active: true,
            completed_action_id: Some("action-1".to_string()),
        };
        let mut request = CreateKeysetRequest {
            completed_action_id: "action-1".to_string(),
            network: NetworkType::Regtest,
            app_spending_public_key: test_xpub(1),
            hardware_spending_public_key: test_xpub(2),
        };
        assert!(keyset.matches_request(&request));

        request.completed_action_id = "action-2".to_string();
        assert!(!keyset.matches_request(&request));

        request.completed_action_id = "action-1".to_string();
        request.app_spending_public_key = test_xpub(4);
        assert!(!keyset.matches_request(&request));
    }

    #[test]
    fn test_remote_keyset_without_action_id_deserializes() {
        let json = serde_json::json!({
            "keyset_id": "ks",
            "network": "regtest",
            "app_spending_public_key": test_xpub(1).to_string(),
            "hardware_spending_public_key": test_xpub(2).to_string(),
            "server_spending_public_key": test_xpub(3).to_string(),
        });
        let keyset: RemoteKeyset = serde_json::from_value(json).unwrap();
        assert!(!keyset.active);
        assert_eq!(keyset.completed_action_id, None);
    }

    #[test]
    fn test_create_keyset_request_wire_names() {
        let request = CreateKeysetRequest {
            completed_action_id: "action-1".to_string(),
            network: NetworkType::Signet,
            app_spending_public_key: test_xpub(1),
            hardware_spending_public_key: test_xpub(2),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["completed_action_id"], "action-1");
        assert_eq!(json["network"], "signet");
        assert_eq!(json["app_spending_public_key"], test_xpub(1).to_string());
    }
}
