//! f8e JSON/HTTPS client

use std::time::Duration;

use async_trait::async_trait;
use keybox_core::{
    AccountId, CompletionReceipt, CreatePrivilegedActionRequest, Error, F8eSpendingKeyset, Factor,
    PrivilegedActionInstance, PrivilegedActionType, ProofOfPossession, RemoteAction, Result,
};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::F8eConfig;
use crate::error::{error_from_response, error_from_transport};
use crate::service::{CreateKeysetRequest, KeysetService, PrivilegedActionService, RemoteKeyset};

/// f8e client
pub struct F8eClient {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ListActionsResponse {
    actions: Vec<RemoteAction>,
}

#[derive(Deserialize)]
struct ListKeysetsResponse {
    keysets: Vec<RemoteKeyset>,
}

#[derive(Serialize)]
struct CancelRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    cancellation_token: Option<&'a str>,
    canceled_by: Factor,
}

#[derive(Serialize)]
struct CompleteRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    completion_token: Option<&'a str>,
    proof: &'a ProofOfPossession,
}

impl F8eClient {
    /// Create new f8e client
    pub fn new(config: &F8eConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| Error::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
            client,
        })
    }

    fn actions_url(&self, account_id: &AccountId) -> String {
        format!(
            "{}/api/accounts/{}/privileged-actions",
            self.base_url, account_id
        )
    }

    fn keysets_url(&self, account_id: &AccountId) -> String {
        format!("{}/api/accounts/{}/keysets", self.base_url, account_id)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send a request; non-success statuses become errors, except 404 which
    /// yields `None`
    async fn execute(&self, request: RequestBuilder) -> Result<Option<reqwest::Response>> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(error_from_transport)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_from_response(status.as_u16(), &body));
        }
        Ok(Some(response))
    }

    /// Send a request and decode the JSON body; `None` on 404
    async fn send_optional<R: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Option<R>> {
        match self.execute(request).await? {
            Some(response) => Ok(Some(response.json().await.map_err(error_from_transport)?)),
            None => Ok(None),
        }
    }

    /// Send a request and decode the JSON body
    async fn send<R: DeserializeOwned>(&self, request: RequestBuilder) -> Result<R> {
        self.send_optional(request)
            .await?
            .ok_or_else(|| Error::NotFound("HTTP 404".to_string()))
    }
}

#[async_trait]
impl PrivilegedActionService for F8eClient {
    async fn create_privileged_action(
        &self,
        account_id: &AccountId,
        request: &CreatePrivilegedActionRequest,
    ) -> Result<PrivilegedActionInstance> {
        tracing::debug!(
            "POST privileged action {} for account {}",
            request.privileged_action_type,
            account_id
        );
        let instance: PrivilegedActionInstance = self
            .send(self.client.post(self.actions_url(account_id)).json(request))
            .await?;
        instance.validate()?;
        Ok(instance)
    }

    async fn list_privileged_actions(
        &self,
        account_id: &AccountId,
        action_type: PrivilegedActionType,
    ) -> Result<Vec<RemoteAction>> {
        let response: ListActionsResponse = self
            .send(
                self.client
                    .get(self.actions_url(account_id))
                    .query(&[("privileged_action_type", action_type.as_str())]),
            )
            .await?;
        Ok(response.actions)
    }

    async fn get_privileged_action(
        &self,
        account_id: &AccountId,
        action_id: &str,
    ) -> Result<Option<RemoteAction>> {
        let url = format!("{}/{}", self.actions_url(account_id), action_id);
        self.send_optional(self.client.get(url)).await
    }

    async fn cancel_privileged_action(
        &self,
        account_id: &AccountId,
        action_id: &str,
        cancellation_token: Option<&str>,
        canceled_by: Factor,
    ) -> Result<()> {
        let url = format!("{}/{}/cancel", self.actions_url(account_id), action_id);
        let body = CancelRequest {
            cancellation_token,
            canceled_by,
        };
        self.execute(self.client.post(url).json(&body))
            .await?
            .ok_or_else(|| Error::NotFound(format!("privileged action {}", action_id)))?;
        Ok(())
    }

    async fn complete_privileged_action(
        &self,
        account_id: &AccountId,
        action_id: &str,
        completion_token: Option<&str>,
        proof: &ProofOfPossession,
    ) -> Result<CompletionReceipt> {
        let url = format!("{}/{}/complete", self.actions_url(account_id), action_id);
        let body = CompleteRequest {
            completion_token,
            proof,
        };
        self.send(self.client.post(url).json(&body)).await
    }
}

#[async_trait]
impl KeysetService for F8eClient {
    async fn create_keyset(
        &self,
        account_id: &AccountId,
        request: &CreateKeysetRequest,
    ) -> Result<F8eSpendingKeyset> {
        tracing::debug!(
            "POST keyset for account {} (action {})",
            account_id,
            request.completed_action_id
        );
        self.send(self.client.post(self.keysets_url(account_id)).json(request))
            .await
    }

    async fn list_keysets(&self, account_id: &AccountId) -> Result<Vec<RemoteKeyset>> {
        let response: ListKeysetsResponse =
            self.send(self.client.get(self.keysets_url(account_id))).await?;
        Ok(response.keysets)
    }
}
