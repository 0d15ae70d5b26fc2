//! Esplora REST client

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::{Address, Amount, FeeRate, OutPoint, Transaction, Txid};
use keybox_core::fees::fee_rate_from_sat_per_vb;
use keybox_core::{with_retry, Error, Result, RetryConfig, MIN_RELAY_FEE_RATE};
use keybox_params::Network;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::source::{ChainSource, Utxo};

/// Esplora client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EsploraConfig {
    /// Base URL, e.g. `https://blockstream.info/api`
    pub base_url: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_request_timeout() -> u64 {
    30
}

impl EsploraConfig {
    /// Default config for a network
    pub fn for_network(network: &Network) -> Self {
        Self {
            base_url: network.default_esplora_url.to_string(),
            request_timeout_secs: default_request_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Deserialize)]
struct AddressStats {
    tx_count: u64,
}

#[derive(Deserialize)]
struct AddressInfo {
    chain_stats: AddressStats,
    mempool_stats: AddressStats,
}

#[derive(Deserialize)]
struct UtxoStatus {
    confirmed: bool,
}

#[derive(Deserialize)]
struct EsploraUtxo {
    txid: Txid,
    vout: u32,
    value: u64,
    status: UtxoStatus,
}

/// Esplora client
#[derive(Clone)]
pub struct EsploraClient {
    base_url: String,
    retry: RetryConfig,
    client: reqwest::Client,
}

impl EsploraClient {
    /// Create new Esplora client
    pub fn new(config: &EsploraConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry: config.retry.clone(),
            client,
        })
    }

    /// Endpoint
    pub fn endpoint(&self) -> &str {
        &self.base_url
    }

    async fn get_json<R: serde::de::DeserializeOwned>(&self, path: &str) -> Result<R> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Network(format!("HTTP error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| Error::RemoteRejected(format!("JSON decode error: {}", e)))
    }
}

fn status_error(status: StatusCode, body: &str) -> Error {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Error::RemoteUnavailable(format!("Esplora HTTP {}: {}", status, body))
    } else {
        Error::RemoteRejected(format!("Esplora HTTP {}: {}", status, body))
    }
}

/// Pick the estimate for `target_blocks`.
///
/// Esplora only reports some targets. Falls back to the closest faster
/// target, then to the slowest reported one, then to the relay minimum.
pub fn select_fee_rate(estimates: &HashMap<u16, f64>, target_blocks: u16) -> FeeRate {
    let faster = estimates
        .iter()
        .filter(|(target, _)| **target <= target_blocks)
        .max_by_key(|(target, _)| **target);
    let chosen = faster.or_else(|| estimates.iter().min_by_key(|(target, _)| **target));

    match chosen {
        Some((_, sat_per_vb)) => fee_rate_from_sat_per_vb(*sat_per_vb),
        None => MIN_RELAY_FEE_RATE,
    }
}

#[async_trait]
impl ChainSource for EsploraClient {
    async fn address_tx_count(&self, address: &Address) -> Result<u64> {
        let path = format!("/address/{}", address);
        let info: AddressInfo = with_retry(&self.retry, "esplora address", || self.get_json(&path)).await?;
        Ok(info.chain_stats.tx_count + info.mempool_stats.tx_count)
    }

    async fn list_unspent(&self, address: &Address) -> Result<Vec<Utxo>> {
        let path = format!("/address/{}/utxo", address);
        let utxos: Vec<EsploraUtxo> =
            with_retry(&self.retry, "esplora utxo", || self.get_json(&path)).await?;

        debug!("{} unspent outputs at {}", utxos.len(), address);
        Ok(utxos
            .into_iter()
            .map(|u| Utxo {
                outpoint: OutPoint {
                    txid: u.txid,
                    vout: u.vout,
                },
                amount: Amount::from_sat(u.value),
                confirmed: u.status.confirmed,
            })
            .collect())
    }

    async fn fee_rate(&self, target_blocks: u16) -> Result<FeeRate> {
        let raw: HashMap<String, f64> =
            with_retry(&self.retry, "esplora fee-estimates", || self.get_json("/fee-estimates"))
                .await?;
        let estimates: HashMap<u16, f64> = raw
            .into_iter()
            .filter_map(|(target, rate)| target.parse().ok().map(|t| (t, rate)))
            .collect();
        Ok(select_fee_rate(&estimates, target_blocks))
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        let raw = serialize_hex(tx);
        info!("Broadcasting transaction {} ({} bytes)", tx.compute_txid(), raw.len() / 2);

        with_retry(&self.retry, "esplora broadcast", || async {
            let response = self
                .client
                .post(format!("{}/tx", self.base_url))
                .body(raw.clone())
                .send()
                .await
                .map_err(|e| Error::Network(format!("HTTP error: {}", e)))?;

            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
                error!("Transaction broadcast failed: HTTP {}: {}", status, body);
                return Err(Error::BroadcastFailed(body));
            }
            if !status.is_success() {
                return Err(status_error(status, &body));
            }

            Txid::from_str(body.trim())
                .map_err(|e| Error::BroadcastFailed(format!("unexpected broadcast response: {}", e)))
        })
        .await
    }
}
