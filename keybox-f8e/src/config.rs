//! f8e client configuration

use keybox_params::Network;
use serde::{Deserialize, Serialize};

/// f8e client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct F8eConfig {
    /// Base URL, without trailing `/api`
    pub base_url: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Bearer token sent with every request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

fn default_request_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

impl F8eConfig {
    /// Default config for a network
    pub fn for_network(network: &Network) -> Self {
        Self {
            base_url: network.default_f8e_url.to_string(),
            ..Self::default()
        }
    }
}

impl Default for F8eConfig {
    fn default() -> Self {
        Self {
            base_url: Network::bitcoin().default_f8e_url.to_string(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            auth_token: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: F8eConfig =
            serde_json::from_str(r#"{"base_url":"http://localhost:8080"}"#).unwrap();
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.connect_timeout_secs, 10);
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn test_for_network() {
        let config = F8eConfig::for_network(&Network::regtest());
        assert_eq!(config.base_url, Network::regtest().default_f8e_url);
    }
}
