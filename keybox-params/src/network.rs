//! Bitcoin network definitions

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Balances strictly below this many satoshis are treated as dust and are
/// never used as a sweep source.
pub const DUST_THRESHOLD_SATS: u64 = 546;

/// Network type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Bitcoin mainnet
    Bitcoin,
    /// Testnet3
    Testnet,
    /// Signet
    Signet,
    /// Regtest (local development)
    Regtest,
}

impl NetworkType {
    /// Lowercase name used in config files and on the wire
    pub const fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Bitcoin => "bitcoin",
            NetworkType::Testnet => "testnet",
            NetworkType::Signet => "signet",
            NetworkType::Regtest => "regtest",
        }
    }

    /// Matching `bitcoin` crate network
    pub const fn bitcoin_network(&self) -> bitcoin::Network {
        match self {
            NetworkType::Bitcoin => bitcoin::Network::Bitcoin,
            NetworkType::Testnet => bitcoin::Network::Testnet,
            NetworkType::Signet => bitcoin::Network::Signet,
            NetworkType::Regtest => bitcoin::Network::Regtest,
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bitcoin" | "mainnet" | "main" => Ok(NetworkType::Bitcoin),
            "testnet" | "test" => Ok(NetworkType::Testnet),
            "signet" => Ok(NetworkType::Signet),
            "regtest" => Ok(NetworkType::Regtest),
            other => Err(Error::InvalidNetwork(other.to_string())),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone)]
pub struct Network {
    /// Network type
    pub network_type: NetworkType,
    /// Human-readable name
    pub name: &'static str,
    /// Coin type (BIP-44)
    pub coin_type: u32,
    /// Minimum sweepable balance in satoshis
    pub dust_threshold_sats: u64,
    /// Delay the remote authority applies to lost-factor recoveries
    pub default_recovery_delay: Duration,
    /// Default remote authority (f8e) endpoint
    pub default_f8e_url: &'static str,
    /// Default Esplora endpoint
    pub default_esplora_url: &'static str,
}

impl Network {
    /// Get mainnet parameters
    pub const fn bitcoin() -> Self {
        Self {
            network_type: NetworkType::Bitcoin,
            name: "bitcoin",
            coin_type: 0,
            dust_threshold_sats: DUST_THRESHOLD_SATS,
            default_recovery_delay: Duration::from_secs(7 * 24 * 60 * 60),
            default_f8e_url: "https://api.keybox.example",
            default_esplora_url: "https://blockstream.info/api",
        }
    }

    /// Get testnet parameters
    pub const fn testnet() -> Self {
        Self {
            network_type: NetworkType::Testnet,
            name: "testnet",
            coin_type: 1,
            dust_threshold_sats: DUST_THRESHOLD_SATS,
            default_recovery_delay: Duration::from_secs(24 * 60 * 60),
            default_f8e_url: "https://api.staging.keybox.example",
            default_esplora_url: "https://blockstream.info/testnet/api",
        }
    }

    /// Get signet parameters
    pub const fn signet() -> Self {
        Self {
            network_type: NetworkType::Signet,
            name: "signet",
            coin_type: 1,
            dust_threshold_sats: DUST_THRESHOLD_SATS,
            default_recovery_delay: Duration::from_secs(24 * 60 * 60),
            default_f8e_url: "https://api.staging.keybox.example",
            default_esplora_url: "https://mempool.space/signet/api",
        }
    }

    /// Get regtest parameters
    pub const fn regtest() -> Self {
        Self {
            network_type: NetworkType::Regtest,
            name: "regtest",
            coin_type: 1,
            dust_threshold_sats: DUST_THRESHOLD_SATS,
            default_recovery_delay: Duration::from_secs(20),
            default_f8e_url: "http://127.0.0.1:8080",
            default_esplora_url: "http://127.0.0.1:3002",
        }
    }

    /// Get network by type
    pub const fn from_type(network_type: NetworkType) -> Self {
        match network_type {
            NetworkType::Bitcoin => Self::bitcoin(),
            NetworkType::Testnet => Self::testnet(),
            NetworkType::Signet => Self::signet(),
            NetworkType::Regtest => Self::regtest(),
        }
    }

    /// Whether a balance is below the dust threshold
    pub const fn is_dust(&self, amount_sats: u64) -> bool {
        amount_sats < self.dust_threshold_sats
    }

    /// Matching `bitcoin` crate network
    pub const fn bitcoin_network(&self) -> bitcoin::Network {
        self.network_type.bitcoin_network()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mainnet_params() {
        let net = Network::bitcoin();
        assert_eq!(net.network_type, NetworkType::Bitcoin);
        assert_eq!(net.coin_type, 0);
        assert_eq!(net.default_recovery_delay, Duration::from_secs(604_800));
        assert_eq!(net.bitcoin_network(), bitcoin::Network::Bitcoin);
    }

    #[test]
    fn test_network_from_type() {
        let net = Network::from_type(NetworkType::Signet);
        assert_eq!(net.network_type, NetworkType::Signet);
        assert_eq!(net.bitcoin_network(), bitcoin::Network::Signet);
    }

    #[test]
    fn test_dust_boundary() {
        let net = Network::regtest();
        assert!(net.is_dust(200));
        assert!(net.is_dust(DUST_THRESHOLD_SATS - 1));
        assert!(!net.is_dust(DUST_THRESHOLD_SATS));
        assert!(!net.is_dust(20_000));
    }

    #[test]
    fn test_parse_network_type() {
        assert_eq!("mainnet".parse::<NetworkType>().unwrap(), NetworkType::Bitcoin);
        assert_eq!(" Signet ".parse::<NetworkType>().unwrap(), NetworkType::Signet);
        assert!("litecoin".parse::<NetworkType>().is_err());
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&NetworkType::Regtest).unwrap();
        assert_eq!(json, "\"regtest\"");
        let parsed: NetworkType = serde_json::from_str("\"testnet\"").unwrap();
        assert_eq!(parsed, NetworkType::Testnet);
    }
}
