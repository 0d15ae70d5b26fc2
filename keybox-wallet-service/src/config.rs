//! Service configuration
//!
//! Stored as JSON. Missing fields take network defaults, and a few
//! environment variables override the file:
//!
//! - `KEYBOX_NETWORK`: bitcoin, testnet, signet or regtest
//! - `KEYBOX_F8E_URL`: remote authority base URL
//! - `KEYBOX_ESPLORA_URL`: Esplora base URL
//! - `KEYBOX_DATA_DIR`: directory holding the wallet database

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use keybox_chain::{EsploraConfig, DEFAULT_GAP_LIMIT};
use keybox_core::fees::FeePriority;
use keybox_core::{Error, Result, RetryConfig};
use keybox_f8e::F8eConfig;
use keybox_params::{Network, NetworkType};
use serde::{Deserialize, Serialize};

/// Wallet service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Bitcoin network
    pub network: NetworkType,
    /// Directory holding the database and its salt
    pub data_dir: PathBuf,
    /// Remote authority
    pub f8e: F8eConfig,
    /// Chain data source
    pub esplora: EsploraConfig,
    /// Retry policy for remote authority calls
    #[serde(default)]
    pub retry: RetryConfig,
    /// Fee policy for sweeps
    #[serde(default)]
    pub fee_priority: FeePriority,
    /// Address gap limit when scanning keysets
    #[serde(default = "default_gap_limit")]
    pub gap_limit: u32,
    /// Foreground refresh interval in seconds
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

fn default_gap_limit() -> u32 {
    DEFAULT_GAP_LIMIT
}

fn default_refresh_interval() -> u64 {
    60
}

/// Platform data directory, or the working directory when none exists
pub fn default_data_dir() -> PathBuf {
    ProjectDirs::from("com", "Keybox", "KeyboxWallet")
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

impl ServiceConfig {
    /// Defaults for a network
    pub fn for_network(network_type: NetworkType) -> Self {
        let network = Network::from_type(network_type);
        Self {
            network: network_type,
            data_dir: default_data_dir().join(network.name),
            f8e: F8eConfig::for_network(&network),
            esplora: EsploraConfig::for_network(&network),
            retry: RetryConfig::default(),
            fee_priority: FeePriority::default(),
            gap_limit: default_gap_limit(),
            refresh_interval_secs: default_refresh_interval(),
        }
    }

    /// Read `path` if it exists, otherwise mainnet defaults; then apply
    /// environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                let config: ServiceConfig = serde_json::from_str(&raw)?;
                tracing::debug!("Loaded config from {}", path.display());
                config
            }
            _ => Self::for_network(NetworkType::Bitcoin),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Write the config as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Apply overrides from `lookup` (the process environment in
    /// [`ServiceConfig::load`]).
    ///
    /// Changing the network resets endpoints and data directory to that
    /// network's defaults before explicit URL overrides apply.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(network) = lookup("KEYBOX_NETWORK") {
            let network_type: NetworkType = network
                .parse()
                .map_err(|e: keybox_params::Error| Error::Other(e.to_string()))?;
            if network_type != self.network {
                let defaults = Self::for_network(network_type);
                self.network = network_type;
                self.data_dir = defaults.data_dir;
                self.f8e.base_url = defaults.f8e.base_url;
                self.esplora.base_url = defaults.esplora.base_url;
            }
        }
        if let Some(url) = lookup("KEYBOX_F8E_URL") {
            self.f8e.base_url = url;
        }
        if let Some(url) = lookup("KEYBOX_ESPLORA_URL") {
            self.esplora.base_url = url;
        }
        if let Some(dir) = lookup("KEYBOX_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Network parameters
    pub fn network_params(&self) -> Network {
        Network::from_type(self.network)
    }

    /// Wallet database path
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("keybox.db")
    }

    /// Foreground refresh interval
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}
