//! Keybox network parameters and constants
//!
//! This crate provides network-specific constants for the 2-of-3 Bitcoin
//! wallet: the mapping onto `bitcoin::Network`, dust policy, the default
//! delay-and-notify window, and default remote endpoints.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod network;

pub use network::{Network, NetworkType, DUST_THRESHOLD_SATS};

/// Error types for parameter operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid network specified
    #[error("Invalid network: {0}")]
    InvalidNetwork(String),
}

/// Result type for parameter operations
pub type Result<T> = std::result::Result<T, Error>;
