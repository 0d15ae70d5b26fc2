//! Blockchain boundary for the Keybox wallet
//!
//! A [`ChainSource`] answers the few questions sweeping needs: has an address
//! been used, what does it hold, what fee should we pay, and broadcast this.
//! [`EsploraClient`] implements it over HTTP; [`KeysetScanner`] walks a
//! keyset's address chains up to a gap limit to collect its spendable funds.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod esplora;
pub mod scanner;
pub mod source;

#[cfg(any(test, feature = "test-helpers"))]
pub mod fake;

pub use esplora::{EsploraClient, EsploraConfig};
pub use scanner::{KeysetScanner, DEFAULT_GAP_LIMIT};
pub use source::{ChainSource, Utxo};

#[cfg(any(test, feature = "test-helpers"))]
pub use fake::FakeChain;
