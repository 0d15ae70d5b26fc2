//! Chain source trait

use async_trait::async_trait;
use bitcoin::{Address, Amount, FeeRate, OutPoint, Transaction, Txid};
use keybox_core::Result;

/// Unspent output paying an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    /// Outpoint
    pub outpoint: OutPoint,
    /// Value
    pub amount: Amount,
    /// Whether the funding transaction is mined
    pub confirmed: bool,
}

/// Watch-only view of the chain
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Number of transactions touching `address`, mined or in mempool
    async fn address_tx_count(&self, address: &Address) -> Result<u64>;

    /// Unspent outputs paying `address`
    async fn list_unspent(&self, address: &Address) -> Result<Vec<Utxo>>;

    /// Estimated fee rate to confirm within `target_blocks`
    async fn fee_rate(&self, target_blocks: u16) -> Result<FeeRate>;

    /// Broadcast a signed transaction
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid>;
}
