//! Gap-limit scan of a keyset's address chains

use std::sync::Arc;

use keybox_core::{KeyChain, KeysetFunds, Result, SpendableUtxo, SpendingKeyset};
use tracing::debug;

use crate::source::ChainSource;

/// Consecutive unused addresses after which a chain is considered exhausted
pub const DEFAULT_GAP_LIMIT: u32 = 20;

/// Collects the spendable funds of a keyset
pub struct KeysetScanner {
    source: Arc<dyn ChainSource>,
    gap_limit: u32,
}

impl KeysetScanner {
    /// Scanner with the default gap limit
    pub fn new(source: Arc<dyn ChainSource>) -> Self {
        Self {
            source,
            gap_limit: DEFAULT_GAP_LIMIT,
        }
    }

    /// Override the gap limit
    pub fn with_gap_limit(mut self, gap_limit: u32) -> Self {
        self.gap_limit = gap_limit.max(1);
        self
    }

    /// Scan receive and change chains.
    ///
    /// Only confirmed outputs are returned. `next_receive_index` is one past
    /// the last used receive address.
    pub async fn scan(&self, keyset: &SpendingKeyset) -> Result<KeysetFunds> {
        let mut utxos = Vec::new();
        let mut next_receive_index = 0;

        for chain in [KeyChain::Receive, KeyChain::Change] {
            let mut index = 0u32;
            let mut unused_run = 0u32;

            while unused_run < self.gap_limit {
                let address = keyset.address(chain, index)?;
                let tx_count = self.source.address_tx_count(&address).await?;

                if tx_count == 0 {
                    unused_run += 1;
                } else {
                    unused_run = 0;
                    if chain == KeyChain::Receive {
                        next_receive_index = index + 1;
                    }

                    let witness_script = keyset.witness_script(chain, index)?;
                    for utxo in self.source.list_unspent(&address).await? {
                        if !utxo.confirmed {
                            debug!("Ignoring unconfirmed output {}", utxo.outpoint);
                            continue;
                        }
                        utxos.push(SpendableUtxo {
                            outpoint: utxo.outpoint,
                            amount: utxo.amount,
                            chain,
                            index,
                            script_pubkey: address.script_pubkey(),
                            witness_script: witness_script.clone(),
                        });
                    }
                }
                index += 1;
            }
        }

        let funds = KeysetFunds {
            keyset: keyset.clone(),
            utxos,
            next_receive_index,
        };
        debug!(
            "Scanned keyset {}: {} utxos, {} sats",
            keyset.local_id,
            funds.utxos.len(),
            funds.balance().to_sat()
        );
        Ok(funds)
    }
}
