//! In-memory chain for tests

use std::collections::HashMap;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{Address, Amount, FeeRate, OutPoint, ScriptBuf, Transaction, Txid};
use keybox_core::{Error, Result};
use parking_lot::Mutex;

use crate::source::{ChainSource, Utxo};

#[derive(Default)]
struct ChainState {
    tx_counts: HashMap<ScriptBuf, u64>,
    utxos: HashMap<ScriptBuf, Vec<Utxo>>,
    fee_rates: HashMap<u16, FeeRate>,
    default_fee_rate: Option<FeeRate>,
    broadcasts: Vec<Transaction>,
    next_txid: u64,
    address_queries: usize,
    transient_failures: u32,
}

/// In-memory chain source.
///
/// Broadcasting spends the referenced outputs, so a rescan after a sweep
/// sees the source keysets empty.
#[derive(Default)]
pub struct FakeChain {
    state: Mutex<ChainState>,
}

impl FakeChain {
    /// Empty chain with a 1 sat/vB fee estimate
    pub fn new() -> Self {
        Self::default()
    }

    fn add_output(&self, address: &Address, amount: Amount, confirmed: bool) -> OutPoint {
        let mut state = self.state.lock();
        state.next_txid += 1;
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&state.next_txid.to_le_bytes());
        let outpoint = OutPoint {
            txid: Txid::from_byte_array(bytes),
            vout: 0,
        };

        let script = address.script_pubkey();
        *state.tx_counts.entry(script.clone()).or_default() += 1;
        state.utxos.entry(script).or_default().push(Utxo {
            outpoint,
            amount,
            confirmed,
        });
        outpoint
    }

    /// Pay `amount` to `address` in a mined transaction
    pub fn fund(&self, address: &Address, amount: Amount) -> OutPoint {
        self.add_output(address, amount, true)
    }

    /// Pay `amount` to `address` in a mempool transaction
    pub fn fund_unconfirmed(&self, address: &Address, amount: Amount) -> OutPoint {
        self.add_output(address, amount, false)
    }

    /// Estimate returned for `target_blocks`
    pub fn set_fee_rate(&self, target_blocks: u16, rate: FeeRate) {
        self.state.lock().fee_rates.insert(target_blocks, rate);
    }

    /// Estimate returned for targets without an explicit rate
    pub fn set_default_fee_rate(&self, rate: FeeRate) {
        self.state.lock().default_fee_rate = Some(rate);
    }

    /// Fail the next `n` calls with a transient error
    pub fn fail_next(&self, n: u32) {
        self.state.lock().transient_failures = n;
    }

    /// Transactions broadcast so far
    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.state.lock().broadcasts.clone()
    }

    /// Number of address lookups served
    pub fn address_queries(&self) -> usize {
        self.state.lock().address_queries
    }
}

impl ChainState {
    fn take_transient_failure(&mut self) -> Result<()> {
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(Error::Network("esplora timed out".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainSource for FakeChain {
    async fn address_tx_count(&self, address: &Address) -> Result<u64> {
        let mut state = self.state.lock();
        state.take_transient_failure()?;
        state.address_queries += 1;
        Ok(state
            .tx_counts
            .get(&address.script_pubkey())
            .copied()
            .unwrap_or(0))
    }

    async fn list_unspent(&self, address: &Address) -> Result<Vec<Utxo>> {
        let mut state = self.state.lock();
        state.take_transient_failure()?;
        Ok(state
            .utxos
            .get(&address.script_pubkey())
            .cloned()
            .unwrap_or_default())
    }

    async fn fee_rate(&self, target_blocks: u16) -> Result<FeeRate> {
        let mut state = self.state.lock();
        state.take_transient_failure()?;
        Ok(state
            .fee_rates
            .get(&target_blocks)
            .copied()
            .or(state.default_fee_rate)
            .unwrap_or(FeeRate::from_sat_per_vb_unchecked(1)))
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        let mut state = self.state.lock();
        state.take_transient_failure()?;

        for input in &tx.input {
            let known = state
                .utxos
                .values()
                .any(|utxos| utxos.iter().any(|u| u.outpoint == input.previous_output));
            if !known {
                return Err(Error::BroadcastFailed(format!(
                    "missing or spent input {}",
                    input.previous_output
                )));
            }
        }
        for utxos in state.utxos.values_mut() {
            utxos.retain(|u| !tx.input.iter().any(|i| i.previous_output == u.outpoint));
        }
        let txid = tx.compute_txid();
        for (vout, output) in tx.output.iter().enumerate() {
            let script = output.script_pubkey.clone();
            *state.tx_counts.entry(script.clone()).or_default() += 1;
            state.utxos.entry(script).or_default().push(Utxo {
                outpoint: OutPoint {
                    txid,
                    vout: vout as u32,
                },
                amount: output.value,
                confirmed: false,
            });
        }

        state.broadcasts.push(tx.clone());
        Ok(txid)
    }
}
