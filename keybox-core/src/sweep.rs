//! Sweep construction
//!
//! After a key rotation every keyset other than the active one is stale. A
//! sweep moves each stale keyset's whole balance to the active keyset with
//! one unsigned PSBT per source keyset. Construction is a pure function of
//! the scanned funds, so an interrupted sweep is regenerated, never resumed.

use std::collections::HashSet;

use bitcoin::psbt::Psbt;
use bitcoin::transaction::Version;
use bitcoin::{
    absolute, Address, Amount, FeeRate, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Witness,
};
use keybox_params::Network;

use crate::fees::{FeeCalculator, P2WSH_OUTPUT_DUST_LIMIT};
use crate::keys::{KeyChain, SpendingKeyset};
use crate::{Error, Result};

/// An unspent output owned by a keyset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendableUtxo {
    /// Output being spent
    pub outpoint: OutPoint,
    /// Value
    pub amount: Amount,
    /// Chain the owning address is on
    pub chain: KeyChain,
    /// Address index on that chain
    pub index: u32,
    /// P2WSH script pubkey
    pub script_pubkey: ScriptBuf,
    /// Witness script committed to by `script_pubkey`
    pub witness_script: ScriptBuf,
}

/// A keyset with its scanned unspent outputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeysetFunds {
    /// Keyset that owns the outputs
    pub keyset: SpendingKeyset,
    /// Unspent outputs
    pub utxos: Vec<SpendableUtxo>,
    /// First receive index with no history
    pub next_receive_index: u32,
}

impl KeysetFunds {
    /// Sum of all outputs
    pub fn balance(&self) -> Amount {
        self.utxos.iter().map(|u| u.amount).sum()
    }
}

/// Unsigned transaction draining one stale keyset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepPsbt {
    /// Keyset the inputs belong to
    pub source_keyset_id: String,
    /// Unsigned PSBT with witness UTXOs and witness scripts
    pub psbt: Psbt,
    /// Sum of inputs
    pub input_amount: Amount,
    /// Fee paid
    pub fee: Amount,
    /// Amount arriving at the destination
    pub output_amount: Amount,
}

/// A set of sweep transactions toward the active keyset.
///
/// Never persisted. Entries are ordered by source keyset id and no source
/// appears twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sweep {
    /// Local id of the keyset receiving the funds
    pub destination_keyset_id: String,
    /// Receiving address
    pub destination: Address,
    /// One PSBT per stale keyset
    pub psbts: Vec<SweepPsbt>,
}

impl Sweep {
    /// Total fees across all transactions
    pub fn total_fee(&self) -> Amount {
        self.psbts.iter().map(|p| p.fee).sum()
    }

    /// Total amount arriving at the destination
    pub fn total_swept(&self) -> Amount {
        self.psbts.iter().map(|p| p.output_amount).sum()
    }

    /// Whether this sweep still targets `active`
    pub fn targets(&self, active: &SpendingKeyset) -> bool {
        self.destination_keyset_id == active.local_id
    }
}

/// Builds sweeps from scanned keyset funds
#[derive(Debug, Clone)]
pub struct SweepGenerator {
    network: Network,
    fee_calculator: FeeCalculator,
}

impl SweepGenerator {
    /// Create a generator for a network
    pub fn new(network: Network) -> Self {
        Self {
            network,
            fee_calculator: FeeCalculator::new(),
        }
    }

    /// Build a sweep of every stale candidate into `destination`.
    ///
    /// Returns `None` when nothing is worth sweeping. The active keyset,
    /// empty keysets, balances below the dust threshold and balances that
    /// cannot pay their own fee are skipped.
    pub fn generate(
        &self,
        candidates: &[KeysetFunds],
        active: &SpendingKeyset,
        destination: &Address,
        fee_rate: FeeRate,
    ) -> Result<Option<Sweep>> {
        let mut sorted: Vec<&KeysetFunds> = candidates.iter().collect();
        sorted.sort_by(|a, b| a.keyset.local_id.cmp(&b.keyset.local_id));

        // One PSBT per server keyset, however many copies were listed
        let mut seen = HashSet::new();
        let sources: Vec<&KeysetFunds> = sorted
            .into_iter()
            .filter(|funds| !funds.keyset.same_keys(active))
            .filter(|funds| seen.insert(funds.keyset.f8e_spending_keyset.keyset_id.as_str()))
            .collect();

        let mut psbts = Vec::new();
        for funds in sources {
            if let Some(psbt) = self.sweep_keyset(funds, destination, fee_rate)? {
                psbts.push(psbt);
            }
        }

        if psbts.is_empty() {
            return Ok(None);
        }

        let sweep = Sweep {
            destination_keyset_id: active.local_id.clone(),
            destination: destination.clone(),
            psbts,
        };
        tracing::info!(
            "Prepared sweep of {} keysets: {} sats, fee {} sats",
            sweep.psbts.len(),
            sweep.total_swept().to_sat(),
            sweep.total_fee().to_sat()
        );
        Ok(Some(sweep))
    }

    fn sweep_keyset(
        &self,
        funds: &KeysetFunds,
        destination: &Address,
        fee_rate: FeeRate,
    ) -> Result<Option<SweepPsbt>> {
        let keyset_id = &funds.keyset.local_id;
        if funds.utxos.is_empty() {
            return Ok(None);
        }

        let balance = funds.balance();
        if self.network.is_dust(balance.to_sat()) {
            tracing::debug!(
                "Skipping keyset {}: balance {} sats is dust",
                keyset_id,
                balance.to_sat()
            );
            return Ok(None);
        }

        let fee = self
            .fee_calculator
            .calculate_sweep_fee(funds.utxos.len(), fee_rate)?;
        let output = balance.to_sat().saturating_sub(fee);
        if output < P2WSH_OUTPUT_DUST_LIMIT {
            tracing::debug!(
                "Skipping keyset {}: {} sats cannot cover fee {}",
                keyset_id,
                balance.to_sat(),
                fee
            );
            return Ok(None);
        }

        let mut utxos = funds.utxos.clone();
        utxos.sort_by(|a, b| a.outpoint.cmp(&b.outpoint));

        let tx = Transaction {
            version: Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: utxos
                .iter()
                .map(|utxo| TxIn {
                    previous_output: utxo.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::default(),
                })
                .collect(),
            output: vec![TxOut {
                value: Amount::from_sat(output),
                script_pubkey: destination.script_pubkey(),
            }],
        };

        let mut psbt =
            Psbt::from_unsigned_tx(tx).map_err(|e| Error::TransactionBuild(e.to_string()))?;
        for (input, utxo) in psbt.inputs.iter_mut().zip(&utxos) {
            input.witness_utxo = Some(TxOut {
                value: utxo.amount,
                script_pubkey: utxo.script_pubkey.clone(),
            });
            input.witness_script = Some(utxo.witness_script.clone());
        }

        Ok(Some(SweepPsbt {
            source_keyset_id: keyset_id.clone(),
            psbt,
            input_amount: balance,
            fee: Amount::from_sat(fee),
            output_amount: Amount::from_sat(output),
        }))
    }
}
