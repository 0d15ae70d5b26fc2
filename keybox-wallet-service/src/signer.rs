//! Signing collaborator
//!
//! The wallet service never holds private keys. Sweep PSBTs are handed to a
//! [`PsbtSigner`] (app key plus hardware device, or app key plus server
//! co-signature) which returns a fully signed transaction.

use async_trait::async_trait;
use bitcoin::psbt::Psbt;
use bitcoin::Transaction;
use keybox_core::{Error, Result};

/// Produces a finalized transaction from an unsigned PSBT
#[async_trait]
pub trait PsbtSigner: Send + Sync {
    /// Collect two signatures for every input and finalize
    async fn sign_psbt(&self, psbt: &Psbt) -> Result<Transaction>;
}

/// Check that a signed transaction spends exactly what the PSBT describes
pub fn verify_signed(psbt: &Psbt, tx: &Transaction) -> Result<()> {
    if tx.compute_txid() != psbt.unsigned_tx.compute_txid() {
        return Err(Error::TransactionSigning(format!(
            "signer returned {} for PSBT {}",
            tx.compute_txid(),
            psbt.unsigned_tx.compute_txid()
        )));
    }
    if tx.input.iter().any(|input| input.witness.is_empty()) {
        return Err(Error::TransactionSigning(
            "signed transaction has inputs without witness".to_string(),
        ));
    }
    Ok(())
}

#[cfg(any(test, feature = "test-helpers"))]
pub use fake::FakeSigner;

#[cfg(any(test, feature = "test-helpers"))]
mod fake {
    use super::*;
    use bitcoin::Witness;
    use parking_lot::Mutex;

    /// Signer that attaches placeholder witnesses and records what it signed
    #[derive(Default)]
    pub struct FakeSigner {
        signed: Mutex<Vec<Psbt>>,
    }

    impl FakeSigner {
        /// New signer
        pub fn new() -> Self {
            Self::default()
        }

        /// PSBTs signed so far
        pub fn signed(&self) -> Vec<Psbt> {
            self.signed.lock().clone()
        }
    }

    #[async_trait]
    impl PsbtSigner for FakeSigner {
        async fn sign_psbt(&self, psbt: &Psbt) -> Result<Transaction> {
            self.signed.lock().push(psbt.clone());
            let mut tx = psbt.unsigned_tx.clone();
            for (input, psbt_input) in tx.input.iter_mut().zip(&psbt.inputs) {
                let script = psbt_input.witness_script.clone().ok_or_else(|| {
                    Error::TransactionSigning("input without witness script".to_string())
                })?;
                input.witness = Witness::from_slice(&[
                    Vec::new(),
                    vec![0x30u8; 71],
                    vec![0x30u8; 71],
                    script.to_bytes(),
                ]);
            }
            Ok(tx)
        }
    }
}
