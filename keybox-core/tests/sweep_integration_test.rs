//! Integration tests for sweep construction
//!
//! Builds sweeps from keysets produced by a simulated rotation and checks the
//! resulting PSBTs against the destination keyset.

use bitcoin::{Amount, FeeRate, OutPoint, Txid};
use keybox_core::testing::test_keyset;
use keybox_core::{KeyChain, KeysetFunds, SpendableUtxo, SpendingKeyset, SweepGenerator};
use keybox_params::{Network, NetworkType};
use std::str::FromStr;

// Helper to create funded keysets
fn funded(keyset: &SpendingKeyset, outputs: &[(KeyChain, u32, u64)]) -> KeysetFunds {
    let utxos = outputs
        .iter()
        .enumerate()
        .map(|(n, (chain, index, sats))| SpendableUtxo {
            outpoint: OutPoint {
                txid: Txid::from_str(&format!("{:064x}", 1000 + n)).unwrap(),
                vout: 1,
            },
            amount: Amount::from_sat(*sats),
            chain: *chain,
            index: *index,
            script_pubkey: keyset.address(*chain, *index).unwrap().script_pubkey(),
            witness_script: keyset.witness_script(*chain, *index).unwrap(),
        })
        .collect();
    KeysetFunds {
        keyset: keyset.clone(),
        utxos,
        next_receive_index: 0,
    }
}

#[test]
fn test_sweep_after_hardware_rotation() {
    let old = test_keyset(60, NetworkType::Regtest);
    // Lost hardware: app and server keys survive, hardware key is replaced
    let mut new = old.clone();
    new.local_id = "rotated".to_string();
    new.hardware_key = keybox_core::testing::test_xpub(250);
    new.f8e_spending_keyset.keyset_id = "f8e-rotated".to_string();

    let destination = new.address(KeyChain::Receive, 0).unwrap();
    let generator = SweepGenerator::new(Network::regtest());
    let sweep = generator
        .generate(
            &[funded(&old, &[(KeyChain::Receive, 0, 30_000), (KeyChain::Change, 2, 20_000)])],
            &new,
            &destination,
            FeeRate::from_sat_per_kwu(1_000),
        )
        .unwrap()
        .expect("funds to sweep");

    assert_eq!(sweep.destination_keyset_id, "rotated");
    assert_eq!(sweep.psbts.len(), 1);
    let entry = &sweep.psbts[0];
    assert_eq!(entry.input_amount, Amount::from_sat(50_000));
    assert_eq!(entry.psbt.unsigned_tx.input.len(), 2);

    for (input, txin) in entry.psbt.inputs.iter().zip(&entry.psbt.unsigned_tx.input) {
        let witness_script = input.witness_script.as_ref().expect("witness script");
        let spk = &input.witness_utxo.as_ref().expect("witness utxo").script_pubkey;
        assert_eq!(
            &bitcoin::Address::p2wsh(witness_script, bitcoin::Network::Regtest).script_pubkey(),
            spk
        );
        assert!(txin.sequence.is_rbf());
    }
}

#[test]
fn test_old_keyset_addresses_differ_from_new() {
    let old = test_keyset(61, NetworkType::Regtest);
    let mut new = old.clone();
    new.app_key = keybox_core::testing::test_xpub(251);
    assert_ne!(
        old.address(KeyChain::Receive, 0).unwrap(),
        new.address(KeyChain::Receive, 0).unwrap()
    );
}
