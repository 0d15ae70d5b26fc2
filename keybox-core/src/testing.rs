//! Deterministic fixtures shared by unit and integration tests

use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::secp256k1::Secp256k1;
use keybox_params::NetworkType;

use crate::keys::{F8eSpendingKeyset, SpendingKeyset};

/// Extended public key derived from a 32-byte seed filled with `tag`
pub fn test_xpub(tag: u8) -> Xpub {
    let secp = Secp256k1::new();
    let seed = [tag; 32];
    let xpriv = Xpriv::new_master(bitcoin::Network::Regtest, &seed).expect("valid seed");
    Xpub::from_priv(&secp, &xpriv)
}

/// Keyset whose three keys are derived from `tag`
pub fn test_keyset(tag: u8, network_type: NetworkType) -> SpendingKeyset {
    let base = tag.wrapping_mul(3);
    SpendingKeyset {
        local_id: format!("keyset-{}", tag),
        network_type,
        app_key: test_xpub(base),
        hardware_key: test_xpub(base.wrapping_add(1)),
        f8e_spending_keyset: F8eSpendingKeyset {
            keyset_id: format!("f8e-keyset-{}", tag),
            spending_public_key: test_xpub(base.wrapping_add(2)),
        },
    }
}
