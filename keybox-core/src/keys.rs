//! Spending keys and 2-of-3 keysets
//!
//! A spending keyset binds one app key, one hardware key and one server (f8e)
//! key into a `wsh(sortedmulti(2, ...))` output descriptor. Keysets are
//! immutable: a recovery produces a new keyset, it never edits one in place.

use std::fmt;

use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::Builder;
use bitcoin::secp256k1::{Secp256k1, VerifyOnly};
use bitcoin::{Address, PublicKey, ScriptBuf};
use keybox_params::NetworkType;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

static SECP: Lazy<Secp256k1<VerifyOnly>> = Lazy::new(Secp256k1::verification_only);

/// Signatures required to spend
pub const REQUIRED_SIGNATURES: i64 = 2;

/// Account identifier assigned by the remote authority
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Wrap a server account id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as str
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One of the three signing factors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Factor {
    /// Mobile app key
    App,
    /// Hardware device key
    Hardware,
    /// Server (f8e) key
    Server,
}

impl fmt::Display for Factor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Factor::App => write!(f, "app"),
            Factor::Hardware => write!(f, "hardware"),
            Factor::Server => write!(f, "server"),
        }
    }
}

/// BIP-32 chain below each factor's account xpub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyChain {
    /// External (receive) addresses
    Receive,
    /// Internal (change) addresses
    Change,
}

impl KeyChain {
    /// Child index of the chain
    pub const fn index(&self) -> u32 {
        match self {
            KeyChain::Receive => 0,
            KeyChain::Change => 1,
        }
    }
}

/// Server half of a keyset, as registered with the remote authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct F8eSpendingKeyset {
    /// Server-side keyset identifier
    pub keyset_id: String,
    /// Server spending key
    pub spending_public_key: Xpub,
}

/// 2-of-3 spending keyset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendingKeyset {
    /// Locally generated identifier
    pub local_id: String,
    /// Network the keys belong to
    pub network_type: NetworkType,
    /// App spending key
    pub app_key: Xpub,
    /// Hardware spending key
    pub hardware_key: Xpub,
    /// Server spending keyset
    pub f8e_spending_keyset: F8eSpendingKeyset,
}

impl SpendingKeyset {
    /// Create a keyset with a fresh local id
    pub fn new(
        network_type: NetworkType,
        app_key: Xpub,
        hardware_key: Xpub,
        f8e_spending_keyset: F8eSpendingKeyset,
    ) -> Self {
        Self {
            local_id: uuid::Uuid::new_v4().to_string(),
            network_type,
            app_key,
            hardware_key,
            f8e_spending_keyset,
        }
    }

    /// Key held by a factor
    pub fn key_for(&self, factor: Factor) -> &Xpub {
        match factor {
            Factor::App => &self.app_key,
            Factor::Hardware => &self.hardware_key,
            Factor::Server => &self.f8e_spending_keyset.spending_public_key,
        }
    }

    /// All three keys with their factor
    pub fn public_keys(&self) -> [(Factor, &Xpub); 3] {
        [
            (Factor::App, &self.app_key),
            (Factor::Hardware, &self.hardware_key),
            (Factor::Server, &self.f8e_spending_keyset.spending_public_key),
        ]
    }

    /// Whether `key` is one of this keyset's keys.
    ///
    /// Compares key material only, so the same key presented with different
    /// BIP-32 metadata still matches.
    pub fn contains_key(&self, key: &Xpub) -> bool {
        self.public_keys()
            .iter()
            .any(|(_, k)| k.public_key == key.public_key)
    }

    /// Whether two keysets describe the same wallet
    pub fn same_keys(&self, other: &SpendingKeyset) -> bool {
        self.f8e_spending_keyset.keyset_id == other.f8e_spending_keyset.keyset_id
            || (self.app_key == other.app_key
                && self.hardware_key == other.hardware_key
                && self.f8e_spending_keyset.spending_public_key
                    == other.f8e_spending_keyset.spending_public_key)
    }

    /// Output descriptor for one chain
    pub fn descriptor(&self, chain: KeyChain) -> String {
        let c = chain.index();
        format!(
            "wsh(sortedmulti({},{}/{}/*,{}/{}/*,{}/{}/*))",
            REQUIRED_SIGNATURES,
            self.app_key,
            c,
            self.hardware_key,
            c,
            self.f8e_spending_keyset.spending_public_key,
            c
        )
    }

    /// Witness script for the address at `chain/index`
    pub fn witness_script(&self, chain: KeyChain, index: u32) -> Result<ScriptBuf> {
        let mut keys = Vec::with_capacity(3);
        for (_, xpub) in self.public_keys() {
            keys.push(derive_child(xpub, chain, index)?);
        }
        keys.sort_by(|a, b| a.inner.serialize().cmp(&b.inner.serialize()));

        let mut builder = Builder::new().push_int(REQUIRED_SIGNATURES);
        for key in &keys {
            builder = builder.push_key(key);
        }
        Ok(builder
            .push_int(keys.len() as i64)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script())
    }

    /// P2WSH address at `chain/index`
    pub fn address(&self, chain: KeyChain, index: u32) -> Result<Address> {
        let script = self.witness_script(chain, index)?;
        Ok(Address::p2wsh(&script, self.network_type.bitcoin_network()))
    }
}

fn derive_child(xpub: &Xpub, chain: KeyChain, index: u32) -> Result<PublicKey> {
    let path = [
        ChildNumber::from_normal_idx(chain.index())
            .map_err(|e| Error::KeyDerivation(e.to_string()))?,
        ChildNumber::from_normal_idx(index).map_err(|e| Error::KeyDerivation(e.to_string()))?,
    ];
    let child = xpub
        .derive_pub(&*SECP, &path)
        .map_err(|e| Error::KeyDerivation(e.to_string()))?;
    Ok(PublicKey::new(child.public_key))
}

/// An account's wallet: the account plus its active keyset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keybox {
    /// Server account
    pub account_id: AccountId,
    /// Network
    pub network_type: NetworkType,
    /// Keyset that receives and spends
    pub active_spending_keyset: SpendingKeyset,
}

impl Keybox {
    /// Create a keybox
    pub fn new(account_id: AccountId, active_spending_keyset: SpendingKeyset) -> Self {
        Self {
            account_id,
            network_type: active_spending_keyset.network_type,
            active_spending_keyset,
        }
    }
}
