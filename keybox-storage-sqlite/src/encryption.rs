//! Encryption key derivation

use argon2::{Argon2, ParamsBuilder, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

use crate::{Error, Result};

/// Argon2id parameters: m_cost (KiB), t_cost, p_cost
const ARGON2_PARAMS: (u32, u32, u32) = (65536, 3, 4);

/// Minimum salt length accepted for key derivation
pub const MIN_SALT_LEN: usize = 16;

/// Encryption key for database
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    /// Derive from passphrase using Argon2id + salt
    pub fn from_passphrase(passphrase: &str, salt: &[u8]) -> Result<Self> {
        let key = derive_key_bytes(passphrase, salt)?;
        Ok(Self(key))
    }

    /// Create from raw key bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Derive a 32-byte key with Argon2id (64 MiB, 3 iterations, 4 lanes)
pub fn derive_key_bytes(passphrase: &str, salt: &[u8]) -> Result<[u8; 32]> {
    if salt.len() < MIN_SALT_LEN {
        return Err(Error::Encryption("Salt too short".to_string()));
    }

    let params = ParamsBuilder::new()
        .m_cost(ARGON2_PARAMS.0)
        .t_cost(ARGON2_PARAMS.1)
        .p_cost(ARGON2_PARAMS.2)
        .output_len(32)
        .build()
        .map_err(|e| Error::Encryption(e.to_string()))?;

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut *key)
        .map_err(|e| Error::Encryption(e.to_string()))?;

    let mut out = [0u8; 32];
    out.copy_from_slice(&key[..]);
    Ok(out)
}

/// Generate a random 32-byte salt
pub fn generate_salt() -> [u8; 32] {
    let mut salt = [0u8; 32];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Load the salt stored next to a database, creating it on first use
pub fn load_or_create_salt(path: &std::path::Path) -> Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(salt) if salt.len() >= MIN_SALT_LEN => Ok(salt),
        Ok(_) => Err(Error::Encryption(format!(
            "Salt file {} is truncated",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let salt = generate_salt();
            std::fs::write(path, salt)
                .map_err(|e| Error::Encryption(format!("Failed to write salt: {}", e)))?;
            tracing::info!("Created database salt at {}", path.display());
            Ok(salt.to_vec())
        }
        Err(e) => Err(Error::Encryption(format!("Failed to read salt: {}", e))),
    }
}
