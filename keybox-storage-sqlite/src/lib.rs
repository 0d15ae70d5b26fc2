//! Encrypted SQLite storage for the Keybox wallet
//!
//! Persists the per-account [`keybox_core::RecoveryState`] and every spending
//! keyset the account has used, in a SQLCipher database with WAL mode and
//! versioned migrations.
//!
//! ## Security Features
//!
//! - **Database Encryption**: SQLCipher page encryption keyed with a raw 256-bit key
//! - **Passphrase KDF**: Argon2id with 64 MiB memory, 3 iterations, 4 lanes
//! - **Salt**: random per database, stored beside it

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod busy;
pub mod database;
pub mod encryption;
pub mod error;
pub mod keysets;
pub mod migrations;
pub mod models;
pub mod recovery_state;

pub use busy::{BASE_BACKOFF_MS, MAX_BACKOFF_MS, MAX_BUSY_RETRIES};
pub use database::Database;
pub use encryption::{generate_salt, load_or_create_salt, EncryptionKey};
pub use error::{Error, Result};
pub use keysets::KeysetStorage;
pub use models::{KeysetStatus, StoredKeyset};
pub use recovery_state::RecoveryStateStorage;
