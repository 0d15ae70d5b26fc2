//! Database connection and initialization

use crate::{encryption::EncryptionKey, migrations, Error, Result};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;

/// Database connection wrapper
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open database with encryption
    pub fn open<P: AsRef<Path>>(path: P, key: &EncryptionKey) -> Result<Self> {
        let db_exists = path.as_ref().exists();
        let path_buf = path.as_ref().to_path_buf();

        let conn = Connection::open_with_flags(
            &path_buf,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        // PRAGMA key must be the first statement on the connection, otherwise
        // SQLCipher creates the file unencrypted.
        apply_key(&conn, key)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let cipher_version: std::result::Result<String, rusqlite::Error> =
            conn.query_row("PRAGMA cipher_version", [], |row| row.get(0));
        match cipher_version {
            Ok(version) if !version.is_empty() => {
                tracing::debug!("SQLCipher version: {}", version);
            }
            Ok(_) | Err(_) => {
                return Err(Error::Encryption(
                    "SQLCipher encryption verification failed. Database may not be encrypted."
                        .to_string(),
                ));
            }
        }

        if db_exists {
            let readable: std::result::Result<i64, rusqlite::Error> =
                conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get(0));
            if readable.is_err() {
                tracing::warn!("Database at {} could not be decrypted", path_buf.display());
                return Err(Error::Encryption(
                    "Cannot read encrypted database. It may have been created with a different passphrase."
                        .to_string(),
                ));
            }
        }

        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    /// Get connection
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Begin transaction
    pub fn transaction(&mut self) -> Result<rusqlite::Transaction<'_>> {
        Ok(self.conn.transaction()?)
    }
}

fn apply_key(conn: &Connection, key: &EncryptionKey) -> Result<()> {
    let key_hex = hex::encode(key.as_bytes());
    // PRAGMA statements may report rows; that is not a failure.
    if let Err(e) = conn.execute(&format!("PRAGMA key = \"x'{}'\";", key_hex), []) {
        if !matches!(e, rusqlite::Error::ExecuteReturnedResults) {
            return Err(Error::Encryption(format!(
                "Failed to set database encryption key: {}",
                e
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_open_database() {
        let file = NamedTempFile::new().unwrap();
        let key = EncryptionKey::from_bytes([1u8; 32]);
        assert!(Database::open(file.path(), &key).is_ok());
    }

    #[test]
    fn test_sqlcipher_verification() {
        let file = NamedTempFile::new().unwrap();
        let key = EncryptionKey::from_bytes([2u8; 32]);
        let db = Database::open(file.path(), &key).unwrap();
        let version: String = db
            .conn()
            .query_row("PRAGMA cipher_version", [], |row| row.get(0))
            .unwrap();
        assert!(!version.is_empty(), "SQLCipher version should be non-empty");
    }

    #[test]
    fn test_wrong_database_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keybox.db");
        let db = Database::open(&path, &EncryptionKey::from_bytes([3u8; 32])).unwrap();
        drop(db);

        let result = Database::open(&path, &EncryptionKey::from_bytes([4u8; 32]));
        assert!(result.is_err(), "Wrong key must not open the database");
    }
}
