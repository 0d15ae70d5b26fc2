//! Spending keyset storage
//!
//! Every keyset an account has ever used is kept. Exactly one is `active`;
//! the rest are `retired` and stay around as sweep candidates. Rotation swaps
//! the active keyset in a single transaction guarded by a compare-and-swap on
//! the previously active id.

use std::str::FromStr;

use bitcoin::bip32::Xpub;
use chrono::{DateTime, Utc};
use keybox_core::{AccountId, F8eSpendingKeyset, SpendingKeyset};
use keybox_params::NetworkType;
use rusqlite::{params, ErrorCode, OptionalExtension, Row};

use crate::busy::with_busy_retry;
use crate::models::{KeysetStatus, StoredKeyset};
use crate::{Database, Error, Result};

const KEYSET_COLUMNS: &str = "local_id, network, f8e_keyset_id, app_xpub, hardware_xpub, \
                              server_xpub, status, created_at";

/// Raw column values, parsed after the row closure returns
struct KeysetRow {
    local_id: String,
    network: String,
    f8e_keyset_id: String,
    app_xpub: String,
    hardware_xpub: String,
    server_xpub: String,
    status: String,
    created_at: String,
}

impl KeysetRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            local_id: row.get(0)?,
            network: row.get(1)?,
            f8e_keyset_id: row.get(2)?,
            app_xpub: row.get(3)?,
            hardware_xpub: row.get(4)?,
            server_xpub: row.get(5)?,
            status: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_stored(self) -> Result<StoredKeyset> {
        let network_type = NetworkType::from_str(&self.network)
            .map_err(|e| Error::Validation(format!("keyset {}: {}", self.local_id, e)))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| Error::Validation(format!("keyset {}: {}", self.local_id, e)))?
            .with_timezone(&Utc);

        Ok(StoredKeyset {
            status: self.status.parse()?,
            created_at,
            keyset: SpendingKeyset {
                app_key: parse_xpub(&self.local_id, &self.app_xpub)?,
                hardware_key: parse_xpub(&self.local_id, &self.hardware_xpub)?,
                f8e_spending_keyset: F8eSpendingKeyset {
                    keyset_id: self.f8e_keyset_id,
                    spending_public_key: parse_xpub(&self.local_id, &self.server_xpub)?,
                },
                local_id: self.local_id,
                network_type,
            },
        })
    }
}

fn parse_xpub(local_id: &str, value: &str) -> Result<Xpub> {
    Xpub::from_str(value).map_err(|e| Error::Validation(format!("keyset {}: {}", local_id, e)))
}

fn is_constraint_violation(err: &Error) -> bool {
    matches!(
        err,
        Error::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: ErrorCode::ConstraintViolation,
                ..
            },
            _
        ))
    )
}

/// Keyset storage operations
pub struct KeysetStorage<'a> {
    db: &'a Database,
}

impl<'a> KeysetStorage<'a> {
    /// Create new keyset storage
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Store a keyset.
    ///
    /// Fails with [`Error::Conflict`] when storing an active keyset for an
    /// account that already has one, or when the server keyset id is taken.
    pub fn insert_keyset(
        &self,
        account_id: &AccountId,
        keyset: &SpendingKeyset,
        status: KeysetStatus,
    ) -> Result<()> {
        let created_at = Utc::now().to_rfc3339();

        let result = with_busy_retry(|| {
            self.db.conn().execute(
                r#"
                INSERT INTO spending_keysets (
                    local_id, account_id, network, f8e_keyset_id,
                    app_xpub, hardware_xpub, server_xpub, status, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    keyset.local_id,
                    account_id.as_str(),
                    keyset.network_type.as_str(),
                    keyset.f8e_spending_keyset.keyset_id,
                    keyset.app_key.to_string(),
                    keyset.hardware_key.to_string(),
                    keyset.f8e_spending_keyset.spending_public_key.to_string(),
                    status.as_str(),
                    created_at,
                ],
            )?;
            Ok(())
        });

        match result {
            Err(ref e) if is_constraint_violation(e) => Err(Error::Conflict(format!(
                "keyset {} conflicts with a stored keyset for account {}",
                keyset.local_id, account_id
            ))),
            other => {
                if other.is_ok() {
                    tracing::debug!(
                        "Stored {} keyset {} for account {}",
                        status,
                        keyset.local_id,
                        account_id
                    );
                }
                other
            }
        }
    }

    /// All keysets of an account, oldest first
    pub fn list_keysets(&self, account_id: &AccountId) -> Result<Vec<StoredKeyset>> {
        let rows = with_busy_retry(|| {
            let mut stmt = self.db.conn().prepare(&format!(
                "SELECT {} FROM spending_keysets WHERE account_id = ?1 \
                 ORDER BY created_at ASC, local_id ASC",
                KEYSET_COLUMNS
            ))?;
            let rows = stmt
                .query_map([account_id.as_str()], KeysetRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        rows.into_iter().map(KeysetRow::into_stored).collect()
    }

    /// The account's active keyset
    pub fn active_keyset(&self, account_id: &AccountId) -> Result<Option<StoredKeyset>> {
        let row = with_busy_retry(|| {
            Ok(self
                .db
                .conn()
                .query_row(
                    &format!(
                        "SELECT {} FROM spending_keysets WHERE account_id = ?1 AND status = 'active'",
                        KEYSET_COLUMNS
                    ),
                    [account_id.as_str()],
                    KeysetRow::from_row,
                )
                .optional()?)
        })?;

        row.map(KeysetRow::into_stored).transpose()
    }

    /// Make `new_keyset` active and retire the current active keyset.
    ///
    /// `expected_active` is the local id the caller believes is active. If the
    /// stored active keyset differs, nothing is written and
    /// [`Error::Conflict`] is returned.
    pub fn commit_rotation(
        &self,
        account_id: &AccountId,
        expected_active: &str,
        new_keyset: &SpendingKeyset,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        let result = with_busy_retry(|| {
            let tx = self.db.conn().unchecked_transaction()?;

            let current: Option<String> = tx
                .query_row(
                    "SELECT local_id FROM spending_keysets WHERE account_id = ?1 AND status = 'active'",
                    [account_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;

            if current.as_deref() != Some(expected_active) {
                return Err(Error::Conflict(format!(
                    "active keyset is {:?}, expected {}",
                    current, expected_active
                )));
            }

            tx.execute(
                "UPDATE spending_keysets SET status = 'retired', retired_at = ?1 WHERE local_id = ?2",
                params![now, expected_active],
            )?;
            tx.execute(
                r#"
                INSERT INTO spending_keysets (
                    local_id, account_id, network, f8e_keyset_id,
                    app_xpub, hardware_xpub, server_xpub, status, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active', ?8)
                "#,
                params![
                    new_keyset.local_id,
                    account_id.as_str(),
                    new_keyset.network_type.as_str(),
                    new_keyset.f8e_spending_keyset.keyset_id,
                    new_keyset.app_key.to_string(),
                    new_keyset.hardware_key.to_string(),
                    new_keyset.f8e_spending_keyset.spending_public_key.to_string(),
                    now,
                ],
            )?;

            tx.commit()?;
            Ok(())
        });

        match result {
            Err(ref e) if is_constraint_violation(e) => Err(Error::Conflict(format!(
                "keyset {} is already stored",
                new_keyset.local_id
            ))),
            Ok(()) => {
                tracing::info!(
                    "Rotated account {} from keyset {} to {}",
                    account_id,
                    expected_active,
                    new_keyset.local_id
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
