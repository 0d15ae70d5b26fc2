//! Recovery state storage
//!
//! One row per account holding the JSON-encoded [`RecoveryState`]. The state
//! name and action id are duplicated into plain columns for inspection; the
//! JSON column is authoritative.

use keybox_core::{AccountId, RecoveryState};
use rusqlite::{params, OptionalExtension};

use crate::busy::with_busy_retry;
use crate::{Database, Result};

/// Recovery state storage operations with retry logic
pub struct RecoveryStateStorage<'a> {
    db: &'a Database,
}

impl<'a> RecoveryStateStorage<'a> {
    /// Create new recovery state storage
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Save the account's recovery state, replacing any previous one
    pub fn save_recovery_state(&self, account_id: &AccountId, state: &RecoveryState) -> Result<()> {
        let state_json = serde_json::to_string(state)?;
        let updated_at = chrono::Utc::now().to_rfc3339();

        with_busy_retry(|| {
            self.db.conn().execute(
                r#"
                INSERT INTO recovery_state (account_id, state, action_id, state_json, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(account_id) DO UPDATE SET
                    state = excluded.state,
                    action_id = excluded.action_id,
                    state_json = excluded.state_json,
                    updated_at = excluded.updated_at
                "#,
                params![
                    account_id.as_str(),
                    state.name(),
                    state.action_id(),
                    state_json,
                    updated_at
                ],
            )?;
            Ok(())
        })?;

        tracing::debug!(
            "Saved recovery state {} for account {}",
            state.name(),
            account_id
        );
        Ok(())
    }

    /// Load the account's recovery state; `NotStarted` when none is stored
    pub fn load_recovery_state(&self, account_id: &AccountId) -> Result<RecoveryState> {
        let json: Option<String> = with_busy_retry(|| {
            Ok(self
                .db
                .conn()
                .query_row(
                    "SELECT state_json FROM recovery_state WHERE account_id = ?1",
                    [account_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        match json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(RecoveryState::NotStarted),
        }
    }

    /// Forget the account's recovery state
    pub fn clear_recovery_state(&self, account_id: &AccountId) -> Result<()> {
        with_busy_retry(|| {
            self.db.conn().execute(
                "DELETE FROM recovery_state WHERE account_id = ?1",
                [account_id.as_str()],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::EncryptionKey;
    use chrono::{Duration, TimeZone, Utc};
    use keybox_core::{
        ActiveRecovery, AuthorizationStrategy, CancelledRecovery, Factor, LostFactor,
        PrivilegedActionInstance, PrivilegedActionType,
    };
    use tempfile::NamedTempFile;

    fn test_db() -> (NamedTempFile, Database) {
        let file = NamedTempFile::new().unwrap();
        let key = EncryptionKey::from_bytes([9u8; 32]);
        let db = Database::open(file.path(), &key).unwrap();
        (file, db)
    }

    fn in_progress() -> RecoveryState {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        RecoveryState::InProgress(ActiveRecovery {
            action: PrivilegedActionInstance {
                id: "action-1".to_string(),
                privileged_action_type: PrivilegedActionType::LostHardwareRecovery,
                authorization_strategy: AuthorizationStrategy::DelayAndNotify {
                    delay_start_time: start,
                    delay_end_time: start + Duration::days(7),
                    cancellation_token: "cancel-1".to_string(),
                    completion_token: "complete-1".to_string(),
                },
            },
            lost_factor: LostFactor::Hardware,
            new_factor_public_key: None,
            started_at: start,
        })
    }

    #[test]
    fn test_default_recovery_state() {
        let (_file, db) = test_db();
        let storage = RecoveryStateStorage::new(&db);

        let state = storage
            .load_recovery_state(&AccountId::new("acct"))
            .unwrap();
        assert_eq!(state, RecoveryState::NotStarted);
    }

    #[test]
    fn test_save_and_load_recovery_state() {
        let (_file, db) = test_db();
        let storage = RecoveryStateStorage::new(&db);
        let account = AccountId::new("acct");

        storage.save_recovery_state(&account, &in_progress()).unwrap();
        assert_eq!(storage.load_recovery_state(&account).unwrap(), in_progress());

        let cancelled = RecoveryState::Cancelled(CancelledRecovery {
            action_id: "action-1".to_string(),
            lost_factor: LostFactor::Hardware,
            cancelled_by: Some(Factor::App),
            cancelled_at: Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap(),
        });
        storage.save_recovery_state(&account, &cancelled).unwrap();
        assert_eq!(storage.load_recovery_state(&account).unwrap(), cancelled);

        let columns: (String, Option<String>) = db
            .conn()
            .query_row(
                "SELECT state, action_id FROM recovery_state WHERE account_id = 'acct'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(columns.0, cancelled.name());
        assert_eq!(columns.1.as_deref(), Some("action-1"));
    }

    #[test]
    fn test_clear_recovery_state() {
        let (_file, db) = test_db();
        let storage = RecoveryStateStorage::new(&db);
        let account = AccountId::new("acct");

        storage.save_recovery_state(&account, &in_progress()).unwrap();
        storage.clear_recovery_state(&account).unwrap();
        assert_eq!(
            storage.load_recovery_state(&account).unwrap(),
            RecoveryState::NotStarted
        );
    }
}
