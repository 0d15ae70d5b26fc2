//! Database schema migrations

use crate::{Error, Result};
use rusqlite::Connection;

/// Schema steps in order; a database at version `n` has run the first `n`
const MIGRATIONS: &[(i32, &str, fn(&Connection) -> Result<()>)] = &[
    (1, "spending keysets", migrate_v1),
    (2, "recovery state", migrate_v2),
    (3, "single active keyset", migrate_v3),
];

/// Bring the schema up to the latest version
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current = schema_version(conn)?;
    let mut applied = current;

    for (version, name, migrate) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        migrate(conn)?;
        applied = *version;
        tracing::debug!("Applied migration v{} ({})", version, name);
    }

    if applied != current {
        set_schema_version(conn, applied)?;
        tracing::info!("Wallet schema migrated from v{} to v{}", current, applied);
    }
    Ok(())
}

/// Current schema version, 0 for a fresh database
pub fn schema_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version')",
        [],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(0);
    }
    let version: Option<i32> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(version.unwrap_or(0))
}

/// Single-row version table
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);
         DELETE FROM schema_version;",
    )?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS spending_keysets (
            local_id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            network TEXT NOT NULL,
            f8e_keyset_id TEXT NOT NULL,
            app_xpub TEXT NOT NULL,
            hardware_xpub TEXT NOT NULL,
            server_xpub TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('active', 'retired')),
            created_at TEXT NOT NULL,
            retired_at TEXT
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_spending_keysets_f8e
            ON spending_keysets(account_id, f8e_keyset_id);

        CREATE INDEX IF NOT EXISTS idx_spending_keysets_account
            ON spending_keysets(account_id);
        "#,
    )
    .map_err(|e| Error::Migration(e.to_string()))?;

    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS recovery_state (
            account_id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            action_id TEXT,
            state_json TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )
    .map_err(|e| Error::Migration(e.to_string()))?;

    Ok(())
}

/// At most one active keyset per account.
fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_spending_keysets_one_active
            ON spending_keysets(account_id) WHERE status = 'active';
        "#,
    )
    .map_err(|e| Error::Migration(e.to_string()))?;

    Ok(())
}
