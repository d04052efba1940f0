//! SQLite schema for the property definition filter table.
//!
//! The schema is an ordered list of migrations. The database records how
//! many have been applied in `PRAGMA user_version`, and opening a store
//! applies whatever is missing, each step in its own transaction.

use rusqlite::{Connection, Result};

/// Entry `i` upgrades a database from version `i` to `i + 1`.
const MIGRATIONS: &[&str] = &[
    // 1: filter table keyed by team and property type
    r#"
    CREATE TABLE IF NOT EXISTS posthog_team_eventpropfilter (
        team_id INTEGER NOT NULL,
        prop_type TEXT NOT NULL
            CHECK (prop_type IN ('event', 'person', 'group', 'session')),
        filter BLOB NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (team_id, prop_type)
    );
    "#,
];

/// Version a fully migrated database reports.
pub const SCHEMA_VERSION: i32 = MIGRATIONS.len() as i32;

/// Bring the database up to [`SCHEMA_VERSION`].
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current = schema_version(conn)?;
    if current > SCHEMA_VERSION {
        tracing::warn!(
            current,
            known = SCHEMA_VERSION,
            "Property store was written by a newer schema; leaving it as is"
        );
        return Ok(());
    }

    for (applied, sql) in MIGRATIONS.iter().enumerate().skip(current.max(0) as usize) {
        let version = applied as i32 + 1;
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        tracing::info!(version, "Applied property store migration");
    }

    Ok(())
}

fn schema_version(conn: &Connection) -> Result<i32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}
