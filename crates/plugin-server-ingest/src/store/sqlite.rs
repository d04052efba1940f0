//! SQLite-backed property definition store.

use super::schema;
use super::{PersistenceError, PropertyDefinition, PropertyDefinitionStore};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use plugin_server_core::PropertyType;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;

/// Property definitions persisted in `posthog_team_eventpropfilter`.
///
/// Several processes may open the same database file; all writes go through
/// the uniqueness constraint (insert) or a `WHERE filter = ?` guard (update).
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                PersistenceError::Unavailable(format!(
                    "cannot create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        tracing::info!("Opening property definition store at {}", path.display());
        let conn = Connection::open(path)?;

        // WAL lets readers proceed while another process holds the write lock.
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )?;
        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_definition(row: &Row<'_>) -> rusqlite::Result<PropertyDefinition> {
        let prop_type: String = row.get(1)?;
        let created_at: String = row.get(3)?;
        let updated_at: String = row.get(4)?;
        Ok(PropertyDefinition {
            team_id: row.get(0)?,
            prop_type: prop_type
                .parse()
                .map_err(|e: String| conversion_error(1, e))?,
            filter: row.get(2)?,
            created_at: parse_ts(&created_at).map_err(|e| conversion_error(3, e))?,
            updated_at: parse_ts(&updated_at).map_err(|e| conversion_error(4, e))?,
        })
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{raw}': {e}"))
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

const SELECT_COLUMNS: &str =
    "SELECT team_id, prop_type, filter, created_at, updated_at FROM posthog_team_eventpropfilter";

impl PropertyDefinitionStore for SqliteStore {
    fn get(
        &self,
        team_id: i64,
        prop_type: PropertyType,
    ) -> Result<Option<PropertyDefinition>, PersistenceError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE team_id = ? AND prop_type = ?"),
                params![team_id, prop_type.as_str()],
                Self::row_to_definition,
            )
            .optional()?;
        Ok(row)
    }

    fn insert_if_absent(&self, definition: &PropertyDefinition) -> Result<bool, PersistenceError> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO posthog_team_eventpropfilter
                (team_id, prop_type, filter, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (team_id, prop_type) DO NOTHING",
            params![
                definition.team_id,
                definition.prop_type.as_str(),
                definition.filter,
                format_ts(definition.created_at),
                format_ts(definition.updated_at),
            ],
        )?;
        Ok(inserted == 1)
    }

    fn compare_and_swap(
        &self,
        team_id: i64,
        prop_type: PropertyType,
        expected: &[u8],
        filter: &[u8],
        updated_at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE posthog_team_eventpropfilter
             SET filter = ?, updated_at = ?
             WHERE team_id = ? AND prop_type = ? AND filter = ?",
            params![
                filter,
                format_ts(updated_at),
                team_id,
                prop_type.as_str(),
                expected
            ],
        )?;
        Ok(updated == 1)
    }

    fn list_for_team(&self, team_id: i64) -> Result<Vec<PropertyDefinition>, PersistenceError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE team_id = ?"))?;
        let mut rows = stmt
            .query_map(params![team_id], Self::row_to_definition)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.sort_by_key(|r| r.prop_type);
        Ok(rows)
    }
}
