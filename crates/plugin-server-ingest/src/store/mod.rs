//! Durable storage for property definition filters.
//!
//! One row per `(team_id, prop_type)`; the `filter` column holds an encoded
//! [`PropertyFilter`]. Stores expose only two write primitives,
//! insert-if-absent and compare-and-swap on the filter bytes, so concurrent
//! writers never need row locks: a writer that loses a race re-reads and
//! re-merges.

mod memory;
mod schema;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use plugin_server_core::{FilterCodecError, PropertyFilter, PropertyType};
use thiserror::Error;

/// Errors from the property definition store.
#[derive(Error, Debug, Clone)]
pub enum PersistenceError {
    /// The backing database rejected or failed the operation.
    #[error("database error: {0}")]
    Database(String),

    /// The store cannot be reached at all.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Too many compare-and-swap conflicts in a row.
    #[error("gave up after {attempts} conflicting updates for team {team_id} ({prop_type})")]
    Contention {
        team_id: i64,
        prop_type: PropertyType,
        attempts: usize,
    },

    /// A persisted filter could not be decoded.
    #[error("corrupt filter for team {team_id} ({prop_type}): {source}")]
    CorruptFilter {
        team_id: i64,
        prop_type: PropertyType,
        #[source]
        source: FilterCodecError,
    },
}

impl PersistenceError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::CorruptFilter { .. })
    }
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::CannotOpen | rusqlite::ErrorCode::DatabaseBusy
                ) =>
            {
                Self::Unavailable(err.to_string())
            }
            _ => Self::Database(err.to_string()),
        }
    }
}

/// A row of `posthog_team_eventpropfilter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDefinition {
    pub team_id: i64,
    pub prop_type: PropertyType,
    pub filter: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PropertyDefinition {
    /// A freshly created definition with both timestamps set to `now`.
    pub fn new(
        team_id: i64,
        prop_type: PropertyType,
        filter: &PropertyFilter,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            team_id,
            prop_type,
            filter: filter.encode(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Decode the stored filter payload.
    pub fn decoded_filter(&self) -> Result<PropertyFilter, PersistenceError> {
        PropertyFilter::decode(&self.filter).map_err(|source| PersistenceError::CorruptFilter {
            team_id: self.team_id,
            prop_type: self.prop_type,
            source,
        })
    }
}

/// Storage backend for property definitions.
///
/// Implementations must be safe to share across workers.
pub trait PropertyDefinitionStore: Send + Sync {
    /// Fetch the definition for `(team_id, prop_type)`, if any.
    fn get(
        &self,
        team_id: i64,
        prop_type: PropertyType,
    ) -> Result<Option<PropertyDefinition>, PersistenceError>;

    /// Insert `definition` unless a row with the same key exists.
    ///
    /// Returns `false` if another writer created the row first.
    fn insert_if_absent(&self, definition: &PropertyDefinition) -> Result<bool, PersistenceError>;

    /// Replace the filter only if it still equals `expected`.
    ///
    /// Returns `false` on conflict (the row changed or disappeared).
    fn compare_and_swap(
        &self,
        team_id: i64,
        prop_type: PropertyType,
        expected: &[u8],
        filter: &[u8],
        updated_at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError>;

    /// All definitions for a team, ordered by property type.
    fn list_for_team(&self, team_id: i64) -> Result<Vec<PropertyDefinition>, PersistenceError>;
}
