//! In-memory property definition store, for tests and dry runs.

use super::{PersistenceError, PropertyDefinition, PropertyDefinitionStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use plugin_server_core::PropertyType;
use std::collections::BTreeMap;

/// Property definitions held in a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<(i64, PropertyType), PropertyDefinition>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

impl PropertyDefinitionStore for MemoryStore {
    fn get(
        &self,
        team_id: i64,
        prop_type: PropertyType,
    ) -> Result<Option<PropertyDefinition>, PersistenceError> {
        Ok(self.rows.lock().get(&(team_id, prop_type)).cloned())
    }

    fn insert_if_absent(&self, definition: &PropertyDefinition) -> Result<bool, PersistenceError> {
        let mut rows = self.rows.lock();
        let key = (definition.team_id, definition.prop_type);
        if rows.contains_key(&key) {
            return Ok(false);
        }
        rows.insert(key, definition.clone());
        Ok(true)
    }

    fn compare_and_swap(
        &self,
        team_id: i64,
        prop_type: PropertyType,
        expected: &[u8],
        filter: &[u8],
        updated_at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let mut rows = self.rows.lock();
        match rows.get_mut(&(team_id, prop_type)) {
            Some(row) if row.filter == expected => {
                row.filter = filter.to_vec();
                row.updated_at = updated_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn list_for_team(&self, team_id: i64) -> Result<Vec<PropertyDefinition>, PersistenceError> {
        Ok(self
            .rows
            .lock()
            .range((team_id, PropertyType::Event)..=(team_id, PropertyType::Session))
            .map(|(_, row)| row.clone())
            .collect())
    }
}
