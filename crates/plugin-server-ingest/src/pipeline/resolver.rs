//! Property definition resolution.
//!
//! Every event is classified into per-type filters which are merged into the
//! persisted `(team_id, prop_type)` rows. Writes use insert-if-absent and
//! compare-and-swap on the filter bytes; a writer that loses a race re-reads
//! and merges again. Merging is commutative and idempotent, so any
//! interleaving of workers ends in the same stored filter.

use crate::store::{PersistenceError, PropertyDefinition, PropertyDefinitionStore};
use chrono::{DateTime, Utc};
use plugin_server_core::metrics::{PROPDEFS_CAS_CONFLICTS, PROPDEFS_UPSERT_ATTEMPT};
use plugin_server_core::{Event, PropertyFilter, PropertyType, observe_event};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Default bound on compare-and-swap conflicts per row.
pub const DEFAULT_MAX_CAS_ATTEMPTS: usize = 16;

/// What happened to one `(team_id, prop_type)` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First observation; the row was inserted.
    Created,
    /// New keys or kinds were merged in.
    Updated,
    /// Nothing new; only `updated_at` moved.
    Touched,
}

/// Per-type outcomes for one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveReport {
    pub outcomes: BTreeMap<PropertyType, UpsertOutcome>,
}

impl ResolveReport {
    pub fn get(&self, prop_type: PropertyType) -> Option<UpsertOutcome> {
        self.outcomes.get(&prop_type).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// Merges event observations into the property definition store.
#[derive(Clone)]
pub struct PropertyResolver {
    store: Arc<dyn PropertyDefinitionStore>,
    max_cas_attempts: usize,
}

impl PropertyResolver {
    pub fn new(store: Arc<dyn PropertyDefinitionStore>) -> Self {
        Self {
            store,
            max_cas_attempts: DEFAULT_MAX_CAS_ATTEMPTS,
        }
    }

    pub fn with_max_cas_attempts(mut self, attempts: usize) -> Self {
        self.max_cas_attempts = attempts.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn PropertyDefinitionStore> {
        &self.store
    }

    /// Record every property of `event`.
    pub fn resolve(&self, event: &Event) -> Result<ResolveReport, PersistenceError> {
        let now = Utc::now();
        let mut report = ResolveReport::default();

        for (prop_type, observed) in observe_event(event) {
            let outcome = self.upsert(event.team_id, prop_type, &observed, now)?;
            report.outcomes.insert(prop_type, outcome);
        }

        Ok(report)
    }

    fn upsert(
        &self,
        team_id: i64,
        prop_type: PropertyType,
        observed: &PropertyFilter,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, PersistenceError> {
        for _ in 0..self.max_cas_attempts {
            match self.store.get(team_id, prop_type)? {
                None => {
                    let definition = PropertyDefinition::new(team_id, prop_type, observed, now);
                    if self.store.insert_if_absent(&definition)? {
                        return Ok(UpsertOutcome::Created);
                    }
                }
                Some(existing) => {
                    let merged = existing.decoded_filter()?.merge(observed).encode();
                    if self.store.compare_and_swap(
                        team_id,
                        prop_type,
                        &existing.filter,
                        &merged,
                        now.max(existing.updated_at),
                    )? {
                        return Ok(if merged == existing.filter {
                            UpsertOutcome::Touched
                        } else {
                            UpsertOutcome::Updated
                        });
                    }
                }
            }

            metrics::counter!(PROPDEFS_CAS_CONFLICTS).increment(1);
            tracing::debug!(team_id, prop_type = %prop_type, "Filter changed underneath us, retrying");
        }

        Err(PersistenceError::Contention {
            team_id,
            prop_type,
            attempts: self.max_cas_attempts,
        })
    }
}

/// Bounded linear backoff with jitter for store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_jitter: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::random_range(0..jitter_ms)
        };
        self.base_delay * attempt + Duration::from_millis(jitter)
    }
}

/// Resolve `event`, retrying retryable store failures per `policy`.
///
/// Store calls run on the blocking pool.
pub async fn resolve_with_retry(
    resolver: &PropertyResolver,
    event: &Event,
    policy: &RetryPolicy,
) -> Result<ResolveReport, PersistenceError> {
    let mut attempt = 1;
    loop {
        let task_resolver = resolver.clone();
        let task_event = event.clone();
        let result = tokio::task::spawn_blocking(move || task_resolver.resolve(&task_event))
            .await
            .unwrap_or_else(|e| Err(PersistenceError::Database(format!("resolver task failed: {e}"))));

        match result {
            Ok(report) => {
                metrics::counter!(PROPDEFS_UPSERT_ATTEMPT, "result" => "success").increment(1);
                return Ok(report);
            }
            Err(e) if !e.is_retryable() || attempt >= policy.max_attempts => {
                metrics::counter!(PROPDEFS_UPSERT_ATTEMPT, "result" => "failed").increment(1);
                tracing::error!(
                    team_id = event.team_id,
                    attempt,
                    "Failed to persist property definitions: {}",
                    e
                );
                return Err(e);
            }
            Err(e) => {
                metrics::counter!(PROPDEFS_UPSERT_ATTEMPT, "result" => "retry").increment(1);
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    team_id = event.team_id,
                    attempt,
                    "Retrying property definition upsert in {:?}: {}",
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
