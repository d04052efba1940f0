//! Prometheus metrics helpers for the plugin server.
//!
//! # Usage
//!
//! ```rust,ignore
//! use plugin_server_core::metrics::{init_metrics, metrics_router};
//!
//! let handle = init_metrics();
//! let app = metrics_router(handle); // serves GET /metrics
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component (`ingest_`, `plugin_`, `propdefs_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: low-cardinality only (`reason`, `result`, `plugin`)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const EVENTS_RECEIVED: &str = "ingest_events_received_total";
pub const EVENTS_DEAD_LETTERED: &str = "ingest_events_dead_lettered_total";
pub const EVENTS_DROPPED: &str = "ingest_events_dropped_total";
pub const EVENTS_FORWARDED: &str = "ingest_events_forwarded_total";
pub const WORKERS_RUNNING: &str = "ingest_workers_running";
pub const WORKER_RESTARTS: &str = "ingest_worker_restarts_total";
pub const PLUGIN_INVOCATIONS: &str = "plugin_invocations_total";
pub const PLUGIN_DURATION: &str = "plugin_invocation_duration_seconds";
pub const PROPDEFS_UPSERT_ATTEMPT: &str = "propdefs_upsert_attempt";
pub const PROPDEFS_CAS_CONFLICTS: &str = "propdefs_cas_conflicts_total";

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if a recorder is already installed.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_metrics();
    Some(handle)
}

/// Router serving the `/metrics` endpoint from `handle`.
pub fn metrics_router<S>(handle: PrometheusHandle) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    )
}

fn register_metrics() {
    // Intake
    describe_counter!(EVENTS_RECEIVED, "Raw messages pulled from the queue");
    describe_counter!(
        EVENTS_DEAD_LETTERED,
        "Messages routed to the dead-letter topic (label: reason)"
    );
    describe_counter!(EVENTS_DROPPED, "Events dropped by a plugin");
    describe_counter!(EVENTS_FORWARDED, "Events written to the downstream sink");
    describe_gauge!(WORKERS_RUNNING, "Number of ingestion workers running");
    describe_counter!(WORKER_RESTARTS, "Worker pool restarts after a crash");

    // Plugins
    describe_counter!(
        PLUGIN_INVOCATIONS,
        "Plugin invocations (labels: plugin, result)"
    );
    describe_histogram!(PLUGIN_DURATION, "Time spent inside a single plugin call");

    // Property definitions
    describe_counter!(
        PROPDEFS_UPSERT_ATTEMPT,
        "Property filter upsert attempts (label: result)"
    );
    describe_counter!(
        PROPDEFS_CAS_CONFLICTS,
        "Compare-and-swap conflicts while merging property filters"
    );
}

/// Increment a counter by `count`.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Set a gauge value.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}
