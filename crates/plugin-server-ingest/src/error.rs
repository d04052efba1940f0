//! Error types for the ingestion worker.

use crate::store::PersistenceError;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the ingestion pipeline.
///
/// Per-message failures (decode, validation, plugin faults, exhausted
/// persistence retries) are handled inside the worker and never surface
/// here; these are the errors that stop a worker.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Plugin configuration document could not be loaded.
    #[error("Plugin config error: {0}")]
    PluginConfig(String),

    /// Property definition store error.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// Downstream sink or dead-letter write failed.
    #[error("Sink error: {0}")]
    Sink(String),

    /// A worker task panicked or was cancelled.
    #[error("Worker {worker} failed: {reason}")]
    WorkerFailed {
        /// Worker index.
        worker: usize,
        /// Panic message or cancellation reason.
        reason: String,
    },
}
