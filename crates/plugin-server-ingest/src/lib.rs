//! Plugin server ingestion pipeline components.
//!
//! This crate consumes raw analytics events from a queue, runs each team's
//! plugin chain over them, records which properties each team has seen and
//! forwards the result downstream.
//!
//! # Modules
//!
//! - [`source`] - Upstream queue adapters (spool files, in-process channel)
//! - [`plugins`] - Plugin trait, registry, built-ins and per-team config
//! - [`pipeline`] - Plugin executor, property resolver, sinks
//! - [`store`] - Property definition storage (SQLite, memory)
//! - [`worker`] - Worker loop and pool
//! - [`supervisor`] - Restart loop around the pool
//! - [`health`] - Liveness registry and endpoints
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   EventQueue    │  spool files under <host>/<topic>/
//! └────────┬────────┘
//!          │  batches
//!          ▼
//! ┌─────────────────┐
//! │  decode_event   │──── decode / validation ────┐
//! └────────┬────────┘                             │
//!          ▼                                      │
//! ┌─────────────────┐                             │
//! │ PluginExecutor  │  per-team chain, isolated   │
//! └────────┬────────┘                             │
//!          ▼                                      ▼
//! ┌─────────────────┐                    ┌─────────────────┐
//! │PropertyResolver │─── persistence ───▶│ DeadLetterSink  │
//! └────────┬────────┘                    └─────────────────┘
//!          ▼
//! ┌─────────────────┐
//! │    EventSink    │  producer topic
//! └─────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod health;
pub mod pipeline;
pub mod plugins;
pub mod source;
pub mod store;
pub mod supervisor;
pub mod worker;

// Re-export commonly used types at crate root
pub use config::Config;
pub use error::{Error, Result};

pub use pipeline::{
    ChainOutcome, ChainResult, DeadLetter, DeadLetterReason, DeadLetterSink, EventSink,
    PluginExecutor, PropertyResolver, ResolveReport, RetryPolicy, TopicWriter, UpsertOutcome,
};
pub use plugins::{
    Plugin, PluginConfig, PluginConfigHandle, PluginConfigSnapshot, PluginRegistry,
};
pub use source::{ChannelQueue, EventQueue, RawMessage, SpoolQueue};
pub use store::{MemoryStore, PersistenceError, PropertyDefinitionStore, SqliteStore};
pub use supervisor::{RestartPolicy, supervise};
pub use worker::{WorkerContext, WorkerStats, run_pool};
