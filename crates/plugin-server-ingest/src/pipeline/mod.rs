//! Per-event processing stages shared by every worker.
//!
//! - [`PluginExecutor`] - runs a team's plugin chain with per-plugin isolation
//! - [`PropertyResolver`] - merges observed properties into stored filters
//! - [`EventSink`] / [`DeadLetterSink`] - downstream outputs
//!
//! # Architecture
//!
//! ```text
//! [RawMessage] → decode_event → [PluginExecutor] → [PropertyResolver] → [EventSink]
//!                     ↓                                    ↓
//!              [DeadLetterSink]                     [DeadLetterSink]
//!            (decode/validation)                      (persistence)
//! ```

mod executor;
mod resolver;
mod sink;

pub use executor::{ChainOutcome, ChainResult, PluginExecutor, PluginFailure};
pub use resolver::{
    DEFAULT_MAX_CAS_ATTEMPTS, PropertyResolver, ResolveReport, RetryPolicy, UpsertOutcome,
    resolve_with_retry,
};
pub use sink::{
    DeadLetter, DeadLetterReason, DeadLetterSink, EventSink, MemoryDeadLetters, MemorySink,
    TopicWriter,
};
