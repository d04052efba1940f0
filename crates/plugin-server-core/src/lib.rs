//! Core types for the plugin server ingestion pipeline.
//!
//! This crate provides:
//! - The [`Event`] model and envelope decoding/validation
//! - Property classification into event/person/group/session namespaces
//! - [`PropertyFilter`], the mergeable filter persisted per team and type
//! - Prometheus metrics helpers

mod error;
mod event;
pub mod filter;
pub mod metrics;
mod property;

pub use error::{FilterCodecError, IntakeError, Result};
pub use event::{Event, TeamLookup, decode_event, parse_timestamp};
pub use filter::{FilterKey, MAX_FILTER_ENTRIES, PropertyFilter, ValueKinds};
pub use property::{PropertyType, observe_event};
