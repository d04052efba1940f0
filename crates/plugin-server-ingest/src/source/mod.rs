//! Upstream queue adapters.
//!
//! Workers pull raw messages in batches through the [`EventQueue`] trait and
//! never see how the queue is implemented.
//!
//! # Available Queues
//!
//! - [`SpoolQueue`] - JSONL files under `<host>/<topic>/`, one message per line
//! - [`ChannelQueue`] - in-process channel, for embedding and tests

mod channel;
mod spool;

pub use channel::ChannelQueue;
pub use spool::SpoolQueue;

use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

/// One undecoded message from the upstream queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Serialized event envelope.
    pub payload: Vec<u8>,

    /// Where the message came from (e.g. `file.jsonl:12`), for logs and
    /// dead letters.
    pub origin: String,
}

impl RawMessage {
    pub fn new(payload: impl Into<Vec<u8>>, origin: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            origin: origin.into(),
        }
    }
}

/// A queue of raw event messages shared by all workers.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Human-readable name for this queue (used in logs).
    fn name(&self) -> &'static str;

    /// Receive up to `max` messages, waiting at most `timeout` for the first.
    ///
    /// Returns `Ok(None)` once the queue is closed and drained, and
    /// `Ok(Some(vec![]))` when the wait timed out with nothing available.
    async fn recv_batch(&self, max: usize, timeout: Duration) -> Result<Option<Vec<RawMessage>>>;

    /// Hand back messages that were received but not processed.
    ///
    /// They are returned, in order, ahead of anything else by the next
    /// `recv_batch`, so a restarted worker picks them up again.
    async fn requeue(&self, messages: Vec<RawMessage>) -> Result<()>;
}
