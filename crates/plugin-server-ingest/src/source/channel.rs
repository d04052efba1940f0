//! In-process channel queue.

use super::{EventQueue, RawMessage};
use crate::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

/// Queue backed by a bounded tokio channel.
///
/// The queue closes once every [`mpsc::Sender`] has been dropped and the
/// buffered messages are drained.
pub struct ChannelQueue {
    receiver: Mutex<mpsc::Receiver<RawMessage>>,
    requeued: parking_lot::Mutex<VecDeque<RawMessage>>,
}

impl ChannelQueue {
    /// Create a queue and the sender that feeds it.
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<RawMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                receiver: Mutex::new(rx),
                requeued: parking_lot::Mutex::new(VecDeque::new()),
            },
            tx,
        )
    }
}

#[async_trait]
impl EventQueue for ChannelQueue {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn recv_batch(&self, max: usize, timeout: Duration) -> Result<Option<Vec<RawMessage>>> {
        let mut rx = self.receiver.lock().await;

        let mut batch = {
            let mut requeued = self.requeued.lock();
            let take = requeued.len().min(max);
            requeued.drain(..take).collect::<Vec<_>>()
        };

        if batch.is_empty() {
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(message)) => batch.push(message),
                Ok(None) => return Ok(None),
                Err(_) => return Ok(Some(Vec::new())),
            }
        }

        while batch.len() < max {
            match rx.try_recv() {
                Ok(message) => batch.push(message),
                Err(_) => break,
            }
        }

        Ok(Some(batch))
    }

    async fn requeue(&self, messages: Vec<RawMessage>) -> Result<()> {
        let mut requeued = self.requeued.lock();
        for message in messages.into_iter().rev() {
            requeued.push_front(message);
        }
        Ok(())
    }
}
