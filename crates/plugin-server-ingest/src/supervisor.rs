//! In-process restart loop for the worker pool.

use crate::Result;
use crate::worker::WorkerStats;
use plugin_server_core::metrics::{WORKER_RESTARTS, increment};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Whether and how a crashed pool is restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// `false` runs the pool exactly once (`--no-restart-loop`).
    pub restart: bool,
    pub delay: Duration,
}

impl RestartPolicy {
    pub fn once() -> Self {
        Self {
            restart: false,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            restart: true,
            delay,
        }
    }
}

/// Run `start` until it finishes cleanly.
///
/// A pool that returns `Ok` (queue closed or shutdown requested) is never
/// restarted. A failed pool is restarted after `policy.delay` unless the
/// policy forbids it or shutdown was requested, in which case the error is
/// returned.
pub async fn supervise<F, Fut>(
    policy: RestartPolicy,
    running: Arc<AtomicBool>,
    mut start: F,
) -> Result<WorkerStats>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<WorkerStats>>,
{
    let mut attempt = 0;
    loop {
        match start(attempt).await {
            Ok(stats) => return Ok(stats),
            Err(e) if !policy.restart || !running.load(Ordering::SeqCst) => {
                tracing::error!("Worker pool failed: {}", e);
                return Err(e);
            }
            Err(e) => {
                attempt += 1;
                increment(WORKER_RESTARTS, 1);
                tracing::error!(
                    attempt,
                    "Worker pool crashed, restarting in {:?}: {}",
                    policy.delay,
                    e
                );
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}
