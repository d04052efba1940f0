//! Ingestion workers.
//!
//! A worker pulls batches from the shared queue and runs each message
//! through intake, the team's plugin chain, property resolution and finally
//! the sink. The plugin configuration snapshot is fetched once per batch, so
//! a refresh never changes the chain halfway through a batch.
//!
//! # Failure Handling
//!
//! - Decode/validation errors: dead-lettered, never reach plugins
//! - Plugin errors: isolated by the executor, the event carries on
//! - Persistence errors: retried, then dead-lettered
//! - Queue or sink errors: fatal for the worker; unwritten messages go back
//!   to the queue, the pool stops the other workers gracefully and reports
//!   the failure to the supervisor

use crate::health::{DEFAULT_LIVENESS_DEADLINE, HealthRegistry};
use crate::pipeline::{
    ChainResult, DeadLetter, DeadLetterReason, DeadLetterSink, EventSink, PluginExecutor,
    PropertyResolver, RetryPolicy, resolve_with_retry,
};
use crate::plugins::{PluginConfigHandle, PluginConfigSnapshot};
use crate::source::{EventQueue, RawMessage};
use crate::{Error, Result};
use plugin_server_core::decode_event;
use plugin_server_core::metrics::{
    EVENTS_DEAD_LETTERED, EVENTS_DROPPED, EVENTS_FORWARDED, EVENTS_RECEIVED, WORKERS_RUNNING,
    increment, set_gauge,
};
use std::ops::AddAssign;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;

/// Everything a worker needs, shared by the whole pool.
pub struct WorkerContext {
    pub queue: Arc<dyn EventQueue>,
    pub plugin_config: PluginConfigHandle,
    pub executor: PluginExecutor,
    pub resolver: PropertyResolver,
    pub retry: RetryPolicy,
    pub sink: Arc<dyn EventSink>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub batch_size: usize,
    pub poll_timeout: Duration,
    /// Cleared by the shutdown handler.
    pub running: Arc<AtomicBool>,
    pub health: HealthRegistry,
}

/// What happened to a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Forwarded,
    Dropped,
    DeadLettered(DeadLetterReason),
}

/// Counters for one worker, or summed over a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub batches: usize,
    pub received: usize,
    pub forwarded: usize,
    pub dropped: usize,
    pub dead_lettered: usize,
    pub plugin_failures: usize,
}

impl WorkerStats {
    fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Forwarded => self.forwarded += 1,
            MessageOutcome::Dropped => self.dropped += 1,
            MessageOutcome::DeadLettered(_) => self.dead_lettered += 1,
        }
    }
}

impl AddAssign<&WorkerStats> for WorkerStats {
    fn add_assign(&mut self, other: &WorkerStats) {
        self.batches += other.batches;
        self.received += other.received;
        self.forwarded += other.forwarded;
        self.dropped += other.dropped;
        self.dead_lettered += other.dead_lettered;
        self.plugin_failures += other.plugin_failures;
    }
}

/// Process one raw message end to end.
///
/// Only sink failures are returned as errors; everything else is handled
/// here and reported through the outcome.
pub async fn process_message(
    ctx: &WorkerContext,
    snapshot: &PluginConfigSnapshot,
    message: &RawMessage,
    stats: &mut WorkerStats,
) -> Result<MessageOutcome> {
    stats.received += 1;
    increment(EVENTS_RECEIVED, 1);

    let event = match decode_event(&message.payload, snapshot) {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!(origin = %message.origin, reason = e.kind(), "Rejected message: {}", e);
            let letter = DeadLetter::rejected(&e, &message.payload, &message.origin);
            return dead_letter(ctx, &letter);
        }
    };

    let chain = snapshot.plugins_for(event.team_id);
    let outcome = ctx.executor.run(event, chain).await;
    stats.plugin_failures += outcome.failures.len();

    let event = match outcome.result {
        ChainResult::Forward(event) => event,
        ChainResult::Dropped { .. } => {
            increment(EVENTS_DROPPED, 1);
            return Ok(MessageOutcome::Dropped);
        }
    };

    if let Err(e) = resolve_with_retry(&ctx.resolver, &event, &ctx.retry).await {
        tracing::error!(
            team_id = event.team_id,
            origin = %message.origin,
            "Dead-lettering event after persistence failure: {}",
            e
        );
        let letter = DeadLetter::unpersisted(&event, &e, &message.origin);
        return dead_letter(ctx, &letter);
    }

    ctx.sink.send(&event)?;
    increment(EVENTS_FORWARDED, 1);
    Ok(MessageOutcome::Forwarded)
}

fn dead_letter(ctx: &WorkerContext, letter: &DeadLetter) -> Result<MessageOutcome> {
    ctx.dead_letters.dead_letter(letter)?;
    metrics::counter!(EVENTS_DEAD_LETTERED, "reason" => letter.reason.as_str()).increment(1);
    Ok(MessageOutcome::DeadLettered(letter.reason))
}

/// A single pool worker.
pub struct Worker {
    id: usize,
    ctx: Arc<WorkerContext>,
    halt: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(id: usize, ctx: Arc<WorkerContext>, halt: Arc<AtomicBool>) -> Self {
        Self { id, ctx, halt }
    }

    fn should_run(&self) -> bool {
        self.ctx.running.load(Ordering::SeqCst) && !self.halt.load(Ordering::SeqCst)
    }

    /// Run until the queue closes or shutdown is requested.
    ///
    /// A batch that has been pulled is always processed completely. If a
    /// sink write fails partway through, the messages not yet written are
    /// handed back to the queue before the error is returned.
    pub async fn run(self) -> Result<WorkerStats> {
        let ctx = &self.ctx;
        let liveness = ctx
            .health
            .register(format!("worker-{}", self.id), DEFAULT_LIVENESS_DEADLINE);
        let mut stats = WorkerStats::default();

        tracing::debug!(worker = self.id, queue = ctx.queue.name(), "Worker started");

        let result = async {
            while self.should_run() {
                liveness.report_healthy();

                let batch = match ctx.queue.recv_batch(ctx.batch_size, ctx.poll_timeout).await? {
                    None => {
                        tracing::debug!(worker = self.id, "Queue closed");
                        break;
                    }
                    Some(batch) if batch.is_empty() => continue,
                    Some(batch) => batch,
                };

                self.process_batch(batch, &mut stats).await?;
                stats.batches += 1;
            }
            Ok::<_, Error>(())
        }
        .await;

        liveness.report_stopped();
        tracing::debug!(worker = self.id, ?stats, "Worker stopped");
        result.map(|()| stats)
    }

    async fn process_batch(&self, batch: Vec<RawMessage>, stats: &mut WorkerStats) -> Result<()> {
        let ctx = &self.ctx;
        let snapshot = ctx.plugin_config.current();

        for (i, message) in batch.iter().enumerate() {
            match process_message(ctx, &snapshot, message, stats).await {
                Ok(outcome) => stats.record(outcome),
                Err(e) => return self.requeue_and_fail(batch[i..].to_vec(), e).await,
            }
        }

        // Unflushed lines may be lost with the writer, so the whole batch
        // goes back and is delivered at least once.
        let flushed = ctx.sink.flush().and_then(|()| ctx.dead_letters.flush());
        if let Err(e) = flushed {
            return self.requeue_and_fail(batch, e).await;
        }
        Ok(())
    }

    async fn requeue_and_fail(&self, unprocessed: Vec<RawMessage>, err: Error) -> Result<()> {
        tracing::error!(
            worker = self.id,
            requeued = unprocessed.len(),
            "Sink failed, returning unprocessed messages to the queue: {}",
            err
        );
        self.ctx.queue.requeue(unprocessed).await?;
        Err(err)
    }
}

/// Run `workers` workers against `ctx` until they all stop.
///
/// If one worker fails, the others are asked to stop after their current
/// batch and the first failure is returned.
pub async fn run_pool(ctx: Arc<WorkerContext>, workers: usize) -> Result<WorkerStats> {
    let halt = Arc::new(AtomicBool::new(false));
    let mut set = JoinSet::new();

    for id in 0..workers {
        let worker = Worker::new(id, Arc::clone(&ctx), Arc::clone(&halt));
        set.spawn(async move { (id, worker.run().await) });
    }
    set_gauge(WORKERS_RUNNING, workers as f64);
    tracing::info!("Started {} workers", workers);

    let mut total = WorkerStats::default();
    let mut first_error = None;
    let mut remaining = workers;

    while let Some(joined) = set.join_next().await {
        remaining -= 1;
        set_gauge(WORKERS_RUNNING, remaining as f64);

        let failure = match joined {
            Ok((_, Ok(stats))) => {
                total += &stats;
                None
            }
            Ok((worker, Err(e))) => Some(Error::WorkerFailed {
                worker,
                reason: e.to_string(),
            }),
            Err(join_err) => Some(Error::WorkerFailed {
                worker: usize::MAX,
                reason: join_err.to_string(),
            }),
        };

        if let Some(err) = failure {
            tracing::error!("{}; stopping remaining workers", err);
            halt.store(true, Ordering::SeqCst);
            first_error.get_or_insert(err);
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(total),
    }
}
