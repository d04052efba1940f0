//! Plugin chain execution.
//!
//! Each enabled entry of a team's chain runs in order against the current
//! event. An invocation works on its own copy of the event inside a spawned
//! task bounded by the plugin timeout, so a failing, panicking or stuck
//! plugin leaves the event exactly as it was before the call and the chain
//! moves on.

use crate::plugins::{
    PluginConfig, PluginContext, PluginExecutionError, PluginOutcome, PluginRegistry,
};
use plugin_server_core::Event;
use plugin_server_core::metrics::{PLUGIN_DURATION, PLUGIN_INVOCATIONS};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Final result of running a chain.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainResult {
    /// Forward this event downstream.
    Forward(Event),
    /// A plugin dropped the event.
    Dropped { by: String },
}

/// One isolated plugin failure.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginFailure {
    pub plugin: String,
    /// Index of the entry in the team's chain.
    pub position: usize,
    pub error: PluginExecutionError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutcome {
    pub result: ChainResult,
    pub failures: Vec<PluginFailure>,
}

impl ChainOutcome {
    pub fn is_dropped(&self) -> bool {
        matches!(self.result, ChainResult::Dropped { .. })
    }
}

/// Runs plugin chains against events.
#[derive(Clone)]
pub struct PluginExecutor {
    registry: Arc<PluginRegistry>,
    timeout: Duration,
}

impl PluginExecutor {
    pub fn new(registry: Arc<PluginRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Apply `chain` to `event`.
    pub async fn run(&self, event: Event, chain: &[PluginConfig]) -> ChainOutcome {
        let mut current = event;
        let mut failures = Vec::new();

        for (position, entry) in chain.iter().enumerate() {
            if !entry.enabled {
                continue;
            }

            let started = Instant::now();
            let result = self.invoke(&current, entry).await;
            metrics::histogram!(PLUGIN_DURATION, "plugin" => entry.plugin.clone())
                .record(started.elapsed().as_secs_f64());

            match result {
                Ok(PluginOutcome::Continue(next)) => {
                    record_invocation(&entry.plugin, "ok");
                    current = next;
                }
                Ok(PluginOutcome::Drop) => {
                    record_invocation(&entry.plugin, "dropped");
                    tracing::debug!(
                        team_id = current.team_id,
                        plugin = %entry.plugin,
                        "Event dropped by plugin"
                    );
                    return ChainOutcome {
                        result: ChainResult::Dropped {
                            by: entry.plugin.clone(),
                        },
                        failures,
                    };
                }
                Err(error) => {
                    record_invocation(&entry.plugin, error.kind());
                    tracing::warn!(
                        team_id = current.team_id,
                        plugin = %entry.plugin,
                        position,
                        "Plugin failed, continuing with unmodified event: {}",
                        error
                    );
                    failures.push(PluginFailure {
                        plugin: entry.plugin.clone(),
                        position,
                        error,
                    });
                }
            }
        }

        ChainOutcome {
            result: ChainResult::Forward(current),
            failures,
        }
    }

    async fn invoke(
        &self,
        event: &Event,
        entry: &PluginConfig,
    ) -> Result<PluginOutcome, PluginExecutionError> {
        let plugin = self
            .registry
            .get(&entry.plugin)
            .ok_or_else(|| PluginExecutionError::UnknownPlugin(entry.plugin.clone()))?;

        let ctx = PluginContext {
            team_id: event.team_id,
            config: Arc::clone(&entry.config),
        };
        let input = event.clone();
        let mut task = tokio::spawn(async move { plugin.transform(input, &ctx).await });

        match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(PluginExecutionError::Panicked(join_err.to_string())),
            Err(_) => {
                task.abort();
                Err(PluginExecutionError::Timeout(self.timeout))
            }
        }
    }
}

fn record_invocation(plugin: &str, result: &'static str) {
    metrics::counter!(PLUGIN_INVOCATIONS, "plugin" => plugin.to_string(), "result" => result)
        .increment(1);
}
