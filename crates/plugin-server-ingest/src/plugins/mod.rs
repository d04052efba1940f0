//! Event transformation plugins.
//!
//! A plugin is statically linked code implementing [`Plugin`]. Teams opt into
//! plugins through their [`PluginConfig`] chain, which names plugins by id;
//! ids are resolved through a [`PluginRegistry`].
//!
//! # Built-in Plugins
//!
//! | id                   | effect                                           |
//! |----------------------|--------------------------------------------------|
//! | `drop-events`        | drops events whose name is in `events`           |
//! | `property-filter`    | removes the properties listed in `properties`    |
//! | `flatten-properties` | flattens nested objects into `a__b` keys         |
//! | `taxonomy`           | rewrites event names to a naming `style`         |
//! | `set-property`       | sets the `properties` object onto every event    |

mod builtin;
mod config;

pub use builtin::{DropEvents, FlattenProperties, PropertyFilterPlugin, SetProperty, Taxonomy};
pub use config::{
    PluginConfig, PluginConfigDocument, PluginConfigHandle, PluginConfigSnapshot, TeamPlugins,
    spawn_config_refresher,
};

use async_trait::async_trait;
use plugin_server_core::Event;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// What a plugin decided to do with an event.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginOutcome {
    /// Pass the (possibly modified) event to the next plugin.
    Continue(Event),
    /// Stop processing; the event is not forwarded.
    Drop,
}

/// A plugin invocation that did not produce an outcome.
///
/// Never fatal to the event: the executor logs it, skips the plugin and
/// carries on with the event as it was before the call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginExecutionError {
    /// The plugin reported a failure.
    #[error("plugin failed: {0}")]
    Failed(String),

    /// The plugin's settings are unusable.
    #[error("invalid plugin config: {0}")]
    InvalidConfig(String),

    /// The invocation exceeded its time bound.
    #[error("plugin timed out after {0:?}")]
    Timeout(Duration),

    /// The configured plugin id is not registered.
    #[error("plugin '{0}' is not registered")]
    UnknownPlugin(String),

    /// The plugin panicked.
    #[error("plugin panicked: {0}")]
    Panicked(String),
}

impl PluginExecutionError {
    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Timeout(_) => "timeout",
            Self::UnknownPlugin(_) => "unknown_plugin",
            Self::Panicked(_) => "panicked",
        }
    }
}

/// Per-invocation context handed to a plugin.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub team_id: i64,
    /// The team's settings for this plugin.
    pub config: Arc<Map<String, Value>>,
}

impl PluginContext {
    /// List of strings under `key`; missing means empty.
    pub fn string_list(&self, key: &str) -> Result<Vec<String>, PluginExecutionError> {
        match self.config.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        PluginExecutionError::InvalidConfig(format!(
                            "'{key}' must contain only strings"
                        ))
                    })
                })
                .collect(),
            // Comma-separated strings are accepted, as config UIs often store them that way.
            Some(Value::String(s)) => Ok(s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()),
            Some(_) => Err(PluginExecutionError::InvalidConfig(format!(
                "'{key}' must be a list of strings"
            ))),
        }
    }

    /// Optional string setting.
    pub fn string(&self, key: &str) -> Result<Option<&str>, PluginExecutionError> {
        match self.config.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(PluginExecutionError::InvalidConfig(format!(
                "'{key}' must be a string"
            ))),
        }
    }
}

/// A transformation step applied to events during ingestion.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Registry key, as referenced from plugin configs.
    fn id(&self) -> &str;

    /// Whether applying the plugin twice equals applying it once.
    fn is_idempotent(&self) -> bool {
        false
    }

    /// Transform one event.
    async fn transform(
        &self,
        event: Event,
        ctx: &PluginContext,
    ) -> Result<PluginOutcome, PluginExecutionError>;
}

/// Plugins available to this process, keyed by id.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in plugin.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DropEvents));
        registry.register(Arc::new(PropertyFilterPlugin));
        registry.register(Arc::new(FlattenProperties));
        registry.register(Arc::new(Taxonomy));
        registry.register(Arc::new(SetProperty));
        registry
    }

    /// Register a plugin, replacing any existing plugin with the same id.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(plugin.id().to_string(), plugin);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(id).cloned()
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
