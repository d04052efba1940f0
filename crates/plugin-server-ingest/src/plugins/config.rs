//! Per-team plugin configuration.
//!
//! The configuration document is a JSON file:
//!
//! ```json
//! {"teams": [{"team_id": 42, "plugins": [
//!     {"plugin": "taxonomy", "config": {"style": "snake_case"}},
//!     {"plugin": "drop-events", "enabled": false, "config": {"events": ["spam"]}}
//! ]}]}
//! ```
//!
//! Every team listed is a known team, even with an empty chain. Workers read
//! an immutable [`PluginConfigSnapshot`] once per batch; a background task
//! reloads the file and swaps the snapshot through a [`PluginConfigHandle`].

use crate::{Error, Result};
use arc_swap::ArcSwap;
use plugin_server_core::TeamLookup;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

/// One entry of a team's plugin chain.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawPluginConfig")]
pub struct PluginConfig {
    /// Plugin id in the registry.
    pub plugin: String,
    pub enabled: bool,
    /// Settings handed to the plugin on every invocation.
    pub config: Arc<Map<String, Value>>,
}

#[derive(Deserialize)]
struct RawPluginConfig {
    plugin: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    config: Map<String, Value>,
}

fn default_enabled() -> bool {
    true
}

impl From<RawPluginConfig> for PluginConfig {
    fn from(raw: RawPluginConfig) -> Self {
        Self {
            plugin: raw.plugin,
            enabled: raw.enabled,
            config: Arc::new(raw.config),
        }
    }
}

impl PluginConfig {
    pub fn new(plugin: impl Into<String>, config: Value) -> Self {
        let config = match config {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            plugin: plugin.into(),
            enabled: true,
            config: Arc::new(config),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A team and its ordered plugin chain.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TeamPlugins {
    pub team_id: i64,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

/// The configuration file as written on disk.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PluginConfigDocument {
    #[serde(default)]
    pub teams: Vec<TeamPlugins>,
}

/// Immutable view of the plugin configuration for all teams.
#[derive(Debug, Clone, Default)]
pub struct PluginConfigSnapshot {
    teams: HashMap<i64, Vec<PluginConfig>>,
}

impl PluginConfigSnapshot {
    /// Build a snapshot; a team listed twice keeps its last entry.
    pub fn from_document(doc: PluginConfigDocument) -> Self {
        let teams = doc
            .teams
            .into_iter()
            .map(|team| (team.team_id, team.plugins))
            .collect();
        Self { teams }
    }

    /// Read and parse the document at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::PluginConfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        let doc: PluginConfigDocument = serde_json::from_str(&raw).map_err(|e| {
            Error::PluginConfig(format!("failed to parse {}: {}", path.display(), e))
        })?;
        Ok(Self::from_document(doc))
    }

    /// The team's chain, empty for teams without plugins.
    pub fn plugins_for(&self, team_id: i64) -> &[PluginConfig] {
        self.teams.get(&team_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn team_count(&self) -> usize {
        self.teams.len()
    }
}

impl TeamLookup for PluginConfigSnapshot {
    fn contains_team(&self, team_id: i64) -> bool {
        self.teams.contains_key(&team_id)
    }
}

/// Shared, atomically replaceable snapshot.
#[derive(Clone)]
pub struct PluginConfigHandle {
    inner: Arc<ArcSwap<PluginConfigSnapshot>>,
}

impl PluginConfigHandle {
    pub fn new(snapshot: PluginConfigSnapshot) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(snapshot)),
        }
    }

    pub fn current(&self) -> Arc<PluginConfigSnapshot> {
        self.inner.load_full()
    }

    pub fn replace(&self, snapshot: PluginConfigSnapshot) {
        self.inner.store(Arc::new(snapshot));
    }
}

const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(1);

/// Reload the configuration file every `interval` until `running` clears.
///
/// A file that fails to load is logged and the previous snapshot stays live.
pub fn spawn_config_refresher(
    handle: PluginConfigHandle,
    path: PathBuf,
    interval: Duration,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    // `interval` panics on a zero period.
    let period = interval.max(MIN_REFRESH_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately; the caller already loaded once.
        ticker.tick().await;

        while running.load(Ordering::SeqCst) {
            ticker.tick().await;
            match PluginConfigSnapshot::load(&path) {
                Ok(snapshot) => {
                    tracing::debug!(teams = snapshot.team_count(), "Reloaded plugin config");
                    handle.replace(snapshot);
                }
                Err(e) => {
                    tracing::warn!("Keeping previous plugin config: {}", e);
                }
            }
        }
    })
}
