//! Liveness tracking and the health endpoints.
//!
//! Long-running components register with a [`HealthRegistry`] and heartbeat
//! through their [`HealthHandle`]. The process is live while every
//! registered component has reported within its deadline.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing::get};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default heartbeat deadline for workers.
pub const DEFAULT_LIVENESS_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
enum ComponentState {
    Starting,
    Healthy { until: Instant },
}

/// Registry of components contributing to process liveness.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, (Duration, ComponentState)>>>,
}

/// Heartbeat handle for one registered component.
#[derive(Clone)]
pub struct HealthHandle {
    name: String,
    registry: HealthRegistry,
}

impl HealthHandle {
    /// Mark the component healthy for another deadline period.
    pub fn report_healthy(&self) {
        let mut components = self.registry.components.write();
        if let Some((deadline, state)) = components.get_mut(&self.name) {
            *state = ComponentState::Healthy {
                until: Instant::now() + *deadline,
            };
        }
    }

    /// Deregister after a clean stop so the component no longer counts.
    pub fn report_stopped(&self) {
        self.registry.components.write().remove(&self.name);
    }
}

/// Liveness snapshot, rendered as the endpoint body.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: BTreeMap<String, &'static str>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        (code, Json(self)).into_response()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`; it must heartbeat at least every `deadline`.
    pub fn register(&self, name: impl Into<String>, deadline: Duration) -> HealthHandle {
        let name = name.into();
        self.components
            .write()
            .insert(name.clone(), (deadline, ComponentState::Starting));
        HealthHandle {
            name,
            registry: self.clone(),
        }
    }

    pub fn get_status(&self) -> HealthStatus {
        let now = Instant::now();
        let components: BTreeMap<String, &'static str> = self
            .components
            .read()
            .iter()
            .map(|(name, (_, state))| {
                let label = match state {
                    ComponentState::Starting => "starting",
                    ComponentState::Healthy { until } if *until >= now => "healthy",
                    ComponentState::Healthy { .. } => "stalled",
                };
                (name.clone(), label)
            })
            .collect();

        HealthStatus {
            healthy: components.values().all(|label| *label == "healthy"),
            components,
        }
    }
}

async fn index() -> &'static str {
    "plugin server"
}

/// Router serving `/`, `/_readiness` and `/_liveness`.
pub fn health_router<S>(registry: HealthRegistry) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || {
                let registry = registry.clone();
                async move { registry.get_status() }
            }),
        )
}
