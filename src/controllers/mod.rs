use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::Client;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::error;

use crate::cloud::FleetGateway;
use crate::Metrics;

pub mod awsmachinepool;

pub use awsmachinepool::ReconcilerConfig;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconciler
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    /// The cloud API that owns fleets and launch templates
    gateway: Arc<dyn FleetGateway>,
    /// Optional behaviour of the pool reconciler
    config: ReconcilerConfig,
    /// If set, only pools in this namespace are reconciled
    watch_namespace: Option<String>,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(
        gateway: Arc<dyn FleetGateway>,
        config: ReconcilerConfig,
        watch_namespace: Option<String>,
    ) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry: prometheus::Registry::default(),
            gateway,
            config,
            watch_namespace,
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}

/// Connects to the apiserver and runs every controller until shutdown
pub async fn run(state: State) {
    let client = match Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to create kube client: {e:?}");
            std::process::exit(1);
        }
    };

    let metrics = match Metrics::default().register(&state.registry) {
        Ok(metrics) => metrics,
        Err(e) => {
            error!("Failed to register metrics: {e:?}");
            std::process::exit(1);
        }
    };

    awsmachinepool::run(client, metrics, state).await
}
