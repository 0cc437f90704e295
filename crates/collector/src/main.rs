//! Cluster Collector - Kubernetes state watcher
//!
//! This binary watches cluster resources, groups pods into microservices
//! and streams change reports to the aggregation endpoint over a WebSocket.

use anyhow::{Context, Result};
use collector_lib::{
    health::HealthRegistry,
    observability::StructuredLogger,
    watch::{KubeEventSource, ResourceHandler, WatchedKind},
    ClusterState, CollectorMetrics, EntityHandler, IdAllocator, KubeOwnerLookup, NewDataSignal,
    OwnerResolver, PodCorrelator, Relay, ReportBuffer, ResetSignal, WatchConfig, WatchLoop,
    WebSocketConnector,
};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod, Secret, Service};
use kube::{Client, Resource};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const COLLECTOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything a watch loop needs besides its kind
struct Watchers {
    client: Client,
    config: WatchConfig,
    reset: ResetSignal,
    health: HealthRegistry,
}

impl Watchers {
    fn spawn<K>(&self, handler: Arc<dyn ResourceHandler<K>>) -> JoinHandle<()>
    where
        K: Resource<DynamicType = ()>
            + Clone
            + std::fmt::Debug
            + serde::de::DeserializeOwned
            + Send
            + Sync
            + 'static,
    {
        let source = Arc::new(KubeEventSource::<K>::all(self.client.clone()));
        let watch_loop = WatchLoop::new(source, handler, self.config.clone(), self.reset.subscribe())
            .with_health(self.health.clone());
        tokio::spawn(watch_loop.run())
    }

    fn spawn_entity<K>(&self, state: &Arc<ClusterState>, buffer: &Arc<ReportBuffer>) -> JoinHandle<()>
    where
        K: WatchedKind + serde::de::DeserializeOwned,
    {
        self.spawn::<K>(Arc::new(EntityHandler::<K>::new(state.clone(), buffer.clone())))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting cluster-collector");

    // Load configuration
    let config = config::CollectorConfig::load()?;
    let relay_config = config.relay_config()?;
    info!(
        cluster_name = %config.cluster_name,
        endpoint = %relay_config.display_endpoint(),
        "Collector configured"
    );
    if config.customer_id.is_empty() {
        warn!("No customer id configured; reports will carry an empty customerGUID");
    }

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let health_registry = HealthRegistry::new();
    let _metrics = CollectorMetrics::new();
    let logger = StructuredLogger::new(&config.cluster_name);
    logger.log_startup(COLLECTOR_VERSION);

    // Shared state
    let cluster = Arc::new(ClusterState::new(Arc::new(IdAllocator::new())));
    let buffer = Arc::new(ReportBuffer::new(NewDataSignal::new()));
    let reset = ResetSignal::new();

    // Watch loops
    let watchers = Watchers {
        client: client.clone(),
        config: config.watch_config(),
        reset: reset.clone(),
        health: health_registry.clone(),
    };
    let owners = OwnerResolver::new(Arc::new(KubeOwnerLookup::new(client)));
    let mut tasks = vec![
        watchers.spawn::<Pod>(Arc::new(PodCorrelator::new(
            cluster.clone(),
            buffer.clone(),
            owners,
        ))),
        watchers.spawn_entity::<Node>(&cluster, &buffer),
        watchers.spawn_entity::<Service>(&cluster, &buffer),
        watchers.spawn_entity::<Secret>(&cluster, &buffer),
        watchers.spawn_entity::<Namespace>(&cluster, &buffer),
        watchers.spawn_entity::<CronJob>(&cluster, &buffer),
    ];

    // Report relay
    let connector = Arc::new(WebSocketConnector::new(relay_config.connect_timeout));
    let relay = Arc::new(
        Relay::new(relay_config, connector, buffer.clone(), reset)
            .with_health(health_registry.clone()),
    );
    tasks.push(tokio::spawn(relay.clone().run_sender()));
    tasks.push(tokio::spawn(relay.run_keepalive()));

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        cluster,
        buffer,
    ));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    // Mark collector as ready once every task is running
    health_registry.set_ready(true).await;

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            logger.log_shutdown("SIGINT received");
        }
        served = api_handle => {
            let reason = match served {
                Ok(Ok(())) => "API server stopped".to_string(),
                Ok(Err(e)) => format!("API server failed: {e:#}"),
                Err(e) => format!("API server task failed: {e}"),
            };
            logger.log_shutdown(&reason);
        }
    }

    info!("Shutting down");
    for task in tasks {
        task.abort();
    }

    Ok(())
}
