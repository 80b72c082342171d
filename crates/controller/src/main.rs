//! costwatch - node and pod cost controller
//!
//! Runs as a single Deployment, keeping node price annotations fresh and
//! publishing per-node and per-pod cost gauges.

use anyhow::{Context, Result};
use costwatch_lib::{
    controller::{NodeController, NodeInfoCache, PodController},
    events::{DedupRecorder, EventRecorder, LogRecorder},
    health::{components, HealthRegistry},
    observability::{ControllerMetrics, StructuredLogger},
    pricing::{Providers, StaticCatalog},
    runtime::{Dispatcher, Runner, WorkQueue},
    sink::PrometheusSink,
    store::{KubeEventRecorder, KubeStore, ObjectStore},
};
use prometheus::Registry;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting costwatch");

    let config = config::ControllerConfig::load()?;
    info!(
        domain = %config.annotation_domain,
        refresh_interval_secs = config.refresh_interval_secs,
        catalog_entries = config.catalog.len(),
        "Controller configured"
    );
    let settings = config.settings();

    let health_registry = HealthRegistry::new();
    health_registry.register(components::OBJECT_STORE).await;
    health_registry.register(components::NODE_CONTROLLER).await;
    health_registry.register(components::POD_CONTROLLER).await;

    // Cost gauges and self-metrics share one registry
    let registry = Registry::new();
    let metrics = ControllerMetrics::new(&registry).context("failed to register self-metrics")?;
    let sink = Arc::new(PrometheusSink::new(&registry).context("failed to register cost gauges")?);

    let logger = StructuredLogger::new(config.pod_name.as_deref().unwrap_or("costwatch"));

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let store = Arc::new(KubeStore::new(client.clone()));
    let events: Arc<dyn EventRecorder> = if config.publish_events {
        Arc::new(DedupRecorder::new(KubeEventRecorder::new(
            client,
            config.pod_name.clone(),
        )))
    } else {
        info!("Object events disabled, logging them instead");
        Arc::new(DedupRecorder::new(LogRecorder))
    };

    let providers = Arc::new(Providers::new(
        settings.keys.clone(),
        Arc::new(StaticCatalog::new(config.catalog.clone())),
    ));
    let nodes = Arc::new(NodeController::new(
        store.clone(),
        providers,
        events.clone(),
        sink.clone(),
        NodeInfoCache::new(),
        settings.clone(),
    ));
    let pods = Arc::new(PodController::new(
        store.clone(),
        events,
        sink,
        settings.clone(),
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let queue = Arc::new(WorkQueue::new());

    // Subscribe before the watchers start so no initial event is lost
    let dispatcher = Dispatcher::new(
        store.clone(),
        queue.clone(),
        settings.keys.clone(),
        settings.call_timeout,
    );
    let dispatcher_handle = tokio::spawn(dispatcher.run(store.subscribe(), shutdown_tx.subscribe()));
    let watcher_handles = store.spawn_watchers(health_registry.clone(), &shutdown_tx);

    let runner = Runner::new(
        queue,
        nodes,
        pods,
        metrics,
        health_registry.clone(),
        config.runner(),
    );
    let runner_handle = tokio::spawn(runner.run(&shutdown_tx));

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), registry));
    let mut api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    health_registry.set_ready(true).await;
    logger.log_startup(CONTROLLER_VERSION, config.max_concurrent_reconciles);

    // Wait for shutdown signal, or for the API server to die
    let reason = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            "SIGINT received"
        }
        served = &mut api_handle => {
            match served {
                Ok(Ok(())) => warn!("API server stopped"),
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Err(e) => error!(error = %e, "API server task panicked"),
            }
            "API server stopped"
        }
    };

    logger.log_shutdown(reason);
    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    let _ = runner_handle.await;
    let _ = dispatcher_handle.await;
    for handle in watcher_handles {
        let _ = handle.await;
    }
    if !api_handle.is_finished() {
        let _ = api_handle.await;
    }
    info!("Shutdown complete");

    Ok(())
}
