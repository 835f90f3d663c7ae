//! Docker exit exporter
//!
//! Subscribes to container `die` events from the Docker daemon and exposes
//! them as the `docker_events` Prometheus counter on `/metrics`.

use anyhow::Result;
use exporter_lib::{
    health::{components, HealthRegistry},
    lifecycle::with_grace_period,
    subscription::STREAM_CONNECTING,
    CounterStore, DockerEventSource, Lifecycle, StructuredLogger, SubscriptionLoopBuilder,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting docker-exit-exporter");

    let config = config::ExporterConfig::load();
    info!(
        listen_port = config.listen_port,
        reconnect_delay_secs = config.reconnect_delay_secs,
        docker_host = ?config.docker_host,
        "Exporter configured"
    );

    let health_registry = HealthRegistry::new();
    // Not healthy until the first session to the daemon opens
    health_registry
        .set_degraded(components::EVENT_STREAM, STREAM_CONNECTING)
        .await;
    health_registry.register(components::METRICS_SERVER).await;

    // Single store for the life of the process, shared by writer and reader
    let store = CounterStore::new()?;
    let lifecycle = Lifecycle::new();
    let logger = StructuredLogger::new("docker");

    // A port that cannot be bound is a misconfiguration; no retry
    let listener = match api::bind(config.listen_port).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, port = config.listen_port, "Error starting HTTP server");
            return Err(e);
        }
    };

    let source = Arc::new(DockerEventSource::new(
        config.docker_host.clone(),
        logger.clone(),
    ));
    let subscription = SubscriptionLoopBuilder::new()
        .source(source)
        .store(store.clone())
        .reconnect_delay(config.reconnect_delay())
        .health(health_registry.clone())
        .logger(logger.clone())
        .build()?;
    let subscription_handle = tokio::spawn(subscription.run(lifecycle.token()));

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), store));
    let mut api_handle = tokio::spawn(api::serve(listener, app_state, lifecycle.clone()));

    health_registry.set_ready(true).await;
    logger.log_startup(EXPORTER_VERSION, config.listen_port);

    // Wait for shutdown signal, or for the server to die on its own
    tokio::select! {
        result = lifecycle.wait_for_signal() => {
            result?;
            logger.log_shutdown("signal received");
        }
        result = &mut api_handle => {
            lifecycle.request_shutdown();
            logger.log_shutdown("metrics server exited");
            let _ = subscription_handle.await;
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(e.into()),
            };
        }
    }

    health_registry.set_ready(false).await;

    match with_grace_period(api_handle, config.shutdown_grace()).await {
        Some(Ok(Ok(()))) => {}
        Some(Ok(Err(e))) => warn!(error = %e, "HTTP server shutdown error"),
        Some(Err(e)) => warn!(error = %e, "HTTP server task failed"),
        None => {}
    }

    match subscription_handle.await {
        Ok(stats) => info!(
            sessions = stats.sessions_opened,
            events = stats.events_processed,
            connection_failures = stats.connection_failures,
            stream_failures = stats.stream_failures,
            "Exporter stopped"
        ),
        Err(e) => warn!(error = %e, "Subscription task failed"),
    }

    Ok(())
}
