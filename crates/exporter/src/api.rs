//! HTTP API for Prometheus scrapes and health checks

use anyhow::Context;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use exporter_lib::{
    health::{components, ComponentStatus, HealthRegistry},
    CounterStore, Lifecycle,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub store: CounterStore,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, store: CounterStore) -> Self {
        Self {
            health_registry,
            store,
        }
    }
}

/// Health check - 200 if healthy or degraded, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check - 200 if ready, 503 otherwise
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, state.store.content_type())],
            body,
        ),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string())],
                e.to_string(),
            )
        }
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Bind the metrics listener on all interfaces
pub async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let addr = format!("0.0.0.0:{}", port);
    TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind metrics listener on {}", addr))
}

/// Serve the API until shutdown is requested
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    lifecycle: Lifecycle,
) -> anyhow::Result<()> {
    let health = state.health_registry.clone();
    let app = create_router(state);

    info!(addr = %listener.local_addr()?, "Starting exporter on /metrics");
    health.set_healthy(components::METRICS_SERVER).await;

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { lifecycle.cancelled().await })
        .await;

    if let Err(e) = &result {
        health
            .set_unhealthy(components::METRICS_SERVER, e.to_string())
            .await;
    }
    result?;

    info!("Metrics server stopped");
    Ok(())
}
