//! Library for the Docker exit event exporter
//!
//! This crate provides the core functionality for:
//! - Subscribing to container exit events from the Docker daemon
//! - Normalizing events into `(image, name, exit code)` label triples
//! - Counting them in a Prometheus-backed store
//! - Reconnecting after daemon restarts and stream failures
//! - Shutdown coordination and health reporting

pub mod events;
pub mod health;
pub mod lifecycle;
pub mod observability;
pub mod store;
pub mod subscription;

pub use events::{
    normalize, ConnectionSession, DockerEventSource, EventSource, EventSourceError, MetricKey,
    RawEvent,
};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use lifecycle::Lifecycle;
pub use observability::StructuredLogger;
pub use store::{CounterStore, StoreError};
pub use subscription::{SubscriptionLoop, SubscriptionLoopBuilder, SubscriptionState};
