//! Container exit event sources
//!
//! This module provides:
//! - The [`EventSource`] trait implemented by runtime adapters
//! - [`ConnectionSession`], one live subscription with its event and error channels
//! - The Docker adapter built on bollard
//! - Normalization of raw events into metric label triples

mod docker;
mod normalize;

pub use docker::{DockerEventSource, DOCKER_EVENT_FILTERS};
pub use normalize::{normalize, MetricKey, UNKNOWN};

use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use async_trait::async_trait;

/// Default capacity of the per-session event channel
pub const SESSION_CHANNEL_CAPACITY: usize = 256;

/// Errors produced by an event source
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventSourceError {
    /// Handshake, client creation or liveness check failed
    #[error("connection to container runtime failed: {0}")]
    Connection(String),

    /// The subscription failed after it was established
    #[error("event stream failed: {0}")]
    Transport(String),
}

/// A raw event record as delivered by the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEvent {
    /// Runtime-assigned container identifier
    pub actor_id: String,
    /// Actor attributes (`name`, `image`, `exitCode`, labels...)
    pub attributes: HashMap<String, String>,
    /// Declared origin of the event, used as an image fallback
    pub origin: Option<String>,
    /// Event action, e.g. `die`
    pub action: Option<String>,
}

impl RawEvent {
    pub fn new(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            ..Default::default()
        }
    }

    /// Add an actor attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Set the origin field
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Look up an attribute, treating empty values as absent
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Trait for container runtime event sources
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Connect, verify liveness and open the exit event subscription
    async fn connect(&self) -> Result<ConnectionSession, EventSourceError>;
}

/// Producer half of a session, held by whatever pumps the transport
#[derive(Debug, Clone)]
pub struct SessionSender {
    events: mpsc::Sender<RawEvent>,
    errors: mpsc::Sender<EventSourceError>,
}

impl SessionSender {
    /// Deliver an event. Returns false once the session is gone.
    pub async fn send_event(&self, event: RawEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Deliver the terminal transport error of the session
    pub async fn send_error(&self, error: EventSourceError) -> bool {
        self.errors.send(error).await.is_ok()
    }

    /// Whether the consuming session has been dropped
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// One live subscription attempt
///
/// The session owns the transport handle; dropping it releases the handle.
#[derive(Debug)]
pub struct ConnectionSession {
    events: mpsc::Receiver<RawEvent>,
    errors: mpsc::Receiver<EventSourceError>,
    handle: Option<JoinHandle<()>>,
}

impl ConnectionSession {
    /// Create a session and the sender that feeds it
    pub fn channel(capacity: usize) -> (SessionSender, Self) {
        let (events_tx, events_rx) = mpsc::channel(capacity);
        // At most one terminal error per session
        let (errors_tx, errors_rx) = mpsc::channel(1);

        let sender = SessionSender {
            events: events_tx,
            errors: errors_tx,
        };
        let session = Self {
            events: events_rx,
            errors: errors_rx,
            handle: None,
        };

        (sender, session)
    }

    /// Attach the transport task; it is aborted when the session is dropped
    pub fn with_handle(mut self, handle: JoinHandle<()>) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Split into the event and error receivers
    pub(crate) fn receivers(
        &mut self,
    ) -> (
        &mut mpsc::Receiver<RawEvent>,
        &mut mpsc::Receiver<EventSourceError>,
    ) {
        (&mut self.events, &mut self.errors)
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
