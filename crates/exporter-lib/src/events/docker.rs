//! Docker event source using bollard.
//!
//! Connects to the Docker daemon, pings it and subscribes to container
//! `die` events. Stream items are pumped into a [`ConnectionSession`] by a
//! background task owned by the session.

use super::{
    async_trait, ConnectionSession, EventSource, EventSourceError, RawEvent, SessionSender,
    SESSION_CHANNEL_CAPACITY,
};
use crate::observability::StructuredLogger;
use bollard::models::EventMessage;
use bollard::query_parameters::{EventsOptions, EventsOptionsBuilder};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::debug;

/// Server-side filters for the `/events` subscription
pub const DOCKER_EVENT_FILTERS: [(&str, &str); 2] = [("type", "container"), ("event", "die")];

/// Request timeout passed to bollard for explicit hosts, in seconds
const CLIENT_TIMEOUT_SECS: u64 = 120;

/// Event source backed by the Docker Engine API
#[derive(Debug, Clone)]
pub struct DockerEventSource {
    /// Explicit daemon address; `None` uses bollard's local defaults (`DOCKER_HOST`)
    host: Option<String>,
    logger: StructuredLogger,
}

impl DockerEventSource {
    pub fn new(host: Option<String>, logger: StructuredLogger) -> Self {
        Self { host, logger }
    }

    /// Daemon address used for logging
    pub fn endpoint(&self) -> &str {
        self.host.as_deref().unwrap_or("local defaults")
    }

    fn client(&self) -> Result<Docker, bollard::errors::Error> {
        match self.host.as_deref() {
            None => Docker::connect_with_local_defaults(),
            #[cfg(unix)]
            Some(host) if host.starts_with("unix://") || host.starts_with('/') => {
                Docker::connect_with_unix(host, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(host) => Docker::connect_with_http(host, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION),
        }
    }
}

#[async_trait]
impl EventSource for DockerEventSource {
    async fn connect(&self) -> Result<ConnectionSession, EventSourceError> {
        let docker = self
            .client()
            .map_err(|e| EventSourceError::Connection(e.to_string()))?;

        docker
            .ping()
            .await
            .map_err(|e| EventSourceError::Connection(e.to_string()))?;

        let (sender, session) = ConnectionSession::channel(SESSION_CHANNEL_CAPACITY);
        let handle = tokio::spawn(pump_events(docker, sender));

        self.logger.log_connected(self.endpoint());

        Ok(session.with_handle(handle))
    }
}

/// Build the filter map for container exit events
pub(crate) fn event_filters() -> HashMap<&'static str, Vec<&'static str>> {
    let mut filters: HashMap<&str, Vec<&str>> = HashMap::new();
    for (key, value) in DOCKER_EVENT_FILTERS {
        filters.entry(key).or_default().push(value);
    }
    filters
}

fn events_options() -> EventsOptions {
    EventsOptionsBuilder::new().filters(&event_filters()).build()
}

/// Forward the daemon's event stream into the session until it ends
async fn pump_events(docker: Docker, sender: SessionSender) {
    let mut stream = Box::pin(docker.events(Some(events_options())));

    while let Some(item) = stream.next().await {
        match item {
            Ok(message) => {
                if !sender.send_event(raw_event(message)).await {
                    debug!("Session dropped, stopping event pump");
                    return;
                }
            }
            Err(e) => {
                sender
                    .send_error(EventSourceError::Transport(e.to_string()))
                    .await;
                return;
            }
        }
    }

    // The daemon closed the stream, e.g. on restart
    sender
        .send_error(EventSourceError::Transport(
            "event stream closed by daemon".to_string(),
        ))
        .await;
}

/// Convert a bollard event message into a raw event record
///
/// The Engine API schema has no top-level `from` field, so the origin is
/// left empty; Docker always reports the image as an actor attribute.
pub(crate) fn raw_event(message: EventMessage) -> RawEvent {
    let (actor_id, attributes) = message
        .actor
        .map(|actor| {
            (
                actor.id.unwrap_or_default(),
                actor.attributes.unwrap_or_default(),
            )
        })
        .unwrap_or_default();

    RawEvent {
        actor_id,
        attributes,
        origin: None,
        action: message.action,
    }
}
