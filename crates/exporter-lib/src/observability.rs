//! Structured logging for exporter events
//!
//! Every significant event is emitted through [`StructuredLogger`] as a
//! `tracing` event with a stable `event` field, so JSON log output can be
//! filtered without parsing messages.

use crate::events::MetricKey;
use std::time::Duration;
use tracing::{info, warn};

/// Structured logger for exporter events
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    source: String,
}

impl StructuredLogger {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Name of the event source this logger reports for
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Log exporter startup
    pub fn log_startup(&self, version: &str, listen_port: u16) {
        info!(
            event = "exporter_started",
            source = %self.source,
            exporter_version = %version,
            listen_port = listen_port,
            "Docker exit exporter started"
        );
    }

    /// Log exporter shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "exporter_shutdown",
            source = %self.source,
            reason = %reason,
            "Docker exit exporter shutting down"
        );
    }

    /// Log a successful runtime connection
    pub fn log_connected(&self, endpoint: &str) {
        info!(
            event = "runtime_connected",
            source = %self.source,
            endpoint = %endpoint,
            "Successfully connected to Docker daemon. Waiting for container exit (die) events"
        );
    }

    /// Log one counted exit event
    pub fn log_exit_event(&self, container_id: &str, key: &MetricKey) {
        info!(
            event = "exit_event",
            source = %self.source,
            container_id = %container_id,
            container_name = %key.name,
            container_image = %key.image,
            exit_code = %key.exit_code,
            "Container exited"
        );
    }

    /// Log a failed connection attempt
    pub fn log_connection_failed(&self, error: &str, retry_in: Duration) {
        warn!(
            event = "connection_failed",
            source = %self.source,
            error = %error,
            retry_in_secs = retry_in.as_secs_f64(),
            "Error connecting to event source. Reconnecting after back-off"
        );
    }

    /// Log a subscription that failed after being established
    pub fn log_stream_failed(&self, error: &str, events_in_session: u64, retry_in: Duration) {
        warn!(
            event = "stream_failed",
            source = %self.source,
            error = %error,
            events_in_session = events_in_session,
            retry_in_secs = retry_in.as_secs_f64(),
            "Error in event listener. Reconnecting after back-off"
        );
    }

    /// Log the end of the subscription loop
    pub fn log_loop_stopped(&self, sessions: u64, events: u64) {
        info!(
            event = "subscription_stopped",
            source = %self.source,
            sessions = sessions,
            events = events,
            "Event subscription stopped"
        );
    }
}
