//! Exporter configuration

use config::ConfigError;
use exporter_lib::{lifecycle::DEFAULT_SHUTDOWN_GRACE, subscription::DEFAULT_RECONNECT_DELAY};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// Environment variable prefix, e.g. `EXPORTER_LISTEN_PORT`
const ENV_PREFIX: &str = "EXPORTER";

/// Exporter configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExporterConfig {
    /// TCP port of the metrics endpoint
    pub listen_port: u16,

    /// Fixed delay between reconnection attempts, in seconds; never zero
    pub reconnect_delay_secs: u64,

    /// Time the HTTP server gets to drain on shutdown, in seconds
    pub shutdown_grace_secs: u64,

    /// Docker daemon address; unset means `DOCKER_HOST` or the local socket
    pub docker_host: Option<String>,
}

fn default_listen_port() -> u16 {
    8000
}

fn default_reconnect_delay() -> u64 {
    DEFAULT_RECONNECT_DELAY.as_secs()
}

fn default_shutdown_grace() -> u64 {
    DEFAULT_SHUTDOWN_GRACE.as_secs()
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            reconnect_delay_secs: default_reconnect_delay(),
            shutdown_grace_secs: default_shutdown_grace(),
            docker_host: None,
        }
    }
}

impl ExporterConfig {
    /// Load configuration from the process environment
    pub fn load() -> Self {
        Self::from_environment(config::Environment::with_prefix(ENV_PREFIX))
    }

    /// Load configuration from an explicit variable map
    pub fn from_vars(vars: HashMap<String, String>) -> Self {
        Self::from_environment(config::Environment::with_prefix(ENV_PREFIX).source(Some(vars)))
    }

    /// Each setting falls back to its own default when missing or invalid
    fn from_environment(environment: config::Environment) -> Self {
        let source = match config::Config::builder()
            .add_source(environment.try_parsing(true))
            .build()
        {
            Ok(source) => source,
            Err(e) => {
                warn!(error = %e, "Invalid configuration, using defaults");
                return Self::default();
            }
        };

        let mut reconnect_delay_secs =
            setting(&source, "reconnect_delay_secs", default_reconnect_delay());
        if reconnect_delay_secs == 0 {
            warn!(
                key = "reconnect_delay_secs",
                default = default_reconnect_delay(),
                "Reconnect delay must be positive, using default"
            );
            reconnect_delay_secs = default_reconnect_delay();
        }

        Self {
            listen_port: setting(&source, "listen_port", default_listen_port()),
            reconnect_delay_secs,
            shutdown_grace_secs: setting(&source, "shutdown_grace_secs", default_shutdown_grace()),
            docker_host: setting(&source, "docker_host", None::<String>),
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn setting<T: DeserializeOwned>(source: &config::Config, key: &str, default: T) -> T {
    match source.get::<T>(key) {
        Ok(value) => value,
        Err(ConfigError::NotFound(_)) => default,
        Err(e) => {
            warn!(key = key, error = %e, "Invalid configuration value, using default");
            default
        }
    }
}
