//! Counter store for container exit events
//!
//! One [`CounterStore`] is constructed at process start and handed to both
//! the subscription loop (writer) and the metrics endpoint (reader). It owns
//! its own Prometheus registry instead of using the process-global default.

use crate::events::MetricKey;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Metric family name
pub const METRIC_NAME: &str = "docker_events";

/// Metric family help text
pub const METRIC_HELP: &str = "Count of docker container exit events";

/// Label names, in [`MetricKey::label_values`] order
pub const LABEL_NAMES: [&str; 3] = ["container_image", "container_name", "exit_code"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("metrics output is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Additive counters keyed by [`MetricKey`]
///
/// Clones share the same cells. Cells are only ever incremented; there is
/// no removal or reset.
#[derive(Clone)]
pub struct CounterStore {
    registry: Registry,
    exits: IntCounterVec,
}

impl CounterStore {
    /// Create a store with a fresh registry
    pub fn new() -> Result<Self, StoreError> {
        Self::with_registry(Registry::new())
    }

    /// Create a store that registers its counter family in `registry`
    pub fn with_registry(registry: Registry) -> Result<Self, StoreError> {
        let exits = IntCounterVec::new(Opts::new(METRIC_NAME, METRIC_HELP), &LABEL_NAMES)?;
        registry.register(Box::new(exits.clone()))?;

        Ok(Self { registry, exits })
    }

    /// Add one to the cell for `key`, creating it if absent
    pub fn increment(&self, key: &MetricKey) {
        self.exits.with_label_values(&key.label_values()).inc();
    }

    /// Current value of one cell (0 if it was never incremented)
    pub fn get(&self, key: &MetricKey) -> u64 {
        let values = key.label_values();
        self.snapshot()
            .into_iter()
            .find(|(k, _)| k.label_values() == values)
            .map(|(_, v)| v)
            .unwrap_or(0)
    }

    /// Point-in-time view of every cell, sorted by key
    pub fn snapshot(&self) -> Vec<(MetricKey, u64)> {
        let mut cells: Vec<(MetricKey, u64)> = self
            .registry
            .gather()
            .into_iter()
            .filter(|family| family.get_name() == METRIC_NAME)
            .flat_map(|family| family.get_metric().to_vec())
            .map(|metric| {
                let label = |name: &str| {
                    metric
                        .get_label()
                        .iter()
                        .find(|pair| pair.get_name() == name)
                        .map(|pair| pair.get_value().to_string())
                        .unwrap_or_default()
                };
                let key = MetricKey::new(
                    label(LABEL_NAMES[0]),
                    label(LABEL_NAMES[1]),
                    label(LABEL_NAMES[2]),
                );
                (key, metric.get_counter().get_value() as u64)
            })
            .collect();

        cells.sort();
        cells
    }

    /// Number of distinct cells
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether no event has been counted yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The registry backing this store
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode the registry in Prometheus text exposition format
    pub fn encode_text(&self) -> Result<String, StoreError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Content type of [`CounterStore::encode_text`] output
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}
