//! Derivation of metric labels from raw exit events

use super::RawEvent;
use serde::Serialize;

/// Label value used when no source field is available
pub const UNKNOWN: &str = "unknown";

/// Length of the short container id used as a name fallback
const SHORT_ID_LEN: usize = 12;

/// Identity of one counter cell
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MetricKey {
    pub image: String,
    pub name: String,
    pub exit_code: String,
}

impl MetricKey {
    pub fn new(
        image: impl Into<String>,
        name: impl Into<String>,
        exit_code: impl Into<String>,
    ) -> Self {
        Self {
            image: image.into(),
            name: name.into(),
            exit_code: exit_code.into(),
        }
    }

    /// Label values in `docker_events` label order
    pub fn label_values(&self) -> [&str; 3] {
        [&self.image, &self.name, &self.exit_code]
    }
}

/// Map a raw event to its metric key
///
/// Every field of the result is non-empty:
/// - name: `name` attribute, else the short container id
/// - image: `image` attribute, else the event origin
/// - exit code: `exitCode` attribute
///
/// Any field with no usable source becomes [`UNKNOWN`].
pub fn normalize(event: &RawEvent) -> MetricKey {
    let name = event
        .attribute("name")
        .map(str::to_string)
        .or_else(|| short_id(&event.actor_id))
        .unwrap_or_else(|| UNKNOWN.to_string());

    let image = event
        .attribute("image")
        .or_else(|| event.origin.as_deref().filter(|o| !o.is_empty()))
        .unwrap_or(UNKNOWN);

    let exit_code = event.attribute("exitCode").unwrap_or(UNKNOWN);

    MetricKey {
        image: image.to_string(),
        name,
        exit_code: exit_code.to_string(),
    }
}

fn short_id(id: &str) -> Option<String> {
    if id.is_empty() {
        return None;
    }
    // Ids are hex, but stay on char boundaries for anything else
    Some(id.chars().take(SHORT_ID_LEN).collect())
}
