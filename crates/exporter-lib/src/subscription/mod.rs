//! Reconnecting event subscription
//!
//! Keeps a subscription to the runtime's exit events alive for the lifetime
//! of the process and feeds each event into the counter store.

mod r#loop;

#[cfg(test)]
mod tests;

pub use r#loop::{
    LoopStats, LoopStatsSnapshot, SubscriptionConfig, SubscriptionLoop, SubscriptionLoopBuilder,
    SubscriptionState, DEFAULT_RECONNECT_DELAY, STREAM_CONNECTING,
};

use thiserror::Error;

/// Errors from assembling a subscription loop
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("an event source is required")]
    MissingSource,

    #[error("a counter store is required")]
    MissingStore,
}
