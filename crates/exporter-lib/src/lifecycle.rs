//! Process-wide shutdown coordination
//!
//! [`Lifecycle`] owns the cancellation token observed by the subscription
//! loop and the metrics server. Termination signals cancel it; the HTTP
//! server then gets a bounded grace period to drain.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Grace period for the metrics server to finish in-flight requests
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shutdown controller
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    token: CancellationToken,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when shutdown is requested
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Child token, cancelled with the root but cancellable on its own
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn request_shutdown(&self) {
        self.token.cancel();
    }

    /// Resolves once shutdown has been requested
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Sleep for `duration` unless shutdown comes first.
    ///
    /// Returns `true` if the full duration elapsed.
    pub async fn sleep_or_cancelled(&self, duration: Duration) -> bool {
        sleep_or_cancelled(&self.token, duration).await
    }

    /// Wait for SIGINT/SIGTERM, then request shutdown.
    ///
    /// Also returns if shutdown was requested some other way.
    pub async fn wait_for_signal(&self) -> std::io::Result<()> {
        tokio::select! {
            result = wait_for_shutdown_signal() => {
                result?;
                info!("Shutdown signal received");
            }
            _ = self.token.cancelled() => {}
        }
        self.request_shutdown();
        Ok(())
    }
}

/// Sleep for `duration` unless `token` is cancelled first
///
/// Returns `true` if the full duration elapsed.
pub async fn sleep_or_cancelled(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Await `drain` for at most `grace`.
///
/// Returns `Some` with the output if it finished in time.
pub async fn with_grace_period<F>(drain: F, grace: Duration) -> Option<F::Output>
where
    F: Future,
{
    match tokio::time::timeout(grace, drain).await {
        Ok(output) => Some(output),
        Err(_) => {
            warn!(
                grace_secs = grace.as_secs_f64(),
                "Grace period elapsed, forcing shutdown"
            );
            None
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
