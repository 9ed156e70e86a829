//! Bootstrap utilities for service binaries.

use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::broker::DoneSignal;
use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the NATS_SERVICE_LOG environment variable.
///
/// Defaults to "info" level if NATS_SERVICE_LOG is not set. Safe to call
/// more than once; later calls leave the first subscriber in place.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Wait for Ctrl-C or for the broker to close, whichever comes first.
///
/// Returns true when the wait ended because of Ctrl-C.
pub async fn wait_for_shutdown(done: DoneSignal) -> bool {
    tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                done.wait().await;
                false
            }
        },
        _ = done.clone().wait() => false,
    }
}
