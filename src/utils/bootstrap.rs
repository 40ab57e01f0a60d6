//! Bootstrap utilities for binaries using the metrics extension.

use std::time::Duration;

use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with MESSAGING_METRICS_LOG environment variable.
///
/// Defaults to "info" level if MESSAGING_METRICS_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Poll `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition was met. Used to wait for bus workers to
/// drain their queues.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    const POLL_INTERVAL: Duration = Duration::from_millis(10);

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(timeout_ms = timeout.as_millis() as u64, "Condition not met before timeout");
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_until_met() {
        let mut calls = 0;
        let met = wait_until(Duration::from_secs(1), || {
            calls += 1;
            calls >= 3
        })
        .await;
        assert!(met);
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        assert!(!wait_until(Duration::from_millis(30), || false).await);
    }
}
