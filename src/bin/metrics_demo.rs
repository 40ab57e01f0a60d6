//! metrics-demo: in-memory bus with metrics enabled
//!
//! Starts a two-worker in-memory bus, sends a batch of commands and events
//! (some commands fail once and are retried) and prints the Prometheus text
//! exposition once the queue has drained.
//!
//! ## Configuration
//! - MESSAGING_METRICS_CONFIG: YAML file with `MetricsOptions` (optional)
//! - MESSAGING_METRICS__MESSAGE_METRICS: per-type metrics (default: false)
//! - MESSAGING_METRICS_LOG: log filter (default: info)
//! - DEMO_MESSAGES: number of messages to send (default: 20)

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use messaging_metrics::bus::{BusBuilder, BusError, InMemNetwork};
use messaging_metrics::config::MetricsOptions;
use messaging_metrics::metrics::MetricRegistry;
use messaging_metrics::setup::MetricsConfigurerExt;
use messaging_metrics::utils::bootstrap::{init_tracing, wait_until};

const DEFAULT_MESSAGES: usize = 20;

#[derive(Debug, Serialize, Deserialize)]
struct ReserveStock {
    sequence: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct StockReserved {
    sequence: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let options = MetricsOptions::load(None)?;
    let messages = std::env::var("DEMO_MESSAGES")
        .ok()
        .and_then(|n| n.parse().ok())
        .unwrap_or(DEFAULT_MESSAGES);

    let handled = Arc::new(AtomicUsize::new(0));
    let failed_once = Arc::new(Mutex::new(HashSet::new()));

    let bus = {
        let handled_commands = Arc::clone(&handled);
        let handled_events = Arc::clone(&handled);
        BusBuilder::new(InMemNetwork::new(), "demo")
            .with_name("demo")
            .with_workers(2)
            .handle::<ReserveStock, _, _>(move |cmd, _ctx| {
                let first_attempt = cmd.sequence % 7 == 0
                    && failed_once
                        .lock()
                        .map(|mut seen| seen.insert(cmd.sequence))
                        .unwrap_or(false);
                let handled = Arc::clone(&handled_commands);
                async move {
                    if first_attempt {
                        return Err(BusError::HandlerFailed {
                            message_type: "ReserveStock".to_string(),
                            message: format!("stock service busy for #{}", cmd.sequence),
                        });
                    }
                    handled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .handle::<StockReserved, _, _>(move |_event, _ctx| {
                let handled = Arc::clone(&handled_events);
                async move {
                    handled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .enable_metrics(options)
            .start()?
    };

    for sequence in 1..=messages {
        if sequence % 3 == 0 {
            bus.send(&ReserveStock { sequence }).await?;
        } else {
            bus.publish(&StockReserved { sequence }).await?;
        }
    }

    let drained = wait_until(Duration::from_secs(10), || {
        handled.load(Ordering::SeqCst) == messages
    })
    .await;
    info!(messages, drained, "Demo batch processed");

    bus.dispose().await;

    print!("{}", MetricRegistry::global().export_text()?);
    Ok(())
}
