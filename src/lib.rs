//! messaging-metrics - Prometheus instrumentation for a message bus
//!
//! Counts, in-flight gauges, error counters and latency histograms for the
//! transport and the incoming/outgoing pipelines of a bus, labelled per bus
//! instance and, optionally, per message type. A sampler publishes the
//! number of active workers.
//!
//! ```ignore
//! use messaging_metrics::bus::{BusBuilder, InMemNetwork};
//! use messaging_metrics::config::MetricsOptions;
//! use messaging_metrics::metrics::MetricRegistry;
//! use messaging_metrics::setup::MetricsConfigurerExt;
//!
//! let bus = BusBuilder::new(InMemNetwork::new(), "orders")
//!     .enable_metrics(MetricsOptions::new().with_message_metrics(true))
//!     .start()?;
//!
//! println!("{}", MetricRegistry::global().export_text()?);
//! ```

pub mod advice;
pub mod bus;
pub mod config;
pub mod identity;
pub mod metrics;
pub mod sampler;
pub mod setup;
pub mod utils;

pub use config::MetricsOptions;
pub use setup::{enable_metrics, enable_metrics_with, MetricsConfigurerExt};
