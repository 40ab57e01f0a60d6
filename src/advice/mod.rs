//! Metrics advice for the bus.
//!
//! Wrapper types that add Prometheus bookkeeping to transports and
//! pipelines without touching their implementations.
//!
//! # Architecture
//!
//! Advice is applied while the bus is configured:
//!
//! ```ignore
//! // Transport: wraps send and receive
//! let transport = InstrumentedTransport::new(transport, Counters::global());
//!
//! // Pipeline: steps placed in front of everything else
//! pipeline.prepend_incoming(Arc::new(InstrumentIncomingStep::new(counters.clone(), tracker)));
//! pipeline.prepend_outgoing(Arc::new(InstrumentOutgoingStep::new(counters)));
//! ```
//!
//! # Available Advice
//!
//! - [`InstrumentedTransport`] - per-instance totals, in-flight, aborts, durations
//! - [`InstrumentIncomingStep`] - per-type totals, in-flight, errors, durations of handling
//! - [`InstrumentOutgoingStep`] - the same for sending

mod incoming;
mod outgoing;
mod transport;

pub use incoming::InstrumentIncomingStep;
pub use outgoing::InstrumentOutgoingStep;
pub use transport::InstrumentedTransport;

use tracing::warn;

use crate::metrics::{MetricLabels, MetricSet};

/// Count an error, logging instead of failing if the set has no error counter.
fn count_error(set: &MetricSet, labels: MetricLabels<'_>) {
    if let Err(e) = set.count_error(labels) {
        warn!(category = %set.category(), error = %e, "Cannot count error");
    }
}
