//! Prometheus metric definitions.
//!
//! - `registry`: name-keyed, single-flight metric creation over a
//!   `prometheus::Registry`, plus text exposition
//! - `counters`: the metric sets for each traffic category and the
//!   worker gauge

pub mod counters;
pub mod registry;

pub use counters::{Category, Counters, MetricLabels, MetricSet, OperationBracket};
pub use registry::{
    ExponentialBuckets, LabelSchema, MetricDefinition, MetricHandle, MetricKind, MetricRegistry,
    DURATION_BUCKETS,
};

/// Label carrying the resolved bus instance name.
pub const INSTANCE_LABEL: &str = "instance";
/// Label carrying the message type.
pub const TYPE_LABEL: &str = "type";

/// Result type for metric definition.
pub type Result<T> = std::result::Result<T, MetricsError>;

/// Errors raised while defining or exporting metrics.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Metric '{name}' already defined as {existing}, requested {requested}")]
    Conflict {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("Category '{category}' has no '{field}' metric")]
    Unsupported {
        category: &'static str,
        field: &'static str,
    },

    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Exposition is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}
