//! Metric sets per traffic category.
//!
//! | category           | total                           | failure                                 |
//! |--------------------|---------------------------------|-----------------------------------------|
//! | transport incoming | `messaging_incoming_total`      | `messaging_incoming_aborted_total`      |
//! | transport outgoing | `messaging_outgoing_total`      | `messaging_outgoing_aborted_total`      |
//! | message incoming   | `messaging_incoming_type_total` | `messaging_incoming_type_error_total`   |
//! | message outgoing   | `messaging_outgoing_type_total` | `messaging_outgoing_type_aborted_total` |
//!
//! Every category also has an `_in_flight_total` gauge and a
//! `_duration_seconds` histogram. Transport categories are labelled by
//! instance, message categories by instance and type.

use std::fmt;
use std::sync::{Arc, LazyLock, OnceLock};

use prometheus::{HistogramTimer, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec};

use super::registry::{LabelSchema, MetricDefinition, MetricRegistry};
use super::{MetricsError, Result};
use crate::bus::message::UNKNOWN_MESSAGE_TYPE;

// ============================================================================
// Definitions
// ============================================================================

const WORKERS: MetricDefinition = MetricDefinition::gauge(
    "messaging_workers_total",
    "The total number of workers processing messages.",
    LabelSchema::Instance,
);

/// Traffic category a [`MetricSet`] covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    TransportIncoming,
    TransportOutgoing,
    MessageIncoming,
    MessageOutgoing,
}

/// Failure counter of a category: transport categories count transaction
/// aborts, message categories count errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Aborted,
    Errors,
}

struct CategoryDefinition {
    total: MetricDefinition,
    in_flight: MetricDefinition,
    failure: (Failure, MetricDefinition),
    duration: MetricDefinition,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::TransportIncoming,
        Category::TransportOutgoing,
        Category::MessageIncoming,
        Category::MessageOutgoing,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Category::TransportIncoming => "transport-incoming",
            Category::TransportOutgoing => "transport-outgoing",
            Category::MessageIncoming => "message-incoming",
            Category::MessageOutgoing => "message-outgoing",
        }
    }

    pub fn labels(self) -> LabelSchema {
        match self {
            Category::TransportIncoming | Category::TransportOutgoing => LabelSchema::Instance,
            Category::MessageIncoming | Category::MessageOutgoing => LabelSchema::InstanceAndType,
        }
    }

    fn definition(self) -> CategoryDefinition {
        let labels = self.labels();
        match self {
            Category::TransportIncoming => CategoryDefinition {
                total: MetricDefinition::counter(
                    "messaging_incoming_total",
                    "The total incoming messages.",
                    labels,
                ),
                in_flight: MetricDefinition::gauge(
                    "messaging_incoming_in_flight_total",
                    "The total incoming messages currently being processed.",
                    labels,
                ),
                failure: (
                    Failure::Aborted,
                    MetricDefinition::counter(
                        "messaging_incoming_aborted_total",
                        "The total of incoming messages for which the transaction was aborted.",
                        labels,
                    ),
                ),
                duration: MetricDefinition::histogram(
                    "messaging_incoming_duration_seconds",
                    "The duration of incoming messages processed.",
                    labels,
                ),
            },
            Category::TransportOutgoing => CategoryDefinition {
                total: MetricDefinition::counter(
                    "messaging_outgoing_total",
                    "The total outgoing messages.",
                    labels,
                ),
                in_flight: MetricDefinition::gauge(
                    "messaging_outgoing_in_flight_total",
                    "The total outgoing messages currently being sent.",
                    labels,
                ),
                failure: (
                    Failure::Aborted,
                    MetricDefinition::counter(
                        "messaging_outgoing_aborted_total",
                        "The total of outgoing messages for which the transaction was aborted.",
                        labels,
                    ),
                ),
                duration: MetricDefinition::histogram(
                    "messaging_outgoing_duration_seconds",
                    "The duration of outgoing messages sent.",
                    labels,
                ),
            },
            Category::MessageIncoming => CategoryDefinition {
                total: MetricDefinition::counter(
                    "messaging_incoming_type_total",
                    "The total incoming messages per type.",
                    labels,
                ),
                in_flight: MetricDefinition::gauge(
                    "messaging_incoming_type_in_flight_total",
                    "The total incoming messages per type currently being processed.",
                    labels,
                ),
                failure: (
                    Failure::Errors,
                    MetricDefinition::counter(
                        "messaging_incoming_type_error_total",
                        "The total of incoming messages per type which resulted in an error.",
                        labels,
                    ),
                ),
                duration: MetricDefinition::histogram(
                    "messaging_incoming_type_duration_seconds",
                    "The duration of incoming messages per type processed.",
                    labels,
                ),
            },
            // The outgoing error counter keeps its historical `_aborted_total` name.
            Category::MessageOutgoing => CategoryDefinition {
                total: MetricDefinition::counter(
                    "messaging_outgoing_type_total",
                    "The total outgoing messages per type.",
                    labels,
                ),
                in_flight: MetricDefinition::gauge(
                    "messaging_outgoing_type_in_flight_total",
                    "The total outgoing messages per type currently being sent.",
                    labels,
                ),
                failure: (
                    Failure::Errors,
                    MetricDefinition::counter(
                        "messaging_outgoing_type_aborted_total",
                        "The total of outgoing messages per type which resulted in an error.",
                        labels,
                    ),
                ),
                duration: MetricDefinition::histogram(
                    "messaging_outgoing_type_duration_seconds",
                    "The duration of outgoing messages per type sent.",
                    labels,
                ),
            },
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// MetricSet
// ============================================================================

/// Label values for one observation.
///
/// `message_type` is ignored by instance-only categories and defaults to
/// `"<unknown>"` for typed ones.
#[derive(Debug, Clone, Copy)]
pub struct MetricLabels<'a> {
    pub instance: &'a str,
    pub message_type: Option<&'a str>,
}

impl<'a> MetricLabels<'a> {
    pub fn instance(instance: &'a str) -> Self {
        Self {
            instance,
            message_type: None,
        }
    }

    pub fn typed(instance: &'a str, message_type: &'a str) -> Self {
        Self {
            instance,
            message_type: Some(message_type),
        }
    }
}

/// Total, in-flight, failure and duration metrics of one category.
pub struct MetricSet {
    category: Category,
    total: IntCounterVec,
    in_flight: IntGaugeVec,
    aborted: Option<IntCounterVec>,
    errors: Option<IntCounterVec>,
    duration: HistogramVec,
}

impl MetricSet {
    /// Define (or look up) the metrics of `category` in `registry`.
    pub fn define(registry: &MetricRegistry, category: Category) -> Result<Self> {
        let definition = category.definition();
        let (failure, failure_definition) = definition.failure;
        let failure_counter = registry.counter(
            failure_definition.name,
            failure_definition.help,
            failure_definition.labels,
        )?;

        Ok(Self {
            category,
            total: registry.counter(
                definition.total.name,
                definition.total.help,
                definition.total.labels,
            )?,
            in_flight: registry.gauge(
                definition.in_flight.name,
                definition.in_flight.help,
                definition.in_flight.labels,
            )?,
            aborted: (failure == Failure::Aborted).then(|| failure_counter.clone()),
            errors: (failure == Failure::Errors).then_some(failure_counter),
            duration: registry.histogram(
                definition.duration.name,
                definition.duration.help,
                definition.duration.labels,
            )?,
        })
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn total(&self) -> &IntCounterVec {
        &self.total
    }

    pub fn in_flight(&self) -> &IntGaugeVec {
        &self.in_flight
    }

    /// Transaction-abort counter. Transport categories only.
    pub fn aborted(&self) -> Result<&IntCounterVec> {
        self.aborted.as_ref().ok_or(MetricsError::Unsupported {
            category: self.category.name(),
            field: "aborted",
        })
    }

    /// Error counter. Message categories only.
    pub fn errors(&self) -> Result<&IntCounterVec> {
        self.errors.as_ref().ok_or(MetricsError::Unsupported {
            category: self.category.name(),
            field: "errors",
        })
    }

    pub fn duration(&self) -> &HistogramVec {
        &self.duration
    }

    fn values<'a>(&self, labels: &MetricLabels<'a>) -> Vec<&'a str> {
        match self.category.labels() {
            LabelSchema::Instance => vec![labels.instance],
            LabelSchema::InstanceAndType => vec![
                labels.instance,
                labels.message_type.unwrap_or(UNKNOWN_MESSAGE_TYPE),
            ],
        }
    }

    /// Count an operation and open its bracket: in-flight up, timer started.
    pub fn begin(&self, labels: MetricLabels<'_>) -> OperationBracket {
        let values = self.values(&labels);
        self.total.with_label_values(&values).inc();

        let in_flight = self.in_flight.with_label_values(&values);
        in_flight.inc();

        OperationBracket {
            in_flight,
            timer: Some(self.duration.with_label_values(&values).start_timer()),
        }
    }

    /// Abort counter child for `labels`, for use in deferred callbacks.
    pub fn aborted_counter(&self, labels: MetricLabels<'_>) -> Result<IntCounter> {
        let values = self.values(&labels);
        Ok(self.aborted()?.with_label_values(&values))
    }

    pub fn count_error(&self, labels: MetricLabels<'_>) -> Result<()> {
        let values = self.values(&labels);
        self.errors()?.with_label_values(&values).inc();
        Ok(())
    }
}

/// Open measurement of one operation.
///
/// Dropping the bracket decrements the in-flight gauge and records the
/// elapsed time, exactly once.
#[must_use = "dropping the bracket ends the measurement"]
pub struct OperationBracket {
    in_flight: IntGauge,
    timer: Option<HistogramTimer>,
}

impl OperationBracket {
    /// End the measurement now.
    pub fn finish(self) {}
}

impl Drop for OperationBracket {
    fn drop(&mut self) {
        self.in_flight.dec();
        if let Some(timer) = self.timer.take() {
            timer.observe_duration();
        }
    }
}

// ============================================================================
// Counters
// ============================================================================

static GLOBAL: LazyLock<Arc<Counters>> =
    LazyLock::new(|| Arc::new(Counters::new(MetricRegistry::global())));

/// Lazily defined metric sets over one [`MetricRegistry`].
///
/// # Panics
///
/// Accessors panic if the registry already holds a metric of the same name
/// with a different kind or label schema.
pub struct Counters {
    registry: Arc<MetricRegistry>,
    incoming_transport: OnceLock<MetricSet>,
    outgoing_transport: OnceLock<MetricSet>,
    incoming_messages: OnceLock<MetricSet>,
    outgoing_messages: OnceLock<MetricSet>,
    workers: OnceLock<IntGaugeVec>,
}

impl Counters {
    pub fn new(registry: Arc<MetricRegistry>) -> Self {
        Self {
            registry,
            incoming_transport: OnceLock::new(),
            outgoing_transport: OnceLock::new(),
            incoming_messages: OnceLock::new(),
            outgoing_messages: OnceLock::new(),
            workers: OnceLock::new(),
        }
    }

    /// Counters over [`MetricRegistry::global`].
    pub fn global() -> Arc<Counters> {
        Arc::clone(&GLOBAL)
    }

    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }

    fn set<'a>(&'a self, cell: &'a OnceLock<MetricSet>, category: Category) -> &'a MetricSet {
        cell.get_or_init(|| {
            MetricSet::define(&self.registry, category)
                .unwrap_or_else(|e| panic!("cannot define {category} metrics: {e}"))
        })
    }

    pub fn incoming_transport(&self) -> &MetricSet {
        self.set(&self.incoming_transport, Category::TransportIncoming)
    }

    pub fn outgoing_transport(&self) -> &MetricSet {
        self.set(&self.outgoing_transport, Category::TransportOutgoing)
    }

    pub fn incoming_messages(&self) -> &MetricSet {
        self.set(&self.incoming_messages, Category::MessageIncoming)
    }

    pub fn outgoing_messages(&self) -> &MetricSet {
        self.set(&self.outgoing_messages, Category::MessageOutgoing)
    }

    /// Metric set of `category`.
    pub fn category(&self, category: Category) -> &MetricSet {
        match category {
            Category::TransportIncoming => self.incoming_transport(),
            Category::TransportOutgoing => self.outgoing_transport(),
            Category::MessageIncoming => self.incoming_messages(),
            Category::MessageOutgoing => self.outgoing_messages(),
        }
    }

    /// Worker count gauge, labelled by instance.
    pub fn workers(&self) -> &IntGaugeVec {
        self.workers.get_or_init(|| {
            self.registry
                .gauge(WORKERS.name, WORKERS.help, WORKERS.labels)
                .unwrap_or_else(|e| panic!("cannot define worker metrics: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters() -> Counters {
        Counters::new(Arc::new(MetricRegistry::new()))
    }

    #[test]
    fn test_all_names_are_defined() {
        let counters = counters();
        for category in Category::ALL {
            counters.category(category);
        }
        counters.workers();

        assert_eq!(
            counters.registry().names(),
            vec![
                "messaging_incoming_aborted_total",
                "messaging_incoming_duration_seconds",
                "messaging_incoming_in_flight_total",
                "messaging_incoming_total",
                "messaging_incoming_type_duration_seconds",
                "messaging_incoming_type_error_total",
                "messaging_incoming_type_in_flight_total",
                "messaging_incoming_type_total",
                "messaging_outgoing_aborted_total",
                "messaging_outgoing_duration_seconds",
                "messaging_outgoing_in_flight_total",
                "messaging_outgoing_total",
                "messaging_outgoing_type_aborted_total",
                "messaging_outgoing_type_duration_seconds",
                "messaging_outgoing_type_in_flight_total",
                "messaging_outgoing_type_total",
                "messaging_workers_total",
            ]
        );
    }

    #[test]
    fn test_accessors_define_each_set_once() {
        let counters = counters();

        let first = counters.incoming_transport();
        let again = counters.category(Category::TransportIncoming);
        assert!(std::ptr::eq(first, again));
        assert!(std::ptr::eq(
            counters.outgoing_messages(),
            counters.outgoing_messages()
        ));

        first.total().with_label_values(&["bus"]).inc();
        assert_eq!(again.total().with_label_values(&["bus"]).get(), 1);
    }

    #[test]
    fn test_unsupported_fields_are_errors() {
        let counters = counters();

        assert!(counters.incoming_transport().aborted().is_ok());
        assert!(matches!(
            counters.incoming_transport().errors(),
            Err(MetricsError::Unsupported { field: "errors", .. })
        ));
        assert!(counters.outgoing_messages().errors().is_ok());
        assert!(matches!(
            counters.outgoing_messages().aborted(),
            Err(MetricsError::Unsupported { field: "aborted", .. })
        ));
        assert!(counters
            .incoming_messages()
            .count_error(MetricLabels::instance("bus"))
            .is_ok());
        assert!(counters
            .outgoing_transport()
            .count_error(MetricLabels::instance("bus"))
            .is_err());
    }

    #[test]
    fn test_bracket_balances_in_flight_and_times_once() {
        let counters = counters();
        let set = counters.incoming_messages();
        let labels = MetricLabels::typed("bus", "Ping");

        let bracket = set.begin(labels);
        assert_eq!(set.total().with_label_values(&["bus", "Ping"]).get(), 1);
        assert_eq!(set.in_flight().with_label_values(&["bus", "Ping"]).get(), 1);

        bracket.finish();
        assert_eq!(set.in_flight().with_label_values(&["bus", "Ping"]).get(), 0);
        assert_eq!(
            set.duration()
                .with_label_values(&["bus", "Ping"])
                .get_sample_count(),
            1
        );
    }

    #[test]
    fn test_missing_type_label_is_unknown() {
        let counters = counters();
        let set = counters.outgoing_messages();

        drop(set.begin(MetricLabels::instance("bus")));

        assert_eq!(
            set.total()
                .with_label_values(&["bus", UNKNOWN_MESSAGE_TYPE])
                .get(),
            1
        );
    }

    #[test]
    #[should_panic(expected = "cannot define transport-incoming metrics")]
    fn test_conflicting_registry_panics_on_first_access() {
        let registry = Arc::new(MetricRegistry::new());
        registry
            .gauge("messaging_incoming_total", "Wrong kind.", LabelSchema::Instance)
            .unwrap();

        Counters::new(registry).incoming_transport();
    }

    #[test]
    fn test_global_is_shared() {
        assert!(Arc::ptr_eq(&Counters::global(), &Counters::global()));
    }
}
