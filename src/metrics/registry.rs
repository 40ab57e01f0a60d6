//! Name-keyed metric registry.
//!
//! Every metric is defined at most once per registry. The first caller for a
//! name creates and registers the collector; later callers with the same
//! definition receive a clone of the same handle. Creation happens under the
//! definition lock, so racing first accesses cannot produce duplicate
//! collectors.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use prometheus::proto::MetricFamily;
use prometheus::{
    exponential_buckets, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tracing::debug;

use super::{MetricsError, Result, INSTANCE_LABEL, TYPE_LABEL};

/// Exponential histogram buckets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBuckets {
    pub start: f64,
    pub factor: f64,
    pub count: usize,
}

/// Buckets for every duration histogram: 1 ms doubling 16 times.
pub const DURATION_BUCKETS: ExponentialBuckets = ExponentialBuckets {
    start: 0.001,
    factor: 2.0,
    count: 16,
};

/// Kind of collector behind a metric name.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram(ExponentialBuckets),
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Counter => f.write_str("counter"),
            MetricKind::Gauge => f.write_str("gauge"),
            MetricKind::Histogram(b) => {
                write!(f, "histogram({}x{}^{})", b.start, b.factor, b.count)
            }
        }
    }
}

/// Ordered label names of a metric, fixed at definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelSchema {
    /// `{instance}`
    Instance,
    /// `{instance, type}`
    InstanceAndType,
}

impl LabelSchema {
    pub fn names(self) -> &'static [&'static str] {
        match self {
            LabelSchema::Instance => &[INSTANCE_LABEL],
            LabelSchema::InstanceAndType => &[INSTANCE_LABEL, TYPE_LABEL],
        }
    }
}

/// Everything needed to create a metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDefinition {
    pub name: &'static str,
    pub help: &'static str,
    pub labels: LabelSchema,
    pub kind: MetricKind,
}

impl MetricDefinition {
    pub const fn counter(name: &'static str, help: &'static str, labels: LabelSchema) -> Self {
        Self {
            name,
            help,
            labels,
            kind: MetricKind::Counter,
        }
    }

    pub const fn gauge(name: &'static str, help: &'static str, labels: LabelSchema) -> Self {
        Self {
            name,
            help,
            labels,
            kind: MetricKind::Gauge,
        }
    }

    pub const fn histogram(name: &'static str, help: &'static str, labels: LabelSchema) -> Self {
        Self {
            name,
            help,
            labels,
            kind: MetricKind::Histogram(DURATION_BUCKETS),
        }
    }

    fn signature(&self) -> String {
        format!("{} {:?}", self.kind, self.labels.names())
    }
}

/// Shared handle to a registered collector.
#[derive(Clone)]
pub enum MetricHandle {
    Counter(IntCounterVec),
    Gauge(IntGaugeVec),
    Histogram(HistogramVec),
}

impl MetricHandle {
    fn create(definition: &MetricDefinition) -> Result<Self> {
        let labels = definition.labels.names();
        let handle = match &definition.kind {
            MetricKind::Counter => MetricHandle::Counter(IntCounterVec::new(
                Opts::new(definition.name, definition.help),
                labels,
            )?),
            MetricKind::Gauge => MetricHandle::Gauge(IntGaugeVec::new(
                Opts::new(definition.name, definition.help),
                labels,
            )?),
            MetricKind::Histogram(b) => MetricHandle::Histogram(HistogramVec::new(
                HistogramOpts::new(definition.name, definition.help)
                    .buckets(exponential_buckets(b.start, b.factor, b.count)?),
                labels,
            )?),
        };
        Ok(handle)
    }

    fn register(&self, registry: &Registry) -> Result<()> {
        match self {
            MetricHandle::Counter(c) => registry.register(Box::new(c.clone()))?,
            MetricHandle::Gauge(g) => registry.register(Box::new(g.clone()))?,
            MetricHandle::Histogram(h) => registry.register(Box::new(h.clone()))?,
        }
        Ok(())
    }
}

struct Defined {
    definition: MetricDefinition,
    handle: MetricHandle,
}

static GLOBAL: LazyLock<Arc<MetricRegistry>> =
    LazyLock::new(|| Arc::new(MetricRegistry::with_registry(prometheus::default_registry().clone())));

/// Metric definitions backed by a `prometheus::Registry`.
pub struct MetricRegistry {
    registry: Registry,
    defined: Mutex<HashMap<&'static str, Defined>>,
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricRegistry {
    /// Registry with its own, empty `prometheus::Registry`.
    pub fn new() -> Self {
        Self::with_registry(Registry::new())
    }

    /// Define metrics into an existing `prometheus::Registry`.
    pub fn with_registry(registry: Registry) -> Self {
        Self {
            registry,
            defined: Mutex::new(HashMap::new()),
        }
    }

    /// Process-wide registry over `prometheus::default_registry()`.
    pub fn global() -> Arc<MetricRegistry> {
        Arc::clone(&GLOBAL)
    }

    /// Underlying prometheus registry.
    pub fn prometheus(&self) -> &Registry {
        &self.registry
    }

    fn defined(&self) -> MutexGuard<'_, HashMap<&'static str, Defined>> {
        self.defined.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the metric named by `definition`, creating it on first use.
    ///
    /// A name already defined with another kind or label schema is a
    /// [`MetricsError::Conflict`]. Help text is not compared.
    pub fn get_or_create(&self, definition: &MetricDefinition) -> Result<MetricHandle> {
        let mut defined = self.defined();

        if let Some(existing) = defined.get(definition.name) {
            if existing.definition.kind != definition.kind
                || existing.definition.labels != definition.labels
            {
                return Err(MetricsError::Conflict {
                    name: definition.name.to_string(),
                    existing: existing.definition.signature(),
                    requested: definition.signature(),
                });
            }
            return Ok(existing.handle.clone());
        }

        let handle = MetricHandle::create(definition)?;
        handle.register(&self.registry)?;
        debug!(metric = definition.name, kind = %definition.kind, "Defined metric");

        defined.insert(
            definition.name,
            Defined {
                definition: definition.clone(),
                handle: handle.clone(),
            },
        );
        Ok(handle)
    }

    pub fn counter(
        &self,
        name: &'static str,
        help: &'static str,
        labels: LabelSchema,
    ) -> Result<IntCounterVec> {
        let definition = MetricDefinition::counter(name, help, labels);
        match self.get_or_create(&definition)? {
            MetricHandle::Counter(c) => Ok(c),
            _ => Err(self.kind_conflict(&definition)),
        }
    }

    pub fn gauge(
        &self,
        name: &'static str,
        help: &'static str,
        labels: LabelSchema,
    ) -> Result<IntGaugeVec> {
        let definition = MetricDefinition::gauge(name, help, labels);
        match self.get_or_create(&definition)? {
            MetricHandle::Gauge(g) => Ok(g),
            _ => Err(self.kind_conflict(&definition)),
        }
    }

    /// Duration histogram with [`DURATION_BUCKETS`].
    pub fn histogram(
        &self,
        name: &'static str,
        help: &'static str,
        labels: LabelSchema,
    ) -> Result<HistogramVec> {
        let definition = MetricDefinition::histogram(name, help, labels);
        match self.get_or_create(&definition)? {
            MetricHandle::Histogram(h) => Ok(h),
            _ => Err(self.kind_conflict(&definition)),
        }
    }

    fn kind_conflict(&self, definition: &MetricDefinition) -> MetricsError {
        let existing = self
            .defined()
            .get(definition.name)
            .map(|d| d.definition.signature())
            .unwrap_or_default();
        MetricsError::Conflict {
            name: definition.name.to_string(),
            existing,
            requested: definition.signature(),
        }
    }

    /// Names defined so far.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.defined().keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Snapshot of every registered metric family.
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn export_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_concurrent_first_access_defines_once() {
        let registry = Arc::new(MetricRegistry::new());

        thread::scope(|scope| {
            for _ in 0..16 {
                let registry = Arc::clone(&registry);
                scope.spawn(move || {
                    registry
                        .counter("race_total", "Racing counter.", LabelSchema::Instance)
                        .unwrap()
                        .with_label_values(&["bus"])
                        .inc();
                });
            }
        });

        let families = registry.gather();
        let race: Vec<_> = families
            .iter()
            .filter(|f| f.get_name() == "race_total")
            .collect();
        assert_eq!(race.len(), 1);
        assert_eq!(race[0].get_metric()[0].get_counter().get_value(), 16.0);
        assert_eq!(registry.names(), vec!["race_total"]);
    }

    #[test]
    fn test_same_definition_returns_same_collector() {
        let registry = MetricRegistry::new();
        let first = registry
            .gauge("shared_total", "Shared.", LabelSchema::Instance)
            .unwrap();
        let second = registry
            .gauge("shared_total", "Shared.", LabelSchema::Instance)
            .unwrap();

        first.with_label_values(&["a"]).set(7);
        assert_eq!(second.with_label_values(&["a"]).get(), 7);
    }

    #[test]
    fn test_kind_mismatch_is_conflict() {
        let registry = MetricRegistry::new();
        registry
            .counter("clash_total", "Clash.", LabelSchema::Instance)
            .unwrap();

        let err = registry
            .gauge("clash_total", "Clash.", LabelSchema::Instance)
            .unwrap_err();
        assert!(matches!(err, MetricsError::Conflict { ref name, .. } if name == "clash_total"));
    }

    #[test]
    fn test_label_mismatch_is_conflict() {
        let registry = MetricRegistry::new();
        registry
            .counter("labels_total", "Labels.", LabelSchema::Instance)
            .unwrap();

        let result = registry.counter("labels_total", "Labels.", LabelSchema::InstanceAndType);
        assert!(matches!(result, Err(MetricsError::Conflict { .. })));
    }

    #[test]
    fn test_histogram_uses_exponential_buckets() {
        let registry = MetricRegistry::new();
        let histogram = registry
            .histogram("op_duration_seconds", "Durations.", LabelSchema::Instance)
            .unwrap();
        histogram.with_label_values(&["bus"]).observe(0.003);

        let family = registry
            .gather()
            .into_iter()
            .find(|f| f.get_name() == "op_duration_seconds")
            .unwrap();
        let buckets = family.get_metric()[0].get_histogram().get_bucket();
        assert_eq!(buckets.len(), 16);
        assert_eq!(buckets[0].get_upper_bound(), 0.001);
        assert_eq!(buckets[15].get_upper_bound(), 0.001 * 2f64.powi(15));
    }

    #[test]
    fn test_shared_prometheus_registry_sees_definitions() {
        let shared = Registry::new();
        let registry = MetricRegistry::with_registry(shared.clone());
        registry
            .gauge("shared_gauge", "Shared gauge.", LabelSchema::Instance)
            .unwrap()
            .with_label_values(&["bus"])
            .set(2);

        let names: Vec<_> = shared.gather().iter().map(|f| f.get_name().to_string()).collect();
        assert_eq!(names, vec!["shared_gauge"]);
        assert_eq!(registry.prometheus().gather().len(), 1);
    }

    #[test]
    fn test_export_text_includes_help_and_type() {
        let registry = MetricRegistry::new();
        registry
            .counter("exported_total", "Exported things.", LabelSchema::Instance)
            .unwrap()
            .with_label_values(&["bus"])
            .inc_by(3);

        let text = registry.export_text().unwrap();
        assert!(text.contains("# HELP exported_total Exported things."));
        assert!(text.contains("# TYPE exported_total counter"));
        assert!(text.contains("exported_total{instance=\"bus\"} 3"));
    }
}
