//! Shared utilities for integration tests.
//!
//! Provides a per-test metrics registry and helpers for reading values
//! back out of the Prometheus text exposition.

#![allow(dead_code)]

use std::sync::Arc;

use messaging_metrics::metrics::{Counters, MetricRegistry};

/// Counters over a fresh registry, isolated from other tests.
pub fn isolated_counters() -> Arc<Counters> {
    Arc::new(Counters::new(Arc::new(MetricRegistry::new())))
}

/// Renders label pairs the way the text encoder does: `{a="x",b="y"}`.
pub fn labels(pairs: &[(&str, &str)]) -> String {
    let rendered: Vec<String> = pairs
        .iter()
        .map(|(name, value)| format!("{name}=\"{value}\""))
        .collect();
    format!("{{{}}}", rendered.join(","))
}

/// Value of the sample `name{labels}` in `exposition`, if present.
pub fn sample(exposition: &str, name: &str, labels: &str) -> Option<f64> {
    let series = format!("{name}{labels} ");
    exposition
        .lines()
        .find_map(|line| line.strip_prefix(series.as_str()))
        .and_then(|value| value.trim().parse().ok())
}

/// Current value of `name{labels}` in `counters`' registry, 0 if absent.
pub fn current(counters: &Counters, name: &str, labels: &str) -> f64 {
    counters
        .registry()
        .export_text()
        .ok()
        .and_then(|text| sample(&text, name, labels))
        .unwrap_or(0.0)
}
