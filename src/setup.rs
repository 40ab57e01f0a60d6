//! Entry point that wires metrics into a bus being configured.
//!
//! ```ignore
//! let bus = BusBuilder::new(network, "orders")
//!     .enable_metrics(MetricsOptions::new().with_message_metrics(true))
//!     .start()?;
//! ```

use std::any::Any;
use std::sync::Arc;

use tracing::info;

use crate::advice::{InstrumentIncomingStep, InstrumentOutgoingStep, InstrumentedTransport};
use crate::bus::{Bus, BusConfigurer, ErrorTracker, Pipeline, Transport};
use crate::config::MetricsOptions;
use crate::identity::bus_name;
use crate::metrics::Counters;
use crate::sampler::InstanceMetrics;

/// Enable metrics using the process-wide [`Counters::global`].
pub fn enable_metrics<C: BusConfigurer + ?Sized>(configurer: &mut C, options: MetricsOptions) {
    enable_metrics_with(configurer, options, Counters::global());
}

/// Enable metrics recorded into `counters`.
///
/// The transport decorator and the worker sampler are always installed.
/// The per-type pipeline steps are only inserted when
/// `options.message_metrics` is set.
pub fn enable_metrics_with<C: BusConfigurer + ?Sized>(
    configurer: &mut C,
    options: MetricsOptions,
    counters: Arc<Counters>,
) {
    let MetricsOptions {
        message_metrics,
        instance_name,
        count_unidentified_as_error,
    } = options;

    {
        let counters = Arc::clone(&counters);
        let instance_name = instance_name.clone();
        configurer.decorate_transport(Box::new(move |transport: Arc<dyn Transport>| {
            Arc::new(InstrumentedTransport::new(transport, counters).with_instance_name(instance_name))
                as Arc<dyn Transport>
        }));
    }

    if message_metrics {
        let counters = Arc::clone(&counters);
        let instance_name = instance_name.clone();
        configurer.decorate_pipeline(Box::new(
            move |pipeline: &mut Pipeline, tracker: &Arc<dyn ErrorTracker>| {
                pipeline.prepend_incoming(Arc::new(
                    InstrumentIncomingStep::new(Arc::clone(&counters), Arc::clone(tracker))
                        .with_instance_name(instance_name.clone())
                        .with_count_unidentified_as_error(count_unidentified_as_error),
                ));
                pipeline.prepend_outgoing(Arc::new(
                    InstrumentOutgoingStep::new(counters).with_instance_name(instance_name),
                ));
            },
        ));
    }

    configurer.attach(Box::new(move |bus: &dyn Bus| {
        let instance = instance_name.unwrap_or_else(|| bus_name(Some(bus)));
        info!(instance = %instance, message_metrics, "Metrics enabled");

        let gauge = counters.workers().with_label_values(&[instance.as_str()]);
        Box::new(InstanceMetrics::new(
            bus.advanced(),
            &bus.lifetime_events(),
            gauge,
        )) as Box<dyn Any + Send + Sync>
    }));
}

/// Builder-style access to [`enable_metrics`].
pub trait MetricsConfigurerExt: BusConfigurer + Sized {
    fn enable_metrics(mut self, options: MetricsOptions) -> Self {
        enable_metrics(&mut self, options);
        self
    }

    fn enable_metrics_with(mut self, options: MetricsOptions, counters: Arc<Counters>) -> Self {
        enable_metrics_with(&mut self, options, counters);
        self
    }
}

impl<T: BusConfigurer> MetricsConfigurerExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusBuilder, InMemNetwork};
    use crate::metrics::MetricRegistry;

    fn counters() -> Arc<Counters> {
        Arc::new(Counters::new(Arc::new(MetricRegistry::new())))
    }

    #[tokio::test]
    async fn test_message_steps_are_prepended_when_enabled() {
        let bus = BusBuilder::new(InMemNetwork::new(), "setup-on")
            .enable_metrics_with(MetricsOptions::new().with_message_metrics(true), counters())
            .start()
            .unwrap();

        let incoming = bus.pipeline().incoming_names();
        let outgoing = bus.pipeline().outgoing_names();
        assert!(incoming[0].ends_with("InstrumentIncomingStep"));
        assert!(outgoing[0].ends_with("InstrumentOutgoingStep"));
        assert_eq!(incoming.len(), 4);

        bus.dispose().await;
    }

    #[tokio::test]
    async fn test_message_steps_are_absent_when_disabled() {
        let bus = BusBuilder::new(InMemNetwork::new(), "setup-off")
            .enable_metrics_with(MetricsOptions::new(), counters())
            .start()
            .unwrap();

        assert!(!bus
            .pipeline()
            .incoming_names()
            .iter()
            .any(|name| name.ends_with("InstrumentIncomingStep")));
        assert_eq!(bus.pipeline().outgoing_names().len(), 1);

        bus.dispose().await;
    }

    #[tokio::test]
    async fn test_sampler_uses_instance_override() {
        let counters = counters();
        let bus = BusBuilder::new(InMemNetwork::new(), "setup-sampler")
            .with_workers(2)
            .enable_metrics_with(
                MetricsOptions::new().with_instance_name("configured"),
                Arc::clone(&counters),
            )
            .start()
            .unwrap();

        let workers = counters.workers().with_label_values(&["configured"]);
        assert_eq!(workers.get(), 2);

        bus.dispose().await;
        assert_eq!(workers.get(), 0);
    }

    #[tokio::test]
    async fn test_sampler_defaults_to_bus_name() {
        let counters = counters();
        let bus = BusBuilder::new(InMemNetwork::new(), "setup-named")
            .with_name("Rebus 9")
            .enable_metrics_with(MetricsOptions::new(), Arc::clone(&counters))
            .start()
            .unwrap();

        assert_eq!(counters.workers().with_label_values(&["Rebus 9"]).get(), 1);
        bus.dispose().await;
    }
}
