//! Worker count sampling.
//!
//! The `InstanceMetrics` sampler keeps the `messaging_workers_total` gauge of
//! one bus current. It resamples on every bus lifetime event and on a fixed
//! interval while the bus runs.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use prometheus::IntGauge;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{AdvancedApi, BusLifetimeEvents, LifetimeEvent, LifetimeHandler, Subscription};

/// How often the worker count is resampled.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

struct Running {
    subscriptions: Vec<Subscription>,
    task: Option<JoinHandle<()>>,
}

/// Publishes a bus's worker count.
///
/// Lives as long as the bus it samples; dropping it stops sampling.
pub struct InstanceMetrics {
    running: Mutex<Option<Running>>,
}

impl InstanceMetrics {
    /// Start sampling `advanced` into `gauge` every [`SAMPLE_INTERVAL`].
    pub fn new(
        advanced: Arc<dyn AdvancedApi>,
        events: &Arc<BusLifetimeEvents>,
        gauge: IntGauge,
    ) -> Self {
        Self::with_interval(advanced, events, gauge, SAMPLE_INTERVAL)
    }

    /// Start sampling with a custom interval.
    ///
    /// Samples once immediately. Without a tokio runtime only lifetime
    /// events trigger later samples.
    pub fn with_interval(
        advanced: Arc<dyn AdvancedApi>,
        events: &Arc<BusLifetimeEvents>,
        gauge: IntGauge,
        interval: Duration,
    ) -> Self {
        let sample: LifetimeHandler = Arc::new(move || {
            let workers = advanced.worker_count();
            gauge.set(i64::try_from(workers).unwrap_or(i64::MAX));
        });

        let subscriptions = LifetimeEvent::ALL
            .into_iter()
            .map(|event| events.subscribe(event, Arc::clone(&sample)))
            .collect();
        sample();

        let task = match Handle::try_current() {
            Ok(handle) => {
                let sample = Arc::clone(&sample);
                Some(handle.spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    loop {
                        ticker.tick().await;
                        sample();
                    }
                }))
            }
            Err(_) => {
                warn!("No tokio runtime, worker count is only sampled on lifetime events");
                None
            }
        };

        Self {
            running: Mutex::new(Some(Running {
                subscriptions,
                task,
            })),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop sampling. Later calls do nothing.
    pub fn dispose(&self) {
        let Some(running) = self.running().take() else {
            return;
        };
        if let Some(task) = running.task {
            task.abort();
        }
        drop(running.subscriptions);
        debug!("Instance metrics disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.running().is_none()
    }
}

impl Drop for InstanceMetrics {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockAdvancedApi;
    use prometheus::Opts;

    fn gauge() -> IntGauge {
        IntGauge::with_opts(Opts::new("workers_test", "Workers.")).unwrap()
    }

    fn setup() -> (Arc<MockAdvancedApi>, Arc<BusLifetimeEvents>, IntGauge) {
        (
            Arc::new(MockAdvancedApi::default()),
            BusLifetimeEvents::new(),
            gauge(),
        )
    }

    #[tokio::test]
    async fn test_lifetime_events_resample() {
        let (advanced, events, gauge) = setup();
        let sampler = InstanceMetrics::new(advanced.clone(), &events, gauge.clone());
        assert_eq!(events.listener_count(), LifetimeEvent::ALL.len());

        advanced.set_worker_count(3);
        events.raise(LifetimeEvent::Started);
        assert_eq!(gauge.get(), 3);

        advanced.set_worker_count(0);
        events.raise(LifetimeEvent::WorkersStopped);
        assert_eq!(gauge.get(), 0);

        sampler.dispose();
    }

    #[tokio::test]
    async fn test_periodic_resample() {
        let (advanced, events, gauge) = setup();
        let _sampler = InstanceMetrics::with_interval(
            advanced.clone(),
            &events,
            gauge.clone(),
            Duration::from_millis(5),
        );

        advanced.set_worker_count(2);
        for _ in 0..200 {
            if gauge.get() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(gauge.get(), 2);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_unsubscribes() {
        let (advanced, events, gauge) = setup();
        let sampler = InstanceMetrics::with_interval(
            advanced.clone(),
            &events,
            gauge.clone(),
            Duration::from_secs(3600),
        );

        sampler.dispose();
        sampler.dispose();
        assert!(sampler.is_disposed());
        assert_eq!(events.listener_count(), 0);

        advanced.set_worker_count(5);
        events.raise(LifetimeEvent::Started);
        assert_eq!(gauge.get(), 0);
    }

    #[tokio::test]
    async fn test_drop_disposes() {
        let (advanced, events, gauge) = setup();
        drop(InstanceMetrics::new(advanced, &events, gauge));
        assert_eq!(events.listener_count(), 0);
    }

    #[test]
    fn test_without_runtime_samples_on_events() {
        let (advanced, events, gauge) = setup();
        advanced.set_worker_count(1);
        let _sampler = InstanceMetrics::new(advanced.clone(), &events, gauge.clone());
        assert_eq!(gauge.get(), 1);

        advanced.set_worker_count(4);
        events.raise(LifetimeEvent::Starting);
        assert_eq!(gauge.get(), 4);
    }
}
