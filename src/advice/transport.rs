//! Transport decorator.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::bus::{Result, TransactionContext, Transport, TransportMessage};
use crate::identity::resolve_instance;
use crate::metrics::{Counters, MetricLabels, MetricSet};

/// Wraps a transport with per-instance metrics.
///
/// Every send, and every receive that yields a message, is counted and
/// bracketed. The bracket closes when the transaction context is disposed,
/// so it covers the whole transaction, not only the transport call. Aborted
/// transactions are counted separately.
///
/// # Example
///
/// ```ignore
/// let transport = InstrumentedTransport::new(inner, Counters::global())
///     .with_instance_name(Some("orders".to_string()));
/// ```
pub struct InstrumentedTransport {
    inner: Arc<dyn Transport>,
    counters: Arc<Counters>,
    instance: Option<String>,
}

impl InstrumentedTransport {
    pub fn new(inner: Arc<dyn Transport>, counters: Arc<Counters>) -> Self {
        Self {
            inner,
            counters,
            instance: None,
        }
    }

    /// Fixed instance label instead of the owning bus's name.
    pub fn with_instance_name(mut self, instance: Option<String>) -> Self {
        self.instance = instance;
        self
    }

    pub fn inner(&self) -> &Arc<dyn Transport> {
        &self.inner
    }

    fn instrument(&self, set: &MetricSet, context: &dyn TransactionContext) {
        let instance = resolve_instance(self.instance.as_deref(), context);
        let labels = MetricLabels::instance(&instance);

        let bracket = set.begin(labels);
        match set.aborted_counter(labels) {
            Ok(aborted) => context.on_aborted(Box::new(move || aborted.inc())),
            Err(e) => warn!(category = %set.category(), error = %e, "Cannot count aborts"),
        }
        context.on_disposed(Box::new(move || bracket.finish()));
        debug!(category = %set.category(), instance = %instance, "Transport operation instrumented");
    }
}

#[async_trait]
impl Transport for InstrumentedTransport {
    fn create_queue(&self, address: &str) -> Result<()> {
        self.inner.create_queue(address)
    }

    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        context: &dyn TransactionContext,
    ) -> Result<()> {
        self.instrument(self.counters.outgoing_transport(), context);
        self.inner.send(destination, message, context).await
    }

    async fn receive(&self, context: &dyn TransactionContext) -> Result<Option<TransportMessage>> {
        let message = self.inner.receive(context).await?;
        if message.is_some() {
            self.instrument(self.counters.incoming_transport(), context);
        }
        Ok(message)
    }

    fn address(&self) -> &str {
        self.inner.address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, BusError, DefaultTransactionContext, Headers, MockBus, MockTransport};
    use crate::metrics::MetricRegistry;

    struct Fixture {
        mock: Arc<MockTransport>,
        counters: Arc<Counters>,
        transport: InstrumentedTransport,
    }

    fn fixture() -> Fixture {
        let mock = Arc::new(MockTransport::new("input"));
        let counters = Arc::new(Counters::new(Arc::new(MetricRegistry::new())));
        let transport = InstrumentedTransport::new(mock.clone(), Arc::clone(&counters));
        Fixture {
            mock,
            counters,
            transport,
        }
    }

    fn message() -> TransportMessage {
        TransportMessage::new(Headers::new(), b"{}".to_vec())
    }

    fn get(set: &MetricSet, instance: &str) -> (u64, i64, u64, u64) {
        let labels = [instance];
        (
            set.total().with_label_values(&labels).get(),
            set.in_flight().with_label_values(&labels).get(),
            set.aborted().unwrap().with_label_values(&labels).get(),
            set.duration().with_label_values(&labels).get_sample_count(),
        )
    }

    #[tokio::test]
    async fn test_send_brackets_until_dispose() {
        let f = fixture();
        let bus: Arc<dyn Bus> = Arc::new(MockBus::new("RebusBus sender"));
        let ctx = DefaultTransactionContext::with_owning_bus(Arc::downgrade(&bus));

        f.transport.send("out", message(), &ctx).await.unwrap();
        assert_eq!(get(f.counters.outgoing_transport(), "sender"), (1, 1, 0, 0));

        ctx.complete();
        ctx.dispose();
        assert_eq!(get(f.counters.outgoing_transport(), "sender"), (1, 0, 0, 1));
        assert_eq!(f.mock.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_aborted_send_is_counted() {
        let f = fixture();
        let ctx = DefaultTransactionContext::new();

        f.transport.send("out", message(), &ctx).await.unwrap();
        ctx.rollback();
        ctx.dispose();

        assert_eq!(get(f.counters.outgoing_transport(), "<unknown>"), (1, 0, 1, 1));
    }

    #[tokio::test]
    async fn test_failed_send_still_balances() {
        let f = fixture();
        f.mock.set_fail_on_send(true);
        let ctx = DefaultTransactionContext::new();

        let result = f.transport.send("out", message(), &ctx).await;
        assert!(matches!(result, Err(BusError::Transport(_))));
        assert_eq!(get(f.counters.outgoing_transport(), "<unknown>").1, 1);

        ctx.rollback();
        ctx.dispose();
        assert_eq!(get(f.counters.outgoing_transport(), "<unknown>"), (1, 0, 1, 1));
    }

    #[tokio::test]
    async fn test_empty_receive_is_not_counted() {
        let f = fixture();
        let ctx = DefaultTransactionContext::new();

        assert!(f.transport.receive(&ctx).await.unwrap().is_none());
        ctx.dispose();

        assert_eq!(get(f.counters.incoming_transport(), "<unknown>"), (0, 0, 0, 0));
    }

    #[tokio::test]
    async fn test_receive_uses_instance_override() {
        let f = fixture();
        let transport = f.transport.with_instance_name(Some("configured".to_string()));
        f.mock.push_incoming(message());
        let ctx = DefaultTransactionContext::new();

        assert!(transport.receive(&ctx).await.unwrap().is_some());
        assert_eq!(get(f.counters.incoming_transport(), "configured"), (1, 1, 0, 0));

        drop(ctx);
        assert_eq!(get(f.counters.incoming_transport(), "configured"), (1, 0, 0, 1));
    }

    #[tokio::test]
    async fn test_passthrough_members() {
        let f = fixture();
        assert_eq!(f.transport.address(), "input");
        assert_eq!(f.transport.inner().address(), "input");
        assert!(f.transport.create_queue("other").is_ok());
    }
}
