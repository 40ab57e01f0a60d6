//! In-process queues and the transport on top of them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::bus::{BusError, Result, TransactionContext, Transport, TransportMessage};

/// Named in-process queues shared by every bus connected to the network.
#[derive(Default)]
pub struct InMemNetwork {
    queues: Mutex<HashMap<String, VecDeque<TransportMessage>>>,
}

impl InMemNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, VecDeque<TransportMessage>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_queue(&self, address: &str) {
        self.queues().entry(address.to_string()).or_default();
    }

    pub fn has_queue(&self, address: &str) -> bool {
        self.queues().contains_key(address)
    }

    /// Append `message` to `address`, creating the queue if needed.
    pub fn deliver(&self, address: &str, message: TransportMessage) {
        self.queues()
            .entry(address.to_string())
            .or_default()
            .push_back(message);
    }

    /// Remove the oldest message from `address`.
    pub fn take(&self, address: &str) -> Option<TransportMessage> {
        self.queues().get_mut(address).and_then(VecDeque::pop_front)
    }

    /// Number of messages waiting in `address`.
    pub fn count(&self, address: &str) -> usize {
        self.queues().get(address).map_or(0, VecDeque::len)
    }
}

/// Transport over an [`InMemNetwork`].
///
/// Sends become visible when the sending transaction commits. A received
/// message goes back to the queue when its transaction aborts.
pub struct InMemTransport {
    network: Arc<InMemNetwork>,
    address: String,
}

impl InMemTransport {
    pub fn new(network: Arc<InMemNetwork>, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
        }
    }
}

#[async_trait]
impl Transport for InMemTransport {
    fn create_queue(&self, address: &str) -> Result<()> {
        if address.is_empty() {
            return Err(BusError::QueueNotFound(address.to_string()));
        }
        self.network.create_queue(address);
        Ok(())
    }

    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        context: &dyn TransactionContext,
    ) -> Result<()> {
        if !self.network.has_queue(destination) {
            return Err(BusError::QueueNotFound(destination.to_string()));
        }

        let network = Arc::clone(&self.network);
        let destination = destination.to_string();
        context.on_committed(Box::new(move || network.deliver(&destination, message)));
        Ok(())
    }

    async fn receive(&self, context: &dyn TransactionContext) -> Result<Option<TransportMessage>> {
        let Some(message) = self.network.take(&self.address) else {
            return Ok(None);
        };

        let network = Arc::clone(&self.network);
        let address = self.address.clone();
        let redelivery = message.clone();
        context.on_aborted(Box::new(move || {
            debug!(queue = %address, "Returning aborted message to queue");
            network.deliver(&address, redelivery);
        }));

        Ok(Some(message))
    }

    fn address(&self) -> &str {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{DefaultTransactionContext, Headers};

    fn message(id: &str) -> TransportMessage {
        let mut headers = Headers::new();
        headers.insert(crate::bus::headers::MESSAGE_ID.to_string(), id.to_string());
        TransportMessage::new(headers, b"{}".to_vec())
    }

    #[tokio::test]
    async fn test_send_is_delivered_on_commit() {
        let network = InMemNetwork::new();
        let transport = InMemTransport::new(Arc::clone(&network), "queue");
        transport.create_queue("queue").unwrap();

        let ctx = DefaultTransactionContext::new();
        transport.send("queue", message("m1"), &ctx).await.unwrap();
        assert_eq!(network.count("queue"), 0);

        ctx.complete();
        assert_eq!(network.count("queue"), 1);
    }

    #[tokio::test]
    async fn test_send_is_dropped_on_abort() {
        let network = InMemNetwork::new();
        let transport = InMemTransport::new(Arc::clone(&network), "queue");
        transport.create_queue("queue").unwrap();

        let ctx = DefaultTransactionContext::new();
        transport.send("queue", message("m1"), &ctx).await.unwrap();
        ctx.rollback();

        assert_eq!(network.count("queue"), 0);
    }

    #[tokio::test]
    async fn test_send_to_missing_queue_fails() {
        let network = InMemNetwork::new();
        let transport = InMemTransport::new(network, "queue");
        let ctx = DefaultTransactionContext::new();

        let result = transport.send("nowhere", message("m1"), &ctx).await;
        assert!(matches!(result, Err(BusError::QueueNotFound(_))));
    }

    #[tokio::test]
    async fn test_aborted_receive_is_redelivered() {
        let network = InMemNetwork::new();
        let transport = InMemTransport::new(Arc::clone(&network), "queue");
        network.deliver("queue", message("m1"));

        let ctx = DefaultTransactionContext::new();
        let received = transport.receive(&ctx).await.unwrap();
        assert_eq!(received.unwrap().id(), Some("m1"));
        assert_eq!(network.count("queue"), 0);

        ctx.rollback();
        assert_eq!(network.count("queue"), 1);
    }

    #[tokio::test]
    async fn test_receive_on_empty_queue_returns_none() {
        let network = InMemNetwork::new();
        let transport = InMemTransport::new(network, "queue");
        let ctx = DefaultTransactionContext::new();

        assert!(transport.receive(&ctx).await.unwrap().is_none());
    }
}
