//! Mock bus collaborators for testing.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{
    AdvancedApi, Bus, BusError, BusLifetimeEvents, ErrorTracker, Result, TrackedError,
    TransactionContext, Transport, TransportMessage,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Bus
// ============================================================================

/// Worker count that tests can set directly.
#[derive(Default)]
pub struct MockAdvancedApi {
    workers: AtomicUsize,
}

impl MockAdvancedApi {
    pub fn set_worker_count(&self, workers: usize) {
        self.workers.store(workers, Ordering::SeqCst);
    }
}

impl AdvancedApi for MockAdvancedApi {
    fn worker_count(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }
}

/// Bus with a fixed self-description.
pub struct MockBus {
    description: String,
    advanced: Arc<MockAdvancedApi>,
    events: Arc<BusLifetimeEvents>,
}

impl MockBus {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            advanced: Arc::new(MockAdvancedApi::default()),
            events: BusLifetimeEvents::new(),
        }
    }

    pub fn set_worker_count(&self, workers: usize) {
        self.advanced.set_worker_count(workers);
    }
}

impl fmt::Display for MockBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

impl Bus for MockBus {
    fn advanced(&self) -> Arc<dyn AdvancedApi> {
        self.advanced.clone()
    }

    fn lifetime_events(&self) -> Arc<BusLifetimeEvents> {
        Arc::clone(&self.events)
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Transport that records sends and serves queued messages.
pub struct MockTransport {
    address: String,
    incoming: Mutex<VecDeque<TransportMessage>>,
    sent: Mutex<Vec<(String, TransportMessage)>>,
    fail_on_send: AtomicBool,
}

impl MockTransport {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            incoming: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            fail_on_send: AtomicBool::new(false),
        }
    }

    pub fn set_fail_on_send(&self, fail: bool) {
        self.fail_on_send.store(fail, Ordering::SeqCst);
    }

    /// Queue a message for the next `receive`.
    pub fn push_incoming(&self, message: TransportMessage) {
        lock(&self.incoming).push_back(message);
    }

    pub fn sent_count(&self) -> usize {
        lock(&self.sent).len()
    }

    pub fn take_sent(&self) -> Vec<(String, TransportMessage)> {
        std::mem::take(&mut *lock(&self.sent))
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn create_queue(&self, _address: &str) -> Result<()> {
        Ok(())
    }

    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        _context: &dyn TransactionContext,
    ) -> Result<()> {
        if self.fail_on_send.load(Ordering::SeqCst) {
            return Err(BusError::Transport("Mock send failure".to_string()));
        }
        lock(&self.sent).push((destination.to_string(), message));
        Ok(())
    }

    async fn receive(&self, _context: &dyn TransactionContext) -> Result<Option<TransportMessage>> {
        Ok(lock(&self.incoming).pop_front())
    }

    fn address(&self) -> &str {
        &self.address
    }
}

// ============================================================================
// Error tracker
// ============================================================================

/// Error tracker populated by the test.
#[derive(Default)]
pub struct MockErrorTracker {
    errors: Mutex<HashMap<String, Vec<TrackedError>>>,
}

impl MockErrorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, message_id: &str, error: &str) {
        lock(&self.errors)
            .entry(message_id.to_string())
            .or_default()
            .push(TrackedError::new(error));
    }
}

impl ErrorTracker for MockErrorTracker {
    fn get_exceptions(&self, message_id: &str) -> Vec<TrackedError> {
        lock(&self.errors).get(message_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{DefaultTransactionContext, Headers};

    #[tokio::test]
    async fn test_mock_transport_records_sends() {
        let transport = MockTransport::new("input");
        let ctx = DefaultTransactionContext::new();

        transport
            .send("out", TransportMessage::new(Headers::new(), Vec::new()), &ctx)
            .await
            .unwrap();

        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "out");
    }

    #[tokio::test]
    async fn test_mock_transport_fail_on_send() {
        let transport = MockTransport::new("input");
        transport.set_fail_on_send(true);
        let ctx = DefaultTransactionContext::new();

        let result = transport
            .send("out", TransportMessage::new(Headers::new(), Vec::new()), &ctx)
            .await;

        assert!(matches!(result, Err(BusError::Transport(_))));
        assert_eq!(transport.sent_count(), 0);
    }

    #[test]
    fn test_mock_bus_display_and_workers() {
        let bus = MockBus::new("RebusBus test");
        bus.set_worker_count(4);

        assert_eq!(bus.to_string(), "RebusBus test");
        assert_eq!(bus.advanced().worker_count(), 4);
    }
}
