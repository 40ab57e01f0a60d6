//! Message bus abstractions consumed by the instrumentation layer.
//!
//! This module contains:
//! - `Bus` / `AdvancedApi`: bus self-description and worker introspection
//! - `Transport`: queue-level send/receive boundary
//! - `TransactionContext`: commit/abort/dispose callback hooks
//! - `Pipeline`: ordered incoming/outgoing step chains
//! - `BusLifetimeEvents`: start/stop observers
//! - `ErrorTracker`: errors recorded by retry middleware
//! - `BusConfigurer`: hooks used by extensions to decorate a bus being built
//! - Implementations: in-memory network, transport and bus
//! - `MockBus`, `MockTransport`, `MockErrorTracker`: test doubles

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

pub mod error_tracker;
pub mod in_memory;
pub mod lifetime;
pub mod message;
pub mod mock;
pub mod pipeline;
pub mod transaction;

// Re-exports
pub use error_tracker::{second_level_message_id, ErrorTracker, InMemErrorTracker, TrackedError};
pub use in_memory::{BusBuilder, InMemNetwork, InMemTransport, InMemoryBus};
pub use lifetime::{BusLifetimeEvents, LifetimeEvent, LifetimeHandler, Subscription};
pub use message::{headers, Headers, Message, TransportMessage};
pub use mock::{MockBus, MockErrorTracker, MockTransport};
pub use pipeline::{
    IncomingStep, IncomingStepContext, Next, OutgoingStep, OutgoingStepContext, Pipeline,
};
pub use transaction::{DefaultTransactionContext, OwningBus, TransactionCallback, TransactionContext};

/// Kind name every bus prints before its instance name in its self-description.
pub const BUS_KIND: &str = "RebusBus";

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("Transport failed: {0}")]
    Transport(String),

    #[error("Queue '{0}' does not exist")]
    QueueNotFound(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("No handler registered for message type '{0}'")]
    NoHandler(String),

    #[error("Handler for '{message_type}' failed: {message}")]
    HandlerFailed {
        message_type: String,
        message: String,
    },

    #[error("Pipeline context is missing {0}")]
    MissingItem(&'static str),

    #[error("Bus has been disposed")]
    Disposed,
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::Serialization(e.to_string())
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Administrative view of a running bus.
pub trait AdvancedApi: Send + Sync {
    /// Number of worker tasks currently processing messages.
    fn worker_count(&self) -> usize;
}

/// A running bus instance.
///
/// The `Display` implementation is the bus's self-description, conventionally
/// `"{BUS_KIND} {name}"`. Instance labels are derived from it.
pub trait Bus: fmt::Display + Send + Sync {
    /// Administrative interface (worker pool size).
    fn advanced(&self) -> Arc<dyn AdvancedApi>;

    /// Lifetime events raised while the bus starts and shuts down.
    fn lifetime_events(&self) -> Arc<BusLifetimeEvents>;
}

/// Queue-level message transport.
///
/// Cancellation follows the usual async Rust contract: dropping the future
/// returned by [`Transport::receive`] abandons the receive.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Ensure a queue with the given address exists.
    fn create_queue(&self, address: &str) -> Result<()>;

    /// Send a message to `destination` as part of `context`.
    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        context: &dyn TransactionContext,
    ) -> Result<()>;

    /// Receive the next message from this transport's input queue, if any.
    async fn receive(&self, context: &dyn TransactionContext) -> Result<Option<TransportMessage>>;

    /// Input queue address.
    fn address(&self) -> &str;
}

// ============================================================================
// Configuration hooks
// ============================================================================

/// Wraps the transport a bus is about to use.
pub type TransportDecorator = Box<dyn FnOnce(Arc<dyn Transport>) -> Arc<dyn Transport> + Send>;

/// Modifies the pipeline a bus is about to use.
pub type PipelineDecorator = Box<dyn FnOnce(&mut Pipeline, &Arc<dyn ErrorTracker>) + Send>;

/// Builds a component that lives as long as the bus it is attached to.
///
/// The returned value is dropped when the bus is disposed.
pub type BusAttachment = Box<dyn FnOnce(&dyn Bus) -> Box<dyn Any + Send + Sync> + Send>;

/// Hooks exposed by a bus while it is being configured.
pub trait BusConfigurer {
    /// Register a transport decorator. Decorators apply in registration order.
    fn decorate_transport(&mut self, decorator: TransportDecorator);

    /// Register a pipeline decorator, applied after the default steps exist.
    fn decorate_pipeline(&mut self, decorator: PipelineDecorator);

    /// Register a component built once the bus exists, before it starts.
    fn attach(&mut self, attachment: BusAttachment);
}
