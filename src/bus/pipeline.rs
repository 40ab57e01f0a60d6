//! Ordered step pipelines for incoming and outgoing messages.
//!
//! A step receives the message context and a [`Next`] continuation for the
//! remaining steps. Steps that do not call `next` end the chain.
//!
//! ```ignore
//! #[async_trait]
//! impl IncomingStep for LogStep {
//!     async fn process(
//!         &self,
//!         ctx: &mut IncomingStepContext,
//!         next: Next<'_, dyn IncomingStep>,
//!     ) -> Result<()> {
//!         debug!("before");
//!         next.run(ctx).await
//!     }
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use http::Extensions;

use super::{Message, Result, TransactionContext, TransportMessage};

// ============================================================================
// Contexts
// ============================================================================

/// Items shared between the steps processing one message.
pub struct StepItems {
    items: Extensions,
    transaction: Arc<dyn TransactionContext>,
}

impl StepItems {
    fn new(transaction: Arc<dyn TransactionContext>) -> Self {
        Self {
            items: Extensions::new(),
            transaction,
        }
    }

    /// Typed lookup of an item deposited earlier in the pipeline.
    pub fn load<T: Clone + Send + Sync + 'static>(&self) -> Option<&T> {
        self.items.get::<T>()
    }

    /// Deposit an item for later steps, replacing any previous item of the same type.
    pub fn save<T: Clone + Send + Sync + 'static>(&mut self, item: T) {
        self.items.insert(item);
    }

    /// Remove an item so later steps no longer see it.
    pub fn take<T: Clone + Send + Sync + 'static>(&mut self) -> Option<T> {
        self.items.remove::<T>()
    }

    /// Transaction the message is processed in.
    pub fn transaction(&self) -> &Arc<dyn TransactionContext> {
        &self.transaction
    }
}

/// Context for a message received from the transport.
pub struct IncomingStepContext {
    items: StepItems,
}

impl IncomingStepContext {
    pub fn new(message: TransportMessage, transaction: Arc<dyn TransactionContext>) -> Self {
        let mut items = StepItems::new(transaction);
        items.save(message);
        Self { items }
    }
}

/// Context for a message on its way to the transport.
pub struct OutgoingStepContext {
    items: StepItems,
}

/// Queues an outgoing message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationAddresses(pub Vec<String>);

impl OutgoingStepContext {
    pub fn new(
        message: Message,
        destinations: DestinationAddresses,
        transaction: Arc<dyn TransactionContext>,
    ) -> Self {
        let mut items = StepItems::new(transaction);
        items.save(message);
        items.save(destinations);
        Self { items }
    }
}

impl std::ops::Deref for IncomingStepContext {
    type Target = StepItems;

    fn deref(&self) -> &StepItems {
        &self.items
    }
}

impl std::ops::DerefMut for IncomingStepContext {
    fn deref_mut(&mut self) -> &mut StepItems {
        &mut self.items
    }
}

impl std::ops::Deref for OutgoingStepContext {
    type Target = StepItems;

    fn deref(&self) -> &StepItems {
        &self.items
    }
}

impl std::ops::DerefMut for OutgoingStepContext {
    fn deref_mut(&mut self) -> &mut StepItems {
        &mut self.items
    }
}

// ============================================================================
// Steps
// ============================================================================

/// Step in the incoming message pipeline.
#[async_trait]
pub trait IncomingStep: Send + Sync {
    async fn process(
        &self,
        ctx: &mut IncomingStepContext,
        next: Next<'_, dyn IncomingStep>,
    ) -> Result<()>;

    /// Name shown in pipeline listings.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Step in the outgoing message pipeline.
#[async_trait]
pub trait OutgoingStep: Send + Sync {
    async fn process(
        &self,
        ctx: &mut OutgoingStepContext,
        next: Next<'_, dyn OutgoingStep>,
    ) -> Result<()>;

    /// Name shown in pipeline listings.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Continuation over the steps after the current one.
pub struct Next<'a, S: ?Sized> {
    steps: &'a [Arc<S>],
}

impl<'a> Next<'a, dyn IncomingStep> {
    /// Run the remaining steps.
    pub fn run<'c>(self, ctx: &'c mut IncomingStepContext) -> BoxFuture<'c, Result<()>>
    where
        'a: 'c,
    {
        match self.steps.split_first() {
            Some((step, rest)) => step.process(ctx, Next { steps: rest }),
            None => Box::pin(async { Ok(()) }),
        }
    }
}

impl<'a> Next<'a, dyn OutgoingStep> {
    /// Run the remaining steps.
    pub fn run<'c>(self, ctx: &'c mut OutgoingStepContext) -> BoxFuture<'c, Result<()>>
    where
        'a: 'c,
    {
        match self.steps.split_first() {
            Some((step, rest)) => step.process(ctx, Next { steps: rest }),
            None => Box::pin(async { Ok(()) }),
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Incoming and outgoing step chains of a bus.
#[derive(Default, Clone)]
pub struct Pipeline {
    incoming: Vec<Arc<dyn IncomingStep>>,
    outgoing: Vec<Arc<dyn OutgoingStep>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an incoming step.
    pub fn with_incoming(mut self, step: Arc<dyn IncomingStep>) -> Self {
        self.incoming.push(step);
        self
    }

    /// Append an outgoing step.
    pub fn with_outgoing(mut self, step: Arc<dyn OutgoingStep>) -> Self {
        self.outgoing.push(step);
        self
    }

    /// Insert an incoming step before all others.
    pub fn prepend_incoming(&mut self, step: Arc<dyn IncomingStep>) {
        self.incoming.insert(0, step);
    }

    /// Insert an outgoing step before all others.
    pub fn prepend_outgoing(&mut self, step: Arc<dyn OutgoingStep>) {
        self.outgoing.insert(0, step);
    }

    pub fn incoming_names(&self) -> Vec<&'static str> {
        self.incoming.iter().map(|s| s.name()).collect()
    }

    pub fn outgoing_names(&self) -> Vec<&'static str> {
        self.outgoing.iter().map(|s| s.name()).collect()
    }

    /// Run the incoming chain for one message.
    pub async fn invoke_incoming(&self, ctx: &mut IncomingStepContext) -> Result<()> {
        Next {
            steps: self.incoming.as_slice(),
        }
        .run(ctx)
        .await
    }

    /// Run the outgoing chain for one message.
    pub async fn invoke_outgoing(&self, ctx: &mut OutgoingStepContext) -> Result<()> {
        Next {
            steps: self.outgoing.as_slice(),
        }
        .run(ctx)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, DefaultTransactionContext, Headers};
    use std::sync::Mutex;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl IncomingStep for Recorder {
        async fn process(
            &self,
            ctx: &mut IncomingStepContext,
            next: Next<'_, dyn IncomingStep>,
        ) -> Result<()> {
            self.log.lock().unwrap().push(self.label);
            if self.fail {
                return Err(BusError::Transport(self.label.to_string()));
            }
            ctx.save(self.label.len());
            next.run(ctx).await
        }
    }

    fn context() -> IncomingStepContext {
        IncomingStepContext::new(
            TransportMessage::new(Headers::new(), Vec::new()),
            Arc::new(DefaultTransactionContext::new()),
        )
    }

    #[tokio::test]
    async fn test_steps_run_in_order_and_share_items() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new().with_incoming(Arc::new(Recorder {
            label: "second",
            log: Arc::clone(&log),
            fail: false,
        }));
        pipeline.prepend_incoming(Arc::new(Recorder {
            label: "first",
            log: Arc::clone(&log),
            fail: false,
        }));

        let mut ctx = context();
        pipeline.invoke_incoming(&mut ctx).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(ctx.load::<usize>(), Some(&"second".len()));
        assert!(ctx.load::<TransportMessage>().is_some());
    }

    #[tokio::test]
    async fn test_failing_step_short_circuits() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new()
            .with_incoming(Arc::new(Recorder {
                label: "boom",
                log: Arc::clone(&log),
                fail: true,
            }))
            .with_incoming(Arc::new(Recorder {
                label: "never",
                log: Arc::clone(&log),
                fail: false,
            }));

        let result = pipeline.invoke_incoming(&mut context()).await;

        assert!(matches!(result, Err(BusError::Transport(_))));
        assert_eq!(*log.lock().unwrap(), vec!["boom"]);
    }

    #[test]
    fn test_take_removes_item() {
        let mut ctx = context();
        ctx.save(7usize);

        assert_eq!(ctx.take::<usize>(), Some(7));
        assert!(ctx.load::<usize>().is_none());
        assert!(ctx.take::<TransportMessage>().is_some());
    }

    #[tokio::test]
    async fn test_empty_pipeline_succeeds() {
        let pipeline = Pipeline::new();
        assert!(pipeline.invoke_incoming(&mut context()).await.is_ok());
        assert!(pipeline.incoming_names().is_empty());
    }
}
