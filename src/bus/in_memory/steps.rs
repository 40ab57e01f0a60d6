//! Default pipeline steps of the in-memory bus.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::bus::pipeline::DestinationAddresses;
use crate::bus::{
    headers, BusError, Headers, InMemErrorTracker, IncomingStep, IncomingStepContext, Message,
    Next, OutgoingStep, OutgoingStepContext, Result, TrackedError, TransactionContext, Transport,
    TransportMessage,
};

/// Handler invoked for a deserialized message.
pub type MessageHandler =
    Arc<dyn Fn(Message, MessageContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handlers keyed by message type.
pub type HandlerMap = HashMap<String, Vec<MessageHandler>>;

/// What a handler can see besides the message body.
#[derive(Clone)]
pub struct MessageContext {
    pub headers: Headers,
    transaction: Arc<dyn TransactionContext>,
}

impl MessageContext {
    pub fn transaction(&self) -> &Arc<dyn TransactionContext> {
        &self.transaction
    }

    pub fn message_id(&self) -> Option<&str> {
        self.headers.get(headers::MESSAGE_ID).map(String::as_str)
    }
}

// ============================================================================
// Incoming
// ============================================================================

/// Records handler failures and aborts the transaction so the message is redelivered.
///
/// Failures are swallowed here; later deliveries of a message that failed
/// too often are forwarded to the error queue.
pub struct RetryStep {
    tracker: Arc<InMemErrorTracker>,
    transport: Arc<dyn Transport>,
    error_queue: String,
}

impl RetryStep {
    pub fn new(
        tracker: Arc<InMemErrorTracker>,
        transport: Arc<dyn Transport>,
        error_queue: impl Into<String>,
    ) -> Self {
        Self {
            tracker,
            transport,
            error_queue: error_queue.into(),
        }
    }

    async fn dead_letter(
        &self,
        mut message: TransportMessage,
        details: String,
        transaction: &dyn TransactionContext,
    ) -> Result<()> {
        warn!(
            message_id = message.id().unwrap_or_default(),
            error_queue = %self.error_queue,
            "Moving message to error queue"
        );
        message
            .headers
            .insert(headers::ERROR_DETAILS.to_string(), details);
        self.transport
            .send(&self.error_queue, message, transaction)
            .await
    }
}

#[async_trait]
impl IncomingStep for RetryStep {
    async fn process(
        &self,
        ctx: &mut IncomingStepContext,
        next: Next<'_, dyn IncomingStep>,
    ) -> Result<()> {
        let message = ctx
            .load::<TransportMessage>()
            .cloned()
            .ok_or(BusError::MissingItem("transport message"))?;
        let transaction = Arc::clone(ctx.transaction());

        let Some(message_id) = message.id().map(str::to_string) else {
            let details = format!("Received message without a '{}' header", headers::MESSAGE_ID);
            return self.dead_letter(message, details, transaction.as_ref()).await;
        };

        if self.tracker.has_failed_too_many_times(&message_id) {
            let details = self.tracker.full_error_description(&message_id);
            self.dead_letter(message, details, transaction.as_ref()).await?;
            self.tracker.clean_up(&message_id);
            return Ok(());
        }

        match next.run(ctx).await {
            Ok(()) => {
                self.tracker.clean_up(&message_id);
                Ok(())
            }
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Message handling failed");
                self.tracker
                    .register_error(&message_id, TrackedError::new(e.to_string()));
                transaction.abort();
                Ok(())
            }
        }
    }
}

/// Turns the transport message into a logical [`Message`].
pub struct DeserializeStep;

#[async_trait]
impl IncomingStep for DeserializeStep {
    async fn process(
        &self,
        ctx: &mut IncomingStepContext,
        next: Next<'_, dyn IncomingStep>,
    ) -> Result<()> {
        let message = ctx
            .load::<TransportMessage>()
            .ok_or(BusError::MissingItem("transport message"))?
            .to_message()?;
        ctx.save(message);
        next.run(ctx).await
    }
}

/// Invokes the handlers registered for the message type.
pub struct DispatchStep {
    handlers: Arc<HandlerMap>,
}

impl DispatchStep {
    pub fn new(handlers: Arc<HandlerMap>) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl IncomingStep for DispatchStep {
    async fn process(
        &self,
        ctx: &mut IncomingStepContext,
        next: Next<'_, dyn IncomingStep>,
    ) -> Result<()> {
        let message = ctx
            .load::<Message>()
            .cloned()
            .ok_or(BusError::MissingItem("message"))?;
        let message_type = message.message_type().to_string();

        let handlers = self
            .handlers
            .get(&message_type)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| BusError::NoHandler(message_type.clone()))?;

        let context = MessageContext {
            headers: message.headers.clone(),
            transaction: Arc::clone(ctx.transaction()),
        };
        for handler in handlers {
            (handler.as_ref())(message.clone(), context.clone()).await?;
        }
        debug!(message_type = %message_type, "Dispatched message");

        next.run(ctx).await
    }
}

// ============================================================================
// Outgoing
// ============================================================================

/// Serializes the message and hands it to the transport for every destination.
pub struct SendStep {
    transport: Arc<dyn Transport>,
}

impl SendStep {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl OutgoingStep for SendStep {
    async fn process(
        &self,
        ctx: &mut OutgoingStepContext,
        next: Next<'_, dyn OutgoingStep>,
    ) -> Result<()> {
        let message = ctx
            .load::<Message>()
            .ok_or(BusError::MissingItem("message"))?
            .to_transport()?;
        let DestinationAddresses(destinations) = ctx
            .load::<DestinationAddresses>()
            .cloned()
            .ok_or(BusError::MissingItem("destination addresses"))?;

        let transaction = Arc::clone(ctx.transaction());
        for destination in &destinations {
            self.transport
                .send(destination, message.clone(), transaction.as_ref())
                .await?;
        }
        ctx.save(message);

        next.run(ctx).await
    }
}
