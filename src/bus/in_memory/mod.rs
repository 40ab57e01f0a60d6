//! In-memory bus for tests and local development.
//!
//! Every bus sends and publishes to its own input queue on a shared
//! [`InMemNetwork`]. Worker tasks receive messages inside a transaction
//! context, run them through the incoming pipeline and then commit or abort.
//!
//! ```ignore
//! let network = InMemNetwork::new();
//! let bus = BusBuilder::new(network, "orders")
//!     .with_workers(2)
//!     .handle::<PlaceOrder, _, _>(|cmd, _ctx| async move { Ok(()) })
//!     .start()?;
//!
//! bus.send(&PlaceOrder { id: 1 }).await?;
//! bus.dispose().await;
//! ```

mod network;
mod steps;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use network::{InMemNetwork, InMemTransport};
pub use steps::{
    DeserializeStep, DispatchStep, HandlerMap, MessageContext, MessageHandler, RetryStep, SendStep,
};

use super::message::message_type_name;
use super::pipeline::DestinationAddresses;
use super::{
    headers, AdvancedApi, Bus, BusAttachment, BusConfigurer, BusError, BusLifetimeEvents,
    DefaultTransactionContext, ErrorTracker, InMemErrorTracker, IncomingStepContext,
    LifetimeEvent, Message, OutgoingStepContext, Pipeline, PipelineDecorator, Result,
    TransactionContext, Transport, TransportDecorator, BUS_KIND,
};

/// Default number of worker tasks.
pub const DEFAULT_WORKERS: usize = 1;
/// Default delivery attempts before a message is moved to the error queue.
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: usize = 5;
/// Default error queue name.
pub const DEFAULT_ERROR_QUEUE: &str = "error";

/// Pause between polls when the input queue is empty.
const IDLE_BACKOFF: Duration = Duration::from_millis(5);

static BUS_NUMBER: AtomicUsize = AtomicUsize::new(1);

// ============================================================================
// Builder
// ============================================================================

/// Configures and starts an [`InMemoryBus`].
pub struct BusBuilder {
    network: Arc<InMemNetwork>,
    input_queue: String,
    name: Option<String>,
    workers: usize,
    max_delivery_attempts: usize,
    error_queue: String,
    handlers: HandlerMap,
    type_names: HashMap<String, String>,
    transport_decorators: Vec<TransportDecorator>,
    pipeline_decorators: Vec<PipelineDecorator>,
    attachments: Vec<BusAttachment>,
}

impl BusBuilder {
    pub fn new(network: Arc<InMemNetwork>, input_queue: impl Into<String>) -> Self {
        Self {
            network,
            input_queue: input_queue.into(),
            name: None,
            workers: DEFAULT_WORKERS,
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
            error_queue: DEFAULT_ERROR_QUEUE.to_string(),
            handlers: HandlerMap::new(),
            type_names: HashMap::new(),
            transport_decorators: Vec::new(),
            pipeline_decorators: Vec::new(),
            attachments: Vec::new(),
        }
    }

    /// Wire type name for messages whose body is a `T`.
    ///
    /// Without one, the `msg-type` header (and the `type` metric label) is
    /// `std::any::type_name::<T>()`, which can change between compiler
    /// releases.
    pub fn with_type_name<T: ?Sized>(mut self, name: impl Into<String>) -> Self {
        self.type_names
            .insert(message_type_name::<T>().to_string(), name.into());
        self
    }

    /// Instance name. Defaults to `"Bus {n}"`, numbered per process.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_delivery_attempts(mut self, attempts: usize) -> Self {
        self.max_delivery_attempts = attempts;
        self
    }

    pub fn with_error_queue(mut self, queue: impl Into<String>) -> Self {
        self.error_queue = queue.into();
        self
    }

    /// Register a handler for messages whose body is a `T`.
    pub fn handle<T, F, Fut>(mut self, handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(
            move |message: Message, ctx: MessageContext| -> BoxFuture<'static, Result<()>> {
                match message.body_as::<T>() {
                    Ok(body) => Box::pin(handler(body, ctx)),
                    Err(e) => Box::pin(async move { Err(e) }),
                }
            },
        );
        self.handlers
            .entry(message_type_name::<T>().to_string())
            .or_default()
            .push(handler);
        self
    }

    /// Build the bus and start its workers. Must run inside a tokio runtime.
    pub fn start(self) -> Result<Arc<InMemoryBus>> {
        let name = self
            .name
            .unwrap_or_else(|| format!("Bus {}", BUS_NUMBER.fetch_add(1, Ordering::Relaxed)));

        let base: Arc<dyn Transport> =
            Arc::new(InMemTransport::new(Arc::clone(&self.network), &self.input_queue));
        base.create_queue(&self.input_queue)?;
        base.create_queue(&self.error_queue)?;

        let transport = self
            .transport_decorators
            .into_iter()
            .fold(base, |transport, decorate| decorate(transport));

        let type_names = self.type_names;
        let mut handlers = HandlerMap::new();
        for (message_type, registered) in self.handlers {
            let wire_name = type_names.get(&message_type).cloned().unwrap_or(message_type);
            handlers.entry(wire_name).or_default().extend(registered);
        }

        let tracker = Arc::new(InMemErrorTracker::new(self.max_delivery_attempts));
        let mut pipeline = Pipeline::new()
            .with_incoming(Arc::new(RetryStep::new(
                Arc::clone(&tracker),
                Arc::clone(&transport),
                self.error_queue.clone(),
            )))
            .with_incoming(Arc::new(DeserializeStep))
            .with_incoming(Arc::new(DispatchStep::new(Arc::new(handlers))))
            .with_outgoing(Arc::new(SendStep::new(Arc::clone(&transport))));

        let error_tracker: Arc<dyn ErrorTracker> = tracker.clone();
        for decorate in self.pipeline_decorators {
            decorate(&mut pipeline, &error_tracker);
        }

        let (shutdown, _) = watch::channel(false);
        let input_queue = self.input_queue;
        let network = self.network;
        let bus = Arc::new_cyclic(|weak: &Weak<InMemoryBus>| {
            let owner: Weak<dyn Bus> = weak.clone();
            InMemoryBus {
                name,
                core: Arc::new(BusCore {
                    transport,
                    pipeline,
                    owner,
                    input_queue,
                }),
                network,
                tracker,
                type_names,
                events: BusLifetimeEvents::new(),
                pool: Arc::new(WorkerPool::default()),
                tasks: Mutex::new(Vec::new()),
                attachments: Mutex::new(Vec::new()),
                shutdown,
                disposed: AtomicBool::new(false),
            }
        });

        let attachments: Vec<_> = self
            .attachments
            .into_iter()
            .map(|attach| attach(bus.as_ref()))
            .collect();
        *lock(&bus.attachments) = attachments;

        bus.start_workers(self.workers);
        Ok(bus)
    }
}

impl BusConfigurer for BusBuilder {
    fn decorate_transport(&mut self, decorator: TransportDecorator) {
        self.transport_decorators.push(decorator);
    }

    fn decorate_pipeline(&mut self, decorator: PipelineDecorator) {
        self.pipeline_decorators.push(decorator);
    }

    fn attach(&mut self, attachment: BusAttachment) {
        self.attachments.push(attachment);
    }
}

// ============================================================================
// Bus
// ============================================================================

/// Worker pool size as seen through [`AdvancedApi`].
#[derive(Default)]
struct WorkerPool {
    count: AtomicUsize,
}

impl AdvancedApi for WorkerPool {
    fn worker_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

/// State shared by the bus handle and its worker tasks.
struct BusCore {
    transport: Arc<dyn Transport>,
    pipeline: Pipeline,
    owner: Weak<dyn Bus>,
    input_queue: String,
}

impl BusCore {
    fn new_transaction(&self) -> Arc<DefaultTransactionContext> {
        Arc::new(DefaultTransactionContext::with_owning_bus(self.owner.clone()))
    }

    /// Receive and process one message. Returns false when the queue was empty.
    async fn process_next(&self) -> bool {
        let context = self.new_transaction();

        let message = match self.transport.receive(context.as_ref()).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                context.dispose();
                return false;
            }
            Err(e) => {
                warn!(queue = %self.input_queue, error = %e, "Receive failed");
                context.rollback();
                context.dispose();
                return false;
            }
        };

        let transaction: Arc<dyn TransactionContext> = context.clone();
        let mut step_context = IncomingStepContext::new(message, transaction);
        if let Err(e) = self.pipeline.invoke_incoming(&mut step_context).await {
            warn!(queue = %self.input_queue, error = %e, "Incoming pipeline failed");
            context.abort();
        }
        drop(step_context);

        let completion = context.complete();
        debug!(queue = %self.input_queue, ?completion, "Message transaction completed");
        context.dispose();
        true
    }

    async fn run_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.process_next().await {
                continue;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(IDLE_BACKOFF) => {}
            }
        }
    }
}

/// Bus running over an [`InMemNetwork`].
pub struct InMemoryBus {
    name: String,
    core: Arc<BusCore>,
    network: Arc<InMemNetwork>,
    tracker: Arc<InMemErrorTracker>,
    type_names: HashMap<String, String>,
    events: Arc<BusLifetimeEvents>,
    pool: Arc<WorkerPool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    attachments: Mutex<Vec<Box<dyn Any + Send + Sync>>>,
    shutdown: watch::Sender<bool>,
    disposed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryBus {
    /// Start building a bus reading from `input_queue`.
    pub fn builder(network: Arc<InMemNetwork>, input_queue: impl Into<String>) -> BusBuilder {
        BusBuilder::new(network, input_queue)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.core.input_queue
    }

    pub fn network(&self) -> &Arc<InMemNetwork> {
        &self.network
    }

    pub fn error_tracker(&self) -> &Arc<InMemErrorTracker> {
        &self.tracker
    }

    /// Pipeline the bus runs messages through.
    pub fn pipeline(&self) -> &Pipeline {
        &self.core.pipeline
    }

    fn start_workers(&self, workers: usize) {
        self.events.raise(LifetimeEvent::Starting);

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let core = Arc::clone(&self.core);
                tokio::spawn(core.run_worker(self.shutdown.subscribe()))
            })
            .collect();
        *lock(&self.tasks) = handles;
        self.pool.count.store(workers, Ordering::SeqCst);

        info!(bus = %self.name, queue = %self.core.input_queue, workers, "Bus started");
        self.events.raise(LifetimeEvent::Started);
    }

    /// Send a command to this bus's input queue.
    pub async fn send<T: Serialize>(&self, body: &T) -> Result<()> {
        let destination = self.core.input_queue.clone();
        self.dispatch(body, headers::INTENT_P2P, destination).await
    }

    /// Send a command to an explicit queue.
    pub async fn send_to<T: Serialize>(&self, destination: &str, body: &T) -> Result<()> {
        self.dispatch(body, headers::INTENT_P2P, destination.to_string())
            .await
    }

    /// Publish an event. Subscribers are the bus itself.
    pub async fn publish<T: Serialize>(&self, body: &T) -> Result<()> {
        let destination = self.core.input_queue.clone();
        self.dispatch(body, headers::INTENT_PUB, destination).await
    }

    async fn dispatch<T: Serialize>(
        &self,
        body: &T,
        intent: &str,
        destination: String,
    ) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BusError::Disposed);
        }

        let mut message = Message::new(body)?;
        if let Some(wire_name) = self.type_names.get(message.message_type()).cloned() {
            message = message.with_header(headers::TYPE, wire_name);
        }
        let message = message
            .with_header(headers::MESSAGE_ID, Uuid::new_v4().to_string())
            .with_header(headers::INTENT, intent)
            .with_header(headers::SENT_TIME, Utc::now().to_rfc3339())
            .with_header(headers::SENDER_ADDRESS, self.core.input_queue.clone());

        let context = self.core.new_transaction();
        let transaction: Arc<dyn TransactionContext> = context.clone();
        let mut step_context = OutgoingStepContext::new(
            message,
            DestinationAddresses(vec![destination]),
            transaction,
        );

        let result = self.core.pipeline.invoke_outgoing(&mut step_context).await;
        drop(step_context);

        if result.is_err() {
            context.abort();
        }
        context.complete();
        context.dispose();
        result
    }

    /// Stop the workers, raise the shutdown events and release attachments.
    ///
    /// Later calls do nothing.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(bus = %self.name, "Disposing bus");
        self.events.raise(LifetimeEvent::Disposing);

        let _ = self.shutdown.send(true);
        let tasks = mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(bus = %self.name, error = %e, "Worker task ended abnormally");
            }
        }
        self.pool.count.store(0, Ordering::SeqCst);
        self.events.raise(LifetimeEvent::WorkersStopped);
        self.events.raise(LifetimeEvent::Disposed);

        let attachments = mem::take(&mut *lock(&self.attachments));
        drop(attachments);
        info!(bus = %self.name, "Bus disposed");
    }
}

impl fmt::Display for InMemoryBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{BUS_KIND} {}", self.name)
    }
}

impl Bus for InMemoryBus {
    fn advanced(&self) -> Arc<dyn AdvancedApi> {
        self.pool.clone()
    }

    fn lifetime_events(&self) -> Arc<BusLifetimeEvents> {
        Arc::clone(&self.events)
    }
}

impl Drop for InMemoryBus {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
