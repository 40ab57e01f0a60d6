//! Bus lifetime events.
//!
//! Observers subscribe per event and receive a [`Subscription`] handle.
//! Dropping the handle (or calling [`Subscription::unsubscribe`]) removes
//! the observer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Signals raised while a bus starts and shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifetimeEvent {
    Starting,
    Started,
    Disposing,
    Disposed,
    WorkersStopped,
}

impl LifetimeEvent {
    pub const ALL: [LifetimeEvent; 5] = [
        LifetimeEvent::Starting,
        LifetimeEvent::Started,
        LifetimeEvent::Disposing,
        LifetimeEvent::Disposed,
        LifetimeEvent::WorkersStopped,
    ];
}

impl fmt::Display for LifetimeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifetimeEvent::Starting => "starting",
            LifetimeEvent::Started => "started",
            LifetimeEvent::Disposing => "disposing",
            LifetimeEvent::Disposed => "disposed",
            LifetimeEvent::WorkersStopped => "workers_stopped",
        };
        f.write_str(name)
    }
}

/// Observer callback.
pub type LifetimeHandler = Arc<dyn Fn() + Send + Sync>;

struct Listener {
    id: u64,
    event: LifetimeEvent,
    handler: LifetimeHandler,
}

/// Registry of lifetime observers for one bus.
#[derive(Default)]
pub struct BusLifetimeEvents {
    listeners: Mutex<Vec<Listener>>,
    next_id: AtomicU64,
}

impl BusLifetimeEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handler` for `event`.
    pub fn subscribe(self: &Arc<Self>, event: LifetimeEvent, handler: LifetimeHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners().push(Listener { id, event, handler });
        Subscription {
            events: Arc::downgrade(self),
            id: Some(id),
        }
    }

    /// Invoke every handler subscribed to `event`.
    ///
    /// Handlers run outside the registry lock.
    pub fn raise(&self, event: LifetimeEvent) {
        let handlers: Vec<LifetimeHandler> = self
            .listeners()
            .iter()
            .filter(|l| l.event == event)
            .map(|l| Arc::clone(&l.handler))
            .collect();

        for handler in handlers {
            handler();
        }
    }

    /// Number of active subscriptions across all events.
    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    fn remove(&self, id: u64) {
        self.listeners().retain(|l| l.id != id);
    }
}

/// Owned registration of a lifetime observer.
#[must_use = "dropping a subscription unsubscribes it"]
pub struct Subscription {
    events: Weak<BusLifetimeEvents>,
    id: Option<u64>,
}

impl Subscription {
    /// Remove the observer now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let (Some(id), Some(events)) = (self.id.take(), self.events.upgrade()) {
            events.remove(id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
