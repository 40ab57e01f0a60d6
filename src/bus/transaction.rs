//! Transaction contexts.
//!
//! Every send and receive happens inside a transaction context. The host
//! completes the context (commit or abort) and then disposes it; callbacks
//! registered on the context fire at those points, at most once each.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::Bus;

/// Callback registered on a transaction context.
pub type TransactionCallback = Box<dyn FnOnce() + Send>;

/// Transaction lifecycle hooks.
pub trait TransactionContext: Send + Sync {
    /// Run `callback` when the transaction commits.
    fn on_committed(&self, callback: TransactionCallback);

    /// Run `callback` when the transaction aborts.
    fn on_aborted(&self, callback: TransactionCallback);

    /// Run `callback` when the transaction is disposed, after commit or abort.
    fn on_disposed(&self, callback: TransactionCallback);

    /// Mark the transaction to be rolled back when it completes.
    fn abort(&self);

    /// Optional capability: contexts that know which bus owns them.
    fn as_owning_bus(&self) -> Option<&dyn OwningBus> {
        None
    }
}

/// Capability of transaction contexts created by a bus.
pub trait OwningBus: Send + Sync {
    /// The bus that created the context, if it is still alive.
    fn owning_bus(&self) -> Option<Arc<dyn Bus>>;
}

/// How a transaction context finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Committed,
    Aborted,
}

#[derive(Default)]
struct CallbackState {
    committed: Vec<TransactionCallback>,
    aborted: Vec<TransactionCallback>,
    disposed: Vec<TransactionCallback>,
    abort_requested: bool,
    completion: Option<Completion>,
    is_disposed: bool,
}

/// Standard transaction context used by the in-memory bus.
///
/// Callbacks are run outside the internal lock, so a callback may register
/// further callbacks on the same context.
pub struct DefaultTransactionContext {
    state: Mutex<CallbackState>,
    owner: Option<Weak<dyn Bus>>,
}

impl Default for DefaultTransactionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultTransactionContext {
    /// Context without an owning bus.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CallbackState::default()),
            owner: None,
        }
    }

    /// Context that can report the bus which created it.
    pub fn with_owning_bus(owner: Weak<dyn Bus>) -> Self {
        Self {
            state: Mutex::new(CallbackState::default()),
            owner: Some(owner),
        }
    }

    fn state(&self) -> MutexGuard<'_, CallbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `abort` has been requested or the context completed as aborted.
    pub fn is_aborted(&self) -> bool {
        let state = self.state();
        state.abort_requested || state.completion == Some(Completion::Aborted)
    }

    /// Commit, unless an abort was requested, and fire the matching callbacks.
    ///
    /// Completing twice returns the first outcome without firing anything.
    pub fn complete(&self) -> Completion {
        let (completion, fired) = {
            let mut state = self.state();
            if let Some(done) = state.completion {
                return done;
            }
            let completion = if state.abort_requested {
                Completion::Aborted
            } else {
                Completion::Committed
            };
            state.completion = Some(completion);
            let committed = mem::take(&mut state.committed);
            let aborted = mem::take(&mut state.aborted);
            match completion {
                Completion::Committed => (completion, committed),
                Completion::Aborted => (completion, aborted),
            }
        };

        for callback in fired {
            callback();
        }
        completion
    }

    /// Abort immediately and fire the abort callbacks.
    pub fn rollback(&self) -> Completion {
        self.abort();
        self.complete()
    }

    /// Fire the dispose callbacks. Later calls do nothing.
    pub fn dispose(&self) {
        let fired = {
            let mut state = self.state();
            if state.is_disposed {
                return;
            }
            state.is_disposed = true;
            mem::take(&mut state.disposed)
        };
        for callback in fired {
            callback();
        }
    }
}

impl TransactionContext for DefaultTransactionContext {
    fn on_committed(&self, callback: TransactionCallback) {
        let mut state = self.state();
        if state.completion.is_none() {
            state.committed.push(callback);
        }
    }

    fn on_aborted(&self, callback: TransactionCallback) {
        let mut state = self.state();
        if state.completion.is_none() {
            state.aborted.push(callback);
        }
    }

    fn on_disposed(&self, callback: TransactionCallback) {
        let mut state = self.state();
        if !state.is_disposed {
            state.disposed.push(callback);
        }
    }

    fn abort(&self) {
        self.state().abort_requested = true;
    }

    fn as_owning_bus(&self) -> Option<&dyn OwningBus> {
        self.owner.as_ref().map(|_| self as &dyn OwningBus)
    }
}

impl OwningBus for DefaultTransactionContext {
    fn owning_bus(&self) -> Option<Arc<dyn Bus>> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }
}

impl Drop for DefaultTransactionContext {
    fn drop(&mut self) {
        self.dispose();
    }
}
