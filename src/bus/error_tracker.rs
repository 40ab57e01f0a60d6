//! Errors recorded by retry middleware, keyed by message id.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

/// Suffix of the id used when a message is retried as a second-level (poison) attempt.
pub const SECOND_LEVEL_SUFFIX: &str = "-2nd-level";

/// Id under which the second-level attempt of `message_id` tracks its errors.
pub fn second_level_message_id(message_id: &str) -> String {
    format!("{message_id}{SECOND_LEVEL_SUFFIX}")
}

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedError {
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

impl TrackedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// Read side of the retry subsystem's error bookkeeping.
pub trait ErrorTracker: Send + Sync {
    /// Errors recorded for `message_id`, oldest first. Pure query.
    fn get_exceptions(&self, message_id: &str) -> Vec<TrackedError>;
}

/// In-process error tracker.
pub struct InMemErrorTracker {
    errors: Mutex<HashMap<String, Vec<TrackedError>>>,
    max_delivery_attempts: usize,
}

impl InMemErrorTracker {
    pub fn new(max_delivery_attempts: usize) -> Self {
        Self {
            errors: Mutex::new(HashMap::new()),
            max_delivery_attempts: max_delivery_attempts.max(1),
        }
    }

    fn errors(&self) -> MutexGuard<'_, HashMap<String, Vec<TrackedError>>> {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_error(&self, message_id: &str, error: TrackedError) {
        self.errors()
            .entry(message_id.to_string())
            .or_default()
            .push(error);
    }

    /// Whether `message_id` has used up its delivery attempts.
    pub fn has_failed_too_many_times(&self, message_id: &str) -> bool {
        self.errors()
            .get(message_id)
            .is_some_and(|e| e.len() >= self.max_delivery_attempts)
    }

    /// Forget everything recorded for `message_id`.
    pub fn clean_up(&self, message_id: &str) {
        self.errors().remove(message_id);
    }

    /// Short summary of the errors recorded for `message_id`.
    pub fn full_error_description(&self, message_id: &str) -> String {
        self.errors()
            .get(message_id)
            .map(|errors| {
                errors
                    .iter()
                    .map(|e| format!("{}: {}", e.recorded_at.to_rfc3339(), e.message))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default()
    }
}

impl ErrorTracker for InMemErrorTracker {
    fn get_exceptions(&self, message_id: &str) -> Vec<TrackedError> {
        self.errors().get(message_id).cloned().unwrap_or_default()
    }
}
