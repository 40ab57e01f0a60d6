//! Incoming pipeline instrumentation.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::count_error;
use crate::bus::{
    headers, second_level_message_id, ErrorTracker, IncomingStep, IncomingStepContext, Message,
    Next, Result, TransportMessage,
};
use crate::identity::resolve_instance;
use crate::metrics::{Counters, MetricLabels};

/// Counts and times incoming messages per type.
///
/// Must run first in the incoming pipeline so the measurement covers every
/// later step. A message counts as errored when a later step fails, or when
/// the retry machinery swallowed a failure and recorded it in the error
/// tracker under the message id or its second-level id.
pub struct InstrumentIncomingStep {
    counters: Arc<Counters>,
    error_tracker: Arc<dyn ErrorTracker>,
    instance: Option<String>,
    count_unidentified_as_error: bool,
}

impl InstrumentIncomingStep {
    pub fn new(counters: Arc<Counters>, error_tracker: Arc<dyn ErrorTracker>) -> Self {
        Self {
            counters,
            error_tracker,
            instance: None,
            count_unidentified_as_error: true,
        }
    }

    pub fn with_instance_name(mut self, instance: Option<String>) -> Self {
        self.instance = instance;
        self
    }

    /// Whether a message without a `msg-id` header counts as errored.
    pub fn with_count_unidentified_as_error(mut self, enabled: bool) -> Self {
        self.count_unidentified_as_error = enabled;
        self
    }

    fn has_caused_error(&self, message_id: Option<&str>) -> bool {
        match message_id {
            None => self.count_unidentified_as_error,
            Some(id) => {
                !self.error_tracker.get_exceptions(id).is_empty()
                    || !self
                        .error_tracker
                        .get_exceptions(&second_level_message_id(id))
                        .is_empty()
            }
        }
    }
}

/// Message id, preferring the deserialized message's headers.
fn message_id(ctx: &IncomingStepContext) -> Option<String> {
    let headers = ctx
        .load::<Message>()
        .map(|m| &m.headers)
        .or_else(|| ctx.load::<TransportMessage>().map(|m| &m.headers))?;
    headers.get(headers::MESSAGE_ID).cloned()
}

#[async_trait]
impl IncomingStep for InstrumentIncomingStep {
    async fn process(
        &self,
        ctx: &mut IncomingStepContext,
        next: Next<'_, dyn IncomingStep>,
    ) -> Result<()> {
        let Some(message_type) = ctx
            .load::<TransportMessage>()
            .map(|m| m.message_type().to_string())
        else {
            warn!("No transport message in context, skipping instrumentation");
            return next.run(ctx).await;
        };
        let instance = resolve_instance(self.instance.as_deref(), ctx.transaction().as_ref());

        let set = self.counters.incoming_messages();
        let labels = MetricLabels::typed(&instance, &message_type);
        let _bracket = set.begin(labels);

        match next.run(ctx).await {
            Ok(()) => {
                let message_id = message_id(ctx);
                if self.has_caused_error(message_id.as_deref()) {
                    debug!(
                        message_type = %message_type,
                        message_id = message_id.as_deref().unwrap_or_default(),
                        "Incoming message recorded as errored"
                    );
                    count_error(set, labels);
                }
                Ok(())
            }
            Err(e) => {
                count_error(set, labels);
                Err(e)
            }
        }
    }
}
