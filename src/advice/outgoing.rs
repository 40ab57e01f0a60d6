//! Outgoing pipeline instrumentation.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::count_error;
use crate::bus::{Message, Next, OutgoingStep, OutgoingStepContext, Result};
use crate::identity::resolve_instance;
use crate::metrics::{Counters, MetricLabels};

/// Counts and times outgoing messages per type. Errors returned by later
/// steps are counted and passed on unchanged.
pub struct InstrumentOutgoingStep {
    counters: Arc<Counters>,
    instance: Option<String>,
}

impl InstrumentOutgoingStep {
    pub fn new(counters: Arc<Counters>) -> Self {
        Self {
            counters,
            instance: None,
        }
    }

    pub fn with_instance_name(mut self, instance: Option<String>) -> Self {
        self.instance = instance;
        self
    }
}

#[async_trait]
impl OutgoingStep for InstrumentOutgoingStep {
    async fn process(
        &self,
        ctx: &mut OutgoingStepContext,
        next: Next<'_, dyn OutgoingStep>,
    ) -> Result<()> {
        let Some(message_type) = ctx.load::<Message>().map(|m| m.message_type().to_string()) else {
            warn!("No message in context, skipping instrumentation");
            return next.run(ctx).await;
        };
        let instance = resolve_instance(self.instance.as_deref(), ctx.transaction().as_ref());

        let set = self.counters.outgoing_messages();
        let labels = MetricLabels::typed(&instance, &message_type);
        let _bracket = set.begin(labels);

        let result = next.run(ctx).await;
        if result.is_err() {
            count_error(set, labels);
        }
        result
    }
}
