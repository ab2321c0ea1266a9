use faas_common::{Invocation, QueueMessage, Result};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::queue::QueueBroker;

/// Publishes async invocations and returns without waiting for them to run.
pub struct AsyncQueueClient {
    broker: Arc<dyn QueueBroker>,
    max_message_bytes: usize,
}

impl AsyncQueueClient {
    pub fn new(broker: Arc<dyn QueueBroker>, max_message_bytes: usize) -> Self {
        Self {
            broker,
            max_message_bytes,
        }
    }

    pub fn broker(&self) -> &Arc<dyn QueueBroker> {
        &self.broker
    }

    /// Returns the call id once the broker has the message. Oversized messages
    /// are refused outright, never truncated.
    #[instrument(skip(self, invocation), fields(function = %invocation.function, call_id = %invocation.call_id))]
    pub async fn enqueue(&self, invocation: &Invocation) -> Result<String> {
        let message = QueueMessage::from_invocation(invocation);
        let payload = message.encode(self.max_message_bytes).inspect_err(|e| {
            warn!(error = %e, "Refusing to enqueue oversized message");
        })?;
        self.broker.publish(payload).await.inspect_err(|e| {
            warn!(error = %e, "Failed to publish invocation");
        })?;
        info!(callback = invocation.callback_url.is_some(), "Invocation queued");
        Ok(invocation.call_id.clone())
    }
}
