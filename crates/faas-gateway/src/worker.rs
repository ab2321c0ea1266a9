//! Async invocation worker: consume, invoke, call back, acknowledge.
//!
//! A message is acknowledged only after its invocation has finished, so a
//! crash in between leads to a redelivery. Functions invoked this way must
//! tolerate running more than once; nothing here deduplicates.

use faas_common::{ExecutionResult, FaasError, QueueMessage, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::metrics::Metrics;
use crate::proxy::{SyncProxy, UNRESOLVED_FUNCTION};
use crate::queue::{Delivery, QueueBroker};

pub const CALL_ID_HEADER: &str = "x-call-id";
pub const FUNCTION_STATUS_HEADER: &str = "x-function-status";
pub const DURATION_HEADER: &str = "x-duration-seconds";

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The invocation ran (or definitively failed) and the message was acked.
    Completed {
        status: u16,
        /// Status returned by the callback receiver, if a callback was posted
        /// and answered.
        callback_status: Option<u16>,
    },
    /// The payload could not be decoded and was acked without running.
    Dropped,
}

#[derive(Clone)]
pub struct AsyncWorker {
    id: usize,
    broker: Arc<dyn QueueBroker>,
    proxy: Arc<SyncProxy>,
    metrics: Arc<Metrics>,
    callback_client: reqwest::Client,
    callback_timeout: Duration,
    poll_interval: Duration,
}

impl AsyncWorker {
    pub fn new(
        id: usize,
        broker: Arc<dyn QueueBroker>,
        proxy: Arc<SyncProxy>,
        metrics: Arc<Metrics>,
        callback_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id,
            broker,
            proxy,
            metrics,
            callback_client: reqwest::Client::new(),
            callback_timeout,
            poll_interval,
        }
    }

    /// Consume until `shutdown` flips to true or its sender goes away.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = self.id, "Async worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.broker.consume().await {
                Ok(Some(delivery)) => {
                    self.process_delivery(delivery).await;
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    warn!(worker = self.id, error = %e, "Queue consume failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!(worker = self.id, "Async worker stopped");
    }

    #[instrument(skip(self, delivery), fields(worker = self.id, attempt = delivery.attempt))]
    pub async fn process_delivery(&self, delivery: Delivery) -> DeliveryOutcome {
        let message = match QueueMessage::decode(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, bytes = delivery.payload.len(), "Dropping undecodable message");
                self.ack(&delivery).await;
                return DeliveryOutcome::Dropped;
            }
        };
        if delivery.attempt > 1 {
            info!(call_id = %message.call_id, attempt = delivery.attempt, "Redelivered message");
        }

        let invocation = message.into_invocation();
        let started = Instant::now();
        let (result, label) = match self.proxy.invoke(&invocation).await {
            Ok(result) => (result, invocation.function.as_str()),
            Err(e) => {
                let label = match e {
                    FaasError::NotFound(_) | FaasError::BackendUnavailable(_) => {
                        UNRESOLVED_FUNCTION
                    }
                    _ => invocation.function.as_str(),
                };
                (ExecutionResult::from_error(&e, started.elapsed()), label)
            }
        };
        self.metrics.record_async_report(
            label,
            result.status,
            result.duration.as_secs_f64(),
        );
        debug!(call_id = %invocation.call_id, status = result.status, "Async invocation finished");

        let callback_status = match &invocation.callback_url {
            Some(url) => match self.post_callback(url, &invocation.call_id, &result).await {
                Ok(status) => Some(status),
                Err(e) => {
                    // The function already ran; a failed callback does not requeue it.
                    warn!(call_id = %invocation.call_id, error = %e, "Callback failed");
                    None
                }
            },
            None => None,
        };

        self.ack(&delivery).await;
        DeliveryOutcome::Completed {
            status: result.status,
            callback_status,
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.ack(delivery).await {
            warn!(worker = self.id, error = %e, "Failed to acknowledge message");
        }
    }

    async fn post_callback(
        &self,
        url: &str,
        call_id: &str,
        result: &ExecutionResult,
    ) -> Result<u16> {
        let mut request = self
            .callback_client
            .post(url)
            .timeout(self.callback_timeout)
            .body(result.body.clone());
        for (name, value) in result.headers.end_to_end().iter() {
            request = request.header(name, value);
        }
        let response = request
            .header(FUNCTION_STATUS_HEADER, result.status.to_string())
            .header(DURATION_HEADER, format!("{:.6}", result.duration.as_secs_f64()))
            .header(CALL_ID_HEADER, call_id)
            .send()
            .await
            .map_err(|e| FaasError::CallbackFailure(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FaasError::CallbackFailure(format!(
                "{url} answered {status}"
            )));
        }
        debug!(%url, %status, "Callback delivered");
        Ok(status.as_u16())
    }
}

/// Requeue anything left unacknowledged by a previous run, then start
/// `count` workers sharing one broker.
pub async fn start_workers(
    count: usize,
    template: AsyncWorker,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    if count == 0 {
        return Vec::new();
    }
    if let Err(e) = template.broker.recover().await {
        warn!(error = %e, "Could not recover unacknowledged messages");
    }
    (0..count)
        .map(|id| {
            let mut worker = template.clone();
            worker.id = id;
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}
