//! Function gateway: sync proxying, async queueing and the worker that drains
//! the queue, replica telemetry and the HTTP routes tying them together.

pub mod alerts;
pub mod async_client;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod proxy;
pub mod queue;
pub mod watcher;
pub mod worker;

pub use async_client::AsyncQueueClient;
pub use config::{BackendKind, GatewayConfig, ScalingPolicy};
pub use handlers::{create_app, ApiError, GatewayState};
pub use metrics::Metrics;
pub use proxy::{SyncProxy, UNRESOLVED_FUNCTION};
pub use queue::{Delivery, InMemoryQueue, QueueBroker, RedisQueue};
pub use watcher::{record_samples, ScalingWatcher};
pub use worker::{start_workers, AsyncWorker, DeliveryOutcome};
