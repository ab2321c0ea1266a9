//! Queue broker abstraction with at-least-once delivery.
//!
//! A consumed message moves to a processing area and stays there until it is
//! acknowledged. `recover` moves unacknowledged messages back onto the queue,
//! which is how a crash between consume and ack turns into a redelivery.

use async_trait::async_trait;
use faas_common::{FaasError, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

/// A consumed, not yet acknowledged message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented by each redelivery.
    pub attempt: u32,
}

#[async_trait]
pub trait QueueBroker: Send + Sync {
    async fn publish(&self, payload: Vec<u8>) -> Result<()>;

    /// Take the next message without blocking. `None` when the queue is empty.
    async fn consume(&self) -> Result<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Requeue every consumed but unacknowledged message. Returns how many.
    async fn recover(&self) -> Result<usize>;
}

fn attempt_key(payload: &[u8]) -> String {
    Sha256::digest(payload)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

// --- In-memory broker ---

#[derive(Debug, Default)]
struct MemoryState {
    ready: VecDeque<Vec<u8>>,
    processing: Vec<Vec<u8>>,
    attempts: HashMap<String, u32>,
}

/// Broker living in process memory. Used by tests and single-node setups
/// that accept losing queued work on restart.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<MemoryState>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.lock().map(|s| s.ready.len()).unwrap_or(0)
    }

    pub fn in_flight(&self) -> usize {
        self.lock().map(|s| s.processing.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| FaasError::Internal("queue lock poisoned".into()))
    }
}

#[async_trait]
impl QueueBroker for InMemoryQueue {
    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        self.lock()?.ready.push_back(payload);
        Ok(())
    }

    async fn consume(&self) -> Result<Option<Delivery>> {
        let mut state = self.lock()?;
        let Some(payload) = state.ready.pop_front() else {
            return Ok(None);
        };
        state.processing.push(payload.clone());
        let attempt = state.attempts.entry(attempt_key(&payload)).or_insert(0);
        *attempt += 1;
        let attempt = *attempt;
        Ok(Some(Delivery { payload, attempt }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(index) = state.processing.iter().position(|p| *p == delivery.payload) {
            state.processing.remove(index);
        }
        if !state.processing.contains(&delivery.payload)
            && !state.ready.contains(&delivery.payload)
        {
            state.attempts.remove(&attempt_key(&delivery.payload));
        }
        Ok(())
    }

    async fn recover(&self) -> Result<usize> {
        let mut state = self.lock()?;
        let unacked: Vec<Vec<u8>> = state.processing.drain(..).collect();
        let count = unacked.len();
        // Recovered work is consumed next, oldest first.
        for payload in unacked.into_iter().rev() {
            state.ready.push_front(payload);
        }
        Ok(count)
    }
}

// --- Redis broker ---

/// Redis list broker.
///
/// publish = `LPUSH queue`, consume = `RPOPLPUSH queue queue:processing`,
/// ack = `LREM queue:processing 1 payload`,
/// recover = `LMOVE queue:processing queue LEFT RIGHT` (Redis 6.2+). Delivery
/// attempts are counted in the `queue:attempts` hash keyed by the payload's
/// SHA-256.
pub struct RedisQueue {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    queue: String,
    processing: String,
    attempts: String,
    timeout: Duration,
}

impl RedisQueue {
    /// Opens the client only; the connection is made on first use so the
    /// gateway can start while the broker is still coming up.
    pub fn new(address: &str, queue: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(address)
            .map_err(|e| FaasError::Config(format!("queue_address {address}: {e}")))?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            queue: queue.to_string(),
            processing: format!("{queue}:processing"),
            attempts: format!("{queue}:attempts"),
            timeout,
        })
    }

    async fn connection(&self) -> std::result::Result<ConnectionManager, String> {
        let connect = self.connection.get_or_try_init(|| async {
            ConnectionManager::new(self.client.clone())
                .await
                .map_err(|e| e.to_string())
        });
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(conn)) => Ok(conn.clone()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(format!("connecting to broker exceeded {:?}", self.timeout)),
        }
    }

    /// Run a command with a fresh clone of the shared connection, bounded by
    /// the broker timeout.
    async fn run<T, F, Fut>(&self, op: F) -> std::result::Result<T, String>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: std::future::Future<Output = redis::RedisResult<T>>,
    {
        let conn = self.connection().await?;
        match tokio::time::timeout(self.timeout, op(conn)).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!("broker call exceeded {:?}", self.timeout)),
        }
    }
}

#[async_trait]
impl QueueBroker for RedisQueue {
    #[instrument(skip(self, payload), fields(queue = %self.queue, bytes = payload.len()))]
    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        let queue = self.queue.clone();
        self.run(|mut conn| async move { conn.lpush::<_, _, ()>(queue, payload).await })
            .await
            .map_err(FaasError::EnqueueFailure)
    }

    async fn consume(&self) -> Result<Option<Delivery>> {
        let (queue, processing) = (self.queue.clone(), self.processing.clone());
        let payload: Option<Vec<u8>> = self
            .run(|mut conn| async move { conn.rpoplpush(queue, processing).await })
            .await
            .map_err(|e| FaasError::BackendUnavailable(format!("queue consume: {e}")))?;
        let Some(payload) = payload else {
            return Ok(None);
        };

        let (attempts, field) = (self.attempts.clone(), attempt_key(&payload));
        let attempt: i64 = match self
            .run(|mut conn| async move { conn.hincr(attempts, field, 1).await })
            .await
        {
            Ok(n) => n,
            Err(e) => {
                // The message is already parked in processing; count it as a first try.
                warn!(error = %e, "Failed to bump delivery attempt counter");
                1
            }
        };
        debug!(attempt, "Consumed message");
        Ok(Some(Delivery {
            payload,
            attempt: u32::try_from(attempt.max(1)).unwrap_or(u32::MAX),
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let (processing, payload) = (self.processing.clone(), delivery.payload.clone());
        self.run(|mut conn| async move { conn.lrem::<_, _, i64>(processing, 1, payload).await })
            .await
            .map_err(|e| FaasError::BackendUnavailable(format!("queue ack: {e}")))?;

        let (attempts, field) = (self.attempts.clone(), attempt_key(&delivery.payload));
        if let Err(e) = self
            .run(|mut conn| async move { conn.hdel::<_, _, i64>(attempts, field).await })
            .await
        {
            warn!(error = %e, "Failed to clear delivery attempt counter");
        }
        Ok(())
    }

    #[instrument(skip(self), fields(queue = %self.queue))]
    async fn recover(&self) -> Result<usize> {
        let mut moved = 0;
        loop {
            let (processing, queue) = (self.processing.clone(), self.queue.clone());
            // Newest processing entry first onto the consuming (right) end, so
            // the oldest one ends up consumed next.
            let entry: Option<Vec<u8>> = self
                .run(|mut conn| async move {
                    redis::cmd("LMOVE")
                        .arg(processing)
                        .arg(queue)
                        .arg("LEFT")
                        .arg("RIGHT")
                        .query_async(&mut conn)
                        .await
                })
                .await
                .map_err(|e| FaasError::BackendUnavailable(format!("queue recover: {e}")))?;
            if entry.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            info!(moved, "Requeued unacknowledged messages");
        }
        Ok(moved)
    }
}
