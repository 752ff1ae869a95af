use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

/// Message carried from intake to the worker. References a job, never
/// carries its payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueMessage {
    pub message_id: Uuid,
    pub job_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn for_job(job_id: Uuid) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            job_id,
            enqueued_at: Utc::now(),
        }
    }
}

/// A received message, leased to one consumer until acked or the
/// visibility timeout runs out.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: QueueMessage,
    /// 1 on first delivery.
    pub receive_count: u32,
    receipt: String,
}

impl Delivery {
    pub fn job_id(&self) -> Uuid {
        self.message.job_id
    }
}

/// Broker behaviour shared by every backend.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_batch_size: usize,
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
    pub poll_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            visibility_timeout: Duration::from_secs(30),
            max_receive_count: 5,
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl From<&crate::config::AppConfig> for QueueSettings {
    fn from(config: &crate::config::AppConfig) -> Self {
        Self {
            max_batch_size: config.queue_max_batch_size,
            visibility_timeout: config.visibility_timeout(),
            max_receive_count: config.max_receive_count,
            poll_interval: Duration::from_millis(config.queue_poll_interval_ms),
        }
    }
}

/// At-least-once work queue with batched, leased receives.
///
/// No ordering is guaranteed. A message that is not acked within the
/// visibility timeout becomes receivable again; one received more than
/// `max_receive_count` times is moved to the dead-letter list instead.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    fn settings(&self) -> &QueueSettings;

    async fn enqueue(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Lease up to `max` currently visible messages without waiting.
    async fn try_receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError>;

    /// Remove messages for good.
    async fn ack(&self, deliveries: &[Delivery]) -> Result<(), QueueError>;

    /// Messages waiting to be received.
    async fn depth(&self) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;

    /// Wait up to `window` to collect `max` messages (capped at the broker's
    /// batch size), then return whatever arrived, possibly nothing.
    async fn receive_batch(
        &self,
        max: usize,
        window: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let max = max.min(self.settings().max_batch_size).max(1);
        let deadline = Instant::now() + window;
        let mut batch = Vec::with_capacity(max);

        loop {
            let received = self.try_receive(max - batch.len()).await?;
            batch.extend(received);

            let now = Instant::now();
            if batch.len() >= max || now >= deadline {
                return Ok(batch);
            }
            let pause = self.settings().poll_interval.max(Duration::from_millis(1));
            sleep(pause.min(deadline - now)).await;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Queue unavailable: {0}")]
    Unavailable(String),
}

/// Requeue expired leases, then pop and lease up to ARGV[2] messages for
/// ARGV[1] ms. Time comes from the Redis server so every consumer shares one
/// clock. Returns a flat list of payload, receive count pairs.
const RECEIVE_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local deadline = now + tonumber(ARGV[1])
local max = tonumber(ARGV[2])
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, payload in ipairs(expired) do
  redis.call('ZREM', KEYS[2], payload)
  redis.call('RPUSH', KEYS[1], payload)
end
local out = {}
for i = 1, max do
  local payload = redis.call('RPOP', KEYS[1])
  if not payload then break end
  redis.call('ZADD', KEYS[2], deadline, payload)
  local count = redis.call('HINCRBY', KEYS[3], payload, 1)
  table.insert(out, payload)
  table.insert(out, tostring(count))
end
return out
"#;

/// Redis-backed work queue.
///
/// `<name>:pending` is a list (LPUSH in, RPOP out), `<name>:inflight` a sorted
/// set of leased payloads scored by lease deadline in ms, `<name>:receives` a
/// hash of receive counts and `<name>:dead` the dead-letter list.
pub struct RedisWorkQueue {
    client: redis::Client,
    settings: QueueSettings,
    pending_key: String,
    inflight_key: String,
    receives_key: String,
    dead_key: String,
    receive_script: redis::Script,
}

impl RedisWorkQueue {
    pub fn new(redis_url: &str, name: &str, settings: QueueSettings) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            settings,
            pending_key: format!("{name}:pending"),
            inflight_key: format!("{name}:inflight"),
            receives_key: format!("{name}:receives"),
            dead_key: format!("{name}:dead"),
            receive_script: redis::Script::new(RECEIVE_SCRIPT),
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    async fn dead_letter(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        payload: &str,
    ) -> Result<(), QueueError> {
        redis::pipe()
            .atomic()
            .zrem(&self.inflight_key, payload)
            .hdel(&self.receives_key, payload)
            .lpush(&self.dead_key, payload)
            .query_async::<()>(conn)
            .await
            .map_err(QueueError::Redis)
    }

    /// Number of dead-lettered messages.
    pub async fn dead_letter_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn().await?;
        let depth: u64 = conn.llen(&self.dead_key).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    async fn enqueue(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(message).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(&self.pending_key, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn try_receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let lease_ms = u64::try_from(self.settings.visibility_timeout.as_millis()).unwrap_or(u64::MAX);

        let raw: Vec<String> = self
            .receive_script
            .key(&self.pending_key)
            .key(&self.inflight_key)
            .key(&self.receives_key)
            .arg(lease_ms)
            .arg(max)
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;

        let mut deliveries = Vec::with_capacity(raw.len() / 2);
        for pair in raw.chunks(2) {
            let [payload, count] = pair else { continue };
            let receive_count: u32 = count.parse().unwrap_or(u32::MAX);

            let message: QueueMessage = match serde_json::from_str(payload) {
                Ok(message) => message,
                Err(e) => {
                    tracing::error!(error = %e, "Undecodable queue message, dead-lettering");
                    self.dead_letter(&mut conn, payload).await?;
                    continue;
                }
            };

            if receive_count > self.settings.max_receive_count {
                tracing::warn!(
                    job_id = %message.job_id,
                    message_id = %message.message_id,
                    receive_count,
                    "Message exceeded max receive count, dead-lettering"
                );
                self.dead_letter(&mut conn, payload).await?;
                continue;
            }

            deliveries.push(Delivery {
                message,
                receive_count,
                receipt: payload.clone(),
            });
        }

        Ok(deliveries)
    }

    async fn ack(&self, deliveries: &[Delivery]) -> Result<(), QueueError> {
        if deliveries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for delivery in deliveries {
            pipe.zrem(&self.inflight_key, &delivery.receipt)
                .hdel(&self.receives_key, &delivery.receipt);
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn().await?;
        let depth: u64 = conn.llen(&self.pending_key).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[derive(Debug)]
struct StoredMessage {
    message: QueueMessage,
    receive_count: u32,
}

#[derive(Debug, Default)]
struct InMemoryState {
    pending: VecDeque<StoredMessage>,
    inflight: HashMap<Uuid, (StoredMessage, Instant)>,
    dead: Vec<QueueMessage>,
    failing_enqueues: u32,
}

/// In-memory work queue with the same lease and dead-letter rules as
/// [`RedisWorkQueue`], driven by `tokio` time so tests can pause the clock.
pub struct InMemoryWorkQueue {
    settings: QueueSettings,
    state: Mutex<InMemoryState>,
}

impl InMemoryWorkQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(InMemoryState::default()),
        }
    }

    /// Reject the next `times` enqueues.
    pub async fn fail_enqueues(&self, times: u32) {
        self.state.lock().await.failing_enqueues = times;
    }

    pub async fn dead_letters(&self) -> Vec<QueueMessage> {
        self.state.lock().await.dead.clone()
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.inflight.len()
    }

    /// Messages not yet acked, leased or not.
    pub async fn outstanding(&self) -> usize {
        let state = self.state.lock().await;
        state.pending.len() + state.inflight.len()
    }
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    async fn enqueue(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.failing_enqueues > 0 {
            state.failing_enqueues -= 1;
            return Err(QueueError::Unavailable("in-memory queue rejected enqueue".into()));
        }
        state.pending.push_back(StoredMessage {
            message: message.clone(),
            receive_count: 0,
        });
        Ok(())
    }

    async fn try_receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let expired: Vec<Uuid> = state
            .inflight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some((stored, _)) = state.inflight.remove(&id) {
                state.pending.push_front(stored);
            }
        }

        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            let Some(mut stored) = state.pending.pop_front() else {
                break;
            };
            stored.receive_count += 1;

            if stored.receive_count > self.settings.max_receive_count {
                tracing::warn!(
                    job_id = %stored.message.job_id,
                    receive_count = stored.receive_count,
                    "Message exceeded max receive count, dead-lettering"
                );
                state.dead.push(stored.message);
                continue;
            }

            deliveries.push(Delivery {
                message: stored.message.clone(),
                receive_count: stored.receive_count,
                receipt: stored.message.message_id.to_string(),
            });
            let deadline = now + self.settings.visibility_timeout;
            state
                .inflight
                .insert(stored.message.message_id, (stored, deadline));
        }

        Ok(deliveries)
    }

    async fn ack(&self, deliveries: &[Delivery]) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        for delivery in deliveries {
            state.inflight.remove(&delivery.message.message_id);
        }
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.state.lock().await.pending.len() as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
