use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::job::ImageInput;

const QUEUE_KEY: &str = "medscan:jobs";
const PROCESSING_KEY: &str = "medscan:processing";
/// Sorted set of in-flight payloads scored by claim time (unix seconds).
const CLAIMED_AT_KEY: &str = "medscan:processing:claimed_at";

/// Moves one payload from the processing list back to the pending list,
/// unless it was acked in the meantime.
const REQUEUE_SCRIPT: &str = r#"
local moved = 0
if redis.call('LREM', KEYS[1], 1, ARGV[1]) > 0 then
    redis.call('RPUSH', KEYS[2], ARGV[1])
    moved = 1
end
redis.call('ZREM', KEYS[3], ARGV[1])
return moved
"#;

/// Job payload serialized into the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueMessage {
    pub job_id: Uuid,
    pub owner_id: String,
    pub input: ImageInput,
    pub is_retry: bool,
    /// The job's `retry_count` this message was issued for. Claims against
    /// any other value are rejected.
    #[serde(default)]
    pub retry_count: i32,
    /// Queue-tier attempt number, starting at 1.
    #[serde(default = "first_attempt")]
    pub attempt: u32,
}

fn first_attempt() -> u32 {
    1
}

impl QueueMessage {
    pub fn new(job_id: Uuid, owner_id: String, input: ImageInput, is_retry: bool) -> Self {
        Self {
            job_id,
            owner_id,
            input,
            is_retry,
            retry_count: 0,
            attempt: 1,
        }
    }

    pub fn with_retry_count(mut self, retry_count: i32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// The redelivery of this message after a failed attempt that left the
    /// job at `retry_count`.
    pub fn next_attempt(&self, retry_count: i32) -> Self {
        Self {
            is_retry: true,
            retry_count,
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// A dequeued message plus whatever the backend needs to acknowledge it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: QueueMessage,
    receipt: String,
}

/// Durable hand-off between the API and worker processes.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Non-blocking; `None` when the queue is empty.
    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError>;

    /// Drop a delivery from the in-flight set.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Hand deliveries claimed more than `visibility_timeout` ago back to the
    /// pending queue, ahead of new work. Returns how many were moved.
    async fn requeue_stale(&self, visibility_timeout: Duration) -> Result<u64, QueueError>;

    async fn depth(&self) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Redis-backed queue: LPUSH / RPOPLPUSH into a processing list / LREM.
pub struct RedisQueue {
    client: redis::Client,
}

impl RedisQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(message)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload).await?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection().await?;
        let payload: Option<String> = conn.rpoplpush(QUEUE_KEY, PROCESSING_KEY).await?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        match serde_json::from_str(&payload) {
            Ok(message) => {
                conn.zadd::<_, _, _, ()>(CLAIMED_AT_KEY, &payload, unix_now())
                    .await?;
                Ok(Some(Delivery {
                    message,
                    receipt: payload,
                }))
            }
            Err(e) => {
                // Poison message: drop it from the in-flight list so it is not redelivered.
                conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &payload).await?;
                Err(QueueError::Serialize(e))
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &delivery.receipt)
            .await?;
        conn.zrem::<_, _, ()>(CLAIMED_AT_KEY, &delivery.receipt)
            .await?;
        Ok(())
    }

    async fn requeue_stale(&self, visibility_timeout: Duration) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let in_flight: Vec<String> = conn.lrange(PROCESSING_KEY, 0, -1).await?;
        let cutoff = unix_now() - visibility_timeout.as_secs_f64();
        let script = redis::Script::new(REQUEUE_SCRIPT);

        let mut moved = 0;
        for payload in in_flight {
            let claimed_at: Option<f64> = conn.zscore(CLAIMED_AT_KEY, &payload).await?;
            match claimed_at {
                // The claiming worker died before stamping it; start the clock now.
                None => {
                    conn.zadd::<_, _, _, ()>(CLAIMED_AT_KEY, &payload, unix_now())
                        .await?;
                }
                Some(at) if at <= cutoff => {
                    let requeued: i64 = script
                        .key(PROCESSING_KEY)
                        .key(QUEUE_KEY)
                        .key(CLAIMED_AT_KEY)
                        .arg(&payload)
                        .invoke_async(&mut conn)
                        .await?;
                    moved += requeued as u64;
                }
                Some(_) => {}
            }
        }
        Ok(moved)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        Ok(conn.llen(QUEUE_KEY).await?)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// In-process FIFO with the same contract, for tests and local runs.
#[derive(Default)]
pub struct MemoryQueue {
    pending: Mutex<VecDeque<QueueMessage>>,
    in_flight: Mutex<HashMap<String, (QueueMessage, Instant)>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliveries handed out and not yet acked.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.pending.lock().await.push_back(message.clone());
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let Some(message) = self.pending.lock().await.pop_front() else {
            return Ok(None);
        };

        let receipt = Uuid::new_v4().to_string();
        self.in_flight
            .lock()
            .await
            .insert(receipt.clone(), (message.clone(), Instant::now()));
        Ok(Some(Delivery { message, receipt }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.in_flight.lock().await.remove(&delivery.receipt);
        Ok(())
    }

    async fn requeue_stale(&self, visibility_timeout: Duration) -> Result<u64, QueueError> {
        let stale: Vec<QueueMessage> = {
            let mut in_flight = self.in_flight.lock().await;
            let expired: Vec<String> = in_flight
                .iter()
                .filter(|(_, (_, claimed_at))| claimed_at.elapsed() >= visibility_timeout)
                .map(|(receipt, _)| receipt.clone())
                .collect();
            expired
                .iter()
                .filter_map(|receipt| in_flight.remove(receipt))
                .map(|(message, _)| message)
                .collect()
        };

        let mut pending = self.pending.lock().await;
        for message in stale.iter().rev() {
            pending.push_front(message.clone());
        }
        Ok(stale.len() as u64)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.pending.lock().await.len() as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> QueueMessage {
        QueueMessage::new(
            Uuid::new_v4(),
            "owner-1".to_string(),
            ImageInput {
                storage_key: "scans/x.png".to_string(),
                original_filename: "x.png".to_string(),
                byte_size: 10,
                mime_type: "image/png".to_string(),
                scan_type: "chest_xray".to_string(),
            },
            false,
        )
    }

    #[test]
    fn test_next_attempt_marks_retry() {
        let first = message();
        let second = first.next_attempt(1);
        assert_eq!(second.attempt, 2);
        assert_eq!(second.retry_count, 1);
        assert!(second.is_retry);
        assert_eq!(second.job_id, first.job_id);
        assert_eq!(second.input, first.input);
    }

    #[test]
    fn test_attempt_defaults_when_absent() {
        let mut value = serde_json::to_value(message()).unwrap();
        value.as_object_mut().unwrap().remove("attempt");
        value.as_object_mut().unwrap().remove("retry_count");
        let parsed: QueueMessage = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.attempt, 1);
        assert_eq!(parsed.retry_count, 0);
    }

    #[tokio::test]
    async fn test_memory_queue_is_fifo() {
        let queue = MemoryQueue::new();
        let a = message();
        let b = message();
        queue.enqueue(&a).await.unwrap();
        queue.enqueue(&b).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 2);

        let first = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(first.message.job_id, a.job_id);
        queue.ack(&first).await.unwrap();
        assert_eq!(queue.dequeue().await.unwrap().unwrap().message.job_id, b.job_id);
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unacked_deliveries_are_requeued_first() {
        let queue = MemoryQueue::new();
        let abandoned = message();
        let waiting = message();
        queue.enqueue(&abandoned).await.unwrap();
        queue.enqueue(&waiting).await.unwrap();

        // claimed by a worker that never acks
        let lost = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(queue.in_flight().await, 1);
        assert_eq!(queue.requeue_stale(Duration::from_secs(60)).await.unwrap(), 0);

        assert_eq!(queue.requeue_stale(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(queue.in_flight().await, 0);
        assert_eq!(queue.depth().await.unwrap(), 2);

        let next = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(next.message, lost.message);
        queue.ack(&next).await.unwrap();
        assert_eq!(queue.in_flight().await, 0);
    }
}
