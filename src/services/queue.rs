use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

use crate::models::job::JobDescriptor;

/// Wire envelope of a queued message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// The job message as a JSON string.
    pub data: String,
    /// Deliveries that already ended in a nack.
    #[serde(default)]
    pub attempt: u32,
}

/// A message handed to a consumer. Stays in the consumer's processing list
/// until it is acked or nacked.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: String,
    pub attributes: BTreeMap<String, String>,
    pub data: String,
    pub attempt: u32,
    /// Exact stored payload, needed to remove it from the processing list.
    pub raw: String,
}

impl Delivery {
    /// Parse a stored payload. Anything that is not an envelope is treated as
    /// a bare job message on its first delivery.
    pub fn from_raw(raw: String) -> Self {
        match serde_json::from_str::<Envelope>(&raw) {
            Ok(envelope) => Self {
                message_id: envelope.message_id,
                attributes: envelope.attributes,
                data: envelope.data,
                attempt: envelope.attempt,
                raw,
            },
            Err(_) => Self {
                message_id: Uuid::new_v4().to_string(),
                attributes: BTreeMap::new(),
                data: raw.clone(),
                attempt: 0,
                raw,
            },
        }
    }

    /// 1-based count of this delivery.
    pub fn delivery_attempt(&self) -> u32 {
        self.attempt.saturating_add(1)
    }

    /// Envelope to store for the next delivery after a nack.
    pub fn redelivery(&self) -> Envelope {
        Envelope {
            message_id: self.message_id.clone(),
            attributes: self.attributes.clone(),
            data: self.data.clone(),
            attempt: self.attempt.saturating_add(1),
        }
    }
}

/// At-least-once job queue.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue a job and return its message id.
    async fn publish(&self, job: &JobDescriptor) -> Result<String, QueueError>;

    /// Take the next message, if any, without blocking.
    async fn receive(&self) -> Result<Option<Delivery>, QueueError>;

    /// Drop a finished message.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Put a message back for redelivery with its attempt incremented.
    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;
}

/// Build the envelope for a new job.
pub fn envelope_for(job: &JobDescriptor) -> Result<Envelope, QueueError> {
    Ok(Envelope {
        message_id: Uuid::new_v4().to_string(),
        attributes: job.delivery_attributes(),
        data: serde_json::to_string(job)?,
        attempt: 0,
    })
}

/// Redis list-backed queue.
///
/// `{queue}:pending` is FIFO (LPUSH in, RPOPLPUSH out). Each consumer moves
/// what it takes into its own `{queue}:processing:{consumer}` list, so work
/// that was in flight when a worker died can be recovered on restart.
pub struct RedisJobQueue {
    conn: MultiplexedConnection,
    pending_key: String,
    processing_key: String,
}

impl RedisJobQueue {
    pub async fn connect(
        redis_url: &str,
        queue_name: &str,
        consumer_name: &str,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            pending_key: format!("{queue_name}:pending"),
            processing_key: format!("{queue_name}:processing:{consumer_name}"),
        })
    }

    /// Move messages left in this consumer's processing list back to pending.
    pub async fn recover_in_flight(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let mut recovered = 0;
        loop {
            let moved: Option<String> =
                conn.rpoplpush(&self.processing_key, &self.pending_key).await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Get the current queue depth (pending jobs).
    pub async fn queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let depth: u64 = conn.llen(&self.pending_key).await?;
        Ok(depth)
    }
}

#[async_trait]
impl MessageQueue for RedisJobQueue {
    async fn publish(&self, job: &JobDescriptor) -> Result<String, QueueError> {
        let envelope = envelope_for(job)?;
        let payload = serde_json::to_string(&envelope)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(&self.pending_key, &payload).await?;
        Ok(envelope.message_id)
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.rpoplpush(&self.pending_key, &self.processing_key).await?;
        Ok(raw.map(Delivery::from_raw))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.lrem(&self.processing_key, 1, &delivery.raw).await?;
        if removed == 0 {
            warn!(
                message_id = %delivery.message_id,
                "Acked message was not in the processing list"
            );
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&delivery.redelivery())?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .lrem(&self.processing_key, 1, &delivery.raw)
            .ignore()
            .lpush(&self.pending_key, &payload)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
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
