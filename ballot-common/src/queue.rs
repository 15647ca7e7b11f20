//! Message queue for Ballots services.
//!
//! Votes leave the streaming process through a named topic on a message
//! queue; counting and presentation happen in separate consumers.
//!
//! - **In-Memory**: For local development and testing
//! - **Redis Pub/Sub**: For production multi-process delivery
//!
//! Each message is the raw payload bytes; no envelope is added, so any
//! consumer subscribed to `votes` receives the matched term verbatim.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

// ============================================================================
// Error Types
// ============================================================================

/// Message queue errors.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Connection error to the backend.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Publish error.
    #[error("Publish error: {0}")]
    Publish(String),

    /// The queue client has been stopped.
    #[error("Queue stopped")]
    Stopped,
}

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

// ============================================================================
// Queue Trait
// ============================================================================

/// Trait for message queue producers.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Publish a raw payload to a topic.
    async fn publish(&self, topic: &str, payload: &[u8]) -> QueueResult<()>;

    /// Check if the queue is connected/healthy.
    async fn is_healthy(&self) -> bool;

    /// Orderly shutdown of the client. Publishing afterwards fails.
    async fn stop(&self) -> QueueResult<()>;
}

/// A message delivered to an in-memory subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Receiver for in-memory subscriptions.
pub struct QueueReceiver {
    inner: broadcast::Receiver<QueueMessage>,
}

impl QueueReceiver {
    /// Receive the next message, or `None` once the queue is stopped.
    pub async fn recv(&mut self) -> Option<QueueMessage> {
        loop {
            match self.inner.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Queue subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ============================================================================
// In-Memory Queue
// ============================================================================

/// In-memory queue for local development and testing.
///
/// This implementation uses tokio broadcast channels per topic.
pub struct InMemoryQueue {
    /// Topic -> broadcast sender.
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<QueueMessage>>>>,
    /// Channel capacity.
    capacity: usize,
    stopped: std::sync::atomic::AtomicBool,
}

impl InMemoryQueue {
    /// Create a new in-memory queue with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new in-memory queue with specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            stopped: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Get or create a topic sender.
    async fn get_or_create_topic(&self, topic: &str) -> broadcast::Sender<QueueMessage> {
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Subscribe to a topic.
    pub async fn subscribe(&self, topic: &str) -> QueueReceiver {
        let sender = self.get_or_create_topic(topic).await;
        tracing::debug!(topic = %topic, "Subscribed to topic");
        QueueReceiver {
            inner: sender.subscribe(),
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn publish(&self, topic: &str, payload: &[u8]) -> QueueResult<()> {
        if self.is_stopped() {
            return Err(QueueError::Stopped);
        }

        let sender = self.get_or_create_topic(topic).await;

        // No subscribers is not an error for pub/sub
        let _ = sender.send(QueueMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });

        tracing::debug!(topic = %topic, bytes = payload.len(), "Message published");

        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        !self.is_stopped()
    }

    async fn stop(&self) -> QueueResult<()> {
        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut topics = self.topics.write().await;
        topics.clear();
        Ok(())
    }
}

// ============================================================================
// Redis Queue (Feature-gated)
// ============================================================================

/// Redis queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisQueueConfig {
    /// Redis URL (redis://host:port).
    pub url: String,
    /// Channel prefix for namespacing.
    pub channel_prefix: String,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            channel_prefix: String::new(),
        }
    }
}

/// Redis Pub/Sub queue implementation.
///
/// Uses Redis PUBLISH on `<prefix><topic>`.
#[cfg(feature = "redis-backend")]
pub struct RedisQueue {
    config: RedisQueueConfig,
    /// Connection manager (handles reconnection automatically).
    conn_manager: RwLock<Option<redis::aio::ConnectionManager>>,
}

#[cfg(feature = "redis-backend")]
impl RedisQueue {
    /// Connect a new Redis queue.
    pub async fn new(config: RedisQueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let conn_manager = client
            .get_connection_manager()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        tracing::info!(url = %config.url, "Connected to Redis queue");

        Ok(Self {
            config,
            conn_manager: RwLock::new(Some(conn_manager)),
        })
    }

    /// Get the prefixed channel name.
    fn prefixed_channel(&self, topic: &str) -> String {
        format!("{}{}", self.config.channel_prefix, topic)
    }
}

#[cfg(feature = "redis-backend")]
#[async_trait]
impl MessageQueue for RedisQueue {
    async fn publish(&self, topic: &str, payload: &[u8]) -> QueueResult<()> {
        let channel = self.prefixed_channel(topic);

        let mut conn_guard = self.conn_manager.write().await;
        let conn = conn_guard.as_mut().ok_or(QueueError::Stopped)?;

        redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(payload)
            .query_async::<i64>(conn)
            .await
            .map_err(|e| QueueError::Publish(e.to_string()))?;

        tracing::debug!(channel = %channel, bytes = payload.len(), "Message published to Redis");

        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        let mut conn_guard = self.conn_manager.write().await;
        if let Some(conn) = conn_guard.as_mut() {
            match redis::cmd("PING").query_async::<String>(conn).await {
                Ok(response) => response == "PONG",
                Err(_) => false,
            }
        } else {
            false
        }
    }

    async fn stop(&self) -> QueueResult<()> {
        let mut conn = self.conn_manager.write().await;
        *conn = None;
        Ok(())
    }
}

// ============================================================================
// Queue Factory
// ============================================================================

/// Queue backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// In-memory queue (single process).
    #[default]
    Memory,
    /// Redis Pub/Sub (multi-process).
    Redis,
}

/// Create a queue for the given backend.
#[cfg(feature = "redis-backend")]
pub async fn create_queue(
    backend: QueueBackend,
    redis_config: Option<RedisQueueConfig>,
) -> QueueResult<Arc<dyn MessageQueue>> {
    match backend {
        QueueBackend::Memory => Ok(Arc::new(InMemoryQueue::new())),
        QueueBackend::Redis => {
            let queue = RedisQueue::new(redis_config.unwrap_or_default()).await?;
            Ok(Arc::new(queue))
        }
    }
}

/// Create a queue for the given backend.
///
/// Without the `redis-backend` feature a Redis request falls back to the
/// in-memory queue.
#[cfg(not(feature = "redis-backend"))]
pub async fn create_queue(
    backend: QueueBackend,
    _redis_config: Option<RedisQueueConfig>,
) -> QueueResult<Arc<dyn MessageQueue>> {
    if backend == QueueBackend::Redis {
        tracing::warn!(
            "Redis backend feature not enabled. Falling back to in-memory queue. \
             Enable with: cargo build --features redis-backend"
        );
    }
    Ok(Arc::new(InMemoryQueue::new()))
}

// ============================================================================
// Topic Constants
// ============================================================================

/// Predefined topic names.
pub mod topics {
    /// Matched poll option terms.
    pub const VOTES: &str = "votes";
}

// ============================================================================
// Tests
// ============================================================================


// ============================================================================
// Redis Integration Tests (requires running Redis server)
// ============================================================================
