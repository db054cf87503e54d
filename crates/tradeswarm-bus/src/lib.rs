//! TradeSwarm Bus - Message transport and persistence-cache seams
//!
//! This crate defines the two external-collaborator traits the core talks
//! through, plus in-memory implementations used by the demo and tests:
//!
//! - [`MessageBus`]: publish/subscribe keyed by topic string. The core's
//!   inter-agent routing layers on top; nothing beyond at-least-once
//!   delivery is assumed of the transport.
//! - [`PersistenceCache`]: a TTL key/value store used to snapshot bids,
//!   matches and negotiations for recovery/observability. Never the source
//!   of truth for an in-flight operation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use tradeswarm_types::AgentMessage;

/// Buffered messages per topic before the slowest subscriber starts lagging
const TOPIC_CHANNEL_CAPACITY: usize = 256;

/// Errors from bus operations
#[derive(Debug, Error)]
pub enum BusError {
    #[error("subscription lagged, {0} messages dropped")]
    Lagged(u64),

    #[error("topic channel closed")]
    Closed,
}

pub type BusResult<T> = Result<T, BusError>;

/// Abstract publish/subscribe channel keyed by topic string.
///
/// Used for both direct agent-to-agent delivery and broadcast. Backed by
/// any transport with at-least-once semantics.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a message to a topic. Publishing to a topic nobody
    /// subscribes to is not an error.
    async fn publish(&self, topic: &str, message: &AgentMessage) -> BusResult<()>;

    /// Subscribe to a topic, receiving every message published after the
    /// subscription is created.
    async fn subscribe(&self, topic: &str) -> BusResult<BusSubscription>;
}

/// A live subscription to one topic
pub struct BusSubscription {
    inner: broadcast::Receiver<AgentMessage>,
}

impl BusSubscription {
    /// Wait for the next message on the topic
    pub async fn recv(&mut self) -> BusResult<AgentMessage> {
        loop {
            match self.inner.recv().await {
                Ok(msg) => return Ok(msg),
                // A lagged subscriber skips ahead rather than erroring out;
                // at-least-once does not promise a bounded buffer.
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(dropped = n, "bus subscription lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }

    /// Non-blocking receive, `None` when no message is queued
    pub fn try_recv(&mut self) -> BusResult<Option<AgentMessage>> {
        match self.inner.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Err(BusError::Lagged(n)),
            Err(broadcast::error::TryRecvError::Closed) => Err(BusError::Closed),
        }
    }
}

/// In-memory bus over per-topic broadcast channels.
///
/// Senders are created lazily on first publish or subscribe and kept for
/// the life of the bus.
#[derive(Default)]
pub struct InMemoryBus {
    topics: DashMap<String, broadcast::Sender<AgentMessage>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<AgentMessage> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Number of live subscribers on a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, message: &AgentMessage) -> BusResult<()> {
        // send() errors only when there are no receivers; that is fine for
        // a fire-and-forget bus.
        let _ = self.sender(topic).send(message.clone());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> BusResult<BusSubscription> {
        Ok(BusSubscription {
            inner: self.sender(topic).subscribe(),
        })
    }
}

// ============================================================================
// Persistence cache
// ============================================================================

/// Errors from cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// External key/value store with per-entry TTL.
///
/// The core snapshots transient marketplace state here, best-effort; a
/// failed write is logged and never fails the in-memory operation.
#[async_trait]
pub trait PersistenceCache: Send + Sync {
    async fn put(&self, key: &str, value: serde_json::Value, ttl: Duration) -> CacheResult<()>;

    async fn get(&self, key: &str) -> CacheResult<Option<serde_json::Value>>;

    async fn remove(&self, key: &str) -> CacheResult<()>;
}

/// In-memory TTL cache with lazy expiry on read plus an explicit purge.
#[derive(Default)]
pub struct InMemoryCache {
    entries: DashMap<String, (serde_json::Value, DateTime<Utc>)>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires)| *expires > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PersistenceCache for InMemoryCache {
    async fn put(&self, key: &str, value: serde_json::Value, ttl: Duration) -> CacheResult<()> {
        let expires = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.entries.insert(key.to_string(), (value, expires));
        Ok(())
    }

    async fn get(&self, key: &str) -> CacheResult<Option<serde_json::Value>> {
        if let Some(entry) = self.entries.get(key) {
            let (value, expires) = entry.value();
            if *expires > Utc::now() {
                return Ok(Some(value.clone()));
            }
        }
        // Expired entries are reaped on access
        self.entries
            .remove_if(key, |_, (_, expires)| *expires <= Utc::now());
        Ok(None)
    }

    async fn remove(&self, key: &str) -> CacheResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tradeswarm_types::{AgentId, MessagePriority, MessageTarget};

    fn test_message(message_type: &str) -> AgentMessage {
        AgentMessage::new(
            message_type,
            AgentId::new("product-agent-P1"),
            MessageTarget::topic("updates"),
            serde_json::json!({}),
            MessagePriority::Medium,
        )
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("updates").await.unwrap();

        bus.publish("updates", &test_message("inventory_update"))
            .await
            .unwrap();

        let received = sub.recv().await.unwrap();
        assert_eq!(received.message_type, "inventory_update");
    }

    #[tokio::test]
    async fn test_topic_isolation() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("topic-a").await.unwrap();

        bus.publish("topic-b", &test_message("other")).await.unwrap();

        assert!(sub.try_recv().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = InMemoryBus::new();
        bus.publish("nobody-home", &test_message("noop"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cache_ttl_expiry() {
        let cache = InMemoryCache::new();
        cache
            .put("bid:1", serde_json::json!({"q": 10}), Duration::from_millis(20))
            .await
            .unwrap();

        assert!(cache.get("bid:1").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("bid:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_purge() {
        let cache = InMemoryCache::new();
        cache
            .put("short", serde_json::json!(1), Duration::from_millis(10))
            .await
            .unwrap();
        cache
            .put("long", serde_json::json!(2), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let purged = cache.purge_expired();
        assert_eq!(purged, 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_cache_remove() {
        let cache = InMemoryCache::new();
        cache
            .put("k", serde_json::json!(true), Duration::from_secs(60))
            .await
            .unwrap();
        cache.remove("k").await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
    }
}
