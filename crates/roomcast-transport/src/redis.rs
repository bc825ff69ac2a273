//! Redis pub/sub transport.
//!
//! Publishing goes through a shared multiplexed connection manager. Every
//! subscription owns a dedicated pub/sub connection, as Redis requires, and
//! a task that forwards its messages to the callback.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::traits::{SubscriptionHandle, SubscriptionId, TopicCallback, Transport, TransportError};

struct RedisSubscription {
    active: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Transport over Redis pub/sub.
pub struct RedisTransport {
    client: redis::Client,
    publisher: ConnectionManager,
    subscriptions: DashMap<SubscriptionId, RedisSubscription>,
    healthy: Arc<AtomicBool>,
}

impl RedisTransport {
    /// Connect to Redis at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(url)
            .map_err(|e| TransportError::Other(format!("Invalid Redis URL: {e}")))?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| TransportError::Other(format!("Redis connection failed: {e}")))?;

        info!("Redis transport connected");

        Ok(Self {
            client,
            publisher,
            subscriptions: DashMap::new(),
            healthy: Arc::new(AtomicBool::new(true)),
        })
    }
}

impl Drop for RedisTransport {
    fn drop(&mut self) {
        for sub in self.subscriptions.iter() {
            sub.task.abort();
        }
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let mut conn = self.publisher.clone();
        let result: redis::RedisResult<usize> = conn.publish(topic, payload.as_ref()).await;

        match result {
            Ok(receivers) => {
                self.healthy.store(true, Ordering::Relaxed);
                debug!(topic = %topic, receivers, "Published payload");
                Ok(())
            }
            Err(e) => {
                self.healthy.store(false, Ordering::Relaxed);
                Err(TransportError::PublishFailed(e.to_string()))
            }
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        callback: TopicCallback,
    ) -> Result<SubscriptionHandle, TransportError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;

        let id = SubscriptionId::next();
        let active = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&active);
        let healthy = Arc::clone(&self.healthy);
        let task_topic = topic.to_string();

        let task = tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                if !flag.load(Ordering::Acquire) {
                    break;
                }
                callback(Bytes::copy_from_slice(msg.get_payload_bytes()));
            }
            if flag.load(Ordering::Acquire) {
                healthy.store(false, Ordering::Relaxed);
                warn!(topic = %task_topic, "Redis subscription ended unexpectedly");
            }
        });

        self.subscriptions
            .insert(id, RedisSubscription { active, task });

        debug!(topic = %topic, subscription = %id, "Subscribed");
        Ok(SubscriptionHandle::new(id, topic))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), TransportError> {
        let (_, sub) = self
            .subscriptions
            .remove(&handle.id())
            .ok_or(TransportError::UnknownSubscription(handle.id()))?;

        // Dropping the pub/sub connection ends the server-side subscription.
        sub.active.store(false, Ordering::Release);
        sub.task.abort();

        debug!(topic = %handle.topic(), subscription = %handle.id(), "Unsubscribed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}
