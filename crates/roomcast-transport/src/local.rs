//! In-process topic transport.
//!
//! Each topic is a tokio broadcast channel. Every subscription runs its own
//! forwarding task that invokes the callback in publish order.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::traits::{SubscriptionHandle, SubscriptionId, TopicCallback, Transport, TransportError};

/// Default per-topic buffer.
const DEFAULT_TOPIC_CAPACITY: usize = 1024;

struct TopicEntry {
    sender: broadcast::Sender<Bytes>,
    subscribers: usize,
}

struct LocalSubscription {
    topic: String,
    active: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// In-process transport backed by tokio broadcast channels.
///
/// A subscriber that falls more than `capacity` payloads behind skips the
/// oldest ones; the skip is logged.
pub struct LocalTransport {
    topics: DashMap<String, TopicEntry>,
    subscriptions: DashMap<SubscriptionId, LocalSubscription>,
    capacity: usize,
    closed: AtomicBool,
}

impl LocalTransport {
    /// Create a transport with the default per-topic capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Create a transport with a specific per-topic capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            subscriptions: DashMap::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of topics with at least one subscriber.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Stop all subscriptions and reject further use.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscriptions.retain(|_, sub| {
            sub.active.store(false, Ordering::Release);
            sub.task.abort();
            false
        });
        self.topics.clear();
        debug!("Local transport shut down");
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        for sub in self.subscriptions.iter() {
            sub.task.abort();
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        self.ensure_open()?;

        if let Some(entry) = self.topics.get(topic) {
            let receivers = entry.sender.send(payload).unwrap_or_default();
            trace!(topic = %topic, receivers, "Published payload");
        } else {
            trace!(topic = %topic, "Publish to topic without subscribers");
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        callback: TopicCallback,
    ) -> Result<SubscriptionHandle, TransportError> {
        self.ensure_open()?;

        let mut receiver = {
            let mut entry = self
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| TopicEntry {
                    sender: broadcast::channel(self.capacity).0,
                    subscribers: 0,
                });
            entry.subscribers += 1;
            entry.sender.subscribe()
        };

        let id = SubscriptionId::next();
        let active = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&active);
        let task_topic = topic.to_string();

        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(payload) => {
                        if !flag.load(Ordering::Acquire) {
                            break;
                        }
                        callback(payload);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %task_topic, skipped, "Subscriber lagged, payloads skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.subscriptions.insert(
            id,
            LocalSubscription {
                topic: topic.to_string(),
                active,
                task,
            },
        );

        debug!(topic = %topic, subscription = %id, "Subscribed");
        Ok(SubscriptionHandle::new(id, topic))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), TransportError> {
        let (_, sub) = self
            .subscriptions
            .remove(&handle.id())
            .ok_or(TransportError::UnknownSubscription(handle.id()))?;

        sub.active.store(false, Ordering::Release);
        sub.task.abort();

        let emptied = match self.topics.get_mut(&sub.topic) {
            Some(mut entry) => {
                entry.subscribers = entry.subscribers.saturating_sub(1);
                entry.subscribers == 0
            }
            None => false,
        };
        if emptied {
            self.topics.remove_if(&sub.topic, |_, e| e.subscribers == 0);
        }

        debug!(topic = %sub.topic, subscription = %handle.id(), "Unsubscribed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }

    fn is_healthy(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}
