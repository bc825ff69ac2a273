//! Test doubles shared by the engine's unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use roomcast_protocol::ChatMessage;
use roomcast_transport::{
    LocalTransport, SubscriptionHandle, TopicCallback, Transport, TransportError,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::store::{LogError, MemoryLog, MessageLog};

/// A [`LocalTransport`] that counts calls per topic and can be told to fail.
#[derive(Default)]
pub struct CountingTransport {
    inner: LocalTransport,
    subscribes: DashMap<String, usize>,
    unsubscribes: DashMap<String, usize>,
    publishes: DashMap<String, usize>,
    failing_topics: DashSet<String>,
    fail_publish: AtomicBool,
}

impl CountingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribes(&self, topic: &str) -> usize {
        self.subscribes.get(topic).map(|n| *n).unwrap_or(0)
    }

    pub fn unsubscribes(&self, topic: &str) -> usize {
        self.unsubscribes.get(topic).map(|n| *n).unwrap_or(0)
    }

    pub fn publishes(&self, topic: &str) -> usize {
        self.publishes.get(topic).map(|n| *n).unwrap_or(0)
    }

    pub fn total_publishes(&self) -> usize {
        self.publishes.iter().map(|n| *n.value()).sum()
    }

    pub fn live_subscriptions(&self) -> usize {
        self.inner.subscription_count()
    }

    pub fn fail_subscribe_on(&self, topic: &str) {
        self.failing_topics.insert(topic.to_string());
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn clear_failures(&self) {
        self.failing_topics.clear();
        self.fail_publish(false);
    }
}

#[async_trait]
impl Transport for CountingTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::PublishFailed("injected".into()));
        }
        *self.publishes.entry(topic.to_string()).or_default() += 1;
        self.inner.publish(topic, payload).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        callback: TopicCallback,
    ) -> Result<SubscriptionHandle, TransportError> {
        if self.failing_topics.contains(topic) {
            return Err(TransportError::SubscribeFailed("injected".into()));
        }
        *self.subscribes.entry(topic.to_string()).or_default() += 1;
        self.inner.subscribe(topic, callback).await
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), TransportError> {
        *self.unsubscribes.entry(handle.topic().to_string()).or_default() += 1;
        self.inner.unsubscribe(handle).await
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

/// A message log that is always down.
pub struct FailingLog;

#[async_trait]
impl MessageLog for FailingLog {
    async fn append(&self, _message: &ChatMessage) -> Result<(), LogError> {
        Err(LogError::Unavailable("injected".into()))
    }

    async fn query(&self, _room: &str) -> Result<Vec<ChatMessage>, LogError> {
        Err(LogError::Unavailable("injected".into()))
    }

    async fn distinct_rooms(&self) -> Result<Vec<String>, LogError> {
        Err(LogError::Unavailable("injected".into()))
    }
}

/// A memory log that notes how many publishes had happened at each append.
pub struct JournalingLog {
    inner: MemoryLog,
    transport: Arc<CountingTransport>,
    seen: Mutex<Vec<usize>>,
}

impl JournalingLog {
    pub fn new(transport: Arc<CountingTransport>) -> Self {
        Self {
            inner: MemoryLog::new(),
            transport,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn publishes_seen_at_append(&self) -> Vec<usize> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageLog for JournalingLog {
    async fn append(&self, message: &ChatMessage) -> Result<(), LogError> {
        self.seen
            .lock()
            .unwrap()
            .push(self.transport.total_publishes());
        self.inner.append(message).await
    }

    async fn query(&self, room: &str) -> Result<Vec<ChatMessage>, LogError> {
        self.inner.query(room).await
    }

    async fn distinct_rooms(&self) -> Result<Vec<String>, LogError> {
        self.inner.distinct_rooms().await
    }
}

/// A memory log that records append order and can hold chosen appends back.
pub struct RecordingLog {
    inner: MemoryLog,
    delay: fn(&ChatMessage) -> Duration,
    appended: Mutex<Vec<String>>,
}

impl RecordingLog {
    pub fn new(delay: fn(&ChatMessage) -> Duration) -> Self {
        Self {
            inner: MemoryLog::new(),
            delay,
            appended: Mutex::new(Vec::new()),
        }
    }

    /// Contents in the order the appends completed.
    pub fn append_order(&self) -> Vec<String> {
        self.appended.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageLog for RecordingLog {
    async fn append(&self, message: &ChatMessage) -> Result<(), LogError> {
        let delay = (self.delay)(message);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.inner.append(message).await?;
        self.appended.lock().unwrap().push(message.content.clone());
        Ok(())
    }

    async fn query(&self, room: &str) -> Result<Vec<ChatMessage>, LogError> {
        self.inner.query(room).await
    }

    async fn distinct_rooms(&self) -> Result<Vec<String>, LogError> {
        self.inner.distinct_rooms().await
    }
}

/// Poll `condition` until it holds, panicking after two seconds.
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
