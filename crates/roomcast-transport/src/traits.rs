//! Transport abstraction traits for roomcast.
//!
//! These traits define the interface every topic transport must provide,
//! allowing the engine to be transport-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Callback invoked with every payload published on a subscribed topic.
///
/// Transports invoke a subscription's callback sequentially, in the order
/// the payloads were received. Callbacks must not block.
pub type TopicCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a transport subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    /// Allocate the next process-unique subscription ID.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

/// Handle to an active subscription, returned by [`Transport::subscribe`].
///
/// Not `Clone`: a subscription is released exactly once by passing the
/// handle back to [`Transport::unsubscribe`].
#[derive(Debug, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    topic: String,
}

impl SubscriptionHandle {
    /// Create a new handle.
    #[must_use]
    pub fn new(id: SubscriptionId, topic: impl Into<String>) -> Self {
        Self {
            id,
            topic: topic.into(),
        }
    }

    /// Get the subscription ID.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Get the subscribed topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport has been shut down.
    #[error("Transport closed")]
    Closed,

    /// Failed to publish a payload.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Failed to open a subscription.
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// The subscription is not known to this transport.
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A publish/subscribe transport addressed by topic name.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a payload to every current subscriber of `topic`.
    ///
    /// Publishing to a topic with no subscribers succeeds.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Subscribe to `topic`, invoking `callback` for each received payload.
    async fn subscribe(
        &self,
        topic: &str,
        callback: TopicCallback,
    ) -> Result<SubscriptionHandle, TransportError>;

    /// Cancel a subscription. After this returns the callback is not
    /// invoked for newly published payloads.
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), TransportError>;

    /// Get the transport name (e.g., "local", "redis").
    fn name(&self) -> &'static str;

    /// Check if the transport is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}
