//! Message Ingress.
//!
//! Chat messages are persisted before they are published, so anything a
//! live viewer sees is already in the room's history. Typing events skip
//! the log entirely.
//!
//! Stamping and appending happen under a per-room lock, so within a room the
//! persistence order and the timestamp order always agree.

use dashmap::DashMap;
use roomcast_protocol::{chat_topic, codec, typing_topic, validate_room, ChatMessage, Record, TypingEvent};
use roomcast_transport::Transport;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::auth::Identity;
use crate::clock::{generate_message_id, MonotonicClock};
use crate::error::EngineError;
use crate::store::MessageLog;

/// Accepts messages and typing events from authenticated senders.
pub struct Ingress {
    log: Arc<dyn MessageLog>,
    transport: Arc<dyn Transport>,
    clock: MonotonicClock,
    append_locks: DashMap<String, Arc<Mutex<()>>>,
    publish_failures: AtomicU64,
}

impl Ingress {
    /// Create an ingress over a log and a transport.
    #[must_use]
    pub fn new(log: Arc<dyn MessageLog>, transport: Arc<dyn Transport>) -> Self {
        Self {
            log,
            transport,
            clock: MonotonicClock::new(),
            append_locks: DashMap::new(),
            publish_failures: AtomicU64::new(0),
        }
    }

    /// Chat messages that were persisted but could not be published.
    #[must_use]
    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    /// Persist a chat message, then publish it to the room.
    ///
    /// The sender is always `identity`. The returned message carries the
    /// server-assigned ID and timestamp.
    ///
    /// # Errors
    ///
    /// `InvalidRoom` for a bad room name and `Persistence` when the log
    /// refuses the append; in both cases nothing is published. A failed
    /// publish is logged and does not fail the send, since the message is
    /// already durable and reaches viewers through history.
    pub async fn send_message(
        &self,
        identity: &Identity,
        room: &str,
        content: impl Into<String>,
    ) -> Result<ChatMessage, EngineError> {
        validate_room(room).map_err(EngineError::InvalidRoom)?;

        let mut message = ChatMessage {
            id: generate_message_id(),
            room: room.to_string(),
            sender: identity.as_str().to_string(),
            content: content.into(),
            created_at: 0,
        };

        {
            let lock = self.append_lock(room);
            let _guard = lock.lock().await;
            message.created_at = self.clock.now();
            self.log.append(&message).await?;
        }
        debug!(room = %room, id = message.id, sender = %identity, "Message persisted");

        let record = Record::Message(message.clone());
        let published = match codec::encode(&record) {
            Ok(payload) => self
                .transport
                .publish(&chat_topic(room), payload)
                .await
                .map_err(EngineError::from),
            Err(e) => Err(EngineError::from(e)),
        };

        if let Err(e) = published {
            self.publish_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                room = %room,
                id = message.id,
                error = %e,
                "Persisted message was not published to live viewers"
            );
        }

        Ok(message)
    }

    fn append_lock(&self, room: &str) -> Arc<Mutex<()>> {
        Arc::clone(&self.append_locks.entry(room.to_string()).or_default())
    }

    /// Publish a typing-status change to the room.
    ///
    /// # Errors
    ///
    /// `InvalidRoom` for a bad room name, `Transport` if the publish fails.
    pub async fn send_typing(
        &self,
        identity: &Identity,
        room: &str,
        typing: bool,
    ) -> Result<(), EngineError> {
        validate_room(room).map_err(EngineError::InvalidRoom)?;

        let record = Record::Typing(TypingEvent {
            room: room.to_string(),
            sender: identity.as_str().to_string(),
            typing,
        });
        let payload = codec::encode(&record)?;
        self.transport.publish(&typing_topic(room), payload).await?;
        Ok(())
    }
}
