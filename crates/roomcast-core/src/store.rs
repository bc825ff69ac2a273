//! Durable message log boundary.
//!
//! The engine only appends and reads; retention and replication belong to
//! the implementation.

use async_trait::async_trait;
use dashmap::DashMap;
use roomcast_protocol::ChatMessage;
use thiserror::Error;
use tracing::trace;

/// Message log errors.
#[derive(Debug, Error)]
pub enum LogError {
    /// The store cannot be reached.
    #[error("Message log unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the operation.
    #[error("Message log error: {0}")]
    Storage(String),
}

/// An append-only, per-room message log.
#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Durably append a message. Returns only once the write is complete.
    async fn append(&self, message: &ChatMessage) -> Result<(), LogError>;

    /// All messages of a room, ascending by `created_at`, ties in append order.
    async fn query(&self, room: &str) -> Result<Vec<ChatMessage>, LogError>;

    /// Every room that has at least one message.
    async fn distinct_rooms(&self) -> Result<Vec<String>, LogError>;
}

/// In-memory message log.
#[derive(Debug, Default)]
pub struct MemoryLog {
    rooms: DashMap<String, Vec<ChatMessage>>,
}

impl MemoryLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.iter().map(|r| r.len()).sum()
    }

    /// Whether the log holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[async_trait]
impl MessageLog for MemoryLog {
    async fn append(&self, message: &ChatMessage) -> Result<(), LogError> {
        self.rooms
            .entry(message.room.clone())
            .or_default()
            .push(message.clone());
        trace!(room = %message.room, id = message.id, "Appended message");
        Ok(())
    }

    async fn query(&self, room: &str) -> Result<Vec<ChatMessage>, LogError> {
        let mut messages = self
            .rooms
            .get(room)
            .map(|r| r.value().clone())
            .unwrap_or_default();
        // Stable sort keeps append order among equal timestamps.
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn distinct_rooms(&self) -> Result<Vec<String>, LogError> {
        Ok(self.rooms.iter().map(|r| r.key().clone()).collect())
    }
}
