//! Record types for roomcast.
//!
//! A `Record` is the unit that travels over room topics and down each
//! viewer's stream. It is tagged by `type` so clients can tell chat
//! messages from typing events without out-of-band context.

use serde::{Deserialize, Serialize};

/// A unique message identifier.
pub type MessageId = u64;

/// A persisted chat message.
///
/// The sender is always the authenticated identity of the request that
/// produced it. Once appended to the message log it is never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Server-assigned identifier.
    pub id: MessageId,
    /// Room the message belongs to.
    pub room: String,
    /// Authenticated sender.
    pub sender: String,
    /// Message body. May be empty.
    pub content: String,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// An ephemeral typing-status change. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingEvent {
    /// Room the sender is typing in.
    pub room: String,
    /// Authenticated sender.
    pub sender: String,
    /// Whether the sender is currently typing.
    pub typing: bool,
}

/// Record kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Message,
    Typing,
    Overloaded,
}

impl RecordKind {
    /// The tag used on the wire and as the stream event name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Message => "message",
            RecordKind::Typing => "typing",
            RecordKind::Overloaded => "overloaded",
        }
    }
}

/// A self-describing room record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Record {
    /// A durable chat message.
    #[serde(rename = "message")]
    Message(ChatMessage),

    /// A transient typing indicator.
    #[serde(rename = "typing")]
    Typing(TypingEvent),

    /// Sent to a single viewer after chat messages were dropped for it.
    /// The viewer should re-fetch history to recover.
    #[serde(rename = "overloaded")]
    Overloaded {
        /// Room whose messages were dropped.
        room: String,
        /// Number of chat messages dropped since the last notice.
        dropped: u64,
    },
}

impl Record {
    /// Get the record kind.
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Message(_) => RecordKind::Message,
            Record::Typing(_) => RecordKind::Typing,
            Record::Overloaded { .. } => RecordKind::Overloaded,
        }
    }

    /// Get the room this record belongs to.
    #[must_use]
    pub fn room(&self) -> &str {
        match self {
            Record::Message(m) => &m.room,
            Record::Typing(t) => &t.room,
            Record::Overloaded { room, .. } => room,
        }
    }

    /// Whether losing this record must be reported to the viewer.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        matches!(self, Record::Message(_))
    }
}

impl From<ChatMessage> for Record {
    fn from(message: ChatMessage) -> Self {
        Record::Message(message)
    }
}

impl From<TypingEvent> for Record {
    fn from(event: TypingEvent) -> Self {
        Record::Typing(event)
    }
}
