//! # roomcast-protocol
//!
//! Wire-level definitions shared by every roomcast crate.
//!
//! - **Records** - `ChatMessage`, `TypingEvent` and the self-describing
//!   `Record` delivered to live viewers
//! - **Topics** - room name validation and the chat/typing topic names
//! - **Codec** - versioned MessagePack framing for topic payloads, JSON for
//!   client streams
//!
//! ## Example
//!
//! ```rust
//! use roomcast_protocol::{codec, ChatMessage, Record};
//!
//! let record = Record::Message(ChatMessage {
//!     id: 1,
//!     room: "general".into(),
//!     sender: "alice".into(),
//!     content: "hi".into(),
//!     created_at: 1_700_000_000_000,
//! });
//!
//! let payload = codec::encode(&record).unwrap();
//! assert_eq!(codec::decode(&payload).unwrap(), record);
//! ```

pub mod codec;
pub mod records;
pub mod topic;

pub use codec::{decode, encode, ProtocolError, PROTOCOL_MAJOR};
pub use records::{ChatMessage, MessageId, Record, RecordKind, TypingEvent};
pub use topic::{chat_topic, typing_topic, validate_room};
