//! # roomcast-core
//!
//! The room event distribution engine.
//!
//! - **Session Gate** - turns a bearer token into an authenticated [`Identity`]
//! - **Ingress** - persists chat messages, then publishes them to the room topic
//! - **Subscriptions** - one transport subscription per room with viewers
//! - **Registry** - which live clients watch which room
//! - **Broadcaster** - non-blocking fan-out to every live client of a room
//!
//! ## Architecture
//!
//! ```text
//!  sender ──▶ SessionGate ──▶ Ingress ──▶ MessageLog
//!                                │
//!                                ▼ publish
//!                            Transport ──▶ SubscriptionManager callback
//!                                                 │
//!                                                 ▼
//!  viewer ◀── Viewer ◀── mpsc ◀── Broadcaster ◀── Registry snapshot
//! ```

pub mod auth;
pub mod broadcast;
pub mod clock;
pub mod engine;
pub mod error;
pub mod ingress;
pub mod registry;
pub mod store;
pub mod subscription;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{AuthError, Identity, JwtSessions, SessionGate, SessionVerifier};
pub use broadcast::{Broadcaster, ClientOverloaded, DeliveryStats, FanoutReport};
pub use engine::{Engine, EngineConfig, EngineStats, Viewer};
pub use error::EngineError;
pub use ingress::Ingress;
pub use registry::{ClientHandle, ClientId, LiveClient, Registry};
pub use store::{LogError, MemoryLog, MessageLog};
pub use subscription::{SubscriptionError, SubscriptionManager};

pub use roomcast_protocol::{ChatMessage, Record, RecordKind, TypingEvent};
