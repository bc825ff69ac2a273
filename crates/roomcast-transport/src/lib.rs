//! # roomcast-transport
//!
//! Topic transport abstraction for roomcast.
//!
//! A transport moves opaque payloads between publishers and subscribers
//! addressed by topic name. roomcast treats it as an at-least-once,
//! already-connected service:
//!
//! - **Local** - in-process topics backed by tokio broadcast channels
//! - **Redis** - Redis pub/sub, for running several server processes
//!
//! ```rust,ignore
//! use roomcast_transport::{LocalTransport, Transport};
//!
//! let transport = LocalTransport::new();
//! let handle = transport
//!     .subscribe("general", Arc::new(|payload| println!("{payload:?}")))
//!     .await?;
//! transport.publish("general", Bytes::from_static(b"hi")).await?;
//! transport.unsubscribe(handle).await?;
//! ```

pub mod traits;

#[cfg(feature = "local")]
pub mod local;

#[cfg(feature = "redis")]
pub mod redis;

pub use traits::{SubscriptionHandle, SubscriptionId, TopicCallback, Transport, TransportError};

#[cfg(feature = "local")]
pub use local::LocalTransport;

#[cfg(feature = "redis")]
pub use self::redis::RedisTransport;
