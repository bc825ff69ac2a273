//! Shared fixtures for the roomcast benchmarks.

use roomcast_core::{Engine, EngineConfig, Identity, JwtSessions, LiveClient, MemoryLog, Record, Registry};
use roomcast_protocol::ChatMessage;
use roomcast_transport::LocalTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A chat record with a `size`-byte body.
#[must_use]
pub fn chat_record(room: &str, size: usize) -> Record {
    Record::Message(ChatMessage {
        id: 1,
        room: room.to_string(),
        sender: "bench".to_string(),
        content: "x".repeat(size),
        created_at: 1_700_000_000_000,
    })
}

/// Register `count` viewers of `room`, returning their receivers.
pub fn register_viewers(
    registry: &Registry,
    room: &str,
    count: usize,
    capacity: usize,
) -> Vec<mpsc::Receiver<Arc<Record>>> {
    (0..count)
        .map(|i| {
            let (client, rx) = LiveClient::channel(room, Identity::new(format!("viewer-{i}")), capacity);
            registry.register(client);
            rx
        })
        .collect()
}

/// An engine over the in-process transport and an in-memory log.
#[must_use]
pub fn local_engine(client_capacity: usize) -> Engine {
    Engine::new(
        Arc::new(LocalTransport::new()),
        Arc::new(MemoryLog::new()),
        Arc::new(JwtSessions::new(b"bench", Duration::from_secs(3600))),
        EngineConfig { client_capacity },
    )
}
