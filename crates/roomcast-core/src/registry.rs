//! Live Client Registry.
//!
//! Tracks which live clients are watching which room. Rooms are sharded
//! across a `DashMap`, so broadcasts for a room take a shard read lock
//! while joins and leaves take the write lock. Nothing performs I/O while a
//! shard lock is held: the broadcaster copies the matching clients out and
//! releases the lock before delivering.

use dashmap::DashMap;
use roomcast_protocol::Record;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::auth::Identity;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a live client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl ClientId {
    fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client_{}", self.0)
    }
}

/// Outcome of offering a record to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// The record was queued.
    Delivered,
    /// The client's channel is full; the record was not queued.
    Full,
    /// The client's receiver is gone.
    Closed,
}

/// One open streaming connection watching a room.
///
/// Only the broadcaster writes to the delivery channel; only the owning
/// connection reads from it.
#[derive(Debug)]
pub struct LiveClient {
    id: ClientId,
    room: String,
    viewer: Identity,
    sender: mpsc::Sender<Arc<Record>>,
    dropped: AtomicU64,
}

impl LiveClient {
    /// Create a client and its bounded delivery channel.
    #[must_use]
    pub fn channel(
        room: impl Into<String>,
        viewer: Identity,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<Record>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let client = Arc::new(Self {
            id: ClientId::next(),
            room: room.into(),
            viewer,
            sender,
            dropped: AtomicU64::new(0),
        });
        (client, receiver)
    }

    /// Get the client ID.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Get the watched room.
    #[must_use]
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Get the viewing identity.
    #[must_use]
    pub fn viewer(&self) -> &Identity {
        &self.viewer
    }

    /// Queue a record without waiting.
    pub fn offer(&self, record: Arc<Record>) -> Offer {
        match self.sender.try_send(record) {
            Ok(()) => Offer::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Offer::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Offer::Closed,
        }
    }

    /// Count a dropped chat message. Returns the count before this drop.
    pub fn note_dropped(&self) -> u64 {
        self.dropped.fetch_add(1, Ordering::AcqRel)
    }

    /// Take the number of chat messages dropped since the last call.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::AcqRel)
    }
}

/// Handle returned by [`Registry::register`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientHandle {
    id: ClientId,
    room: String,
}

impl ClientHandle {
    /// Get the client ID.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Get the room.
    #[must_use]
    pub fn room(&self) -> &str {
        &self.room
    }
}

/// Registry of live clients by room.
#[derive(Debug, Default)]
pub struct Registry {
    rooms: DashMap<String, HashMap<ClientId, Arc<LiveClient>>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client under its room.
    pub fn register(&self, client: Arc<LiveClient>) -> ClientHandle {
        let handle = ClientHandle {
            id: client.id(),
            room: client.room().to_string(),
        };

        let mut clients = self.rooms.entry(handle.room.clone()).or_default();
        clients.insert(handle.id, client);

        debug!(
            room = %handle.room,
            client = %handle.id,
            viewers = clients.len(),
            "Client registered"
        );
        handle
    }

    /// Remove a client. Returns `false` if it was not registered.
    ///
    /// Once this returns, no snapshot taken afterwards contains the client.
    pub fn deregister(&self, handle: &ClientHandle) -> bool {
        let (removed, emptied) = match self.rooms.get_mut(&handle.room) {
            Some(mut clients) => {
                let removed = clients.remove(&handle.id).is_some();
                (removed, clients.is_empty())
            }
            None => (false, false),
        };

        if emptied {
            self.rooms.remove_if(&handle.room, |_, clients| clients.is_empty());
        }

        if removed {
            debug!(room = %handle.room, client = %handle.id, "Client deregistered");
        }
        removed
    }

    /// Snapshot the clients currently watching a room.
    #[must_use]
    pub fn clients(&self, room: &str) -> Vec<Arc<LiveClient>> {
        self.rooms
            .get(room)
            .map(|clients| clients.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of clients watching a room.
    #[must_use]
    pub fn client_count(&self, room: &str) -> usize {
        self.rooms.get(room).map(|c| c.len()).unwrap_or(0)
    }

    /// Number of rooms with at least one client.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Total number of registered clients.
    #[must_use]
    pub fn total_clients(&self) -> usize {
        self.rooms.iter().map(|c| c.len()).sum()
    }
}
