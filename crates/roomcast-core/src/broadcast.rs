//! Fan-out Broadcaster.
//!
//! Delivers one room record to every live client of that room. Delivery
//! never waits: each client's channel is offered the record with
//! `try_send`, so a slow client cannot stall the transport callback or any
//! other client.
//!
//! Full channels are handled per record kind:
//!
//! - chat messages are dropped for that client only, logged as
//!   [`ClientOverloaded`], and counted on the client so its stream can tell
//!   it to re-fetch history
//! - typing events are dropped silently

use roomcast_protocol::Record;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::registry::{ClientId, Offer, Registry};

/// A client fell behind and lost chat messages. Non-fatal and scoped to
/// that client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Client {client} in room {room} is overloaded ({dropped} chat messages dropped)")]
pub struct ClientOverloaded {
    /// The overloaded client.
    pub client: ClientId,
    /// Its room.
    pub room: String,
    /// Messages dropped in the current streak.
    pub dropped: u64,
}

/// Result of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutReport {
    /// Clients in the snapshot.
    pub recipients: usize,
    /// Clients the record was queued for.
    pub delivered: usize,
    /// Clients whose channel was full.
    pub dropped: usize,
    /// Clients whose receiver was already closed.
    pub closed: usize,
}

/// Cumulative delivery counters.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    delivered: AtomicU64,
    chat_dropped: AtomicU64,
    typing_dropped: AtomicU64,
    rejected: AtomicU64,
}

impl DeliveryStats {
    /// Records queued to clients.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Chat messages dropped for overloaded clients.
    #[must_use]
    pub fn chat_dropped(&self) -> u64 {
        self.chat_dropped.load(Ordering::Relaxed)
    }

    /// Typing events dropped for full clients.
    #[must_use]
    pub fn typing_dropped(&self) -> u64 {
        self.typing_dropped.load(Ordering::Relaxed)
    }

    /// Records refused because they named another room.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Fans room records out to registered clients.
#[derive(Debug)]
pub struct Broadcaster {
    registry: Arc<Registry>,
    stats: DeliveryStats,
}

impl Broadcaster {
    /// Create a broadcaster over a registry.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            stats: DeliveryStats::default(),
        }
    }

    /// Get the delivery counters.
    #[must_use]
    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    /// Deliver a record received for `room` to every client of `room`.
    ///
    /// Records that name a different room are refused.
    pub fn broadcast(&self, room: &str, record: Arc<Record>) -> FanoutReport {
        if record.room() != room {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                room = %room,
                record_room = %record.room(),
                "Refusing record addressed to another room"
            );
            return FanoutReport::default();
        }

        let clients = self.registry.clients(room);
        let mut report = FanoutReport {
            recipients: clients.len(),
            ..FanoutReport::default()
        };

        for client in &clients {
            match client.offer(Arc::clone(&record)) {
                Offer::Delivered => report.delivered += 1,
                Offer::Full if record.is_durable() => {
                    report.dropped += 1;
                    self.stats.chat_dropped.fetch_add(1, Ordering::Relaxed);
                    let overloaded = ClientOverloaded {
                        client: client.id(),
                        room: room.to_string(),
                        dropped: client.note_dropped() + 1,
                    };
                    if overloaded.dropped == 1 {
                        warn!(error = %overloaded, "Dropping chat message for slow client");
                    } else {
                        debug!(error = %overloaded, "Dropping chat message for slow client");
                    }
                }
                Offer::Full => {
                    report.dropped += 1;
                    self.stats.typing_dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(room = %room, client = %client.id(), "Dropped typing event");
                }
                Offer::Closed => report.closed += 1,
            }
        }

        self.stats
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        trace!(
            room = %room,
            kind = record.kind().as_str(),
            recipients = report.recipients,
            delivered = report.delivered,
            "Fan-out complete"
        );
        report
    }
}
