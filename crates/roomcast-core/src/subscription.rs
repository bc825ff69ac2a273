//! Room Subscription Manager.
//!
//! Keeps exactly one transport subscription per room while the room has
//! viewers. Each room is either inactive (no subscription, no viewers) or
//! active (chat and typing topic subscriptions plus a viewer count).
//!
//! Decisions for a room are serialized by that room's async mutex, so two
//! viewers joining an inactive room at once open one subscription, and a
//! teardown in progress finishes before the next join looks at the state.
//! Transport calls happen under the room mutex only, never under a map
//! shard lock.

use bytes::Bytes;
use dashmap::DashMap;
use roomcast_protocol::{chat_topic, codec, typing_topic};
use roomcast_transport::{SubscriptionHandle, TopicCallback, Transport, TransportError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::broadcast::Broadcaster;

/// Failure to open a room's transport subscription.
#[derive(Debug, Error)]
#[error("Failed to subscribe to room {room}: {source}")]
pub struct SubscriptionError {
    /// Room that could not be subscribed.
    pub room: String,
    /// Underlying transport failure.
    #[source]
    pub source: TransportError,
}

#[derive(Debug, Default)]
enum RoomState {
    #[default]
    Inactive,
    Active {
        chat: SubscriptionHandle,
        typing: SubscriptionHandle,
        viewers: usize,
    },
}

impl RoomState {
    fn is_inactive(&self) -> bool {
        matches!(self, RoomState::Inactive)
    }
}

type RoomSlot = Arc<Mutex<RoomState>>;

/// Reference-counted room subscriptions.
pub struct SubscriptionManager {
    transport: Arc<dyn Transport>,
    broadcaster: Arc<Broadcaster>,
    rooms: DashMap<String, RoomSlot>,
    deferred: DashMap<String, usize>,
    active: AtomicUsize,
}

impl SubscriptionManager {
    /// Create a manager that feeds `broadcaster` from `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            transport,
            broadcaster,
            rooms: DashMap::new(),
            deferred: DashMap::new(),
            active: AtomicUsize::new(0),
        }
    }

    /// Number of rooms with a live subscription.
    #[must_use]
    pub fn active_rooms(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Current viewer count of a room.
    pub async fn viewers(&self, room: &str) -> usize {
        let Some(slot) = self.slot(room) else {
            return 0;
        };
        let state = slot.lock().await;
        match &*state {
            RoomState::Active { viewers, .. } => *viewers,
            RoomState::Inactive => 0,
        }
    }

    /// Add a viewer to a room, subscribing if it is the first.
    ///
    /// # Errors
    ///
    /// Returns an error if the room was inactive and the transport refused
    /// the subscription. The room stays inactive.
    pub async fn acquire(&self, room: &str) -> Result<(), SubscriptionError> {
        self.settle_deferred().await;
        let slot = Arc::clone(&self.rooms.entry(room.to_string()).or_default());

        let result = {
            let mut state = slot.lock().await;
            if let RoomState::Active { viewers, .. } = &mut *state {
                *viewers += 1;
                debug!(room = %room, viewers = *viewers, "Joined active room");
                Ok(())
            } else {
                match self.open(room).await {
                    Ok((chat, typing)) => {
                        *state = RoomState::Active {
                            chat,
                            typing,
                            viewers: 1,
                        };
                        self.active.fetch_add(1, Ordering::Relaxed);
                        info!(room = %room, "Room subscription opened");
                        Ok(())
                    }
                    Err(source) => Err(SubscriptionError {
                        room: room.to_string(),
                        source,
                    }),
                }
            }
        };

        self.prune(room, slot);
        result
    }

    /// Acquire in a detached task.
    ///
    /// If the caller stops waiting before the acquisition finishes, the
    /// task releases what it acquired, so an abandoned join never leaves a
    /// dangling viewer count.
    ///
    /// # Errors
    ///
    /// Same as [`SubscriptionManager::acquire`].
    pub async fn acquire_owned(self: &Arc<Self>, room: &str) -> Result<(), SubscriptionError> {
        let (tx, rx) = oneshot::channel();
        let manager = Arc::clone(self);
        let task_room = room.to_string();

        tokio::spawn(async move {
            let result = manager.acquire(&task_room).await;
            if let Err(Ok(())) = tx.send(result) {
                debug!(room = %task_room, "Join abandoned, releasing");
                manager.release(&task_room).await;
            }
        });

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(SubscriptionError {
                room: room.to_string(),
                source: TransportError::Other("subscription task aborted".into()),
            }),
        }
    }

    /// Remove a viewer from a room, unsubscribing if it was the last.
    pub async fn release(&self, room: &str) {
        self.settle_deferred().await;
        self.release_one(room).await;
    }

    /// Queue a release that cannot run now, e.g. from a drop with no runtime.
    ///
    /// Queued releases run before the next acquire or release.
    pub fn defer_release(&self, room: &str) {
        *self.deferred.entry(room.to_string()).or_default() += 1;
        debug!(room = %room, "Release deferred");
    }

    async fn settle_deferred(&self) {
        if self.deferred.is_empty() {
            return;
        }
        let rooms: Vec<String> = self.deferred.iter().map(|e| e.key().clone()).collect();
        for room in rooms {
            let Some((room, count)) = self.deferred.remove(&room) else {
                continue;
            };
            for _ in 0..count {
                self.release_one(&room).await;
            }
        }
    }

    async fn release_one(&self, room: &str) {
        let Some(slot) = self.slot(room) else {
            warn!(room = %room, "Release for unknown room");
            return;
        };

        {
            let mut state = slot.lock().await;
            let last = match &mut *state {
                RoomState::Active { viewers, .. } => {
                    *viewers -= 1;
                    debug!(room = %room, viewers = *viewers, "Left room");
                    *viewers == 0
                }
                RoomState::Inactive => {
                    warn!(room = %room, "Release for inactive room");
                    false
                }
            };

            if last {
                if let RoomState::Active { chat, typing, .. } =
                    std::mem::take(&mut *state)
                {
                    self.close(room, chat, typing).await;
                }
                self.active.fetch_sub(1, Ordering::Relaxed);
                info!(room = %room, "Room subscription closed");
            }
        }

        self.prune(room, slot);
    }

    fn slot(&self, room: &str) -> Option<RoomSlot> {
        self.rooms.get(room).map(|slot| Arc::clone(slot.value()))
    }

    /// Drop the room's slot if it is inactive and nobody else holds it.
    fn prune(&self, room: &str, slot: RoomSlot) {
        drop(slot);
        self.rooms.remove_if(room, |_, slot| {
            Arc::strong_count(slot) == 1
                && slot
                    .try_lock()
                    .map(|state| state.is_inactive())
                    .unwrap_or(false)
        });
    }

    async fn open(
        &self,
        room: &str,
    ) -> Result<(SubscriptionHandle, SubscriptionHandle), TransportError> {
        let callback = self.callback(room);

        let chat = self
            .transport
            .subscribe(&chat_topic(room), Arc::clone(&callback))
            .await?;

        match self.transport.subscribe(&typing_topic(room), callback).await {
            Ok(typing) => Ok((chat, typing)),
            Err(e) => {
                if let Err(undo) = self.transport.unsubscribe(chat).await {
                    warn!(room = %room, error = %undo, "Failed to undo chat subscription");
                }
                Err(e)
            }
        }
    }

    async fn close(&self, room: &str, chat: SubscriptionHandle, typing: SubscriptionHandle) {
        for handle in [chat, typing] {
            let topic = handle.topic().to_string();
            if let Err(e) = self.transport.unsubscribe(handle).await {
                warn!(room = %room, topic = %topic, error = %e, "Unsubscribe failed");
            }
        }
    }

    fn callback(&self, room: &str) -> TopicCallback {
        let broadcaster = Arc::clone(&self.broadcaster);
        let room = room.to_string();

        Arc::new(move |payload: Bytes| match codec::decode(&payload) {
            Ok(record) => {
                broadcaster.broadcast(&room, Arc::new(record));
            }
            Err(e) => {
                warn!(room = %room, error = %e, "Dropping undecodable topic payload");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::testing::CountingTransport;

    fn manager(transport: Arc<CountingTransport>) -> Arc<SubscriptionManager> {
        let broadcaster = Arc::new(Broadcaster::new(Arc::new(Registry::new())));
        Arc::new(SubscriptionManager::new(transport, broadcaster))
    }

    #[tokio::test]
    async fn test_first_viewer_subscribes_last_unsubscribes() {
        let transport = Arc::new(CountingTransport::new());
        let manager = manager(Arc::clone(&transport));

        manager.acquire("general").await.unwrap();
        manager.acquire("general").await.unwrap();
        assert_eq!(transport.subscribes("general"), 1);
        assert_eq!(transport.subscribes("general$typing"), 1);
        assert_eq!(manager.viewers("general").await, 2);
        assert_eq!(manager.active_rooms(), 1);

        manager.release("general").await;
        assert_eq!(transport.unsubscribes("general"), 0);

        manager.release("general").await;
        assert_eq!(transport.unsubscribes("general"), 1);
        assert_eq!(transport.unsubscribes("general$typing"), 1);
        assert_eq!(manager.active_rooms(), 0);
        assert_eq!(manager.viewers("general").await, 0);
    }

    #[tokio::test]
    async fn test_rejoin_opens_fresh_subscription() {
        let transport = Arc::new(CountingTransport::new());
        let manager = manager(Arc::clone(&transport));

        manager.acquire("general").await.unwrap();
        manager.release("general").await;
        manager.acquire("general").await.unwrap();

        assert_eq!(transport.subscribes("general"), 2);
        assert_eq!(transport.unsubscribes("general"), 1);
        assert_eq!(manager.active_rooms(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_failure_leaves_room_inactive() {
        let transport = Arc::new(CountingTransport::new());
        let manager = manager(Arc::clone(&transport));

        transport.fail_subscribe_on("general$typing");
        let err = manager.acquire("general").await.unwrap_err();
        assert_eq!(err.room, "general");
        assert_eq!(manager.active_rooms(), 0);
        // The chat subscription opened first must be undone.
        assert_eq!(transport.unsubscribes("general"), 1);
        assert_eq!(transport.live_subscriptions(), 0);

        transport.clear_failures();
        manager.acquire("general").await.unwrap();
        assert_eq!(manager.viewers("general").await, 1);
    }

    #[tokio::test]
    async fn test_failure_in_one_room_leaves_others_alone() {
        let transport = Arc::new(CountingTransport::new());
        let manager = manager(Arc::clone(&transport));

        manager.acquire("general").await.unwrap();
        transport.fail_subscribe_on("random");
        assert!(manager.acquire("random").await.is_err());

        assert_eq!(manager.viewers("general").await, 1);
        assert_eq!(transport.unsubscribes("general"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_and_leaves() {
        let transport = Arc::new(CountingTransport::new());
        let manager = manager(Arc::clone(&transport));

        for _round in 0..5 {
            let joins: Vec<_> = (0..32)
                .map(|_| {
                    let manager = Arc::clone(&manager);
                    tokio::spawn(async move { manager.acquire("general").await })
                })
                .collect();
            for join in joins {
                join.await.unwrap().unwrap();
            }
            assert_eq!(manager.viewers("general").await, 32);

            let leaves: Vec<_> = (0..32)
                .map(|_| {
                    let manager = Arc::clone(&manager);
                    tokio::spawn(async move { manager.release("general").await })
                })
                .collect();
            for leave in leaves {
                leave.await.unwrap();
            }
        }

        assert_eq!(transport.subscribes("general"), 5);
        assert_eq!(transport.unsubscribes("general"), 5);
        assert_eq!(transport.live_subscriptions(), 0);
        assert_eq!(manager.active_rooms(), 0);
    }

    #[tokio::test]
    async fn test_deferred_release_runs_on_next_activity() {
        let transport = Arc::new(CountingTransport::new());
        let manager = manager(Arc::clone(&transport));

        manager.acquire("general").await.unwrap();
        manager.defer_release("general");
        assert_eq!(manager.viewers("general").await, 1);

        manager.acquire("random").await.unwrap();
        assert_eq!(manager.viewers("general").await, 0);
        assert_eq!(transport.unsubscribes("general"), 1);
        assert_eq!(manager.active_rooms(), 1);
    }

    #[tokio::test]
    async fn test_acquire_owned() {
        let transport = Arc::new(CountingTransport::new());
        let manager = manager(Arc::clone(&transport));

        manager.acquire_owned("general").await.unwrap();
        assert_eq!(manager.viewers("general").await, 1);
    }
}
