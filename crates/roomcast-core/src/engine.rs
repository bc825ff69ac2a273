//! The engine facade and live viewer streams.
//!
//! [`Engine`] wires the Session Gate, Ingress, Subscription Manager,
//! Registry and Broadcaster together behind the operations the server
//! exposes. A [`Viewer`] is one open stream on one room.

use roomcast_protocol::{validate_room, ChatMessage, Record};
use roomcast_transport::Transport;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, Identity, SessionGate, SessionVerifier};
use crate::broadcast::Broadcaster;
use crate::error::EngineError;
use crate::ingress::Ingress;
use crate::registry::{ClientHandle, ClientId, LiveClient, Registry};
use crate::store::MessageLog;
use crate::subscription::SubscriptionManager;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of each viewer's delivery channel.
    pub client_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            client_capacity: 256,
        }
    }
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Rooms with a live transport subscription.
    pub active_rooms: usize,
    /// Registered viewers across all rooms.
    pub viewers: usize,
    /// Records queued to viewers.
    pub delivered: u64,
    /// Chat messages dropped for overloaded viewers.
    pub chat_dropped: u64,
    /// Typing events dropped for full viewers.
    pub typing_dropped: u64,
    /// Persisted messages that could not be published.
    pub publish_failures: u64,
}

/// The room event distribution engine.
pub struct Engine {
    gate: SessionGate,
    ingress: Ingress,
    log: Arc<dyn MessageLog>,
    registry: Arc<Registry>,
    broadcaster: Arc<Broadcaster>,
    subscriptions: Arc<SubscriptionManager>,
    transport: Arc<dyn Transport>,
    config: EngineConfig,
}

impl Engine {
    /// Create an engine.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        log: Arc<dyn MessageLog>,
        verifier: Arc<dyn SessionVerifier>,
        config: EngineConfig,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&registry)));
        let subscriptions = Arc::new(SubscriptionManager::new(
            Arc::clone(&transport),
            Arc::clone(&broadcaster),
        ));

        info!(
            transport = transport.name(),
            client_capacity = config.client_capacity,
            "Creating engine"
        );

        Self {
            gate: SessionGate::new(verifier),
            ingress: Ingress::new(Arc::clone(&log), Arc::clone(&transport)),
            log,
            registry,
            broadcaster,
            subscriptions,
            transport,
            config,
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether the transport reports itself healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.transport.is_healthy()
    }

    /// Resolve an `Authorization` value to an identity.
    ///
    /// # Errors
    ///
    /// See [`SessionGate::authenticate`].
    pub fn authenticate(&self, authorization: Option<&str>) -> Result<Identity, AuthError> {
        self.gate.authenticate(authorization)
    }

    /// Issue a session token.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn issue_session(&self, identity: &Identity) -> Result<String, AuthError> {
        self.gate.issue(identity)
    }

    /// Persist and publish a chat message.
    ///
    /// # Errors
    ///
    /// See [`Ingress::send_message`].
    pub async fn send_message(
        &self,
        identity: &Identity,
        room: &str,
        content: impl Into<String>,
    ) -> Result<ChatMessage, EngineError> {
        self.ingress.send_message(identity, room, content).await
    }

    /// Publish a typing-status change.
    ///
    /// # Errors
    ///
    /// See [`Ingress::send_typing`].
    pub async fn send_typing(
        &self,
        identity: &Identity,
        room: &str,
        typing: bool,
    ) -> Result<(), EngineError> {
        self.ingress.send_typing(identity, room, typing).await
    }

    /// Open a live stream on a room with the configured channel capacity.
    ///
    /// # Errors
    ///
    /// `InvalidRoom` for a bad room name, `Subscription` when the room's
    /// transport subscription cannot be opened. On error nothing stays
    /// registered.
    pub async fn open_stream(&self, identity: &Identity, room: &str) -> Result<Viewer, EngineError> {
        self.open_stream_with_capacity(identity, room, self.config.client_capacity)
            .await
    }

    /// Open a live stream with a specific delivery channel capacity.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::open_stream`].
    pub async fn open_stream_with_capacity(
        &self,
        identity: &Identity,
        room: &str,
        capacity: usize,
    ) -> Result<Viewer, EngineError> {
        validate_room(room).map_err(EngineError::InvalidRoom)?;

        let (client, receiver) = LiveClient::channel(room, identity.clone(), capacity);
        let handle = self.registry.register(Arc::clone(&client));

        // From here on, dropping the viewer undoes the registration.
        let mut viewer = Viewer {
            handle,
            client,
            receiver,
            registry: Arc::clone(&self.registry),
            subscriptions: Arc::clone(&self.subscriptions),
            lease: false,
        };

        self.subscriptions.acquire_owned(room).await?;
        viewer.lease = true;

        debug!(room = %room, client = %viewer.id(), viewer = %identity, "Stream opened");
        Ok(viewer)
    }

    /// Chat history of a room, oldest first.
    ///
    /// # Errors
    ///
    /// `InvalidRoom` for a bad room name, `Persistence` if the log fails.
    pub async fn history(&self, room: &str) -> Result<Vec<ChatMessage>, EngineError> {
        validate_room(room).map_err(EngineError::InvalidRoom)?;
        Ok(self.log.query(room).await?)
    }

    /// Rooms with at least one persisted message, sorted by name.
    ///
    /// # Errors
    ///
    /// `Persistence` if the log fails.
    pub async fn rooms(&self) -> Result<Vec<String>, EngineError> {
        let mut rooms = self.log.distinct_rooms().await?;
        rooms.sort_unstable();
        Ok(rooms)
    }

    /// Snapshot the engine counters.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let delivery = self.broadcaster.stats();
        EngineStats {
            active_rooms: self.subscriptions.active_rooms(),
            viewers: self.registry.total_clients(),
            delivered: delivery.delivered(),
            chat_dropped: delivery.chat_dropped(),
            typing_dropped: delivery.typing_dropped(),
            publish_failures: self.ingress.publish_failures(),
        }
    }
}

/// One open live stream on a room.
///
/// Dropping a viewer deregisters it immediately; its share of the room
/// subscription is released in the background. Dropped outside a tokio
/// runtime, the release is queued and runs on the next join or leave.
pub struct Viewer {
    handle: ClientHandle,
    client: Arc<LiveClient>,
    receiver: mpsc::Receiver<Arc<Record>>,
    registry: Arc<Registry>,
    subscriptions: Arc<SubscriptionManager>,
    lease: bool,
}

impl Viewer {
    /// Get the client ID.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.handle.id()
    }

    /// Get the watched room.
    #[must_use]
    pub fn room(&self) -> &str {
        self.handle.room()
    }

    /// Get the viewing identity.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        self.client.viewer()
    }

    /// Wait for the next record.
    ///
    /// Records arrive in transport order. When chat messages were dropped
    /// because this viewer fell behind, an [`Record::Overloaded`] notice is
    /// yielded once the records queued before the gap are drained.
    pub async fn next(&mut self) -> Option<Arc<Record>> {
        match self.receiver.try_recv() {
            Ok(record) => return Some(record),
            Err(mpsc::error::TryRecvError::Empty) => {}
            Err(mpsc::error::TryRecvError::Disconnected) => return None,
        }

        let dropped = self.client.take_dropped();
        if dropped > 0 {
            return Some(Arc::new(Record::Overloaded {
                room: self.handle.room().to_string(),
                dropped,
            }));
        }

        self.receiver.recv().await
    }

    /// Close the stream and wait for the subscription release.
    pub async fn close(mut self) {
        if self.detach() {
            self.subscriptions.release(self.handle.room()).await;
        }
    }

    /// Deregister and close the channel. Returns whether a lease was held.
    fn detach(&mut self) -> bool {
        self.registry.deregister(&self.handle);
        self.receiver.close();
        std::mem::replace(&mut self.lease, false)
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        if !self.detach() {
            return;
        }

        let subscriptions = Arc::clone(&self.subscriptions);
        let room = self.handle.room().to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    subscriptions.release(&room).await;
                });
            }
            Err(_) => {
                warn!(room = %room, client = %self.handle.id(), "Viewer dropped outside a runtime, release deferred");
                subscriptions.defer_release(&room);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{JwtSessions, DEFAULT_SESSION_TTL};
    use crate::store::MemoryLog;
    use crate::testing::{wait_until, CountingTransport, FailingLog};
    use std::time::Duration;

    struct Fixture {
        engine: Engine,
        log: Arc<MemoryLog>,
        transport: Arc<CountingTransport>,
    }

    fn fixture() -> Fixture {
        let log = Arc::new(MemoryLog::new());
        let transport = Arc::new(CountingTransport::new());
        let verifier = Arc::new(JwtSessions::new(b"engine-test", DEFAULT_SESSION_TTL));
        let engine = Engine::new(
            transport.clone(),
            log.clone(),
            verifier,
            EngineConfig::default(),
        );
        Fixture {
            engine,
            log,
            transport,
        }
    }

    async fn next_record(viewer: &mut Viewer) -> Arc<Record> {
        tokio::time::timeout(Duration::from_secs(2), viewer.next())
            .await
            .expect("timed out waiting for record")
            .expect("stream ended")
    }

    fn expect_message(record: &Record) -> &ChatMessage {
        match record {
            Record::Message(message) => message,
            other => panic!("expected chat message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unauthenticated_send_then_authenticated_send() {
        let f = fixture();

        let err = f.engine.authenticate(None).unwrap_err();
        assert_eq!(err, AuthError::Unauthenticated);
        assert!(f.engine.history("general").await.unwrap().is_empty());
        assert_eq!(f.transport.total_publishes(), 0);

        let token = f.engine.issue_session(&Identity::new("alice")).unwrap();
        let alice = f
            .engine
            .authenticate(Some(&format!("Bearer {token}")))
            .unwrap();
        f.engine.send_message(&alice, "general", "hi").await.unwrap();

        let history = f.engine.history("general").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sender, "alice");
        assert_eq!(history[0].content, "hi");
    }

    #[tokio::test]
    async fn test_invalid_session_is_rejected() {
        let f = fixture();
        let err = f.engine.authenticate(Some("Bearer garbage")).unwrap_err();
        assert!(matches!(err, AuthError::InvalidSession(_)));
    }

    #[tokio::test]
    async fn test_live_message_is_already_in_history() {
        let f = fixture();
        let bob = Identity::new("bob");
        let mut viewer = f.engine.open_stream(&bob, "general").await.unwrap();

        let sent = f
            .engine
            .send_message(&Identity::new("alice"), "general", "hello")
            .await
            .unwrap();

        let record = next_record(&mut viewer).await;
        let live = expect_message(&record);
        assert_eq!(live, &sent);
        assert!(f.engine.history("general").await.unwrap().contains(live));
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let f = fixture();
        let mut general = f
            .engine
            .open_stream(&Identity::new("bob"), "general")
            .await
            .unwrap();
        let mut random = f
            .engine
            .open_stream(&Identity::new("carol"), "random")
            .await
            .unwrap();

        let alice = Identity::new("alice");
        f.engine.send_message(&alice, "general", "g").await.unwrap();
        f.engine.send_message(&alice, "random", "r").await.unwrap();

        let g = next_record(&mut general).await;
        let r = next_record(&mut random).await;
        assert_eq!(g.room(), "general");
        assert_eq!(expect_message(&g).content, "g");
        assert_eq!(r.room(), "random");
        assert_eq!(expect_message(&r).content, "r");

        let mut rooms = f.engine.rooms().await.unwrap();
        rooms.dedup();
        assert_eq!(rooms, vec!["general".to_string(), "random".to_string()]);
    }

    #[tokio::test]
    async fn test_slow_viewer_is_isolated() {
        let f = fixture();
        let alice = Identity::new("alice");
        let mut healthy = f
            .engine
            .open_stream_with_capacity(&Identity::new("bob"), "general", 128)
            .await
            .unwrap();
        let mut slow = f
            .engine
            .open_stream_with_capacity(&Identity::new("carol"), "general", 4)
            .await
            .unwrap();

        for n in 0..100 {
            f.engine
                .send_message(&alice, "general", n.to_string())
                .await
                .unwrap();
        }

        for n in 0..100 {
            let record = next_record(&mut healthy).await;
            assert_eq!(expect_message(&record).content, n.to_string());
        }

        for n in 0..4 {
            let record = next_record(&mut slow).await;
            assert_eq!(expect_message(&record).content, n.to_string());
        }
        let notice = next_record(&mut slow).await;
        assert_eq!(
            *notice,
            Record::Overloaded {
                room: "general".into(),
                dropped: 96
            }
        );

        // Everything is still recoverable from history.
        assert_eq!(f.engine.history("general").await.unwrap().len(), 100);
        let stats = f.engine.stats();
        assert_eq!(stats.chat_dropped, 96);
        assert_eq!(stats.viewers, 2);
    }

    #[tokio::test]
    async fn test_typing_reaches_viewers_and_is_never_persisted() {
        let f = fixture();
        let alice = Identity::new("alice");

        // No viewers: still fine.
        f.engine.send_typing(&alice, "general", true).await.unwrap();

        let mut viewer = f
            .engine
            .open_stream(&Identity::new("bob"), "general")
            .await
            .unwrap();
        f.engine.send_typing(&alice, "general", true).await.unwrap();

        match next_record(&mut viewer).await.as_ref() {
            Record::Typing(event) => {
                assert_eq!(event.sender, "alice");
                assert!(event.typing);
            }
            other => panic!("expected typing event, got {other:?}"),
        }
        assert!(f.log.is_empty());
        assert!(f.engine.rooms().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shared_subscription_and_release_on_drop() {
        let f = fixture();
        let first = f
            .engine
            .open_stream(&Identity::new("bob"), "general")
            .await
            .unwrap();
        let second = f
            .engine
            .open_stream(&Identity::new("carol"), "general")
            .await
            .unwrap();
        assert_eq!(f.transport.subscribes("general"), 1);
        assert_eq!(f.engine.stats().active_rooms, 1);

        first.close().await;
        assert_eq!(f.transport.unsubscribes("general"), 0);
        assert_eq!(f.engine.stats().viewers, 1);

        drop(second);
        assert_eq!(f.engine.stats().viewers, 0);

        let transport = Arc::clone(&f.transport);
        wait_until(|| {
            let transport = Arc::clone(&transport);
            async move { transport.unsubscribes("general") == 1 }
        })
        .await;
        assert_eq!(f.transport.unsubscribes("general$typing"), 1);
        assert_eq!(f.engine.stats().active_rooms, 0);
    }

    #[tokio::test]
    async fn test_closed_viewer_receives_nothing_more() {
        let f = fixture();
        let alice = Identity::new("alice");
        let mut stays = f
            .engine
            .open_stream(&Identity::new("bob"), "general")
            .await
            .unwrap();
        let leaves = f
            .engine
            .open_stream(&Identity::new("carol"), "general")
            .await
            .unwrap();
        let leaving_id = leaves.id();
        leaves.close().await;

        f.engine.send_message(&alice, "general", "after").await.unwrap();
        let record = next_record(&mut stays).await;
        assert_eq!(expect_message(&record).content, "after");
        assert!(f
            .engine
            .registry
            .clients("general")
            .iter()
            .all(|c| c.id() != leaving_id));
        assert_eq!(f.engine.stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_viewer_dropped_off_runtime_is_released_later() {
        let f = fixture();
        let viewer = f
            .engine
            .open_stream(&Identity::new("bob"), "general")
            .await
            .unwrap();

        std::thread::spawn(move || drop(viewer)).join().unwrap();
        assert_eq!(f.engine.registry.client_count("general"), 0);

        let other = f
            .engine
            .open_stream(&Identity::new("carol"), "random")
            .await
            .unwrap();
        assert_eq!(f.engine.subscriptions.viewers("general").await, 0);
        assert_eq!(f.transport.unsubscribes("general"), 1);
        other.close().await;
    }

    #[tokio::test]
    async fn test_subscribe_failure_registers_nothing() {
        let f = fixture();
        f.transport.fail_subscribe_on("general");

        let err = f
            .engine
            .open_stream(&Identity::new("bob"), "general")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Subscription(_)));
        assert_eq!(f.engine.stats().viewers, 0);
        assert_eq!(f.engine.stats().active_rooms, 0);

        // Other rooms keep working.
        let _viewer = f
            .engine
            .open_stream(&Identity::new("bob"), "random")
            .await
            .unwrap();
        assert_eq!(f.engine.stats().active_rooms, 1);
    }

    #[tokio::test]
    async fn test_invalid_room_operations() {
        let f = fixture();
        let bob = Identity::new("bob");
        assert!(matches!(
            f.engine.open_stream(&bob, "").await.err().unwrap(),
            EngineError::InvalidRoom(_)
        ));
        assert!(matches!(
            f.engine.history("").await.unwrap_err(),
            EngineError::InvalidRoom(_)
        ));
        assert_eq!(f.engine.stats().viewers, 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_surfaces() {
        let transport = Arc::new(CountingTransport::new());
        let engine = Engine::new(
            transport.clone(),
            Arc::new(FailingLog),
            Arc::new(JwtSessions::new(b"engine-test", DEFAULT_SESSION_TTL)),
            EngineConfig::default(),
        );

        let err = engine
            .send_message(&Identity::new("alice"), "general", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));
        assert_eq!(transport.total_publishes(), 0);
        assert!(matches!(
            engine.rooms().await.unwrap_err(),
            EngineError::Persistence(_)
        ));
    }
}
