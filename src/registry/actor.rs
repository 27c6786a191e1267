use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::sink::{ConnectionSink, SessionSink};
use super::types::{DeliveryError, RegistryError, RoomId, SessionId, UserId};

const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// Commands sent to the registry actor
pub(crate) enum RoomCommand<S> {
    Connect {
        room: RoomId,
        user: UserId,
        sink: S,
        reply: oneshot::Sender<SessionId>,
    },
    Disconnect {
        room: RoomId,
        user: UserId,
    },
    Leave {
        room: RoomId,
        user: UserId,
        session: SessionId,
    },
    Broadcast {
        room: RoomId,
        event: Arc<Value>,
        exclude: Option<UserId>,
        reply: oneshot::Sender<()>,
    },
    ActiveMembers {
        room: RoomId,
        reply: oneshot::Sender<HashSet<UserId>>,
    },
    RoomCount {
        reply: oneshot::Sender<usize>,
    },
}

struct Session<S> {
    id: SessionId,
    sink: S,
}

type Rooms<S> = HashMap<RoomId, HashMap<UserId, Session<S>>>;

pub(crate) async fn room_registry_actor<S: SessionSink>(mut rx: mpsc::Receiver<RoomCommand<S>>) {
    let mut rooms: Rooms<S> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            RoomCommand::Connect {
                room,
                user,
                sink,
                reply,
            } => {
                let id = SessionId::next();
                let previous = rooms
                    .entry(room.clone())
                    .or_default()
                    .insert(user.clone(), Session { id, sink });

                match previous {
                    Some(old) => info!(
                        "User {} reconnected to room {} ({} replaces {})",
                        user, room, id, old.id
                    ),
                    None => info!("User {} connected to room {} ({})", user, room, id),
                }
                let _ = reply.send(id);
            }

            RoomCommand::Disconnect { room, user } => {
                if remove_session(&mut rooms, &room, &user, None) {
                    info!("User {} disconnected from room {}", user, room);
                }
            }

            RoomCommand::Leave {
                room,
                user,
                session,
            } => {
                if remove_session(&mut rooms, &room, &user, Some(session)) {
                    info!("User {} left room {} ({})", user, room, session);
                } else {
                    debug!("Stale session {} of user {} in room {}", session, user, room);
                }
            }

            RoomCommand::Broadcast {
                room,
                event,
                exclude,
                reply,
            } => {
                let failed = deliver(&rooms, &room, &event, exclude.as_ref()).await;
                for (user, session, err) in failed {
                    warn!("Error sending to user {} in room {}: {}", user, room, err);
                    remove_session(&mut rooms, &room, &user, Some(session));
                }
                let _ = reply.send(());
            }

            RoomCommand::ActiveMembers { room, reply } => {
                let members = rooms
                    .get(&room)
                    .map(|sessions| sessions.keys().cloned().collect())
                    .unwrap_or_default();
                let _ = reply.send(members);
            }

            RoomCommand::RoomCount { reply } => {
                let _ = reply.send(rooms.len());
            }
        }
    }

    debug!("Room registry stopped");
}

/// Fan the event out to every session in the room except `exclude`.
/// Returns the sessions whose delivery failed.
async fn deliver<S: SessionSink>(
    rooms: &Rooms<S>,
    room: &RoomId,
    event: &Arc<Value>,
    exclude: Option<&UserId>,
) -> Vec<(UserId, SessionId, DeliveryError)> {
    let Some(sessions) = rooms.get(room) else {
        return Vec::new();
    };

    let deliveries = sessions
        .iter()
        .filter(|(user, _)| Some(*user) != exclude)
        .map(|(user, session)| {
            let event = Arc::clone(event);
            async move {
                session
                    .sink
                    .send(event)
                    .await
                    .err()
                    .map(|err| (user.clone(), session.id, err))
            }
        });

    join_all(deliveries).await.into_iter().flatten().collect()
}

/// Remove the user's session (only if it is `expected`, when given) and drop
/// the room once it has no sessions left.
fn remove_session<S>(
    rooms: &mut Rooms<S>,
    room: &RoomId,
    user: &UserId,
    expected: Option<SessionId>,
) -> bool {
    let Some(sessions) = rooms.get_mut(room) else {
        return false;
    };

    let matches = match (sessions.get(user), expected) {
        (Some(session), Some(id)) => session.id == id,
        (Some(_), None) => true,
        (None, _) => false,
    };
    if matches {
        sessions.remove(user);
    }

    if sessions.is_empty() {
        rooms.remove(room);
        info!("Room {} removed (empty)", room);
    }
    matches
}

/// Handle to communicate with the room registry actor.
///
/// Construct once with [`RoomRegistryHandle::spawn`] and clone it into every
/// connection task. All membership changes go through the actor's queue, so a
/// room is present exactly while it has at least one session.
///
/// A `connect` issued concurrently with a `broadcast` from another task may or
/// may not receive that broadcast, depending on which command is queued first.
pub struct RoomRegistryHandle<S = ConnectionSink> {
    pub(crate) tx: mpsc::Sender<RoomCommand<S>>,
}

impl<S> Clone for RoomRegistryHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S: SessionSink> RoomRegistryHandle<S> {
    /// Spawn the registry actor on the current runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<RoomCommand<S>>(COMMAND_QUEUE_CAPACITY);
        tokio::spawn(room_registry_actor(rx));
        Self { tx }
    }

    /// Register `sink` as the user's session in the room, replacing any
    /// previous session of the same user there.
    pub async fn connect(
        &self,
        room: RoomId,
        user: UserId,
        sink: S,
    ) -> Result<SessionId, RegistryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::Connect {
                room,
                user,
                sink,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RegistryError::Closed)?;
        reply_rx.await.map_err(|_| RegistryError::Closed)
    }

    /// Remove the user from the room. No-op for unknown rooms or users.
    pub async fn disconnect(&self, room: &RoomId, user: &UserId) {
        let _ = self
            .tx
            .send(RoomCommand::Disconnect {
                room: room.clone(),
                user: user.clone(),
            })
            .await;
    }

    /// Remove the user from the room only if `session` is still the live one.
    pub async fn leave(&self, room: &RoomId, user: &UserId, session: SessionId) {
        let _ = self
            .tx
            .send(RoomCommand::Leave {
                room: room.clone(),
                user: user.clone(),
                session,
            })
            .await;
    }

    /// Deliver `event` to every session in the room except `exclude`.
    ///
    /// Sessions whose delivery fails are evicted before this returns. Events
    /// reach each recipient in the order of the `broadcast` calls.
    pub async fn broadcast(&self, room: &RoomId, event: Value, exclude: Option<&UserId>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self
            .tx
            .send(RoomCommand::Broadcast {
                room: room.clone(),
                event: Arc::new(event),
                exclude: exclude.cloned(),
                reply: reply_tx,
            })
            .await;
        if sent.is_ok() {
            let _ = reply_rx.await;
        }
    }

    /// Snapshot of the users currently connected to the room.
    pub async fn active_members(&self, room: &RoomId) -> Result<HashSet<UserId>, RegistryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::ActiveMembers {
                room: room.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| RegistryError::Closed)?;
        reply_rx.await.map_err(|_| RegistryError::Closed)
    }

    /// Number of rooms with at least one session.
    pub async fn room_count(&self) -> Result<usize, RegistryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::RoomCount { reply: reply_tx })
            .await
            .map_err(|_| RegistryError::Closed)?;
        reply_rx.await.map_err(|_| RegistryError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionSender;
    use serde_json::json;
    use std::sync::Mutex;

    fn channel() -> (SessionSender, mpsc::UnboundedReceiver<Arc<Value>>) {
        mpsc::unbounded_channel()
    }

    fn members(ids: &[&str]) -> HashSet<UserId> {
        ids.iter().map(|id| UserId::from(*id)).collect()
    }

    #[tokio::test]
    async fn connect_registers_member() {
        let registry: RoomRegistryHandle<SessionSender> = RoomRegistryHandle::spawn();
        let room = RoomId::from("c1");
        let (tx, _rx) = channel();

        registry.connect(room.clone(), UserId::from("u1"), tx).await.unwrap();

        assert_eq!(registry.active_members(&room).await.unwrap(), members(&["u1"]));
        assert_eq!(registry.room_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reconnect_replaces_previous_session() {
        let registry: RoomRegistryHandle<SessionSender> = RoomRegistryHandle::spawn();
        let room = RoomId::from("c1");
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();

        let first = registry.connect(room.clone(), UserId::from("u1"), tx1).await.unwrap();
        let second = registry.connect(room.clone(), UserId::from("u1"), tx2).await.unwrap();
        assert_ne!(first, second);

        registry.broadcast(&room, json!({"n": 1}), None).await;

        assert_eq!(*rx2.recv().await.unwrap(), json!({"n": 1}));
        // the replaced sink was dropped by the registry
        assert!(rx1.recv().await.is_none());
        assert_eq!(registry.active_members(&room).await.unwrap(), members(&["u1"]));
    }

    #[tokio::test]
    async fn disconnect_removes_empty_room() {
        let registry: RoomRegistryHandle<SessionSender> = RoomRegistryHandle::spawn();
        let room = RoomId::from("c1");
        let (tx, _rx) = channel();

        registry.connect(room.clone(), UserId::from("u1"), tx).await.unwrap();
        registry.disconnect(&room, &UserId::from("u1")).await;

        assert!(registry.active_members(&room).await.unwrap().is_empty());
        assert_eq!(registry.room_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn disconnect_keeps_room_with_remaining_members() {
        let registry: RoomRegistryHandle<SessionSender> = RoomRegistryHandle::spawn();
        let room = RoomId::from("c1");
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        registry.connect(room.clone(), UserId::from("u1"), tx1).await.unwrap();
        registry.connect(room.clone(), UserId::from("u2"), tx2).await.unwrap();
        registry.disconnect(&room, &UserId::from("u1")).await;

        assert_eq!(registry.active_members(&room).await.unwrap(), members(&["u2"]));
        assert_eq!(registry.room_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn disconnect_unknown_is_noop_and_idempotent() {
        let registry: RoomRegistryHandle<SessionSender> = RoomRegistryHandle::spawn();
        let room = RoomId::from("c1");
        let (tx, _rx) = channel();

        registry.disconnect(&RoomId::from("nowhere"), &UserId::from("u1")).await;
        registry.connect(room.clone(), UserId::from("u1"), tx).await.unwrap();
        registry.disconnect(&room, &UserId::from("ghost")).await;
        assert_eq!(registry.active_members(&room).await.unwrap(), members(&["u1"]));

        registry.disconnect(&room, &UserId::from("u1")).await;
        registry.disconnect(&room, &UserId::from("u1")).await;
        assert!(registry.active_members(&room).await.unwrap().is_empty());
        assert_eq!(registry.room_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn leave_ignores_stale_session() {
        let registry: RoomRegistryHandle<SessionSender> = RoomRegistryHandle::spawn();
        let room = RoomId::from("doc1");
        let user = UserId::from("u1");
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        let stale = registry.connect(room.clone(), user.clone(), tx1).await.unwrap();
        let live = registry.connect(room.clone(), user.clone(), tx2).await.unwrap();

        registry.leave(&room, &user, stale).await;
        assert_eq!(registry.active_members(&room).await.unwrap(), members(&["u1"]));

        registry.leave(&room, &user, live).await;
        assert!(registry.active_members(&room).await.unwrap().is_empty());
        assert_eq!(registry.room_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn broadcast_excludes_sender() {
        let registry: RoomRegistryHandle<SessionSender> = RoomRegistryHandle::spawn();
        let room = RoomId::from("doc1");
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();

        registry.connect(room.clone(), UserId::from("u1"), tx1).await.unwrap();
        registry.connect(room.clone(), UserId::from("u2"), tx2).await.unwrap();
        registry
            .broadcast(&room, json!({"op": "insert", "pos": 5}), Some(&UserId::from("u1")))
            .await;

        assert_eq!(*rx2.try_recv().unwrap(), json!({"op": "insert", "pos": 5}));
        assert!(rx1.try_recv().is_err());
        assert_eq!(
            registry.active_members(&room).await.unwrap(),
            members(&["u1", "u2"])
        );
    }

    #[tokio::test]
    async fn broadcast_evicts_failed_session_and_continues() {
        let registry: RoomRegistryHandle<SessionSender> = RoomRegistryHandle::spawn();
        let room = RoomId::from("c1");
        let (tx_a, rx_a) = channel();
        let (tx_b, mut rx_b) = channel();

        registry.connect(room.clone(), UserId::from("a"), tx_a).await.unwrap();
        registry.connect(room.clone(), UserId::from("b"), tx_b).await.unwrap();
        drop(rx_a);

        registry.broadcast(&room, json!({"text": "hi"}), None).await;

        assert_eq!(*rx_b.try_recv().unwrap(), json!({"text": "hi"}));
        assert_eq!(registry.active_members(&room).await.unwrap(), members(&["b"]));
    }

    #[tokio::test]
    async fn broadcast_removes_room_when_every_delivery_fails() {
        let registry: RoomRegistryHandle<SessionSender> = RoomRegistryHandle::spawn();
        let room = RoomId::from("c1");
        let (tx, rx) = channel();

        registry.connect(room.clone(), UserId::from("a"), tx).await.unwrap();
        drop(rx);
        registry.broadcast(&room, json!({}), None).await;

        assert_eq!(registry.room_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn broadcast_to_unknown_room_is_noop() {
        let registry: RoomRegistryHandle<SessionSender> = RoomRegistryHandle::spawn();

        registry.broadcast(&RoomId::from("missing"), json!({}), None).await;

        assert_eq!(registry.room_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn broadcasts_arrive_in_call_order() {
        let registry: RoomRegistryHandle<SessionSender> = RoomRegistryHandle::spawn();
        let room = RoomId::from("c1");
        let (tx, mut rx) = channel();
        registry.connect(room.clone(), UserId::from("u1"), tx).await.unwrap();

        for seq in 0..20 {
            registry.broadcast(&room, json!({"seq": seq}), None).await;
        }

        for seq in 0..20 {
            assert_eq!(*rx.recv().await.unwrap(), json!({"seq": seq}));
        }
    }

    #[tokio::test]
    async fn rooms_are_independent_namespaces() {
        let registry: RoomRegistryHandle<SessionSender> = RoomRegistryHandle::spawn();
        let chat = RoomId::from("chat:1");
        let doc = RoomId::from("document:1");
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();

        registry.connect(chat.clone(), UserId::from("u1"), tx1).await.unwrap();
        registry.connect(doc.clone(), UserId::from("u1"), tx2).await.unwrap();
        registry.broadcast(&doc, json!({"kind": "doc"}), None).await;

        assert!(rx1.try_recv().is_err());
        assert_eq!(*rx2.try_recv().unwrap(), json!({"kind": "doc"}));
        assert_eq!(registry.room_count().await.unwrap(), 2);
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        events: Arc<Mutex<Vec<Value>>>,
        fail: bool,
    }

    impl SessionSink for RecordingSink {
        async fn send(&self, event: Arc<Value>) -> Result<(), DeliveryError> {
            tokio::task::yield_now().await;
            if self.fail {
                return Err(DeliveryError("peer reset".to_string()));
            }
            self.events.lock().unwrap().push((*event).clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn custom_sink_failure_is_contained() {
        let registry = RoomRegistryHandle::<RecordingSink>::spawn();
        let room = RoomId::from("doc1");
        let healthy = RecordingSink::default();
        let broken = RecordingSink {
            fail: true,
            ..Default::default()
        };

        registry.connect(room.clone(), UserId::from("a"), broken).await.unwrap();
        registry
            .connect(room.clone(), UserId::from("b"), healthy.clone())
            .await
            .unwrap();
        registry.broadcast(&room, json!({"op": "delete"}), None).await;

        assert_eq!(*healthy.events.lock().unwrap(), vec![json!({"op": "delete"})]);
        assert_eq!(registry.active_members(&room).await.unwrap(), members(&["b"]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_membership_changes_leave_no_empty_rooms() {
        let registry: RoomRegistryHandle<SessionSender> = RoomRegistryHandle::spawn();

        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let room = RoomId::from(format!("room{}", i % 4));
                let user = UserId::from(format!("user{}", i));
                let (tx, _rx) = mpsc::unbounded_channel();
                let session = registry.connect(room.clone(), user.clone(), tx).await.unwrap();
                registry.broadcast(&room, json!({"from": i}), Some(&user)).await;
                registry.leave(&room, &user, session).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.room_count().await.unwrap(), 0);
        for i in 0..4 {
            let room = RoomId::from(format!("room{}", i));
            assert!(registry.active_members(&room).await.unwrap().is_empty());
        }
    }
}
