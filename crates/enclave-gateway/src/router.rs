use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use enclave_types::events::{ServerEvent, VoiceParticipantInfo};

/// Addressable fan-out group. Every event reaches exactly the connections
/// subscribed to one of these keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomKey {
    Realm(Uuid),
    Channel(Uuid),
    Thread(Uuid),
    Voice(Uuid),
    /// All live connections of one user. Subscribed on authentication,
    /// dropped on disconnect; the target of direct messages and signaling.
    User(Uuid),
}

struct ConnHandle {
    user_id: Uuid,
    username: String,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

/// Routes events to connections through room membership.
///
/// Senders are unbounded, so no read guard is ever held across a blocking
/// send. Empty rooms are discarded as the last member leaves.
#[derive(Clone)]
pub struct RoomRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    conns: RwLock<HashMap<Uuid, ConnHandle>>,
    rooms: RwLock<HashMap<RoomKey, HashSet<Uuid>>>,
    /// Reverse index: connection id -> rooms it occupies, so disconnect
    /// releases everything without scanning.
    joined: RwLock<HashMap<Uuid, HashSet<RoomKey>>>,
}

impl RoomRouter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RouterInner {
                conns: RwLock::new(HashMap::new()),
                rooms: RwLock::new(HashMap::new()),
                joined: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register an authenticated connection. Returns the receiving half of
    /// its outbox; the connection's writer task drains it.
    pub async fn register(
        &self,
        conn_id: Uuid,
        user_id: Uuid,
        username: &str,
    ) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.conns.write().await.insert(
            conn_id,
            ConnHandle {
                user_id,
                username: username.to_string(),
                tx,
            },
        );
        self.join(conn_id, RoomKey::User(user_id)).await;
        rx
    }

    /// Remove a connection and release all of its rooms. Returns the rooms
    /// it occupied so the caller can announce the departure.
    pub async fn unregister(&self, conn_id: Uuid) -> Vec<RoomKey> {
        self.inner.conns.write().await.remove(&conn_id);

        let occupied = self
            .inner
            .joined
            .write()
            .await
            .remove(&conn_id)
            .unwrap_or_default();

        let mut rooms = self.inner.rooms.write().await;
        for room in &occupied {
            if let Some(members) = rooms.get_mut(room) {
                members.remove(&conn_id);
                if members.is_empty() {
                    rooms.remove(room);
                }
            }
        }

        occupied.into_iter().collect()
    }

    pub async fn join(&self, conn_id: Uuid, room: RoomKey) {
        self.inner
            .rooms
            .write()
            .await
            .entry(room)
            .or_default()
            .insert(conn_id);
        self.inner
            .joined
            .write()
            .await
            .entry(conn_id)
            .or_default()
            .insert(room);
    }

    pub async fn leave(&self, conn_id: Uuid, room: RoomKey) {
        let mut rooms = self.inner.rooms.write().await;
        if let Some(members) = rooms.get_mut(&room) {
            members.remove(&conn_id);
            if members.is_empty() {
                rooms.remove(&room);
            }
        }
        drop(rooms);

        if let Some(joined) = self.inner.joined.write().await.get_mut(&conn_id) {
            joined.remove(&room);
        }
    }

    /// Queue an event on one connection's outbox.
    pub async fn send_to_conn(&self, conn_id: Uuid, event: ServerEvent) {
        let conns = self.inner.conns.read().await;
        if let Some(handle) = conns.get(&conn_id) {
            let _ = handle.tx.send(event);
        }
    }

    /// Queue an event on every connection of one user. A no-op when the
    /// user is offline.
    pub async fn send_to_user(&self, user_id: Uuid, event: ServerEvent) {
        self.broadcast(RoomKey::User(user_id), event).await;
    }

    /// Queue an event on every connection in a room.
    pub async fn broadcast(&self, room: RoomKey, event: ServerEvent) {
        self.broadcast_inner(room, None, event).await;
    }

    /// Like `broadcast`, but skips one connection (usually the origin).
    pub async fn broadcast_except(&self, room: RoomKey, except: Uuid, event: ServerEvent) {
        self.broadcast_inner(room, Some(except), event).await;
    }

    async fn broadcast_inner(&self, room: RoomKey, except: Option<Uuid>, event: ServerEvent) {
        let rooms = self.inner.rooms.read().await;
        let Some(members) = rooms.get(&room) else {
            return;
        };

        let conns = self.inner.conns.read().await;
        for conn_id in members {
            if Some(*conn_id) == except {
                continue;
            }
            if let Some(handle) = conns.get(conn_id) {
                let _ = handle.tx.send(event.clone());
            }
        }
    }

    /// Current occupants of a voice room, one entry per user.
    pub async fn voice_roster(&self, channel_id: Uuid) -> Vec<VoiceParticipantInfo> {
        let rooms = self.inner.rooms.read().await;
        let Some(members) = rooms.get(&RoomKey::Voice(channel_id)) else {
            return Vec::new();
        };

        let conns = self.inner.conns.read().await;
        let mut seen = HashSet::new();
        let mut roster = Vec::new();
        for conn_id in members {
            if let Some(handle) = conns.get(conn_id) {
                if seen.insert(handle.user_id) {
                    roster.push(VoiceParticipantInfo {
                        user_id: handle.user_id,
                        username: handle.username.clone(),
                    });
                }
            }
        }
        roster
    }

    /// Number of connections currently in a room.
    pub async fn occupancy(&self, room: RoomKey) -> usize {
        self.inner
            .rooms
            .read()
            .await
            .get(&room)
            .map_or(0, HashSet::len)
    }
}

impl Default for RoomRouter {
    fn default() -> Self {
        Self::new()
    }
}
