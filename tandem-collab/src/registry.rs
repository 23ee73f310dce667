//! Room registry: room id → (document, connected sessions).
//!
//! Rooms are created lazily on first reference and are never evicted, so a
//! peer arriving after everyone else left still inherits the accumulated
//! document state. Memory therefore grows with the number of distinct room
//! ids seen by the process.
//!
//! The registry is owned by the relay and touched from a single dispatch
//! context, so it holds plain maps rather than locks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::document::{Document, Subscription, YDocument};

/// Outbound half of a session's transport: encoded frames to deliver.
pub type Outbound = mpsc::UnboundedSender<Arc<Vec<u8>>>;

/// Room used when a connection path names none.
pub const DEFAULT_ROOM: &str = "default";

/// Room identifier, taken from the connection path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive a room id from a request path such as `/r1` or `/r1?x=y`.
    /// An empty suffix maps to `default_room`.
    pub fn from_path(path: &str, default_room: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let suffix = path.strip_prefix('/').unwrap_or(path);
        if suffix.is_empty() {
            Self::new(default_room)
        } else {
            Self::new(suffix)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RoomId {
    fn default() -> Self {
        Self::new(DEFAULT_ROOM)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Unique id of one connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Best-effort send: closed channels are skipped, never an error.
pub(crate) fn deliver(outbound: &Outbound, frame: Arc<Vec<u8>>) -> bool {
    if outbound.is_closed() {
        return false;
    }
    outbound.send(frame).is_ok()
}

/// One connected peer inside a room.
pub struct Session {
    id: SessionId,
    outbound: Outbound,
    /// Forwarder registered on the room document; released on teardown.
    subscription: Option<Subscription>,
}

impl Session {
    pub fn new(id: SessionId, outbound: Outbound, subscription: Subscription) -> Self {
        Self {
            id,
            outbound,
            subscription: Some(subscription),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Queue an encoded frame for this peer.
    pub fn send(&self, frame: Arc<Vec<u8>>) -> bool {
        deliver(&self.outbound, frame)
    }

    pub(crate) fn take_subscription(&mut self) -> Option<Subscription> {
        self.subscription.take()
    }
}

/// A document and the sessions editing it.
pub struct Room<D: Document = YDocument> {
    id: RoomId,
    document: Arc<D>,
    sessions: HashMap<SessionId, Session>,
}

impl<D: Document> Room<D> {
    fn new(id: RoomId, document: D) -> Self {
        Self {
            id,
            document: Arc::new(document),
            sessions: HashMap::new(),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn document(&self) -> &Arc<D> {
        &self.document
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_session(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn session(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub(crate) fn insert_session(&mut self, session: Session) {
        self.sessions.insert(session.id(), session);
    }

    pub(crate) fn remove_session(&mut self, id: &SessionId) -> Option<Session> {
        self.sessions.remove(id)
    }

    /// Send a frame to every open session except `origin`.
    ///
    /// Returns the number of sessions the frame was queued for. A dead
    /// recipient never prevents delivery to the others.
    pub fn broadcast_except(&self, origin: SessionId, frame: Arc<Vec<u8>>) -> usize {
        self.sessions
            .values()
            .filter(|s| s.id() != origin)
            .filter(|s| s.send(frame.clone()))
            .count()
    }
}

/// Maps room ids to rooms.
pub struct RoomRegistry<D: Document = YDocument> {
    rooms: HashMap<RoomId, Room<D>>,
}

impl<D: Document + Default> RoomRegistry<D> {
    pub fn new() -> Self {
        Self {
            rooms: HashMap::new(),
        }
    }

    /// Get or create the room for `id`.
    ///
    /// The first call allocates an empty document and session set; later
    /// calls return the same room for the lifetime of the registry.
    pub fn get_or_create(&mut self, id: &RoomId) -> &mut Room<D> {
        if !self.rooms.contains_key(id) {
            log::info!("Room {id} created");
        }
        self.rooms
            .entry(id.clone())
            .or_insert_with(|| Room::new(id.clone(), D::default()))
    }
}

impl<D: Document> RoomRegistry<D> {
    pub fn get(&self, id: &RoomId) -> Option<&Room<D>> {
        self.rooms.get(id)
    }

    pub fn get_mut(&mut self, id: &RoomId) -> Option<&mut Room<D>> {
        self.rooms.get_mut(id)
    }

    pub fn contains(&self, id: &RoomId) -> bool {
        self.rooms.contains_key(id)
    }

    /// Number of rooms ever created.
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.keys().cloned().collect()
    }

    /// Total sessions across all rooms.
    pub fn session_count(&self) -> usize {
        self.rooms.values().map(Room::session_count).sum()
    }
}

impl<D: Document + Default> Default for RoomRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}
