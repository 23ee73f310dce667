//! Relay core: per-session frame handling on top of the room registry.
//!
//! ```text
//!  StateVector(peer) ──► compute_delta(peer) ──► Update(delta)   (if any)
//!                    └─► state_vector()      ──► StateVector(room)
//!
//!  Update(delta)     ──► apply_delta(delta, Session(origin))
//!                    └─► raw frame ──► every other session in the room
//! ```
//!
//! The relay is plain synchronous state. The server owns it from a single
//! dispatch task, so documents and the registry are never touched
//! concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::document::{Delta, Document, DocumentError, Origin, UpdateCallback, YDocument};
use crate::protocol::{encode_frame, Frame, MessageKind, ProtocolError};
use crate::registry::{deliver, Outbound, Room, RoomId, RoomRegistry, Session, SessionId};

/// Relay errors. None of them are fatal to the connection.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed frame: {0}")]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
}

/// Relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Rooms created so far (rooms are never evicted)
    pub rooms: usize,
    pub active_sessions: usize,
    pub total_sessions: u64,
    pub frames_received: u64,
    /// Frames discarded because they failed to decode or apply
    pub frames_rejected: u64,
    pub updates_applied: u64,
    /// Raw Update frames queued to other sessions
    pub frames_relayed: u64,
}

/// Forwards room mutations to one session, skipping its own.
fn forward_updates(session: SessionId, outbound: Outbound) -> UpdateCallback {
    Box::new(move |delta: &Delta, origin: &Origin| {
        if *origin == Origin::Session(session) {
            return;
        }
        let frame = encode_frame(MessageKind::Update, delta.as_bytes());
        deliver(&outbound, Arc::new(frame));
    })
}

pub struct Relay<D: Document = YDocument> {
    registry: RoomRegistry<D>,
    /// session → room it joined
    sessions: HashMap<SessionId, RoomId>,
    stats: RelayStats,
}

impl<D: Document + Default> Relay<D> {
    pub fn new() -> Self {
        Self {
            registry: RoomRegistry::new(),
            sessions: HashMap::new(),
            stats: RelayStats::default(),
        }
    }

    /// Join `room_id`, creating it on first use.
    ///
    /// Registers a forwarder on the room document that sends every mutation
    /// not originating from this session to `outbound`.
    pub fn on_connect(&mut self, room_id: RoomId, outbound: Outbound) -> SessionId {
        let id = SessionId::new();
        let room = self.registry.get_or_create(&room_id);
        let subscription = room.document().subscribe(forward_updates(id, outbound.clone()));
        room.insert_session(Session::new(id, outbound, subscription));
        log::info!(
            "Session {id} joined room {room_id} ({} connected)",
            room.session_count()
        );

        self.sessions.insert(id, room_id);
        self.stats.total_sessions += 1;
        id
    }
}

impl<D: Document> Relay<D> {
    /// Handle one inbound frame from `session`.
    ///
    /// Errors describe the discarded frame; the session stays usable.
    pub fn on_message(&mut self, session: SessionId, frame: &[u8]) -> Result<(), RelayError> {
        self.stats.frames_received += 1;
        let result = self.handle_frame(session, frame);
        if result.is_err() {
            self.stats.frames_rejected += 1;
        }
        result
    }

    fn handle_frame(&mut self, session_id: SessionId, bytes: &[u8]) -> Result<(), RelayError> {
        let room = self
            .sessions
            .get(&session_id)
            .and_then(|room_id| self.registry.get(room_id))
            .ok_or(RelayError::UnknownSession(session_id))?;
        let session = room
            .session(&session_id)
            .ok_or(RelayError::UnknownSession(session_id))?;
        let document = room.document();

        match Frame::decode(bytes)? {
            Frame::StateVector(peer) => {
                let delta = document.compute_delta(&peer)?;
                if !delta.is_empty() {
                    session.send(Arc::new(Frame::Update(delta).encode()));
                }
                // Reciprocal probe: lets the peer push what the room lacks.
                let probe = Frame::StateVector(document.state_vector());
                session.send(Arc::new(probe.encode()));
                log::debug!("Session {session_id} synced with room {}", room.id());
            }
            Frame::Update(delta) => {
                document.apply_delta(&delta, Origin::Session(session_id))?;
                self.stats.updates_applied += 1;

                // Forwarders of the other sessions also fire for this
                // mutation; the duplicate is absorbed by the document.
                let relayed = room.broadcast_except(session_id, Arc::new(bytes.to_vec()));
                self.stats.frames_relayed += relayed as u64;
                log::debug!(
                    "Session {session_id} update ({} bytes) relayed to {relayed} peers",
                    delta.len()
                );
            }
        }
        Ok(())
    }

    /// Leave the room and release the session's forwarder.
    ///
    /// The room and its document are kept. Returns false for an unknown
    /// session.
    pub fn on_disconnect(&mut self, session_id: SessionId) -> bool {
        let Some(room_id) = self.sessions.remove(&session_id) else {
            return false;
        };
        if let Some(room) = self.registry.get_mut(&room_id) {
            if let Some(mut session) = room.remove_session(&session_id) {
                if let Some(subscription) = session.take_subscription() {
                    room.document().unsubscribe(subscription);
                }
            }
            log::info!(
                "Session {session_id} left room {room_id} ({} connected)",
                room.session_count()
            );
        }
        true
    }

    pub fn room(&self, id: &RoomId) -> Option<&Room<D>> {
        self.registry.get(id)
    }

    pub fn registry(&self) -> &RoomRegistry<D> {
        &self.registry
    }

    /// Room a live session belongs to.
    pub fn session_room(&self, session: &SessionId) -> Option<&RoomId> {
        self.sessions.get(session)
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            rooms: self.registry.len(),
            active_sessions: self.sessions.len(),
            ..self.stats.clone()
        }
    }
}

impl<D: Document + Default> Default for Relay<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{FlowGraph, Node};
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use yrs::updates::decoder::Decode;

    type Inbox = UnboundedReceiver<Arc<Vec<u8>>>;

    fn connect(relay: &mut Relay, room: &str) -> (SessionId, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (relay.on_connect(RoomId::new(room), tx), rx)
    }

    fn drain(rx: &mut Inbox) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            frames.push(Frame::decode(&bytes).unwrap());
        }
        frames
    }

    fn sv_frame(doc: &YDocument) -> Vec<u8> {
        Frame::StateVector(doc.state_vector()).encode()
    }

    fn update_frame(doc: &YDocument) -> Vec<u8> {
        let delta = doc.compute_delta(&YDocument::new().state_vector()).unwrap();
        Frame::Update(delta).encode()
    }

    fn graph_with(ids: &[&str]) -> FlowGraph {
        let g = FlowGraph::new(Arc::new(YDocument::new()));
        for id in ids {
            g.add_node(&Node::new(*id)).unwrap();
        }
        g
    }

    fn apply_all(doc: &YDocument, frames: Vec<Frame>) {
        for frame in frames {
            if let Frame::Update(delta) = frame {
                doc.apply_delta(&delta, Origin::Remote).unwrap();
            }
        }
    }

    fn state_vector(doc: &YDocument) -> yrs::StateVector {
        yrs::StateVector::decode_v1(doc.state_vector().as_bytes()).unwrap()
    }

    #[test]
    fn test_handshake_scenario() {
        let mut relay: Relay = Relay::new();

        // A joins the empty room and probes with an empty vector.
        let (a, mut a_rx) = connect(&mut relay, "r1");
        let empty = YDocument::new();
        relay.on_message(a, &sv_frame(&empty)).unwrap();

        let frames = drain(&mut a_rx);
        assert_eq!(frames.len(), 1, "empty room sends only the probe");
        assert!(matches!(frames[0], Frame::StateVector(_)));

        // A pushes one node; nobody else is there.
        let a_graph = graph_with(&["n1"]);
        relay.on_message(a, &update_frame(a_graph.document())).unwrap();
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(relay.stats().frames_relayed, 0);

        // B arrives later and catches up from the room document.
        let (b, mut b_rx) = connect(&mut relay, "r1");
        relay.on_message(b, &sv_frame(&empty)).unwrap();

        let frames = drain(&mut b_rx);
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Frame::Update(_)));
        assert!(matches!(frames[1], Frame::StateVector(_)));

        let b_graph = graph_with(&[]);
        apply_all(b_graph.document(), frames);
        assert_eq!(b_graph.nodes(), a_graph.nodes());
    }

    #[test]
    fn test_update_never_echoes_to_origin() {
        let mut relay: Relay = Relay::new();
        let (a, mut a_rx) = connect(&mut relay, "r1");
        let (_b, mut b_rx) = connect(&mut relay, "r1");
        let (_c, mut c_rx) = connect(&mut relay, "r1");

        let source = graph_with(&["n1"]);
        let frame = update_frame(source.document());
        relay.on_message(a, &frame).unwrap();

        assert!(a_rx.try_recv().is_err(), "origin must not hear its own update");

        for rx in [&mut b_rx, &mut c_rx] {
            let received: Vec<Vec<u8>> = std::iter::from_fn(|| rx.try_recv().ok())
                .map(|bytes| bytes.to_vec())
                .collect();
            assert!(received.contains(&frame), "raw frame relayed verbatim");
            assert!(received
                .iter()
                .all(|bytes| bytes[0] == MessageKind::Update.tag()));
        }
        assert_eq!(relay.stats().frames_relayed, 2);
    }

    #[test]
    fn test_idempotent_resync() {
        let mut relay: Relay = Relay::new();
        let (a, _a_rx) = connect(&mut relay, "r1");
        let source = graph_with(&["n1", "n2"]);
        relay.on_message(a, &update_frame(source.document())).unwrap();

        let (b, mut b_rx) = connect(&mut relay, "r1");
        let replica = graph_with(&[]);
        relay.on_message(b, &sv_frame(replica.document())).unwrap();
        apply_all(replica.document(), drain(&mut b_rx));

        for _ in 0..2 {
            relay.on_message(b, &sv_frame(replica.document())).unwrap();
            let frames = drain(&mut b_rx);
            assert_eq!(frames.len(), 1);
            assert!(matches!(frames[0], Frame::StateVector(_)));
        }
    }

    #[test]
    fn test_room_document_survives_empty_room() {
        let mut relay: Relay = Relay::new();
        let (a, _a_rx) = connect(&mut relay, "r1");
        let first = relay.room(&RoomId::new("r1")).unwrap().document().clone();
        relay.on_message(a, &update_frame(graph_with(&["n1"]).document())).unwrap();
        assert!(relay.on_disconnect(a));

        let room = relay.room(&RoomId::new("r1")).unwrap();
        assert_eq!(room.session_count(), 0);

        let (b, mut b_rx) = connect(&mut relay, "r1");
        let second = relay.room(&RoomId::new("r1")).unwrap().document().clone();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(relay.stats().rooms, 1);

        relay.on_message(b, &sv_frame(&YDocument::new())).unwrap();
        let replica = graph_with(&[]);
        apply_all(replica.document(), drain(&mut b_rx));
        assert_eq!(replica.node_count(), 1);
    }

    #[test]
    fn test_disconnect_releases_forwarder() {
        let mut relay: Relay = Relay::new();
        let (a, _a_rx) = connect(&mut relay, "r1");
        let (b, _b_rx) = connect(&mut relay, "r1");
        let doc = relay.room(&RoomId::new("r1")).unwrap().document().clone();
        assert_eq!(doc.subscriber_count(), 2);

        assert!(relay.on_disconnect(a));
        assert_eq!(doc.subscriber_count(), 1);
        assert!(!relay.on_disconnect(a), "second disconnect is a no-op");

        assert!(relay.on_disconnect(b));
        assert_eq!(doc.subscriber_count(), 0);
        assert_eq!(relay.stats().active_sessions, 0);
        assert_eq!(relay.stats().total_sessions, 2);
    }

    #[test]
    fn test_bad_frames_are_isolated() {
        let mut relay: Relay = Relay::new();
        let (a, mut a_rx) = connect(&mut relay, "r1");
        let (_b, mut b_rx) = connect(&mut relay, "r1");

        assert!(matches!(relay.on_message(a, &[]), Err(RelayError::Protocol(_))));
        assert!(matches!(relay.on_message(a, &[9, 1]), Err(RelayError::Protocol(_))));
        assert!(matches!(
            relay.on_message(a, &[1, 0xFF, 0xFE]),
            Err(RelayError::Document(_))
        ));
        assert!(matches!(
            relay.on_message(a, &[0, 0xFF, 0xFF, 0xFF]),
            Err(RelayError::Document(_))
        ));
        assert!(b_rx.try_recv().is_err(), "rejected updates are not relayed");

        // The session keeps working afterwards.
        relay.on_message(a, &sv_frame(&YDocument::new())).unwrap();
        assert_eq!(drain(&mut a_rx).len(), 1);

        let stats = relay.stats();
        assert_eq!(stats.frames_received, 5);
        assert_eq!(stats.frames_rejected, 4);
    }

    #[test]
    fn test_unknown_session() {
        let mut relay: Relay = Relay::new();
        let ghost = SessionId::new();
        assert!(matches!(
            relay.on_message(ghost, &[0, 0]),
            Err(RelayError::UnknownSession(id)) if id == ghost
        ));
    }

    #[test]
    fn test_rooms_do_not_leak() {
        let mut relay: Relay = Relay::new();
        let (a, _a_rx) = connect(&mut relay, "left");
        let (_b, mut b_rx) = connect(&mut relay, "right");

        relay.on_message(a, &update_frame(graph_with(&["n1"]).document())).unwrap();

        assert!(b_rx.try_recv().is_err());
        let right = relay.room(&RoomId::new("right")).unwrap();
        let replica = FlowGraph::new(Arc::new(YDocument::new()));
        let delta = right
            .document()
            .compute_delta(&replica.document().state_vector())
            .unwrap();
        assert!(delta.is_empty());
    }

    #[test]
    fn test_convergence_under_reordering() {
        let mut relay: Relay = Relay::new();
        let clients: Vec<(SessionId, Inbox, FlowGraph)> = (0..3)
            .map(|_| {
                let (id, rx) = connect(&mut relay, "r1");
                (id, rx, graph_with(&[]))
            })
            .collect();

        // Concurrent, conflicting edits made before anything is exchanged.
        for (i, (_, _, graph)) in clients.iter().enumerate() {
            graph.add_node(&Node::new(format!("own-{i}"))).unwrap();
            graph
                .add_node(&Node::new("shared").with_field("by", i as u64))
                .unwrap();
        }
        for (id, _, graph) in &clients {
            relay.on_message(*id, &update_frame(graph.document())).unwrap();
        }

        // Deliver everything each client received, newest first.
        let mut clients = clients;
        for (_, rx, graph) in clients.iter_mut() {
            let mut frames = drain(rx);
            frames.reverse();
            apply_all(graph.document(), frames);
        }

        let room_doc = relay.room(&RoomId::new("r1")).unwrap().document().clone();
        let reference = FlowGraph::new(room_doc.clone());
        assert_eq!(reference.node_count(), 4);
        for (_, _, graph) in &clients {
            assert_eq!(graph.nodes(), reference.nodes());
            assert_eq!(state_vector(graph.document()), state_vector(&room_doc));
        }
    }
}
