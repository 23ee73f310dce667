//! # tandem-collab — Real-time CRDT relay for shared flow graphs
//!
//! Peers edit a replicated document locally and exchange opaque deltas
//! through a room-scoped relay. The relay never interprets document
//! contents; convergence comes from the CRDT itself.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐    WebSocket     ┌────────────────┐
//! │ SyncController │ ◄──────────────► │ SyncServer     │
//! │ (per client)   │   [kind|bytes]   │ (relay)        │
//! └───────┬────────┘                  └───────┬────────┘
//!         │                                   │
//!         ▼                                   ▼
//! ┌────────────────┐                  ┌────────────────┐
//! │ YDocument      │                  │ RoomRegistry   │
//! │ (local)        │                  │ room → doc +   │
//! └────────────────┘                  │ sessions       │
//!                                     └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`] — Document capability and its `yrs` implementation
//! - [`protocol`] — Two-kind binary frame codec
//! - [`registry`] — Rooms, sessions and lazy room creation
//! - [`relay`] — Handshake, apply and rebroadcast logic
//! - [`server`] — WebSocket server around a single relay dispatcher
//! - [`client`] — Sync controller with fixed-delay reconnection
//! - [`graph`] — Node/edge editing on top of a document

pub mod client;
pub mod document;
pub mod graph;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;

// Re-exports for convenience
pub use client::{
    ClientConfig, ConnectionStatus, ReconnectTimer, SyncController, DEFAULT_RECONNECT_DELAY,
};
pub use document::{
    Delta, Document, DocumentError, Origin, Subscription, UpdateCallback, VersionVector, YDocument,
};
pub use graph::{Edge, FlowGraph, GraphError, Node};
pub use protocol::{Frame, MessageKind, ProtocolError};
pub use registry::{Outbound, Room, RoomId, RoomRegistry, Session, SessionId, DEFAULT_ROOM};
pub use relay::{Relay, RelayError, RelayStats};
pub use server::{RelayHandle, ServerConfig, ServerError, SyncServer};
