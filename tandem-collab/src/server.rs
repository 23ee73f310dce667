//! WebSocket relay server with path-based room routing.
//!
//! Architecture:
//! ```text
//! ws://host/r1 ── conn task ──┐                      ┌── Room r1 ── YDocument
//!                             ├── RelayCommand ──► dispatcher (Relay)
//! ws://host/r2 ── conn task ──┘        mpsc          └── Room r2 ── YDocument
//!        ▲                                   │
//!        └────────── Outbound (per session) ◄┘
//! ```
//!
//! The dispatcher is the only task that touches the registry and the room
//! documents, so every frame of a room is handled in arrival order without
//! locks. Connection tasks only shuttle bytes between the socket and the
//! dispatcher.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::registry::{Outbound, RoomId, SessionId, DEFAULT_ROOM};
use crate::relay::{Relay, RelayStats};

/// Pause after a failed accept, so descriptor exhaustion does not spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: String,
    pub port: u16,
    /// Room used when the connection path names none
    pub default_room: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1234,
            default_room: DEFAULT_ROOM.to_string(),
        }
    }
}

impl ServerConfig {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_default_room(mut self, room: impl Into<String>) -> Self {
        self.default_room = room.into();
        self
    }

    /// `host:port` as passed to the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("relay dispatcher has stopped")]
    DispatcherClosed,
}

enum RelayCommand {
    Connect {
        room: RoomId,
        outbound: Outbound,
        reply: oneshot::Sender<SessionId>,
    },
    Message {
        session: SessionId,
        frame: Vec<u8>,
    },
    Disconnect {
        session: SessionId,
    },
    Stats {
        reply: oneshot::Sender<RelayStats>,
    },
}

/// Cloneable handle to the dispatch task that owns the [`Relay`].
#[derive(Clone)]
pub struct RelayHandle {
    commands: mpsc::UnboundedSender<RelayCommand>,
}

impl RelayHandle {
    /// Spawn a dispatch task for `relay`. It runs until every handle is gone.
    pub fn spawn(relay: Relay) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(relay, rx));
        Self { commands }
    }

    fn submit(&self, command: RelayCommand) -> Result<(), ServerError> {
        self.commands
            .send(command)
            .map_err(|_| ServerError::DispatcherClosed)
    }

    pub async fn connect(&self, room: RoomId, outbound: Outbound) -> Result<SessionId, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.submit(RelayCommand::Connect {
            room,
            outbound,
            reply,
        })?;
        rx.await.map_err(|_| ServerError::DispatcherClosed)
    }

    /// Queue an inbound frame. Handling errors are logged by the dispatcher.
    pub fn message(&self, session: SessionId, frame: Vec<u8>) -> Result<(), ServerError> {
        self.submit(RelayCommand::Message { session, frame })
    }

    pub fn disconnect(&self, session: SessionId) -> Result<(), ServerError> {
        self.submit(RelayCommand::Disconnect { session })
    }

    pub async fn stats(&self) -> Result<RelayStats, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.submit(RelayCommand::Stats { reply })?;
        rx.await.map_err(|_| ServerError::DispatcherClosed)
    }
}

async fn dispatch(mut relay: Relay, mut commands: mpsc::UnboundedReceiver<RelayCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            RelayCommand::Connect {
                room,
                outbound,
                reply,
            } => {
                let session = relay.on_connect(room, outbound);
                if reply.send(session).is_err() {
                    // Connection task went away mid-handshake.
                    relay.on_disconnect(session);
                }
            }
            RelayCommand::Message { session, frame } => {
                if let Err(e) = relay.on_message(session, &frame) {
                    log::warn!("Discarded frame from session {session}: {e}");
                }
            }
            RelayCommand::Disconnect { session } => {
                relay.on_disconnect(session);
            }
            RelayCommand::Stats { reply } => {
                let _ = reply.send(relay.stats());
            }
        }
    }
    log::debug!("Relay dispatcher stopped");
}

/// The relay server.
pub struct SyncServer {
    config: ServerConfig,
    relay: RelayHandle,
}

impl SyncServer {
    /// Create a server and start its dispatcher. Must be called inside a
    /// tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            relay: RelayHandle::spawn(Relay::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn handle(&self) -> RelayHandle {
        self.relay.clone()
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serve until `shutdown` completes. Failed accepts are logged and
    /// retried. Connections already accepted keep running on their own tasks.
    pub async fn serve_with_shutdown(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        log::info!("Relay listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);
        let listener = &listener;

        loop {
            tokio::select! {
                (stream, addr) = accept_next(move || listener.accept()) => {
                    log::debug!("New TCP connection from {addr}");

                    let relay = self.relay.clone();
                    let default_room = self.config.default_room.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, relay, default_room).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = &mut shutdown => {
                    log::info!("Relay shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Accept the next connection, retrying after transient failures such as
/// `EMFILE` or `ECONNABORTED`.
async fn accept_next<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(conn) => return conn,
            Err(e) => {
                log::warn!("Failed to accept connection: {e}");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Handle a single WebSocket connection for its whole lifetime.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    relay: RelayHandle,
    default_room: String,
) -> Result<(), ServerError> {
    let mut path = String::new();
    let capture_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().path().to_string();
        Ok(resp)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture_path).await?;
    let room = RoomId::from_path(&path, &default_room);

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
    let session = relay.connect(room.clone(), outbound).await?;
    log::info!("WebSocket connection from {addr} joined room {room} as {session}");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let result: Result<(), ServerError> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            relay.message(session, data.into())?;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Text(_))) => {
                            log::debug!("Ignoring text frame from {addr}");
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            return Ok(());
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                    }
                }

                frame = outbound_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }
    .await;

    // Release the session even when the socket failed.
    let _ = relay.disconnect(session);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, YDocument};
    use crate::protocol::Frame;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 1234);
        assert_eq!(config.default_room, "default");
        assert_eq!(config.bind_addr(), "0.0.0.0:1234");
    }

    #[test]
    fn test_server_config_builders() {
        let config = ServerConfig::default()
            .with_host("127.0.0.1")
            .with_port(8080)
            .with_default_room("lobby");
        assert_eq!(config.bind_addr(), "127.0.0.1:8080");
        assert_eq!(config.default_room, "lobby");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.handle().stats().await.unwrap();
        assert_eq!(stats, RelayStats::default());
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let relay = RelayHandle::spawn(Relay::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = relay.connect(RoomId::new("r1"), tx).await.unwrap();

        let probe = Frame::StateVector(YDocument::new().state_vector()).encode();
        relay.message(session, probe).unwrap();

        let reply = rx.recv().await.unwrap();
        assert!(matches!(Frame::decode(&reply).unwrap(), Frame::StateVector(_)));

        relay.disconnect(session).unwrap();
        let stats = relay.stats().await.unwrap();
        assert_eq!(stats.rooms, 1);
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.frames_received, 1);
    }

    #[tokio::test]
    async fn test_dispatcher_logs_and_survives_bad_frame() {
        let relay = RelayHandle::spawn(Relay::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = relay.connect(RoomId::default(), tx).await.unwrap();

        relay.message(session, vec![42]).unwrap();
        let stats = relay.stats().await.unwrap();
        assert_eq!(stats.frames_rejected, 1);
        assert_eq!(stats.active_sessions, 1);
    }

    #[tokio::test]
    async fn test_accept_survives_transient_errors() {
        let mut failures = 2;
        let accepted = accept_next(|| {
            let result = if failures > 0 {
                failures -= 1;
                Err(io::Error::from_raw_os_error(24))
            } else {
                Ok(7u8)
            };
            async move { result }
        })
        .await;

        assert_eq!(accepted, 7);
        assert_eq!(failures, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accept_loop() {
        let server = SyncServer::with_defaults();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (stop, stopped) = oneshot::channel::<()>();

        stop.send(()).unwrap();
        server
            .serve_with_shutdown(listener, async {
                let _ = stopped.await;
            })
            .await
            .unwrap();
    }
}
