//! Client sync controller: keeps a local document in sync with one room.
//!
//! ```text
//!            open                      close / failed open
//! Connecting ─────► Connected ───────────────────────────► Disconnected
//!     ▲                                                         │
//!     └──────────────── reconnect timer (one pending) ──────────┘
//! ```
//!
//! One driver task per controller serializes socket events, local document
//! mutations, the reconnect timer and teardown in a single `select!` loop.
//! Transport failures never surface as errors; they only show up in
//! [`ConnectionStatus`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::document::{Delta, Document, Origin, Subscription, YDocument};
use crate::protocol::{encode_frame, Frame, MessageKind};
use crate::registry::RoomId;

/// Default pause between a lost connection and the next attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(2000);

/// Connection status as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Relay base URL, e.g. `ws://localhost:1234`
    pub server_url: String,
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:1234".to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// WebSocket URL of `room`.
    pub fn room_url(&self, room: &RoomId) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), room)
    }
}

/// Fixed-delay reconnection timer with at most one pending deadline.
#[derive(Debug, Clone)]
pub struct ReconnectTimer {
    delay: Duration,
    deadline: Option<Instant>,
    terminated: bool,
}

impl ReconnectTimer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
            terminated: false,
        }
    }

    /// Schedule a reconnect at `now + delay`.
    ///
    /// Returns false, leaving the timer untouched, if one is already pending
    /// or the timer was terminated.
    pub fn arm(&mut self, now: Instant) -> bool {
        if self.terminated || self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(now + self.delay);
        true
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Consume the pending deadline if it has passed.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Cancel and refuse every later `arm`.
    pub fn terminate(&mut self) {
        self.terminated = true;
        self.deadline = None;
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

/// Handle to a running sync controller.
///
/// Dropping the handle tears the controller down, same as [`Self::shutdown`]
/// without waiting.
#[must_use = "dropping a SyncController stops syncing"]
pub struct SyncController<D: Document = YDocument> {
    room: RoomId,
    document: Arc<D>,
    status: watch::Receiver<ConnectionStatus>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl<D: Document> SyncController<D> {
    /// Start syncing `document` with `room`. Must be called inside a tokio
    /// runtime.
    pub fn spawn(config: ClientConfig, room: RoomId, document: Arc<D>) -> Self {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let subscription = document.subscribe(Box::new(move |delta: &Delta, origin: &Origin| {
            if *origin == Origin::Remote {
                return;
            }
            let _ = local_tx.send(delta.clone());
        }));

        let driver = Driver {
            url: config.room_url(&room),
            document: document.clone(),
            status: status_tx,
            local: local_rx,
            timer: ReconnectTimer::new(config.reconnect_delay),
            subscription: Some(subscription),
        };
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(driver.run(shutdown_rx));

        Self {
            room,
            document,
            status: status_rx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn document(&self) -> &Arc<D> {
        &self.document
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Receiver for status transitions.
    pub fn status_changes(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Wait until the controller reports `target`. Returns false if the
    /// controller stopped first.
    pub async fn wait_for_status(&self, target: ConnectionStatus) -> bool {
        let mut rx = self.status.clone();
        if rx.wait_for(|status| *status == target).await.is_err() {
            return false;
        }
        true
    }

    /// Tear down and wait for the driver to finish: the reconnect timer is
    /// cancelled, the document subscriber released and any open socket closed.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl<D: Document> Drop for SyncController<D> {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum SessionEnd {
    Closed,
    Shutdown,
}

struct Driver<D: Document> {
    url: String,
    document: Arc<D>,
    status: watch::Sender<ConnectionStatus>,
    /// Local mutations queued by the document subscriber
    local: mpsc::UnboundedReceiver<Delta>,
    timer: ReconnectTimer,
    subscription: Option<Subscription>,
}

impl<D: Document> Driver<D> {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        loop {
            self.set_status(ConnectionStatus::Connecting);
            let connected = tokio::select! {
                result = tokio_tungstenite::connect_async(self.url.as_str()) => result,
                _ = &mut shutdown => break,
            };

            match connected {
                Ok((socket, _)) => {
                    log::info!("Connected to {}", self.url);
                    self.set_status(ConnectionStatus::Connected);
                    if let SessionEnd::Shutdown = self.session(socket, &mut shutdown).await {
                        break;
                    }
                }
                Err(e) => log::warn!("Connection to {} failed: {e}", self.url),
            }

            self.set_status(ConnectionStatus::Disconnected);
            self.timer.arm(Instant::now());
            if !self.wait_for_timer(&mut shutdown).await {
                break;
            }
        }
        self.teardown();
    }

    /// Wait for the pending reconnect deadline. False on teardown.
    async fn wait_for_timer(&mut self, shutdown: &mut oneshot::Receiver<()>) -> bool {
        let Some(deadline) = self.timer.deadline() else {
            return false;
        };
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    self.timer.fire(Instant::now());
                    return true;
                }
                // Offline edits are dropped; the next handshake covers them.
                Some(_) = self.local.recv() => {}
                _ = &mut *shutdown => return false,
            }
        }
    }

    async fn session(
        &mut self,
        socket: Socket,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> SessionEnd {
        let (mut ws_sender, mut ws_receiver) = socket.split();

        while self.local.try_recv().is_ok() {}
        let hello = Frame::StateVector(self.document.state_vector()).encode();
        if let Err(e) = ws_sender.send(Message::Binary(hello.into())).await {
            log::warn!("Handshake with {} failed: {e}", self.url);
            return SessionEnd::Closed;
        }

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            if let Some(reply) = self.handle_frame(&data) {
                                if ws_sender.send(Message::Binary(reply.into())).await.is_err() {
                                    return SessionEnd::Closed;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection to {} closed", self.url);
                            return SessionEnd::Closed;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {}: {e}", self.url);
                            return SessionEnd::Closed;
                        }
                        Some(Ok(_)) => {}
                    }
                }

                Some(delta) = self.local.recv() => {
                    let frame = encode_frame(MessageKind::Update, delta.as_bytes());
                    if ws_sender.send(Message::Binary(frame.into())).await.is_err() {
                        return SessionEnd::Closed;
                    }
                }

                _ = &mut *shutdown => {
                    let _ = ws_sender.close().await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    /// Handle one inbound frame; returns a reply frame if one is due.
    fn handle_frame(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        match Frame::decode(bytes) {
            Ok(Frame::StateVector(peer)) => match self.document.compute_delta(&peer) {
                Ok(delta) if !delta.is_empty() => Some(Frame::Update(delta).encode()),
                Ok(_) => None,
                Err(e) => {
                    log::warn!("Ignoring state vector from {}: {e}", self.url);
                    None
                }
            },
            Ok(Frame::Update(delta)) => {
                if let Err(e) = self.document.apply_delta(&delta, Origin::Remote) {
                    log::warn!("Ignoring update from {}: {e}", self.url);
                }
                None
            }
            Err(e) => {
                log::warn!("Ignoring frame from {}: {e}", self.url);
                None
            }
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        if self.status.send_replace(status) != status {
            log::debug!("Sync status for {}: {status}", self.url);
        }
    }

    fn teardown(&mut self) {
        self.timer.terminate();
        if let Some(subscription) = self.subscription.take() {
            self.document.unsubscribe(subscription);
        }
        self.set_status(ConnectionStatus::Disconnected);
        log::info!("Sync controller for {} stopped", self.url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.server_url, "ws://localhost:1234");
        assert_eq!(config.reconnect_delay, Duration::from_millis(2000));
    }

    #[test]
    fn test_room_url() {
        let room = RoomId::new("r1");
        assert_eq!(ClientConfig::new("ws://relay:1234").room_url(&room), "ws://relay:1234/r1");
        assert_eq!(ClientConfig::new("ws://relay:1234/").room_url(&room), "ws://relay:1234/r1");
    }

    #[test]
    fn test_status_string_form() {
        assert_eq!(ConnectionStatus::Connected.to_string(), "connected");
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::Disconnected).unwrap(),
            "\"disconnected\""
        );
        let parsed: ConnectionStatus = serde_json::from_str("\"connecting\"").unwrap();
        assert_eq!(parsed, ConnectionStatus::Connecting);
    }

    #[test]
    fn test_timer_single_pending() {
        let mut timer = ReconnectTimer::new(Duration::from_millis(2000));
        let now = Instant::now();

        assert!(timer.arm(now));
        let deadline = timer.deadline().unwrap();
        assert!(!timer.arm(now + Duration::from_millis(500)));
        assert_eq!(timer.deadline(), Some(deadline), "second arm must not move the deadline");
        assert_eq!(deadline, now + Duration::from_millis(2000));
    }

    #[test]
    fn test_timer_fires_once() {
        let mut timer = ReconnectTimer::new(Duration::from_millis(100));
        let now = Instant::now();
        timer.arm(now);

        assert!(!timer.fire(now));
        assert!(timer.fire(now + Duration::from_millis(100)));
        assert!(!timer.fire(now + Duration::from_millis(200)));
        assert!(!timer.is_pending());

        assert!(timer.arm(now), "re-armable after firing");
    }

    #[test]
    fn test_timer_terminate() {
        let mut timer = ReconnectTimer::new(Duration::from_millis(100));
        let now = Instant::now();
        timer.arm(now);
        timer.terminate();

        assert!(!timer.is_pending());
        assert!(timer.is_terminated());
        assert!(!timer.arm(now));
    }

    async fn dead_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_disconnected() {
        let config = ClientConfig::new(dead_url().await)
            .with_reconnect_delay(Duration::from_millis(50));
        let doc = Arc::new(YDocument::new());
        let controller = SyncController::spawn(config, RoomId::new("r1"), doc.clone());
        assert_eq!(doc.subscriber_count(), 1);

        let reached = timeout(
            Duration::from_secs(5),
            controller.wait_for_status(ConnectionStatus::Disconnected),
        )
        .await
        .unwrap();
        assert!(reached);

        // Keeps retrying until torn down.
        let mut changes = controller.status_changes();
        timeout(
            Duration::from_secs(5),
            changes.wait_for(|s| *s == ConnectionStatus::Connecting),
        )
        .await
        .unwrap()
        .unwrap();

        controller.shutdown().await;
        assert_eq!(doc.subscriber_count(), 0);
        assert_eq!(*changes.borrow(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_drop_tears_down() {
        let config = ClientConfig::new(dead_url().await);
        let doc = Arc::new(YDocument::new());
        let controller = SyncController::spawn(config, RoomId::default(), doc.clone());
        let mut changes = controller.status_changes();
        drop(controller);

        // The driver exits and drops its status sender.
        timeout(Duration::from_secs(5), async {
            while changes.changed().await.is_ok() {}
        })
        .await
        .unwrap();
        assert_eq!(doc.subscriber_count(), 0);
    }
}
