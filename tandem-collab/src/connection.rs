//! One WebSocket transport per room, reported as a four-state
//! [`ConnectionStatus`].
//!
//! ```text
//!              connect()
//! Disconnected ─────────▶ Connecting ──ok──▶ Connected
//!      ▲                      │                  │
//!      │                      └──fail──▶ Error ◀─┘ socket error
//!      └──── stop_all_connections() / clean close ─┘
//! ```
//!
//! Everything received on the socket, and every state transition, is
//! delivered as a [`TransportEvent`] on the channel returned by
//! [`ConnectionManager::new`]. Nothing outside this module touches the
//! socket itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::SyncError;
use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, PeerInfo, SyncMessage};
use crate::reconnect::RetryEvent;

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Relay base address, e.g. `ws://127.0.0.1:9090`
    pub endpoint: String,
    pub room: String,
    pub peer: PeerInfo,
    /// Application-level ping period (None = no heartbeat)
    pub heartbeat_interval: Option<Duration>,
    /// Upper bound on the WebSocket handshake
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(endpoint: impl Into<String>, room: impl Into<String>, peer: PeerInfo) -> Self {
        Self {
            endpoint: endpoint.into(),
            room: room.into(),
            peer,
            heartbeat_interval: Some(Duration::from_secs(15)),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// `{endpoint}/{room}`
    pub fn url(&self) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), self.room)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Connectivity as seen by dependents.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Consecutive failed reconnection attempts, reset on connect.
    pub retry_count: u32,
    pub error: Option<String>,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// Everything the transport reports.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StatusChanged(ConnectionState),
    /// Incremental update from another peer
    RemoteUpdate { peer_id: Uuid, update: Vec<u8> },
    /// The relay sent its state vector and wants our diff
    SyncRequest(Vec<u8>),
    /// The relay's diff against our state vector
    StateSynced(Vec<u8>),
    RemoteAwareness { peer_id: Uuid, message: AwarenessMessage },
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
    Pong,
    RetryScheduled(RetryEvent),
    /// Automatic reconnection stopped after this many failures.
    RetriesExhausted(u32),
}

struct Transport {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    /// Reader and heartbeat. The writer is not listed: it exits on its own
    /// once every sender is gone, after flushing what was queued.
    tasks: Vec<JoinHandle<()>>,
}

impl Transport {
    fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        drop(self.outgoing);
    }
}

struct Inner {
    config: Mutex<ConnectionConfig>,
    state: Mutex<ConnectionState>,
    transport: Mutex<Option<Transport>>,
    /// Bumped on every connect and stop; tasks of older transports go quiet.
    generation: AtomicU64,
    clock: AtomicU64,
    events: mpsc::UnboundedSender<TransportEvent>,
}

/// Cloneable handle to the room transport.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionManager {
    /// Create the manager and the receiving end of its event stream.
    pub fn new(config: ConnectionConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(Inner {
                config: Mutex::new(config),
                state: Mutex::new(ConnectionState::default()),
                transport: Mutex::new(None),
                generation: AtomicU64::new(0),
                clock: AtomicU64::new(0),
                events,
            }),
        };
        (manager, events_rx)
    }

    /// Extra producer for the event stream (used for retry notifications).
    pub fn event_sender(&self) -> mpsc::UnboundedSender<TransportEvent> {
        self.inner.events.clone()
    }

    fn emit(&self, event: TransportEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.inner.events.send(event);
    }

    fn update_state(&self, f: impl FnOnce(&mut ConnectionState)) {
        let changed = {
            let mut state = lock(&self.inner.state);
            let before = state.clone();
            f(&mut state);
            (*state != before).then(|| state.clone())
        };
        if let Some(state) = changed {
            log::debug!("Connection state → {:?}", state.status);
            self.emit(TransportEvent::StatusChanged(state));
        }
    }

    fn set_status(&self, status: ConnectionStatus, error: Option<String>) {
        self.update_state(|state| {
            state.status = status;
            state.error = error;
            if status == ConnectionStatus::Connected {
                state.retry_count = 0;
            }
        });
    }

    /// Open the transport and announce this peer to the room.
    ///
    /// Returns immediately when already connected. Failures move the state
    /// to `Error` and are returned.
    pub async fn connect(&self) -> Result<(), SyncError> {
        if self.is_connected() {
            return Ok(());
        }
        if let Some(stale) = lock(&self.inner.transport).take() {
            stale.shutdown();
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let config = self.config();
        let join = SyncMessage::peer_joined(&config.room, &config.peer)?.encode()?;
        let url = config.url();
        self.set_status(ConnectionStatus::Connecting, None);
        log::info!("Connecting to {url} as {}", config.peer.peer_id);

        let ws_stream = match tokio::time::timeout(
            config.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                let err = SyncError::from(e);
                self.fail(generation, &err);
                return Err(err);
            }
            Err(_) => {
                self.fail(generation, &SyncError::Timeout);
                return Err(SyncError::Timeout);
            }
        };

        if !self.is_current(generation) {
            log::debug!("Connection to {url} superseded before it completed");
            return Err(SyncError::Transport("connection superseded".to_string()));
        }

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let mut tasks = Vec::with_capacity(2);

        // Writer: outgoing channel → socket, then a close frame.
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader: socket → events.
        let this = self.clone();
        let own_id = config.peer.peer_id;
        tasks.push(tokio::spawn(async move {
            let reason = loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        match SyncMessage::decode(&bytes) {
                            Ok(msg) if msg.peer_id == own_id => {}
                            Ok(msg) => {
                                if let Some(event) = route(msg) {
                                    this.emit(event);
                                }
                            }
                            Err(e) => log::warn!("Undecodable message from relay: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break None,
                    Some(Err(e)) => break Some(e.to_string()),
                    Some(Ok(_)) => {}
                }
            };
            this.lost(generation, reason);
        }));

        if let Some(period) = config.heartbeat_interval {
            let out = out_tx.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let ping = match SyncMessage::ping(own_id).encode() {
                        Ok(ping) => ping,
                        Err(_) => break,
                    };
                    if out.send(ping).is_err() {
                        break;
                    }
                }
            }));
        }

        let _ = out_tx.send(join);

        {
            let mut transport = lock(&self.inner.transport);
            if !self.is_current(generation) {
                Transport { outgoing: out_tx, tasks }.shutdown();
                return Err(SyncError::Transport("connection superseded".to_string()));
            }
            *transport = Some(Transport { outgoing: out_tx, tasks });
            // Under the lock, so a loss noticed by the reader lands after it.
            self.set_status(ConnectionStatus::Connected, None);
        }

        log::info!("Connected to room {:?}", config.room);
        Ok(())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    fn fail(&self, generation: u64, err: &SyncError) {
        if self.is_current(generation) {
            log::warn!("Connection failed: {err}");
            self.set_status(ConnectionStatus::Error, Some(err.to_string()));
        }
    }

    /// The socket of `generation` ended on its own.
    fn lost(&self, generation: u64, reason: Option<String>) {
        let transport = {
            let mut transport = lock(&self.inner.transport);
            if !self.is_current(generation) {
                return;
            }
            // A connect still installing this transport backs out.
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            transport.take()
        };
        if let Some(transport) = transport {
            transport.shutdown();
        }
        match reason {
            Some(e) => {
                log::warn!("Connection lost: {e}");
                self.set_status(ConnectionStatus::Error, Some(e));
            }
            None => {
                log::info!("Connection closed by relay");
                self.set_status(ConnectionStatus::Disconnected, None);
            }
        }
    }

    /// Tear down the transport and release the socket. Messages already
    /// sent are flushed before the close frame. Returns whether a transport
    /// was live; a second call is a no-op.
    pub fn stop_all_connections(&self) -> bool {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let transport = lock(&self.inner.transport).take();
        let had_transport = transport.is_some();
        if let Some(transport) = transport {
            transport.shutdown();
            log::info!("Connection stopped");
        }
        self.set_status(ConnectionStatus::Disconnected, None);
        had_transport
    }

    // ─── Outgoing ────────────────────────────────────────────────

    fn send(&self, msg: SyncMessage) -> Result<(), SyncError> {
        let encoded = msg.encode()?;
        let transport = lock(&self.inner.transport);
        match transport.as_ref() {
            Some(t) => t.outgoing.send(encoded).map_err(|_| SyncError::NotConnected),
            None => Err(SyncError::NotConnected),
        }
    }

    /// Send a document update to the room.
    pub fn send_update(&self, update: Vec<u8>) -> Result<(), SyncError> {
        let clock = self.inner.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let (peer_id, room) = self.identity();
        self.send(SyncMessage::delta(peer_id, &room, clock, update))
    }

    /// Ask the relay for everything missing from `state_vector`.
    pub fn send_sync_request(&self, state_vector: Vec<u8>) -> Result<(), SyncError> {
        let (peer_id, room) = self.identity();
        self.send(SyncMessage::sync_step1(peer_id, &room, state_vector))
    }

    /// Answer the relay's state vector with our diff.
    pub fn send_sync_reply(&self, diff: Vec<u8>) -> Result<(), SyncError> {
        let (peer_id, room) = self.identity();
        self.send(SyncMessage::sync_step2(peer_id, &room, diff))
    }

    pub fn send_awareness(&self, message: &AwarenessMessage) -> Result<(), SyncError> {
        let clock = self.inner.clock.load(Ordering::Relaxed);
        let (peer_id, room) = self.identity();
        self.send(SyncMessage::awareness(peer_id, &room, clock, message)?)
    }

    pub fn send_ping(&self) -> Result<(), SyncError> {
        let (peer_id, _) = self.identity();
        self.send(SyncMessage::ping(peer_id))
    }

    // ─── State ───────────────────────────────────────────────────

    /// Record the reconnection supervisor's failure count.
    pub fn record_retry(&self, retry_count: u32) {
        self.update_state(|state| state.retry_count = retry_count);
    }

    /// Switch to a fresh peer id for the next connect.
    pub fn renew_identity(&self) -> PeerInfo {
        let mut config = lock(&self.inner.config);
        config.peer = config.peer.renewed();
        config.peer.clone()
    }

    fn identity(&self) -> (Uuid, String) {
        let config = lock(&self.inner.config);
        (config.peer.peer_id, config.room.clone())
    }

    pub fn config(&self) -> ConnectionConfig {
        lock(&self.inner.config).clone()
    }

    pub fn peer(&self) -> PeerInfo {
        lock(&self.inner.config).peer.clone()
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.state).clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.inner.state).status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Number of updates sent so far.
    pub fn clock(&self) -> u64 {
        self.inner.clock.load(Ordering::Relaxed)
    }
}

/// Map a relay message onto the event it represents.
fn route(msg: SyncMessage) -> Option<TransportEvent> {
    match msg.msg_type {
        MessageType::Delta => Some(TransportEvent::RemoteUpdate {
            peer_id: msg.peer_id,
            update: msg.payload,
        }),
        MessageType::SyncStep1 => Some(TransportEvent::SyncRequest(msg.payload)),
        MessageType::SyncStep2 => Some(TransportEvent::StateSynced(msg.payload)),
        MessageType::Awareness => match msg.awareness_message() {
            Ok(message) => Some(TransportEvent::RemoteAwareness {
                peer_id: msg.peer_id,
                message,
            }),
            Err(e) => {
                log::warn!("Dropping awareness from {}: {e}", msg.peer_id);
                None
            }
        },
        MessageType::PeerJoined => msg.peer_info().ok().map(TransportEvent::PeerJoined),
        MessageType::PeerLeft => Some(TransportEvent::PeerLeft(msg.peer_id)),
        MessageType::Pong => Some(TransportEvent::Pong),
        MessageType::Ping => None,
    }
}
