//! WebSocket relay with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/{room}
//!            ├── DocumentRoom(room) ── yrs Doc ── BroadcastGroup
//! Client B ──┘                                       │
//!                                  ┌─────────────────┼───────────────┐
//!                                  ▼                 ▼               ▼
//!                               Client A          Client B        Client C
//!                            (own messages filtered out by peer_id)
//!
//! GET /status ── { rooms, connections, shapes: { room → count } }
//! ```
//!
//! Each room keeps an authoritative `yrs` document so late joiners and
//! reconnecting clients catch up through the two-step handshake. Rooms are
//! dropped when their last peer leaves.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, PeerInfo, SyncMessage};
use crate::room::{DocumentRoom, RoomRegistry};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket listen address
    pub bind_addr: String,
    /// HTTP status endpoint address (None = not served)
    pub status_addr: Option<String>,
    /// Joins beyond this many peers in one room are refused
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            status_addr: None,
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Read-only health report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub rooms: usize,
    pub connections: usize,
    /// Live shape count per room
    pub shapes: BTreeMap<String, usize>,
}

struct Shared {
    config: ServerConfig,
    registry: RoomRegistry,
    connections: AtomicUsize,
}

/// The relay server. Clones share rooms and counters.
#[derive(Clone)]
pub struct SyncServer {
    shared: Arc<Shared>,
}

/// Per-connection state once the peer has joined a room.
struct Joined {
    peer: PeerInfo,
    room: Arc<DocumentRoom>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = RoomRegistry::new(config.broadcast_capacity);
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                connections: AtomicUsize::new(0),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.shared.registry
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve WebSocket peers on an already bound listener.
    ///
    /// The status endpoint is started first when `status_addr` is set.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        if let Some(addr) = &self.shared.config.status_addr {
            let status_listener = TcpListener::bind(addr).await?;
            log::info!("Status endpoint on http://{}/status", status_listener.local_addr()?);
            let router = self.status_router();
            tokio::spawn(async move {
                if let Err(e) = axum::serve(status_listener, router).await {
                    log::error!("Status endpoint stopped: {e}");
                }
            });
        }

        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                shared.connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = Self::handle_connection(stream, addr, &shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                shared.connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    /// Current room count, connection count and per-room shape counts.
    pub async fn status(&self) -> ServerStatus {
        Self::status_of(&self.shared).await
    }

    async fn status_of(shared: &Shared) -> ServerStatus {
        ServerStatus {
            rooms: shared.registry.room_count().await,
            connections: shared.connections.load(Ordering::Relaxed),
            shapes: shared.registry.shape_counts().await,
        }
    }

    /// `GET /status` as JSON.
    pub fn status_router(&self) -> Router {
        Router::new()
            .route("/status", get(status_handler))
            .with_state(self.shared.clone())
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: &Shared,
    ) -> Result<(), BoxError> {
        let mut path = String::new();
        let capture_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().path().to_string();
            Ok(resp)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture_path).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let path_room = room_from_path(&path);

        log::info!("WebSocket connection established from {addr} (path {path:?})");

        let mut joined: Option<Joined> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let bytes: Vec<u8> = match msg {
                        Some(Ok(Message::Binary(data))) => data.into(),
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(_)) => continue,
                    };

                    let sync_msg = match SyncMessage::decode(&bytes) {
                        Ok(m) => m,
                        Err(e) => {
                            log::warn!("Failed to decode message from {addr}: {e}");
                            continue;
                        }
                    };

                    if sync_msg.msg_type == MessageType::Ping {
                        let pong = SyncMessage::pong(sync_msg.peer_id).encode()?;
                        ws_sender.send(Message::Binary(pong.into())).await?;
                        continue;
                    }

                    let Some(session) = &joined else {
                        if sync_msg.msg_type != MessageType::PeerJoined {
                            log::warn!("{addr} sent {:?} before joining a room", sync_msg.msg_type);
                            continue;
                        }
                        let info = sync_msg.peer_info().unwrap_or_else(|_| {
                            PeerInfo::with_id(sync_msg.peer_id, sync_msg.peer_id.to_string(), "Anonymous")
                        });
                        let room_name = path_room.clone().unwrap_or_else(|| sync_msg.room.clone());
                        let room = shared.registry.get_or_create(&room_name).await;

                        if room.broadcast().peer_count().await >= shared.config.max_peers_per_room {
                            log::warn!(
                                "Room {room_name:?} is full ({} peers), refusing {}",
                                shared.config.max_peers_per_room,
                                info.peer_id
                            );
                            ws_sender.send(Message::Close(None)).await?;
                            shared.registry.remove_if_empty(&room_name).await;
                            return Ok(());
                        }

                        broadcast_rx = Some(room.broadcast().add_peer(info.clone()).await);
                        let _ = room.broadcast().broadcast(&SyncMessage::peer_joined(&room_name, &info)?);
                        log::info!("Peer {} ({}) joined room {room_name:?}", info.name, info.peer_id);
                        joined = Some(Joined { peer: info, room });
                        continue;
                    };

                    let room = &session.room;
                    match sync_msg.msg_type {
                        MessageType::SyncStep1 => {
                            let diff = match room.diff_since(&sync_msg.payload) {
                                Ok(diff) => diff,
                                Err(e) => {
                                    log::warn!("Bad state vector from {}: {e}", session.peer.peer_id);
                                    continue;
                                }
                            };
                            let reply = SyncMessage::sync_step2(Uuid::nil(), room.name(), diff).encode()?;
                            ws_sender.send(Message::Binary(reply.into())).await?;

                            // Ask for whatever the client has that the room lacks.
                            let request =
                                SyncMessage::sync_step1(Uuid::nil(), room.name(), room.state_vector()).encode()?;
                            ws_sender.send(Message::Binary(request.into())).await?;
                        }

                        MessageType::SyncStep2 | MessageType::Delta => {
                            if let Err(e) = room.apply_update(&sync_msg.payload) {
                                log::warn!("Dropping update from {}: {e}", session.peer.peer_id);
                                continue;
                            }
                            let delta = SyncMessage::delta(
                                session.peer.peer_id,
                                room.name(),
                                sync_msg.clock,
                                sync_msg.payload,
                            );
                            let _ = room.broadcast().broadcast(&delta);
                        }

                        MessageType::Awareness => {
                            match AwarenessMessage::decode(&sync_msg.payload) {
                                Ok(AwarenessMessage::Join(user)) => {
                                    log::info!("Presence: {} joined room {:?}", user.name, room.name());
                                }
                                Ok(AwarenessMessage::Leave) => {
                                    log::info!("Presence: {} left room {:?}", session.peer.peer_id, room.name());
                                }
                                Ok(AwarenessMessage::Cursor { .. }) => {
                                    log::trace!("Presence: cursor update in room {:?}", room.name());
                                }
                                Ok(AwarenessMessage::Selection { shape_ids }) => {
                                    log::debug!(
                                        "Presence: {} selected {} shapes in room {:?}",
                                        session.peer.peer_id,
                                        shape_ids.len(),
                                        room.name()
                                    );
                                }
                                Ok(AwarenessMessage::Active { is_active }) => {
                                    log::debug!("Presence: {} active={is_active}", session.peer.peer_id);
                                }
                                Err(e) => {
                                    log::warn!("Dropping awareness from {}: {e}", session.peer.peer_id);
                                    continue;
                                }
                            }
                            let mut relayed = sync_msg;
                            relayed.peer_id = session.peer.peer_id;
                            let _ = room.broadcast().broadcast(&relayed);
                        }

                        MessageType::PeerLeft => {
                            log::info!("Peer {} leaving room {:?}", session.peer.peer_id, room.name());
                            break;
                        }

                        other => {
                            log::debug!("Unhandled message type from {addr}: {other:?}");
                        }
                    }
                }

                msg = async {
                    match broadcast_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        Ok(data) => {
                            let own = match (&joined, SyncMessage::decode(&data)) {
                                (Some(session), Ok(m)) => m.peer_id == session.peer.peer_id,
                                _ => false,
                            };
                            if !own {
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Peer at {addr} lagged by {n} messages");
                            if let Some(session) = &joined {
                                session.room.broadcast().record_lag(n);
                            }
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }

        if let Some(Joined { peer, room }) = joined {
            room.broadcast().remove_peer(&peer.peer_id).await;
            let _ = room.broadcast().broadcast(&SyncMessage::peer_left(peer.peer_id, room.name()));
            shared.registry.remove_if_empty(room.name()).await;
            log::info!("Peer {} ({}) left room {:?}", peer.name, peer.peer_id, room.name());
        }

        Ok(())
    }
}

async fn status_handler(State(shared): State<Arc<Shared>>) -> Json<ServerStatus> {
    Json(SyncServer::status_of(&shared).await)
}

/// `/board-1` → `board-1`; the bare root carries no room.
fn room_from_path(path: &str) -> Option<String> {
    let room = path.trim_matches('/');
    (!room.is_empty()).then(|| room.to_string())
}
