//! Presence protocol for real-time cursor, selection and activity awareness.
//!
//! Presence is ephemeral: it never enters the offline queue, is never
//! recorded by the undo manager, and is rebuilt from scratch after a
//! restart. Remote peers are keyed by their session peer id, so two tabs of
//! the same user show up as two entries.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! PresenceRoom::update_local_cursor()
//!       │  (rate-limited: cursor_interval)
//!       ▼
//! AwarenessMessage::Cursor { … }
//!       │
//!       ▼   (WebSocket relay)
//! Remote PresenceRoom::handle_message()
//!       │
//!       ▼
//! users()  →  onPresenceChange listeners
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tandem_core::Point;
use uuid::Uuid;

use crate::protocol::{from_wire, to_wire, ProtocolError};

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Application-level identity of the local user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: String,
    pub name: String,
    pub avatar: Option<String>,
}

impl UserInfo {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

/// Everything collaborators know about one user right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: String,
    pub name: String,
    pub avatar: Option<String>,
    pub cursor: Point,
    /// Selected shape ids (empty = no selection)
    pub selection: Vec<String>,
    pub is_active: bool,
}

impl UserPresence {
    pub fn new(user: &UserInfo) -> Self {
        Self {
            user_id: user.user_id.clone(),
            name: user.name.clone(),
            avatar: user.avatar.clone(),
            cursor: Point::default(),
            selection: Vec::new(),
            is_active: true,
        }
    }

    /// Stand-in for a peer whose Join we missed.
    fn placeholder(peer_id: Uuid) -> Self {
        let short = peer_id.to_string()[..8].to_string();
        Self {
            user_id: format!("peer-{short}"),
            name: format!("Peer-{short}"),
            avatar: None,
            cursor: Point::default(),
            selection: Vec::new(),
            is_active: true,
        }
    }
}

/// Tuning knobs for presence traffic.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Minimum interval between cursor broadcasts (33ms ≈ 30fps).
    pub cursor_interval: Duration,
    /// Peers silent for longer than this are dropped by `cleanup_idle_peers`.
    pub idle_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            cursor_interval: Duration::from_millis(33),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire protocol messages
// ───────────────────────────────────────────────────────────────────

/// Awareness message types sent over the wire.
///
/// These are serialized inside `SyncMessage::Awareness` payloads; the sender
/// is identified by the envelope's `peer_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AwarenessMessage {
    /// Full presence state, sent on join and whenever a peer asks for it.
    Join(UserPresence),

    /// Leave room (clean disconnect).
    Leave,

    /// Cursor position update (high frequency, rate-limited).
    Cursor {
        position: Point,
        /// Monotonic per-sender counter; older values are dropped.
        timestamp: u64,
    },

    /// Selection update (only on selection change).
    Selection { shape_ids: Vec<String> },

    /// Activity flag (tab focused, user idle, ...).
    Active { is_active: bool },
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        to_wire(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        from_wire(bytes)
    }
}

// ───────────────────────────────────────────────────────────────────
// Remote peer state
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RemotePeer {
    presence: UserPresence,
    last_update: Instant,
    last_timestamp: u64,
}

impl RemotePeer {
    fn new(presence: UserPresence) -> Self {
        Self {
            presence,
            last_update: Instant::now(),
            last_timestamp: 0,
        }
    }

    /// Only applies updates with newer timestamps. Returns whether it moved.
    fn update_cursor(&mut self, position: Point, timestamp: u64) -> bool {
        self.last_update = Instant::now();
        if timestamp < self.last_timestamp {
            return false;
        }
        self.last_timestamp = timestamp;
        let moved = self.presence.cursor != position;
        self.presence.cursor = position;
        moved
    }

    fn touch(&mut self) {
        self.last_update = Instant::now();
    }

    fn is_idle(&self, timeout: Duration) -> bool {
        self.last_update.elapsed() > timeout
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence room
// ───────────────────────────────────────────────────────────────────

/// Presence state of one collaboration room as seen by the local session.
pub struct PresenceRoom {
    /// Session identity of the local peer.
    local_peer_id: Uuid,
    local: UserPresence,
    /// Remote peer states, indexed by session peer id.
    peers: HashMap<Uuid, RemotePeer>,
    last_cursor_broadcast: Option<Instant>,
    /// Monotonic timestamp counter for outgoing cursor messages.
    timestamp_counter: u64,
    config: PresenceConfig,
}

impl PresenceRoom {
    pub fn new(local_peer_id: Uuid, user: &UserInfo, config: PresenceConfig) -> Self {
        Self {
            local_peer_id,
            local: UserPresence::new(user),
            peers: HashMap::new(),
            last_cursor_broadcast: None,
            timestamp_counter: 0,
            config,
        }
    }

    /// Handle an incoming awareness message from `peer_id`.
    ///
    /// Returns `true` when the visible presence state changed.
    pub fn handle_message(&mut self, peer_id: Uuid, msg: &AwarenessMessage) -> bool {
        // Ignore our own messages
        if peer_id == self.local_peer_id {
            return false;
        }

        match msg {
            AwarenessMessage::Join(presence) => {
                let previous = self.peers.insert(peer_id, RemotePeer::new(presence.clone()));
                previous.map_or(true, |p| p.presence != *presence)
            }

            AwarenessMessage::Leave => self.peers.remove(&peer_id).is_some(),

            AwarenessMessage::Cursor { position, timestamp } => match self.peers.get_mut(&peer_id) {
                Some(peer) => peer.update_cursor(*position, *timestamp),
                // They joined before we connected; track them until the Join arrives.
                None => {
                    let mut peer = RemotePeer::new(UserPresence::placeholder(peer_id));
                    peer.update_cursor(*position, *timestamp);
                    self.peers.insert(peer_id, peer);
                    true
                }
            },

            AwarenessMessage::Selection { shape_ids } => match self.peers.get_mut(&peer_id) {
                Some(peer) => {
                    peer.touch();
                    let changed = peer.presence.selection != *shape_ids;
                    peer.presence.selection = shape_ids.clone();
                    changed
                }
                None => false,
            },

            AwarenessMessage::Active { is_active } => match self.peers.get_mut(&peer_id) {
                Some(peer) => {
                    peer.touch();
                    let changed = peer.presence.is_active != *is_active;
                    peer.presence.is_active = *is_active;
                    changed
                }
                None => false,
            },
        }
    }

    /// Replace the local user profile, keeping cursor and selection.
    pub fn set_local_user(&mut self, user: &UserInfo) -> AwarenessMessage {
        self.local.user_id = user.user_id.clone();
        self.local.name = user.name.clone();
        self.local.avatar = user.avatar.clone();
        self.join_message()
    }

    /// Update local cursor position and return a message if it should be broadcast.
    ///
    /// Returns `None` if throttled; the position is still recorded locally.
    pub fn update_local_cursor(&mut self, position: Point) -> Option<AwarenessMessage> {
        self.local.cursor = position;

        if let Some(last) = self.last_cursor_broadcast {
            if last.elapsed() < self.config.cursor_interval {
                log::trace!("cursor broadcast throttled");
                return None;
            }
        }
        Some(self.force_cursor_broadcast())
    }

    /// Force a cursor broadcast regardless of rate limiting.
    pub fn force_cursor_broadcast(&mut self) -> AwarenessMessage {
        self.timestamp_counter += 1;
        self.last_cursor_broadcast = Some(Instant::now());

        AwarenessMessage::Cursor {
            position: self.local.cursor,
            timestamp: self.timestamp_counter,
        }
    }

    pub fn update_local_selection(&mut self, shape_ids: Vec<String>) -> AwarenessMessage {
        self.local.selection = shape_ids.clone();
        AwarenessMessage::Selection { shape_ids }
    }

    pub fn set_local_active(&mut self, is_active: bool) -> AwarenessMessage {
        self.local.is_active = is_active;
        AwarenessMessage::Active { is_active }
    }

    /// Full local state, sent on join and after every reconnect.
    pub fn join_message(&self) -> AwarenessMessage {
        AwarenessMessage::Join(self.local.clone())
    }

    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave
    }

    /// Forget a peer that left the room. Returns whether it was known.
    pub fn remove_peer(&mut self, peer_id: &Uuid) -> bool {
        self.peers.remove(peer_id).is_some()
    }

    /// Drop every remote peer (transport lost).
    pub fn clear_peers(&mut self) -> bool {
        let had_peers = !self.peers.is_empty();
        self.peers.clear();
        had_peers
    }

    /// Remove peers that have been idle for longer than the timeout.
    pub fn cleanup_idle_peers(&mut self) -> Vec<Uuid> {
        let timeout = self.config.idle_timeout;
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_idle(timeout))
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    /// Active users: the local user first, then remote peers ordered by user id.
    pub fn users(&self) -> Vec<UserPresence> {
        let mut remote: Vec<&UserPresence> = self
            .peers
            .values()
            .map(|p| &p.presence)
            .filter(|p| p.is_active)
            .collect();
        remote.sort_by(|a, b| a.user_id.cmp(&b.user_id).then_with(|| a.name.cmp(&b.name)));

        std::iter::once(&self.local)
            .filter(|p| p.is_active)
            .chain(remote)
            .cloned()
            .collect()
    }

    /// Switch to a new session identity; remote state is kept.
    pub fn set_local_peer_id(&mut self, peer_id: Uuid) {
        self.local_peer_id = peer_id;
        self.timestamp_counter = 0;
        self.last_cursor_broadcast = None;
    }

    pub fn local_peer_id(&self) -> Uuid {
        self.local_peer_id
    }

    pub fn local(&self) -> &UserPresence {
        &self.local
    }

    pub fn peer(&self, peer_id: &Uuid) -> Option<&UserPresence> {
        self.peers.get(peer_id).map(|p| &p.presence)
    }

    /// Number of remote peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

// ───────────────────────────────────────────────────────────────────
// Tests
// ───────────────────────────────────────────────────────────────────
