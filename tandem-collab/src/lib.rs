//! # tandem-collab: Real-time collaboration layer for Tandem
//!
//! Keeps a shared diagram consistent across concurrently connected
//! clients, survives network loss, and gives each session its own undo.
//!
//! ## Architecture
//!
//! ```text
//!            caller
//!              │ add_shape / undo / broadcast_cursor ...
//!              ▼
//! ┌──────────────────────────┐      online      ┌────────────────────┐
//! │ SyncOrchestrator         │ ───────────────► │ ReplicatedDocument │
//! │ (per session)            │                  │ yrs Doc + undo     │
//! └──┬────────────┬──────────┘                  │ + PresenceRoom     │
//!    │ offline    │ events                      └────────────────────┘
//!    ▼            │
//! ┌─────────────┐ │  ┌───────────────────┐  loss   ┌─────────────────────┐
//! │OfflineQueue │ └──│ ConnectionManager │ ◄────── │ ReconnectionManager │
//! │ (durable)   │    └─────────┬─────────┘ connect └─────────────────────┘
//! └─────────────┘              │ WebSocket, binary protocol
//!                              ▼
//!                     ┌─────────────────┐
//!                     │ SyncServer      │ rooms: yrs Doc + BroadcastGroup
//!                     │ GET /status     │
//!                     └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`document`]: Replicated document, per-session undo, change listeners
//! - [`presence`]: Cursors, selections and activity of room members
//! - [`connection`]: One WebSocket transport per room, four-state status
//! - [`reconnect`]: Exponential backoff supervisor
//! - [`offline`]: Durable queue of changes made while disconnected
//! - [`orchestrator`]: The caller-facing seam wiring everything together
//! - [`broadcast`], [`room`], [`server`]: The relay
//! - [`events`]: Listener registry with unsubscribe handles

pub mod broadcast;
pub mod connection;
pub mod document;
pub mod error;
pub mod events;
pub mod offline;
pub mod orchestrator;
pub mod presence;
pub mod protocol;
pub mod reconnect;
pub mod room;
pub mod server;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState, ConnectionStatus, TransportEvent};
pub use document::{ReplicatedDocument, UndoRedoState};
pub use error::{DocumentError, StorageError, SyncError};
pub use events::{Listeners, Subscription};
pub use offline::{
    ChangeAction, FileStorage, MemoryStorage, OfflineChange, OfflineQueue, QueueConfig, QueueState,
    QueueStorage, OFFLINE_QUEUE_KEY,
};
pub use orchestrator::{SessionConfig, SyncOrchestrator};
pub use presence::{AwarenessMessage, PresenceConfig, PresenceRoom, UserInfo, UserPresence};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use reconnect::{ReconnectConfig, ReconnectPhase, ReconnectionManager, RetryEvent};
pub use room::{DocumentRoom, RoomRegistry};
pub use server::{ServerConfig, ServerStatus, SyncServer};
