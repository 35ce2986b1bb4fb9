//! Durable queue of mutations issued while disconnected.
//!
//! ```text
//! mutation (offline)
//!       │
//!       ▼
//! OfflineQueue::queue_change ──▶ QueueStorage::save(OFFLINE_QUEUE_KEY, json)
//!       │
//!       ▼ (reconnected)
//! sync_pending_changes ── timestamp order ──▶ ReplicatedDocument
//!       │
//!       └─ each success removed + persisted, failures stay queued
//! ```

pub mod queue;
pub mod storage;

pub use queue::{
    ChangeAction, EntityType, OfflineChange, OfflineQueue, Operation, QueueConfig, QueueState,
    OFFLINE_QUEUE_KEY,
};
pub use storage::{FileStorage, MemoryStorage, QueueStorage};
