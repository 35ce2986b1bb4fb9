use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_core::{Group, GroupPatch, ModelError, Shape, ShapePatch};

use super::storage::QueueStorage;
use crate::error::StorageError;
use crate::events::{Listeners, Subscription};

/// Storage key of the persisted queue. The value is a JSON array of
/// [`OfflineChange`].
pub const OFFLINE_QUEUE_KEY: &str = "tandem-offline-queue";

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of pending changes; the oldest are evicted beyond it.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

// ───────────────────────────────────────────────────────────────────
// Queued changes
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Shape,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Add,
    Update,
    Delete,
}

/// One mutation recorded while offline.
///
/// `data` holds the full object for `add`, the patch plus `id` for
/// `update`, and only `{"id": ...}` for `delete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineChange {
    pub id: String,
    #[serde(rename = "type")]
    pub entity: EntityType,
    pub operation: Operation,
    pub data: Value,
    /// Milliseconds since the Unix epoch; only used to order replay.
    pub timestamp: u64,
    pub user_id: String,
}

/// Typed form of a queued mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeAction {
    AddShape(Shape),
    UpdateShape { id: String, patch: ShapePatch },
    DeleteShape(String),
    AddGroup(Group),
    UpdateGroup { id: String, patch: GroupPatch },
    DeleteGroup(String),
}

impl ChangeAction {
    pub fn entity(&self) -> EntityType {
        match self {
            Self::AddShape(_) | Self::UpdateShape { .. } | Self::DeleteShape(_) => EntityType::Shape,
            Self::AddGroup(_) | Self::UpdateGroup { .. } | Self::DeleteGroup(_) => EntityType::Group,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Self::AddShape(_) | Self::AddGroup(_) => Operation::Add,
            Self::UpdateShape { .. } | Self::UpdateGroup { .. } => Operation::Update,
            Self::DeleteShape(_) | Self::DeleteGroup(_) => Operation::Delete,
        }
    }

    /// Id of the object the action targets.
    pub fn target_id(&self) -> &str {
        match self {
            Self::AddShape(shape) => &shape.id,
            Self::AddGroup(group) => &group.id,
            Self::UpdateShape { id, .. }
            | Self::UpdateGroup { id, .. }
            | Self::DeleteShape(id)
            | Self::DeleteGroup(id) => id,
        }
    }

    fn to_data(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::AddShape(shape) => serde_json::to_value(shape),
            Self::AddGroup(group) => serde_json::to_value(group),
            Self::UpdateShape { id, patch } => with_id(serde_json::to_value(patch)?, id),
            Self::UpdateGroup { id, patch } => with_id(serde_json::to_value(patch)?, id),
            Self::DeleteShape(id) | Self::DeleteGroup(id) => with_id(Value::Object(Default::default()), id),
        }
    }
}

fn with_id(value: Value, id: &str) -> Result<Value, serde_json::Error> {
    let mut object = match value {
        Value::Object(object) => object,
        _ => Default::default(),
    };
    object.insert("id".to_string(), Value::String(id.to_string()));
    Ok(Value::Object(object))
}

fn data_id(data: &Value) -> Result<String, ModelError> {
    match data.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => Err(ModelError::EmptyId),
    }
}

impl OfflineChange {
    pub fn new(
        id: impl Into<String>,
        action: &ChangeAction,
        user_id: impl Into<String>,
        timestamp: u64,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: id.into(),
            entity: action.entity(),
            operation: action.operation(),
            data: action.to_data()?,
            timestamp,
            user_id: user_id.into(),
        })
    }

    /// Decode `data` back into a typed action.
    pub fn decode(&self) -> Result<ChangeAction, ModelError> {
        let action = match (self.entity, self.operation) {
            (EntityType::Shape, Operation::Add) => {
                ChangeAction::AddShape(serde_json::from_value(self.data.clone())?)
            }
            (EntityType::Shape, Operation::Update) => ChangeAction::UpdateShape {
                id: data_id(&self.data)?,
                patch: serde_json::from_value(self.data.clone())?,
            },
            (EntityType::Shape, Operation::Delete) => ChangeAction::DeleteShape(data_id(&self.data)?),
            (EntityType::Group, Operation::Add) => {
                ChangeAction::AddGroup(serde_json::from_value(self.data.clone())?)
            }
            (EntityType::Group, Operation::Update) => ChangeAction::UpdateGroup {
                id: data_id(&self.data)?,
                patch: serde_json::from_value(self.data.clone())?,
            },
            (EntityType::Group, Operation::Delete) => ChangeAction::DeleteGroup(data_id(&self.data)?),
        };
        Ok(action)
    }
}

// ───────────────────────────────────────────────────────────────────
// Queue
// ───────────────────────────────────────────────────────────────────

/// Snapshot delivered to `on_state_change` listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueState {
    pub is_online: bool,
    pub pending: usize,
    pub is_syncing: bool,
}

struct QueueInner {
    changes: VecDeque<OfflineChange>,
    network_available: bool,
    forced_offline: bool,
    last_timestamp: u64,
}

/// Offline queue persisted to a [`QueueStorage`] after every change.
pub struct OfflineQueue {
    inner: Mutex<QueueInner>,
    storage: Box<dyn QueueStorage>,
    config: QueueConfig,
    syncing: AtomicBool,
    seq: AtomicU64,
    listeners: Listeners<QueueState>,
}

/// Clears the syncing flag however the sync pass ends.
struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl OfflineQueue {
    /// Open the queue, reloading whatever a previous process persisted.
    ///
    /// Unreadable stored data is logged and discarded.
    pub fn open(storage: impl QueueStorage + 'static, config: QueueConfig) -> Self {
        let mut changes: Vec<OfflineChange> = match storage.load(OFFLINE_QUEUE_KEY) {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                log::warn!("Discarding unreadable offline queue: {e}");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                log::error!("Failed to load offline queue: {e}");
                Vec::new()
            }
        };
        changes.sort_by_key(|c| c.timestamp);
        if changes.len() > config.capacity {
            let excess = changes.len() - config.capacity;
            changes.drain(..excess);
        }
        if !changes.is_empty() {
            log::info!("Restored {} offline changes", changes.len());
        }

        let last_timestamp = changes.last().map_or(0, |c| c.timestamp);
        Self {
            inner: Mutex::new(QueueInner {
                changes: changes.into(),
                network_available: false,
                forced_offline: false,
                last_timestamp,
            }),
            storage: Box::new(storage),
            config,
            syncing: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            listeners: Listeners::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, inner: &QueueInner) -> Result<(), StorageError> {
        let json = serde_json::to_string(&inner.changes)?;
        self.storage.save(OFFLINE_QUEUE_KEY, &json).map_err(|e| {
            log::error!("Failed to persist offline queue: {e}");
            e
        })
    }

    fn state_of(&self, inner: &QueueInner) -> QueueState {
        QueueState {
            is_online: inner.network_available && !inner.forced_offline,
            pending: inner.changes.len(),
            is_syncing: self.syncing.load(Ordering::SeqCst),
        }
    }

    fn notify(&self) {
        let state = self.state();
        self.listeners.emit(&state);
    }

    /// Stamp `action` with an id and a non-decreasing timestamp and queue it.
    pub fn record(&self, action: &ChangeAction, user_id: &str) -> Result<OfflineChange, StorageError> {
        let timestamp = {
            let mut inner = self.lock();
            inner.last_timestamp = inner.last_timestamp.max(now_millis());
            inner.last_timestamp
        };
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let change = OfflineChange::new(format!("{timestamp}-{seq}"), action, user_id, timestamp)?;
        self.queue_change(change.clone())?;
        Ok(change)
    }

    /// Append `change`, evicting the oldest entries beyond capacity, and
    /// persist the whole queue.
    pub fn queue_change(&self, change: OfflineChange) -> Result<(), StorageError> {
        let result = {
            let mut inner = self.lock();
            inner.last_timestamp = inner.last_timestamp.max(change.timestamp);
            inner.changes.push_back(change);
            while inner.changes.len() > self.config.capacity {
                let oldest = inner
                    .changes
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, c)| c.timestamp)
                    .map(|(i, _)| i);
                if let Some(evicted) = oldest.and_then(|i| inner.changes.remove(i)) {
                    log::warn!("Offline queue full, dropping change {}", evicted.id);
                }
            }
            self.persist(&inner)
        };
        self.notify();
        result
    }

    /// Replay every pending change in ascending timestamp order.
    ///
    /// Each change is removed (and the queue persisted) only after `apply`
    /// succeeds; a failure is logged and the pass continues. Returns whether
    /// every change applied and the emptied queue was saved. Returns `false`
    /// without doing anything when
    /// offline or when another pass is already running.
    pub fn sync_pending_changes<F, E>(&self, mut apply: F) -> bool
    where
        F: FnMut(&OfflineChange) -> Result<(), E>,
        E: Display,
    {
        if !self.is_online() {
            log::debug!("Skipping offline replay: not online");
            return false;
        }
        if self.syncing.swap(true, Ordering::SeqCst) {
            log::debug!("Offline replay already running");
            return false;
        }
        let _guard = SyncGuard(&self.syncing);
        self.notify();

        let mut pending: Vec<OfflineChange> = self.lock().changes.iter().cloned().collect();
        pending.sort_by_key(|c| c.timestamp);

        let total = pending.len();
        let mut applied = 0usize;
        let mut saved = true;
        for change in &pending {
            match apply(change) {
                Ok(()) => {
                    applied += 1;
                    let mut inner = self.lock();
                    inner.changes.retain(|c| c.id != change.id);
                    // persist() already logged the error. The stored queue still
                    // lists this change until a later save succeeds.
                    if let Err(e) = self.persist(&inner) {
                        log::debug!("Replayed change {} is still stored: {e}", change.id);
                        saved = false;
                    }
                }
                Err(e) => log::warn!("Failed to replay offline change {}: {e}", change.id),
            }
        }
        log::info!("Replayed {applied}/{total} offline changes");

        drop(_guard);
        self.notify();
        applied == total && saved
    }

    /// Pending changes in replay order.
    pub fn pending_changes(&self) -> Vec<OfflineChange> {
        let mut changes: Vec<OfflineChange> = self.lock().changes.iter().cloned().collect();
        changes.sort_by_key(|c| c.timestamp);
        changes
    }

    /// Drop a single change without replaying it.
    pub fn remove(&self, change_id: &str) -> Result<bool, StorageError> {
        let (removed, result) = {
            let mut inner = self.lock();
            let before = inner.changes.len();
            inner.changes.retain(|c| c.id != change_id);
            let removed = inner.changes.len() != before;
            (removed, if removed { self.persist(&inner) } else { Ok(()) })
        };
        if removed {
            self.notify();
        }
        result.map(|_| removed)
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        let result = {
            let mut inner = self.lock();
            inner.changes.clear();
            self.persist(&inner)
        };
        self.notify();
        result
    }

    pub fn len(&self) -> usize {
        self.lock().changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().changes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Force offline (`true`) or release the override (`false`).
    pub fn set_offline_mode(&self, offline: bool) {
        let changed = {
            let mut inner = self.lock();
            let changed = inner.forced_offline != offline;
            inner.forced_offline = offline;
            changed
        };
        if changed {
            log::info!("Offline mode {}", if offline { "enabled" } else { "disabled" });
            self.notify();
        }
    }

    /// Platform connectivity signal.
    pub fn set_network_available(&self, available: bool) {
        let changed = {
            let mut inner = self.lock();
            let changed = inner.network_available != available;
            inner.network_available = available;
            changed
        };
        if changed {
            self.notify();
        }
    }

    pub fn is_offline_mode(&self) -> bool {
        self.lock().forced_offline
    }

    pub fn is_online(&self) -> bool {
        let inner = self.lock();
        inner.network_available && !inner.forced_offline
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> QueueState {
        let inner = self.lock();
        self.state_of(&inner)
    }

    pub fn on_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&QueueState) + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }
}
