//! Replicated document: shapes and groups in a `yrs` doc, per-session undo,
//! and ephemeral presence.
//!
//! ```text
//!            ┌───────────── transactions tagged with an origin ─────────────┐
//!            │                                                               │
//!  session:{peer}  ── tracked by UndoManager ──┐                             │
//!  local-untracked (offline replay) ───────────┼──▶ yrs Doc {shapes, groups} │
//!  remote (updates from peers) ────────────────┘           │                 │
//!            └─────────────────────────────────────────────┼─────────────────┘
//!                                                          ▼
//!                                   materialize ─▶ on_shapes_change / on_groups_change
//! ```
//!
//! Every mutation returns the encoded update (a diff against the state before
//! the mutation) for the caller to transmit. Listeners fire only when the
//! materialized value actually changed.

use tandem_core::entries::{
    read_group, read_groups, read_shape, read_shapes, remove_entity, write_group,
    write_group_patch, write_group_ref, write_shape, write_shape_patch, GROUPS_MAP, SHAPES_MAP,
};
use tandem_core::model::validate_id;
use tandem_core::{Group, GroupPatch, ModelError, Point, Rect, Shape, ShapePatch};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, MapRef, Options, ReadTxn, StateVector, Transact, TransactionMut, UndoManager, Update};

use crate::error::DocumentError;
use crate::events::{Listeners, Subscription};
use crate::presence::{AwarenessMessage, PresenceConfig, PresenceRoom, UserInfo, UserPresence};

/// Origin of updates received from peers.
pub const REMOTE_ORIGIN: &str = "remote";
/// Origin of local writes that must not be undoable (offline replay).
pub const UNTRACKED_ORIGIN: &str = "local-untracked";

/// Origin tag of the session identified by `peer_id`.
pub fn session_origin(peer_id: Uuid) -> String {
    format!("session:{peer_id}")
}

/// Availability of undo and redo, reported after every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UndoRedoState {
    pub can_undo: bool,
    pub can_redo: bool,
}

#[derive(Clone)]
struct Maps {
    shapes: MapRef,
    groups: MapRef,
}

pub struct ReplicatedDocument {
    doc: Doc,
    maps: Maps,
    undo: UndoManager,
    origin: String,
    presence: PresenceRoom,

    shapes: Vec<Shape>,
    groups: Vec<Group>,
    stack: UndoRedoState,
    users: Vec<UserPresence>,

    shape_listeners: Listeners<Vec<Shape>>,
    group_listeners: Listeners<Vec<Group>>,
    stack_listeners: Listeners<UndoRedoState>,
    presence_listeners: Listeners<Vec<UserPresence>>,
}

impl ReplicatedDocument {
    pub fn new(peer_id: Uuid, user: &UserInfo, presence: PresenceConfig) -> Self {
        // Undo needs deleted items to stay around for redo.
        let doc = Doc::with_options(Options {
            skip_gc: true,
            ..Options::default()
        });
        let maps = Maps {
            shapes: doc.get_or_insert_map(SHAPES_MAP),
            groups: doc.get_or_insert_map(GROUPS_MAP),
        };
        let origin = session_origin(peer_id);
        let undo = undo_manager(&doc, &maps, &origin);
        let presence = PresenceRoom::new(peer_id, user, presence);
        let users = presence.users();

        Self {
            doc,
            maps,
            undo,
            origin,
            presence,
            shapes: Vec::new(),
            groups: Vec::new(),
            stack: UndoRedoState::default(),
            users,
            shape_listeners: Listeners::new(),
            group_listeners: Listeners::new(),
            stack_listeners: Listeners::new(),
            presence_listeners: Listeners::new(),
        }
    }

    // ─── Mutations ───────────────────────────────────────────────

    /// Add (or overwrite) a shape without undo tracking. Returns the
    /// encoded update to transmit.
    pub fn add_shape(&mut self, shape: Shape) -> Result<Vec<u8>, DocumentError> {
        self.write_shape_add(false, shape)
    }

    /// Add a shape as one undo step of this session.
    pub fn add_shape_with_undo(&mut self, shape: Shape) -> Result<Vec<u8>, DocumentError> {
        self.write_shape_add(true, shape)
    }

    /// Write the fields named in `patch`. Fails when the shape is absent.
    pub fn update_shape(&mut self, id: &str, patch: ShapePatch) -> Result<Vec<u8>, DocumentError> {
        self.write_shape_update(false, id, patch)
    }

    /// [`update_shape`](Self::update_shape) as one undo step.
    pub fn update_shape_with_undo(&mut self, id: &str, patch: ShapePatch) -> Result<Vec<u8>, DocumentError> {
        self.write_shape_update(true, id, patch)
    }

    /// Deleting an id that does not exist is a no-op.
    pub fn delete_shape(&mut self, id: &str) -> Result<Vec<u8>, DocumentError> {
        self.write_shape_delete(false, id)
    }

    /// [`delete_shape`](Self::delete_shape) as one undo step.
    pub fn delete_shape_with_undo(&mut self, id: &str) -> Result<Vec<u8>, DocumentError> {
        self.write_shape_delete(true, id)
    }

    /// Add a group and set `groupId` on its existing member shapes.
    /// Fails when none of the members exist.
    pub fn add_group(&mut self, group: Group) -> Result<Vec<u8>, DocumentError> {
        self.write_group_add(false, group)
    }

    /// [`add_group`](Self::add_group) as one undo step.
    pub fn add_group_with_undo(&mut self, group: Group) -> Result<Vec<u8>, DocumentError> {
        self.write_group_add(true, group)
    }

    /// Write the fields named in `patch`; membership changes move
    /// `groupId` on the shapes involved.
    pub fn update_group(&mut self, id: &str, patch: GroupPatch) -> Result<Vec<u8>, DocumentError> {
        self.write_group_update(false, id, patch)
    }

    /// [`update_group`](Self::update_group) as one undo step.
    pub fn update_group_with_undo(&mut self, id: &str, patch: GroupPatch) -> Result<Vec<u8>, DocumentError> {
        self.write_group_update(true, id, patch)
    }

    /// Delete a group and clear `groupId` on its members. Deleting an
    /// absent id is a no-op.
    pub fn delete_group(&mut self, id: &str) -> Result<Vec<u8>, DocumentError> {
        self.write_group_delete(false, id)
    }

    /// [`delete_group`](Self::delete_group) as one undo step.
    pub fn delete_group_with_undo(&mut self, id: &str) -> Result<Vec<u8>, DocumentError> {
        self.write_group_delete(true, id)
    }

    fn write_shape_add(&mut self, tracked: bool, shape: Shape) -> Result<Vec<u8>, DocumentError> {
        shape.validate()?;
        let shape = shape.sanitized();
        self.mutate(tracked, |maps, txn| {
            add_shape_in(maps, txn, shape);
            Ok(())
        })
    }

    fn write_shape_update(&mut self, tracked: bool, id: &str, patch: ShapePatch) -> Result<Vec<u8>, DocumentError> {
        validate_id(id)?;
        patch.validate()?;
        let patch = patch.sanitized();
        self.mutate(tracked, |maps, txn| update_shape_in(maps, txn, id, &patch))
    }

    fn write_shape_delete(&mut self, tracked: bool, id: &str) -> Result<Vec<u8>, DocumentError> {
        validate_id(id)?;
        self.mutate(tracked, |maps, txn| {
            delete_shape_in(maps, txn, id);
            Ok(())
        })
    }

    fn write_group_add(&mut self, tracked: bool, group: Group) -> Result<Vec<u8>, DocumentError> {
        group.validate()?;
        let group = group.sanitized();
        self.mutate(tracked, |maps, txn| add_group_in(maps, txn, group))
    }

    fn write_group_update(&mut self, tracked: bool, id: &str, patch: GroupPatch) -> Result<Vec<u8>, DocumentError> {
        validate_id(id)?;
        patch.validate(id)?;
        let patch = patch.sanitized();
        self.mutate(tracked, |maps, txn| update_group_in(maps, txn, id, patch))
    }

    fn write_group_delete(&mut self, tracked: bool, id: &str) -> Result<Vec<u8>, DocumentError> {
        validate_id(id)?;
        self.mutate(tracked, |maps, txn| {
            delete_group_in(maps, txn, id);
            Ok(())
        })
    }

    /// Run `f` in one transaction and return the resulting update.
    fn mutate<F>(&mut self, tracked: bool, f: F) -> Result<Vec<u8>, DocumentError>
    where
        F: FnOnce(&Maps, &mut TransactionMut) -> Result<(), DocumentError>,
    {
        let before = self.doc.transact().state_vector();
        {
            let origin = if tracked { self.origin.as_str() } else { UNTRACKED_ORIGIN };
            let mut txn = self.doc.transact_mut_with(origin);
            f(&self.maps, &mut txn)?;
        }
        if tracked {
            // Next tracked mutation becomes its own undo step.
            self.undo.reset();
        }
        let update = self.doc.transact().encode_diff_v1(&before);
        self.refresh();
        Ok(update)
    }

    // ─── Sync ────────────────────────────────────────────────────

    /// Merge an update received from a peer. Never recorded for undo.
    pub fn apply_remote_update(&mut self, update: &[u8]) -> Result<(), DocumentError> {
        let update = Update::decode_v1(update).map_err(|e| DocumentError::InvalidUpdate(e.to_string()))?;
        {
            let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
            txn.apply_update(update)
                .map_err(|e| DocumentError::InvalidUpdate(e.to_string()))?;
        }
        self.refresh();
        Ok(())
    }

    /// Encoded state vector, sent as `SyncStep1`.
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything the holder of `state_vector` is missing, sent as `SyncStep2`.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| DocumentError::InvalidUpdate(e.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    /// Full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    // ─── Undo / redo ─────────────────────────────────────────────

    /// Revert the latest local-session change. Returns the update to
    /// transmit, or `None` when there was nothing to undo.
    pub fn undo(&mut self) -> Option<Vec<u8>> {
        let before = self.doc.transact().state_vector();
        if !self.undo.undo_blocking() {
            return None;
        }
        let update = self.doc.transact().encode_diff_v1(&before);
        self.refresh();
        Some(update)
    }

    /// Reapply the latest undone change. Returns the update to transmit.
    pub fn redo(&mut self) -> Option<Vec<u8>> {
        let before = self.doc.transact().state_vector();
        if !self.undo.redo_blocking() {
            return None;
        }
        let update = self.doc.transact().encode_diff_v1(&before);
        self.refresh();
        Some(update)
    }

    /// Whether this session has a change to undo.
    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    /// Whether an undone change can be reapplied.
    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }

    /// Drop the undo and redo stacks of the current session.
    pub fn reset_undo_history(&mut self) {
        self.undo = undo_manager(&self.doc, &self.maps, &self.origin);
        self.refresh();
    }

    /// Switch to a new session identity. Undo history of the previous
    /// identity is discarded.
    pub fn start_session(&mut self, peer_id: Uuid) {
        self.origin = session_origin(peer_id);
        self.presence.set_local_peer_id(peer_id);
        self.reset_undo_history();
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    // ─── Presence ────────────────────────────────────────────────

    pub fn set_local_user(&mut self, user: &UserInfo) -> AwarenessMessage {
        let msg = self.presence.set_local_user(user);
        self.refresh_presence();
        msg
    }

    /// `None` when the broadcast was rate-limited.
    pub fn broadcast_cursor(&mut self, position: Point) -> Option<AwarenessMessage> {
        let msg = self.presence.update_local_cursor(position);
        self.refresh_presence();
        msg
    }

    pub fn broadcast_selection(&mut self, shape_ids: Vec<String>) -> AwarenessMessage {
        let msg = self.presence.update_local_selection(shape_ids);
        self.refresh_presence();
        msg
    }

    pub fn set_user_active(&mut self, is_active: bool) -> AwarenessMessage {
        let msg = self.presence.set_local_active(is_active);
        self.refresh_presence();
        msg
    }

    pub fn presence_join_message(&self) -> AwarenessMessage {
        self.presence.join_message()
    }

    pub fn presence_leave_message(&self) -> AwarenessMessage {
        self.presence.leave_message()
    }

    pub fn apply_awareness(&mut self, peer_id: Uuid, msg: &AwarenessMessage) {
        if self.presence.handle_message(peer_id, msg) {
            self.refresh_presence();
        }
    }

    pub fn remove_peer_presence(&mut self, peer_id: &Uuid) {
        if self.presence.remove_peer(peer_id) {
            self.refresh_presence();
        }
    }

    pub fn clear_remote_presence(&mut self) {
        if self.presence.clear_peers() {
            self.refresh_presence();
        }
    }

    pub fn cleanup_idle_presence(&mut self) -> Vec<Uuid> {
        let stale = self.presence.cleanup_idle_peers();
        if !stale.is_empty() {
            self.refresh_presence();
        }
        stale
    }

    /// Active users, local first.
    pub fn presence(&self) -> &[UserPresence] {
        &self.users
    }

    // ─── Materialized state ──────────────────────────────────────

    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn shape(&self, id: &str) -> Option<&Shape> {
        self.shapes.iter().find(|s| s.id == id)
    }

    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    // ─── Listeners ───────────────────────────────────────────────

    pub fn on_shapes_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Vec<Shape>) + Send + Sync + 'static,
    {
        self.shape_listeners.subscribe(callback)
    }

    pub fn on_groups_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Vec<Group>) + Send + Sync + 'static,
    {
        self.group_listeners.subscribe(callback)
    }

    pub fn on_undo_redo_stack_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&UndoRedoState) + Send + Sync + 'static,
    {
        self.stack_listeners.subscribe(callback)
    }

    pub fn on_presence_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Vec<UserPresence>) + Send + Sync + 'static,
    {
        self.presence_listeners.subscribe(callback)
    }

    /// Re-materialize and notify listeners whose value changed.
    fn refresh(&mut self) {
        let (shapes, groups) = {
            let txn = self.doc.transact();
            (
                read_shapes(&self.maps.shapes, &txn),
                read_groups(&self.maps.groups, &txn),
            )
        };
        if shapes != self.shapes {
            self.shapes = shapes;
            self.shape_listeners.emit(&self.shapes);
        }
        if groups != self.groups {
            self.groups = groups;
            self.group_listeners.emit(&self.groups);
        }

        let stack = UndoRedoState {
            can_undo: self.undo.can_undo(),
            can_redo: self.undo.can_redo(),
        };
        if stack != self.stack {
            self.stack = stack;
            self.stack_listeners.emit(&self.stack);
        }
    }

    fn refresh_presence(&mut self) {
        let users = self.presence.users();
        if users != self.users {
            self.users = users;
            self.presence_listeners.emit(&self.users);
        }
    }
}

fn undo_manager(doc: &Doc, maps: &Maps, origin: &str) -> UndoManager {
    let mut undo = UndoManager::new(doc, &maps.shapes);
    undo.expand_scope(&maps.groups);
    undo.include_origin(origin);
    undo
}

// ───────────────────────────────────────────────────────────────────
// Transaction bodies
//
// Groups and shapes reference each other: `Shape::group_id` must name a
// group whose `shape_ids` contains the shape. These helpers keep both
// sides in the same transaction.
// ───────────────────────────────────────────────────────────────────

fn member_bounds(maps: &Maps, txn: &TransactionMut, ids: &[String]) -> Option<Rect> {
    ids.iter()
        .filter_map(|id| read_shape(&maps.shapes, txn, id))
        .map(|s| s.bounds())
        .reduce(|acc, r| acc.union(&r))
}

fn shape_exists(maps: &Maps, txn: &TransactionMut, id: &str) -> bool {
    read_shape(&maps.shapes, txn, id).is_some()
}

/// Remove `shape_id` from `group_id`; a group left without members is removed.
fn detach(maps: &Maps, txn: &mut TransactionMut, shape_id: &str, group_id: &str) {
    let Some(group) = read_group(&maps.groups, &*txn, group_id) else {
        return;
    };
    let remaining: Vec<String> = group.shape_ids.into_iter().filter(|id| id != shape_id).collect();
    if remaining.is_empty() {
        log::debug!("Group {group_id} lost its last member, removing it");
        remove_entity(&maps.groups, txn, group_id);
    } else {
        let bounds = member_bounds(maps, &*txn, &remaining);
        let patch = GroupPatch {
            shape_ids: Some(remaining),
            bounds,
            locked: None,
        };
        write_group_patch(&maps.groups, txn, group_id, &patch);
    }
}

/// Add `shape_id` to `group_id` and refresh its bounds.
fn add_member(maps: &Maps, txn: &mut TransactionMut, group_id: &str, shape_id: &str) {
    let Some(group) = read_group(&maps.groups, &*txn, group_id) else {
        return;
    };
    let mut ids = group.shape_ids;
    if !ids.iter().any(|id| id == shape_id) {
        ids.push(shape_id.to_string());
    }
    let bounds = member_bounds(maps, &*txn, &ids);
    let patch = GroupPatch {
        shape_ids: Some(ids),
        bounds,
        locked: None,
    };
    write_group_patch(&maps.groups, txn, group_id, &patch);
}

/// Point the shape at `group_id`, leaving any previous group.
fn attach(maps: &Maps, txn: &mut TransactionMut, shape_id: &str, group_id: &str) {
    let previous = read_shape(&maps.shapes, &*txn, shape_id).and_then(|s| s.group_id);
    if let Some(previous) = previous.as_deref() {
        if previous == group_id {
            return;
        }
        detach(maps, txn, shape_id, previous);
    }
    write_group_ref(&maps.shapes, txn, shape_id, Some(group_id));
}

fn add_shape_in(maps: &Maps, txn: &mut TransactionMut, mut shape: Shape) {
    let previous = read_shape(&maps.shapes, &*txn, &shape.id).and_then(|s| s.group_id);
    if let Some(group_id) = shape.group_id.as_deref() {
        if read_group(&maps.groups, &*txn, group_id).is_none() {
            log::warn!("Shape {} references missing group {group_id}, dropping the reference", shape.id);
            shape.group_id = None;
        }
    }
    if let Some(previous) = previous.as_deref() {
        if shape.group_id.as_deref() != Some(previous) {
            detach(maps, txn, &shape.id, previous);
        }
    }
    write_shape(&maps.shapes, txn, &shape);
    if let Some(group_id) = shape.group_id.as_deref() {
        add_member(maps, txn, group_id, &shape.id);
    }
}

fn update_shape_in(maps: &Maps, txn: &mut TransactionMut, id: &str, patch: &ShapePatch) -> Result<(), DocumentError> {
    let current = read_shape(&maps.shapes, &*txn, id)
        .ok_or_else(|| DocumentError::ShapeNotFound(id.to_string()))?;
    if let Some(Some(group_id)) = &patch.group_id {
        if read_group(&maps.groups, &*txn, group_id).is_none() {
            return Err(DocumentError::GroupNotFound(group_id.clone()));
        }
    }

    let next_group = match &patch.group_id {
        Some(group_id) => group_id.clone(),
        None => current.group_id.clone(),
    };
    if let Some(previous) = current.group_id.as_deref() {
        if next_group.as_deref() != Some(previous) {
            detach(maps, txn, id, previous);
        }
    }
    write_shape_patch(&maps.shapes, txn, id, patch);
    if let Some(group_id) = next_group.as_deref() {
        add_member(maps, txn, group_id, id);
    }
    Ok(())
}

fn delete_shape_in(maps: &Maps, txn: &mut TransactionMut, id: &str) {
    let group_id = read_shape(&maps.shapes, &*txn, id).and_then(|s| s.group_id);
    remove_entity(&maps.shapes, txn, id);
    if let Some(group_id) = group_id {
        detach(maps, txn, id, &group_id);
    }
}

fn add_group_in(maps: &Maps, txn: &mut TransactionMut, group: Group) -> Result<(), DocumentError> {
    let members: Vec<String> = group
        .shape_ids
        .iter()
        .filter(|id| shape_exists(maps, &*txn, id))
        .cloned()
        .collect();
    if members.is_empty() {
        return Err(ModelError::EmptyGroup(group.id.clone()).into());
    }

    if let Some(existing) = read_group(&maps.groups, &*txn, &group.id) {
        for released in existing.shape_ids.iter().filter(|id| !members.contains(id)) {
            write_group_ref(&maps.shapes, txn, released, None);
        }
    }
    for id in &members {
        attach(maps, txn, id, &group.id);
    }

    let bounds = member_bounds(maps, &*txn, &members).unwrap_or(group.bounds);
    let group = Group {
        shape_ids: members,
        bounds,
        ..group
    };
    write_group(&maps.groups, txn, &group);
    Ok(())
}

fn update_group_in(maps: &Maps, txn: &mut TransactionMut, id: &str, mut patch: GroupPatch) -> Result<(), DocumentError> {
    let current = read_group(&maps.groups, &*txn, id)
        .ok_or_else(|| DocumentError::GroupNotFound(id.to_string()))?;

    if let Some(ids) = patch.shape_ids.take() {
        let members: Vec<String> = ids.into_iter().filter(|sid| shape_exists(maps, &*txn, sid)).collect();
        if members.is_empty() {
            return Err(ModelError::EmptyGroup(id.to_string()).into());
        }
        for released in current.shape_ids.iter().filter(|sid| !members.contains(sid)) {
            write_group_ref(&maps.shapes, txn, released, None);
        }
        for sid in &members {
            attach(maps, txn, sid, id);
        }
        if patch.bounds.is_none() {
            patch.bounds = member_bounds(maps, &*txn, &members);
        }
        patch.shape_ids = Some(members);
    }
    write_group_patch(&maps.groups, txn, id, &patch);
    Ok(())
}

fn delete_group_in(maps: &Maps, txn: &mut TransactionMut, id: &str) {
    if let Some(group) = read_group(&maps.groups, &*txn, id) {
        for shape_id in &group.shape_ids {
            let member_of = read_shape(&maps.shapes, &*txn, shape_id).and_then(|s| s.group_id);
            if member_of.as_deref() == Some(id) {
                write_group_ref(&maps.shapes, txn, shape_id, None);
            }
        }
    }
    remove_entity(&maps.groups, txn, id);
}
