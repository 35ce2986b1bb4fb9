//! The single entry point for callers: routes mutations, drives the
//! handshake, replay and reconnection from transport events.
//!
//! ```text
//!  add_shape / update_group / ...
//!        │
//!        ├── online ──▶ ReplicatedDocument (*_with_undo) ──▶ ConnectionManager::send_update
//!        └── offline ─▶ OfflineQueue::record (persisted, no local echo)
//!
//!  TransportEvent ──▶ handle_event
//!        ├── Connected     ─▶ SyncStep1 + presence join
//!        ├── lost          ─▶ ReconnectionManager::start (unless disconnect() was called)
//!        ├── RemoteUpdate  ─▶ apply_remote_update
//!        ├── StateSynced   ─▶ apply_remote_update + queue replay
//!        └── SyncRequest   ─▶ diff_since ─▶ SyncStep2 (handshake complete)
//! ```
//!
//! Queued changes are replayed only once the relay's state has been
//! applied. Until then a queued delete of an object the relay holds would
//! find nothing to delete locally and be lost.
//!
//! The orchestrator has a single owner. Events are only handled while the
//! owner calls [`SyncOrchestrator::process_pending`],
//! [`SyncOrchestrator::next_event`] or [`SyncOrchestrator::run_until`];
//! every callback therefore runs on the owner's task.

use std::time::Duration;

use tandem_core::model::validate_id;
use tandem_core::{Group, GroupPatch, Point, Shape, ShapePatch};
use tokio::sync::mpsc;

use crate::connection::{ConnectionConfig, ConnectionManager, ConnectionState, ConnectionStatus, TransportEvent};
use crate::document::{ReplicatedDocument, UndoRedoState};
use crate::error::{DocumentError, SyncError};
use crate::events::{Listeners, Subscription};
use crate::offline::{ChangeAction, OfflineChange, OfflineQueue, QueueConfig, QueueState, QueueStorage};
use crate::presence::{AwarenessMessage, PresenceConfig, UserInfo, UserPresence};
use crate::protocol::PeerInfo;
use crate::reconnect::{ReconnectConfig, ReconnectionManager, RetryEvent};

/// Everything needed to join one room as one user.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: String,
    pub room: String,
    pub user: UserInfo,
    pub queue: QueueConfig,
    pub reconnect: ReconnectConfig,
    pub presence: PresenceConfig,
    pub heartbeat_interval: Option<Duration>,
}

impl SessionConfig {
    pub fn new(endpoint: impl Into<String>, room: impl Into<String>, user: UserInfo) -> Self {
        Self {
            endpoint: endpoint.into(),
            room: room.into(),
            user,
            queue: QueueConfig::default(),
            reconnect: ReconnectConfig::default(),
            presence: PresenceConfig::default(),
            heartbeat_interval: Some(Duration::from_secs(15)),
        }
    }
}

/// Progress of the handshake on the current transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    /// Not connected, or waiting for the relay's `SyncStep2`.
    Pending,
    /// Relay state applied; its `SyncStep1` not answered yet.
    StateApplied,
    Complete,
}

pub struct SyncOrchestrator {
    config: SessionConfig,
    document: ReplicatedDocument,
    queue: OfflineQueue,
    connection: ConnectionManager,
    reconnection: ReconnectionManager,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    connection_state: ConnectionState,
    handshake: Handshake,
    state_listeners: Listeners<ConnectionState>,
    /// Set by `disconnect()`; suppresses automatic reconnection.
    user_disconnected: bool,
    /// Feed reconnection notices into the event stream.
    forwarders: Vec<Subscription>,
}

impl SyncOrchestrator {
    /// Build every component for `config`. The queue is reloaded from
    /// `storage`; nothing connects until [`connect`](Self::connect).
    pub fn new(config: SessionConfig, storage: impl QueueStorage + 'static) -> Self {
        let peer = PeerInfo::new(config.user.user_id.clone(), config.user.name.clone());
        let mut connection_config = ConnectionConfig::new(&config.endpoint, &config.room, peer.clone());
        connection_config.heartbeat_interval = config.heartbeat_interval;
        connection_config.connect_timeout = config.reconnect.attempt_timeout;

        let (connection, events) = ConnectionManager::new(connection_config);
        let document = ReplicatedDocument::new(peer.peer_id, &config.user, config.presence.clone());
        let queue = OfflineQueue::open(storage, config.queue.clone());
        let reconnection = ReconnectionManager::new(config.reconnect.clone());

        let retry_tx = connection.event_sender();
        let exhausted_tx = connection.event_sender();
        let forwarders = vec![
            reconnection.on_retry(move |event| {
                let _ = retry_tx.send(TransportEvent::RetryScheduled(*event));
            }),
            reconnection.on_exhausted(move |failures| {
                let _ = exhausted_tx.send(TransportEvent::RetriesExhausted(*failures));
            }),
        ];

        Self {
            config,
            document,
            queue,
            connection,
            reconnection,
            events,
            connection_state: ConnectionState::default(),
            handshake: Handshake::Pending,
            state_listeners: Listeners::new(),
            user_disconnected: false,
            forwarders,
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────

    /// Open the room transport and run the handshake: our state vector
    /// out, the relay's diff applied (which replays the offline queue),
    /// the relay's state vector answered.
    ///
    /// Returns once the handshake is done, the transport drops, or the
    /// attempt timeout passes. A connect failure is returned and also hands
    /// the connection to the reconnection supervisor.
    pub async fn connect(&mut self) -> Result<(), SyncError> {
        self.user_disconnected = false;
        let result = self.connection.connect().await;
        if let Err(e) = &result {
            log::warn!("Connecting to room {:?} failed: {e}", self.config.room);
        }
        self.process_pending();

        if result.is_ok() {
            let timeout = self.config.reconnect.attempt_timeout;
            let settled = self
                .run_until(timeout, |s| {
                    s.handshake == Handshake::Complete || !s.connection_state.is_connected()
                })
                .await;
            if !settled {
                log::warn!("Relay did not finish the handshake within {timeout:?}");
            }
        }
        result
    }

    /// Stop reconnecting and release the transport.
    pub fn disconnect(&mut self) {
        self.user_disconnected = true;
        let leave = self.document.presence_leave_message();
        self.send_presence(&leave);
        self.reconnection.stop();
        self.connection.stop_all_connections();
        self.process_pending();
    }

    /// Resume automatic reconnection, e.g. after retries were exhausted.
    /// Returns whether a supervisor was started.
    pub fn reconnect(&mut self) -> bool {
        self.user_disconnected = false;
        if self.connection.is_connected() {
            return false;
        }
        let connection = self.connection.clone();
        self.reconnection.reconnect(move || {
            let connection = connection.clone();
            async move { connection.connect().await }
        })
    }

    /// Reconnect under a fresh peer identity. Undo history of the previous
    /// identity is discarded.
    pub async fn new_session(&mut self) -> Result<(), SyncError> {
        self.user_disconnected = true;
        self.reconnection.stop();
        self.connection.stop_all_connections();
        self.process_pending();

        let peer = self.connection.renew_identity();
        self.document.start_session(peer.peer_id);
        log::info!("Started session {} for user {}", peer.peer_id, peer.user_id);
        self.connect().await
    }

    fn start_reconnection(&self) -> bool {
        let connection = self.connection.clone();
        self.reconnection.start(move || {
            let connection = connection.clone();
            async move { connection.connect().await }
        })
    }

    // ─── Mutations ───────────────────────────────────────────────
    //
    // Input is validated and sanitized first; an invalid object is an
    // error and nothing is queued or applied. Transport state never
    // makes a mutation fail.

    /// Add a shape, undoable when applied online.
    pub fn add_shape(&mut self, shape: Shape) -> Result<(), SyncError> {
        shape.validate()?;
        self.route(ChangeAction::AddShape(shape.sanitized()))
    }

    /// Change the fields named in `patch`.
    pub fn update_shape(&mut self, id: &str, patch: ShapePatch) -> Result<(), SyncError> {
        validate_id(id)?;
        patch.validate()?;
        self.route(ChangeAction::UpdateShape {
            id: id.to_string(),
            patch: patch.sanitized(),
        })
    }

    /// Delete a shape. Deleting an absent id is a no-op.
    pub fn delete_shape(&mut self, id: &str) -> Result<(), SyncError> {
        validate_id(id)?;
        self.route(ChangeAction::DeleteShape(id.to_string()))
    }

    /// Add a group; its member shapes get `groupId` set.
    pub fn add_group(&mut self, group: Group) -> Result<(), SyncError> {
        group.validate()?;
        self.route(ChangeAction::AddGroup(group.sanitized()))
    }

    /// Change the fields named in `patch`, including membership.
    pub fn update_group(&mut self, id: &str, patch: GroupPatch) -> Result<(), SyncError> {
        validate_id(id)?;
        patch.validate(id)?;
        self.route(ChangeAction::UpdateGroup {
            id: id.to_string(),
            patch: patch.sanitized(),
        })
    }

    /// Delete a group and release its member shapes.
    pub fn delete_group(&mut self, id: &str) -> Result<(), SyncError> {
        validate_id(id)?;
        self.route(ChangeAction::DeleteGroup(id.to_string()))
    }

    /// Online: apply with undo tracking and transmit. Offline: queue only.
    /// While earlier changes wait for the handshake, new ones queue behind
    /// them so replay keeps their order.
    fn route(&mut self, action: ChangeAction) -> Result<(), SyncError> {
        let waiting = self.handshake == Handshake::Pending && !self.queue.is_empty();
        if self.is_online() && !waiting {
            let update = apply_action(&mut self.document, action, true)?;
            self.transmit(self.connection.send_update(update));
        } else {
            let change = self.queue.record(&action, &self.config.user.user_id)?;
            log::debug!(
                "Queued {:?} {:?} {} for replay",
                change.operation,
                change.entity,
                action.target_id()
            );
        }
        Ok(())
    }

    /// Revert this session's most recent change. Edits by collaborators
    /// are never reverted. Returns whether anything was undone.
    pub fn undo(&mut self) -> bool {
        match self.document.undo() {
            Some(update) => {
                self.transmit(self.connection.send_update(update));
                true
            }
            None => false,
        }
    }

    /// Reapply the most recently undone change.
    pub fn redo(&mut self) -> bool {
        match self.document.redo() {
            Some(update) => {
                self.transmit(self.connection.send_update(update));
                true
            }
            None => false,
        }
    }

    /// Transport failures never surface from mutations: the change is in
    /// the document and reaches the relay with the next handshake.
    fn transmit(&self, result: Result<(), SyncError>) {
        if let Err(e) = result {
            log::debug!("Not transmitted now: {e}");
        }
    }

    // ─── Presence ────────────────────────────────────────────────

    /// Rename or re-avatar the local user and tell the room.
    pub fn set_local_user(&mut self, user: UserInfo) {
        let msg = self.document.set_local_user(&user);
        self.config.user = user;
        self.send_presence(&msg);
    }

    /// Rate-limited; moves inside the interval only update local state.
    pub fn broadcast_cursor(&mut self, position: Point) {
        if let Some(msg) = self.document.broadcast_cursor(position) {
            self.send_presence(&msg);
        }
    }

    /// Share the local selection. Never queued, never undone.
    pub fn broadcast_selection(&mut self, shape_ids: Vec<String>) {
        let msg = self.document.broadcast_selection(shape_ids);
        self.send_presence(&msg);
    }

    /// Inactive users are hidden from everyone's presence list.
    pub fn set_user_active(&mut self, is_active: bool) {
        let msg = self.document.set_user_active(is_active);
        self.send_presence(&msg);
    }

    /// Drop peers that went quiet. Returns how many were removed.
    pub fn cleanup_idle_presence(&mut self) -> usize {
        self.document.cleanup_idle_presence().len()
    }

    fn send_presence(&self, msg: &AwarenessMessage) {
        if self.connection_state.is_connected() {
            self.transmit(self.connection.send_awareness(msg));
        }
    }

    // ─── Offline queue ───────────────────────────────────────────

    /// Force offline behavior regardless of connectivity. Leaving offline
    /// mode while connected and synced replays the queue.
    pub fn set_offline_mode(&mut self, offline: bool) {
        self.queue.set_offline_mode(offline);
        if !offline && self.connection_state.is_connected() && !self.queue.is_empty() {
            self.sync_pending_changes();
        }
    }

    /// Replay queued changes in timestamp order without undo tracking.
    /// Returns whether every change applied; failed ones stay queued.
    /// Returns `false` without replaying until the relay's state has been
    /// applied on the current connection.
    pub fn sync_pending_changes(&mut self) -> bool {
        if self.handshake == Handshake::Pending {
            log::debug!("Holding {} offline changes until the relay state arrives", self.queue.len());
            return false;
        }
        let pending = self.queue.len();
        let document = &mut self.document;
        let connection = &self.connection;
        let all_applied = self.queue.sync_pending_changes(|change| -> Result<(), SyncError> {
            let action = change.decode()?;
            let update = apply_action(document, action, false)?;
            if let Err(e) = connection.send_update(update) {
                log::debug!("Replayed change {} not transmitted now: {e}", change.id);
            }
            Ok(())
        });
        if pending > 0 {
            log::info!(
                "Replayed {} of {pending} offline changes",
                pending - self.queue.len().min(pending)
            );
        }
        all_applied
    }

    // ─── Event loop ──────────────────────────────────────────────

    /// Handle every event already delivered. Returns how many were handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Wait for the next event, handle it and return it.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        let event = self.events.recv().await?;
        self.handle_event(event.clone());
        Some(event)
    }

    /// Handle events until `predicate` holds or `timeout` elapses. Returns
    /// the final value of `predicate`.
    pub async fn run_until<P>(&mut self, timeout: Duration, mut predicate: P) -> bool
    where
        P: FnMut(&Self) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        self.process_pending();
        loop {
            if predicate(self) {
                return true;
            }
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => self.handle_event(event),
                Ok(None) | Err(_) => return predicate(self),
            }
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::StatusChanged(state) => self.on_status(state),
            TransportEvent::RemoteUpdate { peer_id, update } => {
                if let Err(e) = self.document.apply_remote_update(&update) {
                    log::warn!("Dropping update from {peer_id}: {e}");
                }
            }
            TransportEvent::SyncRequest(state_vector) => {
                match self.document.diff_since(&state_vector) {
                    Ok(diff) => self.transmit(self.connection.send_sync_reply(diff)),
                    Err(e) => log::warn!("Relay sent an unreadable state vector: {e}"),
                }
                if self.connection_state.is_connected() {
                    self.handshake = Handshake::Complete;
                }
            }
            TransportEvent::StateSynced(diff) => {
                if let Err(e) = self.document.apply_remote_update(&diff) {
                    log::warn!("Dropping relay state: {e}");
                }
                if self.connection_state.is_connected() && self.handshake == Handshake::Pending {
                    self.handshake = Handshake::StateApplied;
                }
                if self.queue.is_online() && !self.queue.is_empty() {
                    self.sync_pending_changes();
                }
            }
            TransportEvent::RemoteAwareness { peer_id, message } => {
                self.document.apply_awareness(peer_id, &message);
            }
            TransportEvent::PeerJoined(info) => {
                log::info!("{} joined room {:?}", info.name, self.config.room);
                // The newcomer has not seen our presence yet.
                let join = self.document.presence_join_message();
                self.send_presence(&join);
            }
            TransportEvent::PeerLeft(peer_id) => {
                log::info!("Peer {peer_id} left room {:?}", self.config.room);
                self.document.remove_peer_presence(&peer_id);
            }
            TransportEvent::Pong => log::trace!("pong"),
            TransportEvent::RetryScheduled(RetryEvent { attempt, delay }) => {
                log::info!("Reconnection attempt {attempt} scheduled in {delay:?}");
                self.connection.record_retry(attempt);
            }
            TransportEvent::RetriesExhausted(failures) => {
                log::warn!("Gave up reconnecting after {failures} attempts; reconnect() resumes");
                self.connection.record_retry(failures);
            }
        }
    }

    fn on_status(&mut self, state: ConnectionState) {
        if state == self.connection_state {
            return;
        }
        self.connection_state = state.clone();
        self.state_listeners.emit(&state);

        match state.status {
            ConnectionStatus::Connected => {
                self.handshake = Handshake::Pending;
                self.queue.set_network_available(true);
                self.transmit(self.connection.send_sync_request(self.document.state_vector()));
                let join = self.document.presence_join_message();
                self.send_presence(&join);
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                self.handshake = Handshake::Pending;
                self.queue.set_network_available(false);
                self.document.clear_remote_presence();
                // A stale loss event may arrive after a newer connect started.
                let live = self.connection.status();
                let recovering = matches!(live, ConnectionStatus::Connected | ConnectionStatus::Connecting);
                if !self.user_disconnected && !recovering && self.start_reconnection() {
                    log::info!("Connection lost, reconnecting");
                }
            }
            ConnectionStatus::Connecting => {}
        }
    }

    // ─── Subscriptions ───────────────────────────────────────────

    pub fn on_shapes_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Vec<Shape>) + Send + Sync + 'static,
    {
        self.document.on_shapes_change(callback)
    }

    pub fn on_groups_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Vec<Group>) + Send + Sync + 'static,
    {
        self.document.on_groups_change(callback)
    }

    pub fn on_presence_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Vec<UserPresence>) + Send + Sync + 'static,
    {
        self.document.on_presence_change(callback)
    }

    pub fn on_undo_redo_stack_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&UndoRedoState) + Send + Sync + 'static,
    {
        self.document.on_undo_redo_stack_change(callback)
    }

    pub fn on_connection_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.state_listeners.subscribe(callback)
    }

    pub fn on_queue_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&QueueState) + Send + Sync + 'static,
    {
        self.queue.on_state_change(callback)
    }

    pub fn on_retry<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        self.reconnection.on_retry(callback)
    }

    // ─── Accessors ───────────────────────────────────────────────

    pub fn shapes(&self) -> &[Shape] {
        self.document.shapes()
    }

    pub fn groups(&self) -> &[Group] {
        self.document.groups()
    }

    pub fn presence(&self) -> &[UserPresence] {
        self.document.presence()
    }

    /// Last state delivered to `on_connection_state_change` listeners.
    pub fn connection_state(&self) -> &ConnectionState {
        &self.connection_state
    }

    /// Connected and not forced offline.
    pub fn is_online(&self) -> bool {
        self.connection_state.is_connected() && self.queue.is_online()
    }

    pub fn pending_changes(&self) -> Vec<OfflineChange> {
        self.queue.pending_changes()
    }

    pub fn can_undo(&self) -> bool {
        self.document.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.document.can_redo()
    }

    pub fn peer(&self) -> PeerInfo {
        self.connection.peer()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn document(&self) -> &ReplicatedDocument {
        &self.document
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn reconnection(&self) -> &ReconnectionManager {
        &self.reconnection
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        self.reconnection.stop();
        self.connection.stop_all_connections();
        for forwarder in self.forwarders.drain(..) {
            forwarder.unsubscribe();
        }
    }
}

/// Apply a typed change, with or without undo tracking.
fn apply_action(
    document: &mut ReplicatedDocument,
    action: ChangeAction,
    tracked: bool,
) -> Result<Vec<u8>, DocumentError> {
    match (action, tracked) {
        (ChangeAction::AddShape(shape), true) => document.add_shape_with_undo(shape),
        (ChangeAction::AddShape(shape), false) => document.add_shape(shape),
        (ChangeAction::UpdateShape { id, patch }, true) => document.update_shape_with_undo(&id, patch),
        (ChangeAction::UpdateShape { id, patch }, false) => document.update_shape(&id, patch),
        (ChangeAction::DeleteShape(id), true) => document.delete_shape_with_undo(&id),
        (ChangeAction::DeleteShape(id), false) => document.delete_shape(&id),
        (ChangeAction::AddGroup(group), true) => document.add_group_with_undo(group),
        (ChangeAction::AddGroup(group), false) => document.add_group(group),
        (ChangeAction::UpdateGroup { id, patch }, true) => document.update_group_with_undo(&id, patch),
        (ChangeAction::UpdateGroup { id, patch }, false) => document.update_group(&id, patch),
        (ChangeAction::DeleteGroup(id), true) => document.delete_group_with_undo(&id),
        (ChangeAction::DeleteGroup(id), false) => document.delete_group(&id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::{MemoryStorage, Operation};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn offline_session() -> SyncOrchestrator {
        // Nothing listens here; these tests never connect.
        let config = SessionConfig::new("ws://127.0.0.1:9", "board", UserInfo::new("u1", "Alice"));
        SyncOrchestrator::new(config, MemoryStorage::new())
    }

    #[test]
    fn test_offline_mutations_are_queued_not_applied() {
        let mut session = offline_session();
        session.add_shape(Shape::rectangle("s1", 0.0, 0.0, 10.0, 10.0)).unwrap();
        session
            .update_shape("s1", ShapePatch::fill("#00ff00"))
            .unwrap();
        session.delete_shape("s2").unwrap();

        assert!(session.shapes().is_empty());
        assert!(!session.can_undo());

        let ops: Vec<Operation> = session.pending_changes().iter().map(|c| c.operation).collect();
        assert_eq!(ops, vec![Operation::Add, Operation::Update, Operation::Delete]);
        assert!(session.pending_changes().iter().all(|c| c.user_id == "u1"));
    }

    #[test]
    fn test_invalid_input_rejected_before_queueing() {
        let mut session = offline_session();
        assert!(session.add_shape(Shape::rectangle("", 0.0, 0.0, 1.0, 1.0)).is_err());
        assert!(session.delete_shape("a/b").is_err());
        assert!(session.add_group(Group::new("g1", Vec::<String>::new())).is_err());
        assert!(session.pending_changes().is_empty());
    }

    #[test]
    fn test_queued_changes_sanitized() {
        let mut session = offline_session();
        session
            .add_shape(Shape::rectangle("s1", f64::NAN, 0.0, -5.0, 0.0))
            .unwrap();

        let queued = session.pending_changes()[0].decode().unwrap();
        match queued {
            ChangeAction::AddShape(shape) => {
                assert_eq!(shape.position.x, 0.0);
                assert_eq!(shape.dimensions.width, 5.0);
                assert_eq!(shape.dimensions.height, 1.0);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_sync_pending_requires_connection() {
        let mut session = offline_session();
        session.add_shape(Shape::rectangle("s1", 0.0, 0.0, 1.0, 1.0)).unwrap();

        assert!(!session.sync_pending_changes());
        assert_eq!(session.pending_changes().len(), 1);
        assert!(session.shapes().is_empty());
    }

    #[test]
    fn test_presence_is_local_while_offline() {
        let mut session = offline_session();
        session.broadcast_selection(vec!["s1".to_string()]);
        session.set_user_active(true);

        assert_eq!(session.presence().len(), 1);
        assert_eq!(session.presence()[0].selection, vec!["s1".to_string()]);
        assert!(session.pending_changes().is_empty());
    }

    #[test]
    fn test_replay_waits_for_relay_state() {
        let mut session = offline_session();
        session.delete_shape("s1").unwrap();

        let mut relay = ReplicatedDocument::new(
            uuid::Uuid::new_v4(),
            &UserInfo::new("u9", "Relay"),
            PresenceConfig::default(),
        );
        relay.add_shape(Shape::rectangle("s1", 0.0, 0.0, 1.0, 1.0)).unwrap();
        relay.add_shape(Shape::rectangle("s2", 0.0, 0.0, 1.0, 1.0)).unwrap();

        session.handle_event(TransportEvent::StatusChanged(ConnectionState {
            status: ConnectionStatus::Connected,
            ..ConnectionState::default()
        }));
        assert!(session.is_online());
        assert!(!session.sync_pending_changes());
        assert_eq!(session.pending_changes().len(), 1);

        // Queued behind the held delete, not applied ahead of it.
        session.add_shape(Shape::rectangle("s3", 0.0, 0.0, 1.0, 1.0)).unwrap();
        assert_eq!(session.pending_changes().len(), 2);
        assert!(session.shapes().is_empty());

        let diff = relay.diff_since(&session.document.state_vector()).unwrap();
        session.handle_event(TransportEvent::StateSynced(diff));

        assert!(session.pending_changes().is_empty());
        let mut ids: Vec<&str> = session.shapes().iter().map(|s| s.id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["s2", "s3"]);
        assert!(!session.can_undo());
    }

    #[test]
    fn test_undo_with_empty_history() {
        let mut session = offline_session();
        assert!(!session.undo());
        assert!(!session.redo());
    }

    #[test]
    fn test_state_listener_unsubscribe() {
        let session = offline_session();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sub = session.on_connection_state_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(sub.unsubscribe());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_queue_state_listener_tracks_pending() {
        let mut session = offline_session();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = session.on_queue_state_change(move |state| {
            sink.lock().unwrap().push(state.pending);
        });

        session.add_shape(Shape::rectangle("s1", 0.0, 0.0, 1.0, 1.0)).unwrap();
        session.delete_shape("s1").unwrap();
        assert!(sub.unsubscribe());
        session.delete_shape("s2").unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error_state() {
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut config = SessionConfig::new(
            format!("ws://127.0.0.1:{port}"),
            "board",
            UserInfo::new("u1", "Alice"),
        );
        config.reconnect.max_retries = 1;
        let mut session = SyncOrchestrator::new(config, MemoryStorage::new());

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = session.on_connection_state_change(move |state| {
            sink.lock().unwrap().push(state.status);
        });

        assert!(session.connect().await.is_err());
        assert_eq!(session.connection_state().status, ConnectionStatus::Error);
        assert_eq!(
            seen.lock().unwrap()[..2],
            [ConnectionStatus::Connecting, ConnectionStatus::Error]
        );

        session.disconnect();
        assert_eq!(session.connection_state().status, ConnectionStatus::Disconnected);
        assert!(!session.reconnection().is_supervising());
    }
}
