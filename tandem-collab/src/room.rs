//! Relay-side rooms: one authoritative `yrs` document plus a broadcast
//! group per room name.
//!
//! Rooms live only as long as they have peers. The relay keeps no state on
//! disk; clients re-send what the relay lacks during the handshake.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tandem_core::entries::{count_shapes, SHAPES_MAP};
use tokio::sync::RwLock;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::broadcast::BroadcastGroup;
use crate::error::DocumentError;

pub struct DocumentRoom {
    name: String,
    doc: Mutex<Doc>,
    broadcast: Arc<BroadcastGroup>,
}

impl DocumentRoom {
    pub fn new(name: impl Into<String>, broadcast_capacity: usize) -> Self {
        Self {
            name: name.into(),
            doc: Mutex::new(Doc::new()),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }

    fn doc(&self) -> MutexGuard<'_, Doc> {
        self.doc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge a v1 update from a peer into the room document.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        let update =
            Update::decode_v1(update).map_err(|e| DocumentError::InvalidUpdate(e.to_string()))?;
        let doc = self.doc();
        let mut txn = doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::InvalidUpdate(e.to_string()))
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.doc().transact().state_vector().encode_v1()
    }

    /// Everything the room has that a peer with `state_vector` lacks.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| DocumentError::InvalidUpdate(e.to_string()))?;
        Ok(self.doc().transact().encode_diff_v1(&sv))
    }

    pub fn shape_count(&self) -> usize {
        let doc = self.doc();
        let shapes = doc.get_or_insert_map(SHAPES_MAP);
        let txn = doc.transact();
        count_shapes(&shapes, &txn)
    }
}

/// Room name → room, created on first join.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<DocumentRoom>>>,
    broadcast_capacity: usize,
}

impl RoomRegistry {
    pub fn new(broadcast_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            broadcast_capacity,
        }
    }

    pub async fn get_or_create(&self, name: &str) -> Arc<DocumentRoom> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Another task may have created it between the two locks.
        if let Some(room) = rooms.get(name) {
            return room.clone();
        }
        let room = Arc::new(DocumentRoom::new(name, self.broadcast_capacity));
        rooms.insert(name.to_string(), room.clone());
        log::info!("Room {name:?} created");
        room
    }

    pub async fn get(&self, name: &str) -> Option<Arc<DocumentRoom>> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Drop the room if its last peer is gone.
    pub async fn remove_if_empty(&self, name: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let empty = match rooms.get(name) {
            Some(room) => room.broadcast.peer_count().await == 0,
            None => false,
        };
        if empty {
            rooms.remove(name);
            log::info!("Room {name:?} removed (empty)");
        }
        empty
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Live shape count of every room.
    pub async fn shape_counts(&self) -> BTreeMap<String, usize> {
        let rooms: Vec<Arc<DocumentRoom>> = self.rooms.read().await.values().cloned().collect();
        rooms
            .iter()
            .map(|room| (room.name.clone(), room.shape_count()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PeerInfo;
    use tandem_core::entries::write_shape;
    use tandem_core::Shape;

    fn client_update(shapes: &[Shape]) -> Vec<u8> {
        let doc = Doc::new();
        let map = doc.get_or_insert_map(SHAPES_MAP);
        {
            let mut txn = doc.transact_mut();
            for shape in shapes {
                write_shape(&map, &mut txn, shape);
            }
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    #[test]
    fn test_room_counts_applied_shapes() {
        let room = DocumentRoom::new("board", 8);
        assert_eq!(room.shape_count(), 0);

        let update = client_update(&[
            Shape::rectangle("s1", 0.0, 0.0, 10.0, 10.0),
            Shape::circle("s2", 5.0, 5.0, 4.0, 4.0),
        ]);
        room.apply_update(&update).unwrap();
        assert_eq!(room.shape_count(), 2);

        // Applying the same update again is idempotent.
        room.apply_update(&update).unwrap();
        assert_eq!(room.shape_count(), 2);
    }

    #[test]
    fn test_room_rejects_garbage_update() {
        let room = DocumentRoom::new("board", 8);
        assert!(matches!(
            room.apply_update(&[0xff, 0xff, 0xff]),
            Err(DocumentError::InvalidUpdate(_))
        ));
        assert!(room.diff_since(&[0xff, 0xff]).is_err());
    }

    #[test]
    fn test_diff_since_empty_state_vector_is_full_state() {
        let room = DocumentRoom::new("board", 8);
        room.apply_update(&client_update(&[Shape::rectangle("s1", 0.0, 0.0, 1.0, 1.0)]))
            .unwrap();

        let empty = StateVector::default().encode_v1();
        let diff = room.diff_since(&empty).unwrap();

        let other = DocumentRoom::new("copy", 8);
        other.apply_update(&diff).unwrap();
        assert_eq!(other.shape_count(), 1);

        // Up to date peers get an update that changes nothing.
        let nothing = room.diff_since(&room.state_vector()).unwrap();
        other.apply_update(&nothing).unwrap();
        assert_eq!(other.shape_count(), 1);
    }

    #[tokio::test]
    async fn test_registry_get_or_create_is_shared() {
        let registry = RoomRegistry::new(8);
        let a = registry.get_or_create("board").await;
        let b = registry.get_or_create("board").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.room_count().await, 1);

        registry.get_or_create("other").await;
        assert_eq!(registry.room_names().await, vec!["board", "other"]);
    }

    #[tokio::test]
    async fn test_registry_remove_if_empty() {
        let registry = RoomRegistry::new(8);
        let room = registry.get_or_create("board").await;
        let peer = PeerInfo::new("u1", "Alice");
        let _rx = room.broadcast().add_peer(peer.clone()).await;

        assert!(!registry.remove_if_empty("board").await);
        room.broadcast().remove_peer(&peer.peer_id).await;
        assert!(registry.remove_if_empty("board").await);
        assert!(registry.get("board").await.is_none());
        assert!(!registry.remove_if_empty("missing").await);
    }

    #[tokio::test]
    async fn test_registry_shape_counts() {
        let registry = RoomRegistry::new(8);
        registry
            .get_or_create("a")
            .await
            .apply_update(&client_update(&[Shape::rectangle("s1", 0.0, 0.0, 1.0, 1.0)]))
            .unwrap();
        registry.get_or_create("b").await;

        let counts = registry.shape_counts().await;
        assert_eq!(counts.get("a"), Some(&1));
        assert_eq!(counts.get("b"), Some(&0));
    }
}
