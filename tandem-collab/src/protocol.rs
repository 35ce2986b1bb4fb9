//! Wire format shared by clients and the relay.
//!
//! Every WebSocket binary frame carries one bincode-encoded [`SyncMessage`]:
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room     │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ len+utf8 │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Handshake after every (re)connect:
//! ```text
//! client                         relay
//!   │── PeerJoined(info) ─────────▶│
//!   │── SyncStep1(client sv) ─────▶│
//!   │◀──────── SyncStep2(diff) ────│
//!   │◀──────── SyncStep1(relay sv)─│
//!   │── SyncStep2(diff) ──────────▶│── Delta ──▶ other peers
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::AwarenessMessage;

/// Encode any wire value with the standard bincode configuration.
pub(crate) fn to_wire<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Inverse of [`to_wire`]. Trailing bytes are ignored.
pub(crate) fn from_wire<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| ProtocolError::Decode(e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Payload: encoded state vector; the receiver answers with `SyncStep2`
    SyncStep1 = 1,
    /// Payload: update containing everything the requester lacked
    SyncStep2 = 2,
    /// Payload: incremental document update
    Delta = 3,
    /// Payload: bincode `AwarenessMessage`
    Awareness = 4,
    /// Payload: bincode `PeerInfo`
    PeerJoined = 5,
    PeerLeft = 6,
    Ping = 7,
    Pong = 8,
}

/// Identity of one connected session.
///
/// `peer_id` changes with every session identity; `user_id` is the stable
/// application-level user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub user_id: String,
    pub name: String,
}

impl PeerInfo {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), user_id, name)
    }

    pub fn with_id(peer_id: Uuid, user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            user_id: user_id.into(),
            name: name.into(),
        }
    }

    /// Same user, fresh session identity.
    pub fn renewed(&self) -> Self {
        Self::with_id(Uuid::new_v4(), self.user_id.clone(), self.name.clone())
    }
}

/// One frame on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Session that produced the content; the relay uses nil for its own replies
    pub peer_id: Uuid,
    pub room: String,
    /// Sender's count of updates sent so far
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, room: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room: room.to_string(),
            clock,
            payload,
        }
    }

    pub fn delta(peer_id: Uuid, room: &str, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Delta, peer_id, room, clock, update)
    }

    pub fn sync_step1(peer_id: Uuid, room: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, room, 0, state_vector)
    }

    pub fn sync_step2(peer_id: Uuid, room: &str, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, room, 0, diff)
    }

    pub fn awareness(
        peer_id: Uuid,
        room: &str,
        clock: u64,
        message: &AwarenessMessage,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Awareness, peer_id, room, clock, message.encode()?))
    }

    /// Join announcement; the sender's identity travels in the payload.
    pub fn peer_joined(room: &str, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::PeerJoined, info.peer_id, room, 0, to_wire(info)?))
    }

    pub fn peer_left(peer_id: Uuid, room: &str) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, room, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, "", 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, "", 0, Vec::new())
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        to_wire(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        from_wire(bytes)
    }

    /// Payload of an `Awareness` frame.
    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        self.expect_type(MessageType::Awareness)?;
        AwarenessMessage::decode(&self.payload)
    }

    /// Payload of a `PeerJoined` frame.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        self.expect_type(MessageType::PeerJoined)?;
        from_wire(&self.payload)
    }

    fn expect_type(&self, expected: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type == expected {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedType {
                expected,
                actual: self.msg_type,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Encode(String),
    Decode(String),
    UnexpectedType { expected: MessageType, actual: MessageType },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "cannot encode frame: {e}"),
            Self::Decode(e) => write!(f, "malformed frame: {e}"),
            Self::UnexpectedType { expected, actual } => {
                write!(f, "expected a {expected:?} frame, got {actual:?}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::Point;

    #[test]
    fn test_sync_message_roundtrip() {
        let peer = Uuid::new_v4();
        let payload = vec![1, 2, 3, 4, 5];

        let msg = SyncMessage::delta(peer, "board-1", 42, payload.clone());
        let encoded = msg.encode().unwrap();
        let decoded = SyncMessage::decode(&encoded).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Delta);
        assert_eq!(decoded.peer_id, peer);
        assert_eq!(decoded.room, "board-1");
        assert_eq!(decoded.clock, 42);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_sync_steps_carry_payload() {
        let peer = Uuid::new_v4();

        let step1 = SyncMessage::decode(&SyncMessage::sync_step1(peer, "r", vec![10, 20]).encode().unwrap()).unwrap();
        let step2 = SyncMessage::decode(&SyncMessage::sync_step2(peer, "r", vec![100]).encode().unwrap()).unwrap();

        assert_eq!(step1.msg_type, MessageType::SyncStep1);
        assert_eq!(step1.payload, vec![10, 20]);
        assert_eq!(step2.msg_type, MessageType::SyncStep2);
        assert_eq!(step2.payload, vec![100]);
    }

    #[test]
    fn test_awareness_payload() {
        let peer = Uuid::new_v4();
        let cursor = AwarenessMessage::Cursor {
            position: Point::new(100.5, 200.25),
            timestamp: 7,
        };

        let msg = SyncMessage::awareness(peer, "r", 7, &cursor).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Awareness);
        assert_eq!(decoded.awareness_message().unwrap(), cursor);
    }

    #[test]
    fn test_peer_joined_payload() {
        let info = PeerInfo::new("u-alice", "Alice");

        let msg = SyncMessage::peer_joined("r", &info).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::PeerJoined);
        assert_eq!(decoded.peer_id, info.peer_id);
        assert_eq!(decoded.peer_info().unwrap(), info);
    }

    #[test]
    fn test_peer_left_has_empty_payload() {
        let peer = Uuid::new_v4();
        let decoded = SyncMessage::decode(&SyncMessage::peer_left(peer, "r").encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::PeerLeft);
        assert_eq!(decoded.peer_id, peer);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_renewed_peer_keeps_user() {
        let info = PeerInfo::new("u-alice", "Alice");
        let next = info.renewed();

        assert_ne!(next.peer_id, info.peer_id);
        assert_eq!(next.user_id, "u-alice");
        assert_eq!(next.name, "Alice");
    }

    #[test]
    fn test_payload_accessors_check_type() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert_eq!(
            msg.awareness_message().unwrap_err(),
            ProtocolError::UnexpectedType {
                expected: MessageType::Awareness,
                actual: MessageType::Ping
            }
        );
        assert!(matches!(
            msg.peer_info(),
            Err(ProtocolError::UnexpectedType { expected: MessageType::PeerJoined, .. })
        ));
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(matches!(SyncMessage::decode(&garbage), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_frame_overhead_is_small() {
        let encoded = SyncMessage::delta(Uuid::new_v4(), "board", 1, vec![0u8; 50]).encode().unwrap();
        // 50 payload bytes + 16 id + short room + a few varints
        assert!(encoded.len() < 90, "frame is {} bytes", encoded.len());
    }

}
