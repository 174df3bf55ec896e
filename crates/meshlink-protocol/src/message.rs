//! Message types and structures

use blake2::{Blake2b512, Digest};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ProtocolError, Result};
use crate::types::{Destination, PeerId, Priority};

/// Size of a message ID in bytes
pub const MESSAGE_ID_SIZE: usize = 16;

/// Maximum message payload size (64 KiB)
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Maximum TTL (hops)
pub const MAX_TTL: u8 = 32;

/// Default TTL for application messages
pub const DEFAULT_TTL: u8 = 8;

/// Current Unix time in milliseconds
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// 16-byte message identifier, the truncated BLAKE2b-512 digest of the
/// message's identifying fields plus a random nonce
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId([u8; MESSAGE_ID_SIZE]);

impl MessageId {
    /// Fresh identifier for a message
    ///
    /// The nonce keeps identifiers distinct when two messages agree on every
    /// other field.
    pub fn generate(
        sender: &PeerId,
        destination: &Destination,
        payload: &[u8],
        timestamp: u64,
        sequence: u32,
    ) -> Self {
        let destination_bytes: &[u8] = match destination {
            Destination::Peer(peer) => peer.as_str().as_bytes(),
            Destination::Broadcast => &[0xFF],
        };

        let digest = Blake2b512::new()
            .chain_update(timestamp.to_le_bytes())
            .chain_update(sender.as_str().as_bytes())
            .chain_update(destination_bytes)
            .chain_update(payload)
            .chain_update(sequence.to_le_bytes())
            .chain_update(rand::thread_rng().next_u64().to_le_bytes())
            .finalize();

        let mut bytes = [0u8; MESSAGE_ID_SIZE];
        bytes.copy_from_slice(&digest[..MESSAGE_ID_SIZE]);
        MessageId(bytes)
    }

    pub fn from_bytes(bytes: [u8; MESSAGE_ID_SIZE]) -> Self {
        MessageId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let decoded =
            hex::decode(s).map_err(|e| ProtocolError::DeserializationFailed(e.to_string()))?;
        <[u8; MESSAGE_ID_SIZE]>::try_from(decoded.as_slice())
            .map(MessageId)
            .map_err(|_| ProtocolError::InvalidMessageId)
    }

    /// First six bytes in hex, for logs
    fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl std::fmt::Debug for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MessageId").field(&self.short()).finish()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.short())
    }
}

/// Application message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Chat text (0x01)
    Chat = 0x01,
    /// Emergency alert (0x02)
    Emergency = 0x02,
    /// Location share (0x03)
    Location = 0x03,
    /// Presence / status update (0x04)
    Status = 0x04,
    /// Delivery acknowledgment (0x40)
    Ack = 0x40,
    /// Liveness probe (0x20)
    Ping = 0x20,
    /// Liveness reply (0x21)
    Pong = 0x21,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(MessageType::Chat),
            0x02 => Ok(MessageType::Emergency),
            0x03 => Ok(MessageType::Location),
            0x04 => Ok(MessageType::Status),
            0x40 => Ok(MessageType::Ack),
            0x20 => Ok(MessageType::Ping),
            0x21 => Ok(MessageType::Pong),
            _ => Err(ProtocolError::ValidationFailed(format!(
                "Invalid message type: {:#04x}",
                value
            ))),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Flood-control fields shared by relayable messages
///
/// Invariant: `hop_count <= ttl`. A peer relays only if the message has
/// hops remaining and the peer is not already in `visited`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloodControl {
    /// Maximum number of relays
    pub ttl: u8,

    /// Relays performed so far
    pub hop_count: u8,

    /// Peers the message has passed through, originator first
    pub visited: Vec<PeerId>,
}

impl FloodControl {
    /// New flood control seeded with the originating peer
    pub fn new(ttl: u8, origin: &PeerId) -> Self {
        FloodControl {
            ttl,
            hop_count: 0,
            visited: vec![origin.clone()],
        }
    }

    pub fn has_visited(&self, peer: &PeerId) -> bool {
        self.visited.iter().any(|p| p == peer)
    }

    /// True if `local` may relay this message
    pub fn can_relay(&self, local: &PeerId) -> bool {
        self.hop_count < self.ttl && !self.has_visited(local)
    }

    /// Record a relay through `local`
    ///
    /// Returns false (and changes nothing) when relaying is not allowed.
    pub fn advance(&mut self, local: &PeerId) -> bool {
        if !self.can_relay(local) {
            return false;
        }
        self.visited.push(local.clone());
        self.hop_count += 1;
        true
    }

    /// Hops remaining before the message dies
    pub fn remaining(&self) -> u8 {
        self.ttl.saturating_sub(self.hop_count)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl == 0 {
            return Err(ProtocolError::TtlExceeded);
        }
        if self.ttl > MAX_TTL {
            return Err(ProtocolError::ValidationFailed(format!(
                "TTL too large: {} hops (max: {})",
                self.ttl, MAX_TTL
            )));
        }
        if self.hop_count > self.ttl {
            return Err(ProtocolError::ValidationFailed(format!(
                "hop count {} exceeds ttl {}",
                self.hop_count, self.ttl
            )));
        }
        Ok(())
    }
}

/// An application message carried across the mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkMessage {
    /// Unique message identifier
    pub id: MessageId,

    /// Originating peer
    pub sender: PeerId,

    /// Addressed peer or broadcast
    pub recipient: Destination,

    /// Message type
    pub message_type: MessageType,

    /// Queue priority
    pub priority: Priority,

    /// TTL, hop count and visited list
    pub flood: FloodControl,

    /// Sender wants a delivery acknowledgment
    pub requires_ack: bool,

    /// For acks: the message being acknowledged
    pub ack_for: Option<MessageId>,

    /// Creation time (Unix milliseconds)
    pub timestamp: u64,

    /// Opaque payload
    pub payload: Vec<u8>,
}

impl NetworkMessage {
    /// Create a new message originating at `sender`
    pub fn new(
        sender: PeerId,
        recipient: Destination,
        message_type: MessageType,
        payload: Vec<u8>,
    ) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let timestamp = now_millis();
        let id = MessageId::generate(&sender, &recipient, &payload, timestamp, 0);
        let flood = FloodControl::new(DEFAULT_TTL, &sender);

        Ok(NetworkMessage {
            id,
            sender,
            recipient,
            message_type,
            priority: Priority::for_type(message_type),
            flood,
            requires_ack: false,
            ack_for: None,
            timestamp,
            payload,
        })
    }

    /// Build the acknowledgment for `original`, sent by `local`
    pub fn ack(local: PeerId, original: &NetworkMessage) -> Self {
        let timestamp = now_millis();
        let recipient = Destination::Peer(original.sender.clone());
        let id = MessageId::generate(&local, &recipient, original.id.as_bytes(), timestamp, 0);
        let flood = FloodControl::new(original.flood.ttl.max(DEFAULT_TTL), &local);

        NetworkMessage {
            id,
            sender: local,
            recipient,
            message_type: MessageType::Ack,
            priority: Priority::for_type(MessageType::Ack),
            flood,
            requires_ack: false,
            ack_for: Some(original.id),
            timestamp,
            payload: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.flood.ttl = ttl;
        self
    }

    pub fn requiring_ack(mut self, requires_ack: bool) -> Self {
        self.requires_ack = requires_ack;
        self
    }

    /// True if this message should be delivered to `local`
    pub fn is_for(&self, local: &PeerId) -> bool {
        self.recipient.includes(local)
    }

    /// True if addressed to `local` and no one else
    pub fn is_only_for(&self, local: &PeerId) -> bool {
        self.recipient.peer() == Some(local)
    }

    /// Copy of this message prepared for relay through `local`
    ///
    /// Returns None when the loop guard forbids relaying.
    pub fn relayed_by(&self, local: &PeerId) -> Option<NetworkMessage> {
        let mut relayed = self.clone();
        if relayed.flood.advance(local) {
            Some(relayed)
        } else {
            None
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        self.flood.validate()?;

        if self.message_type == MessageType::Ack && self.ack_for.is_none() {
            return Err(ProtocolError::MissingField("ack_for".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> PeerId {
        PeerId::new(name).unwrap()
    }

    #[test]
    fn test_message_id_uniqueness() {
        let a = peer("a");
        let dest = Destination::Broadcast;
        let id1 = MessageId::generate(&a, &dest, b"x", 1, 0);
        let id2 = MessageId::generate(&a, &dest, b"x", 1, 0);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_message_id_hex() {
        let id = MessageId::generate(&peer("a"), &Destination::Broadcast, b"", 0, 0);
        let parsed = MessageId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
        assert!(MessageId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_new_message_defaults() {
        let msg = NetworkMessage::new(
            peer("a"),
            Destination::Peer(peer("c")),
            MessageType::Chat,
            b"hello".to_vec(),
        )
        .unwrap();

        assert_eq!(msg.flood.hop_count, 0);
        assert_eq!(msg.flood.ttl, DEFAULT_TTL);
        assert_eq!(msg.flood.visited, vec![peer("a")]);
        assert_eq!(msg.priority, Priority::normal());
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_payload_limit() {
        let result = NetworkMessage::new(
            peer("a"),
            Destination::Broadcast,
            MessageType::Chat,
            vec![0u8; MAX_PAYLOAD_SIZE + 1],
        );
        assert!(matches!(result, Err(ProtocolError::MessageTooLarge { .. })));
    }

    #[test]
    fn test_relay_increments_hop_count() {
        let msg = NetworkMessage::new(peer("a"), Destination::Broadcast, MessageType::Chat, vec![])
            .unwrap();

        let relayed = msg.relayed_by(&peer("b")).unwrap();
        assert_eq!(relayed.flood.hop_count, msg.flood.hop_count + 1);
        assert_eq!(relayed.flood.visited, vec![peer("a"), peer("b")]);
        assert_eq!(relayed.id, msg.id);
    }

    #[test]
    fn test_relay_loop_guard() {
        let msg = NetworkMessage::new(peer("a"), Destination::Broadcast, MessageType::Chat, vec![])
            .unwrap();

        // Originator never relays its own message
        assert!(msg.relayed_by(&peer("a")).is_none());

        // A peer already in visited does not relay again
        let relayed = msg.relayed_by(&peer("b")).unwrap();
        assert!(relayed.relayed_by(&peer("b")).is_none());
    }

    #[test]
    fn test_relay_stops_at_ttl() {
        let mut msg =
            NetworkMessage::new(peer("a"), Destination::Broadcast, MessageType::Chat, vec![])
                .unwrap()
                .with_ttl(2);

        msg = msg.relayed_by(&peer("b")).unwrap();
        msg = msg.relayed_by(&peer("c")).unwrap();
        assert_eq!(msg.flood.hop_count, 2);
        assert_eq!(msg.flood.remaining(), 0);
        assert!(msg.relayed_by(&peer("d")).is_none());
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_hop_count_over_ttl() {
        let mut msg =
            NetworkMessage::new(peer("a"), Destination::Broadcast, MessageType::Chat, vec![])
                .unwrap();
        msg.flood.hop_count = msg.flood.ttl + 1;
        assert!(msg.validate().is_err());

        let msg = msg.with_ttl(MAX_TTL + 1);
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_ack_references_original() {
        let original = NetworkMessage::new(
            peer("a"),
            Destination::Peer(peer("c")),
            MessageType::Chat,
            b"hi".to_vec(),
        )
        .unwrap()
        .requiring_ack(true);

        let ack = NetworkMessage::ack(peer("c"), &original);
        assert_eq!(ack.message_type, MessageType::Ack);
        assert_eq!(ack.ack_for, Some(original.id));
        assert_eq!(ack.recipient, Destination::Peer(peer("a")));
        assert_eq!(ack.sender, peer("c"));
        assert!(!ack.requires_ack);
        assert!(ack.validate().is_ok());
    }

    #[test]
    fn test_ack_without_reference_is_invalid() {
        let mut msg =
            NetworkMessage::new(peer("a"), Destination::Broadcast, MessageType::Ack, vec![])
                .unwrap();
        msg.ack_for = None;
        assert!(matches!(msg.validate(), Err(ProtocolError::MissingField(_))));
    }

    #[test]
    fn test_message_type_codes() {
        for ty in [
            MessageType::Chat,
            MessageType::Emergency,
            MessageType::Location,
            MessageType::Status,
            MessageType::Ack,
            MessageType::Ping,
            MessageType::Pong,
        ] {
            assert_eq!(MessageType::from_u8(ty.to_u8()).unwrap(), ty);
        }
        assert!(MessageType::from_u8(0x99).is_err());
    }
}
