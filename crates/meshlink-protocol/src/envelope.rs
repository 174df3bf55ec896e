//! Wire envelope
//!
//! Every payload handed to the transport is wrapped in an envelope:
//!
//! - Magic (4 bytes): "MLNK"
//! - Version (1 byte): protocol version (0x01)
//! - Kind (1 byte): discriminator of the body
//! - Body length (4 bytes, big-endian)
//! - Checksum (4 bytes, big-endian): CRC32 of the body
//! - Body (variable): bincode encoding of the envelope

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::message::{NetworkMessage, MAX_PAYLOAD_SIZE};
use crate::topology::TopologyMessage;
use crate::types::PeerId;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic bytes identifying MeshLink envelopes: "MLNK"
pub const MAGIC_BYTES: [u8; 4] = [0x4D, 0x4C, 0x4E, 0x4B];

/// Header size: 4 + 1 + 1 + 4 + 4
pub const HEADER_SIZE: usize = 14;

/// Maximum encoded body size (payload plus generous room for routing fields)
pub const MAX_BODY_SIZE: usize = MAX_PAYLOAD_SIZE + 16 * 1024;

/// Envelope discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvelopeKind {
    Message = 0x01,
    Topology = 0x02,
    Ping = 0x03,
    Pong = 0x04,
    DiscoveryToken = 0x05,
}

impl EnvelopeKind {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(EnvelopeKind::Message),
            0x02 => Ok(EnvelopeKind::Topology),
            0x03 => Ok(EnvelopeKind::Ping),
            0x04 => Ok(EnvelopeKind::Pong),
            0x05 => Ok(EnvelopeKind::DiscoveryToken),
            other => Err(ProtocolError::InvalidEnvelopeKind(other)),
        }
    }
}

/// Everything that travels over a link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    /// Application message or ack
    Message(NetworkMessage),
    /// Adjacency announcement
    Topology(TopologyMessage),
    /// Liveness probe
    Ping { nonce: u64, sent_at_ms: u64 },
    /// Liveness reply echoing the probe
    Pong { nonce: u64, sent_at_ms: u64 },
    /// Discovery token exchanged before a link is admitted
    DiscoveryToken { peer: PeerId, token: Vec<u8> },
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_BODY_SIZE as u64)
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Message(_) => EnvelopeKind::Message,
            Envelope::Topology(_) => EnvelopeKind::Topology,
            Envelope::Ping { .. } => EnvelopeKind::Ping,
            Envelope::Pong { .. } => EnvelopeKind::Pong,
            Envelope::DiscoveryToken { .. } => EnvelopeKind::DiscoveryToken,
        }
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = codec()
            .serialize(self)
            .map_err(|e| ProtocolError::SerializationFailed(e.to_string()))?;

        if body.len() > MAX_BODY_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: body.len(),
                max: MAX_BODY_SIZE,
            });
        }

        let mut bytes = Vec::with_capacity(HEADER_SIZE + body.len());
        bytes.extend_from_slice(&MAGIC_BYTES);
        bytes.push(PROTOCOL_VERSION);
        bytes.push(self.kind() as u8);
        bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());
        bytes.extend_from_slice(&body);

        Ok(bytes)
    }

    /// Parse wire bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::InvalidEnvelopeFormat);
        }

        if bytes[0..4] != MAGIC_BYTES {
            return Err(ProtocolError::InvalidEnvelopeFormat);
        }

        let version = bytes[4];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let kind = EnvelopeKind::from_u8(bytes[5])?;

        let body_len = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
        if body_len > MAX_BODY_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: body_len,
                max: MAX_BODY_SIZE,
            });
        }

        let body = &bytes[HEADER_SIZE..];
        if body.len() != body_len {
            return Err(ProtocolError::InvalidEnvelopeFormat);
        }

        let expected = u32::from_be_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]);
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(ProtocolError::ChecksumMismatch { expected, actual });
        }

        let envelope: Envelope = codec()
            .deserialize(body)
            .map_err(|e| ProtocolError::DeserializationFailed(e.to_string()))?;

        if envelope.kind() != kind {
            return Err(ProtocolError::InvalidEnvelopeKind(kind as u8));
        }

        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use crate::types::Destination;

    fn peer(name: &str) -> PeerId {
        PeerId::new(name).unwrap()
    }

    fn sample_message() -> NetworkMessage {
        NetworkMessage::new(
            peer("alice"),
            Destination::Peer(peer("carol")),
            MessageType::Chat,
            b"hello mesh".to_vec(),
        )
        .unwrap()
        .requiring_ack(true)
        .relayed_by(&peer("bob"))
        .unwrap()
    }

    #[test]
    fn test_message_fields_survive_the_wire() {
        let msg = sample_message();
        let bytes = Envelope::Message(msg.clone()).encode().unwrap();

        match Envelope::decode(&bytes).unwrap() {
            Envelope::Message(decoded) => {
                assert_eq!(decoded.id, msg.id);
                assert_eq!(decoded.flood.ttl, msg.flood.ttl);
                assert_eq!(decoded.flood.hop_count, 1);
                assert_eq!(decoded.flood.visited, vec![peer("alice"), peer("bob")]);
                assert!(decoded.requires_ack);
                assert_eq!(decoded, msg);
            }
            other => panic!("unexpected envelope: {:?}", other),
        }
    }

    #[test]
    fn test_topology_envelope() {
        let topo = TopologyMessage::new(peer("bob"), vec![peer("alice"), peer("carol")], 7, 4);
        let bytes = Envelope::Topology(topo.clone()).encode().unwrap();
        assert_eq!(bytes[5], EnvelopeKind::Topology as u8);
        assert_eq!(Envelope::decode(&bytes).unwrap(), Envelope::Topology(topo));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = Envelope::Ping { nonce: 1, sent_at_ms: 2 }.encode().unwrap();
        bytes[0] = b'X';
        assert_eq!(
            Envelope::decode(&bytes),
            Err(ProtocolError::InvalidEnvelopeFormat)
        );
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut bytes = Envelope::Ping { nonce: 1, sent_at_ms: 2 }.encode().unwrap();
        bytes[4] = 9;
        assert_eq!(
            Envelope::decode(&bytes),
            Err(ProtocolError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn test_rejects_corrupted_body() {
        let mut bytes = Envelope::Message(sample_message()).encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_kind_mismatch() {
        let mut bytes = Envelope::Ping { nonce: 1, sent_at_ms: 2 }.encode().unwrap();
        bytes[5] = EnvelopeKind::Pong as u8;
        assert_eq!(
            Envelope::decode(&bytes),
            Err(ProtocolError::InvalidEnvelopeKind(EnvelopeKind::Pong as u8))
        );
    }

    #[test]
    fn test_rejects_truncated_input() {
        assert!(Envelope::decode(&[]).is_err());
        assert!(Envelope::decode(&MAGIC_BYTES).is_err());

        let bytes = Envelope::Pong { nonce: 5, sent_at_ms: 6 }.encode().unwrap();
        assert!(Envelope::decode(&bytes[..bytes.len() - 2]).is_err());
    }
}
