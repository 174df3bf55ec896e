//! Core protocol types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ProtocolError, Result};
use crate::message::MessageType;

/// Maximum length of a peer ID in bytes
pub const MAX_PEER_ID_LEN: usize = 64;

/// Identity of a peer as reported by the P2P session layer
///
/// Peer IDs are opaque display names. They are compared byte-for-byte and are
/// never empty.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Create a PeerId, rejecting empty or oversized names
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(ProtocolError::InvalidPeerId("empty".to_string()));
        }

        if id.len() > MAX_PEER_ID_LEN {
            return Err(ProtocolError::InvalidPeerId(format!(
                "{} bytes (max {})",
                id.len(),
                MAX_PEER_ID_LEN
            )));
        }

        Ok(PeerId(id))
    }

    /// Get the peer ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for PeerId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        PeerId::new(s)
    }
}

/// Recipient of a message: a single peer or every reachable peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// Directed message for one peer
    Peer(PeerId),
    /// Broadcast sentinel
    Broadcast,
}

impl Destination {
    /// True if this destination includes `peer`
    pub fn includes(&self, peer: &PeerId) -> bool {
        match self {
            Destination::Peer(id) => id == peer,
            Destination::Broadcast => true,
        }
    }

    /// The addressed peer, if directed
    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            Destination::Peer(id) => Some(id),
            Destination::Broadcast => None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Destination::Broadcast)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Peer(id) => write!(f, "{}", id),
            Destination::Broadcast => write!(f, "*"),
        }
    }
}

impl From<PeerId> for Destination {
    fn from(peer: PeerId) -> Self {
        Destination::Peer(peer)
    }
}

/// Connection priority tier
///
/// Tiers are ordered `Low < Normal < High < Critical` and govern which slot
/// occupants may be evicted for a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Tier {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Tier {
    /// All tiers from highest to lowest priority
    pub const DESCENDING: [Tier; 4] = [Tier::Critical, Tier::High, Tier::Normal, Tier::Low];

    /// Tiers strictly above this one, nearest first
    pub fn higher(self) -> impl Iterator<Item = Tier> {
        Tier::DESCENDING
            .into_iter()
            .rev()
            .filter(move |t| *t > self)
    }

    /// Tiers strictly below this one, nearest first
    pub fn lower(self) -> impl Iterator<Item = Tier> {
        Tier::DESCENDING.into_iter().filter(move |t| *t < self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Critical => "critical",
            Tier::High => "high",
            Tier::Normal => "normal",
            Tier::Low => "low",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Tier::Critical),
            "high" => Ok(Tier::High),
            "normal" => Ok(Tier::Normal),
            "low" => Ok(Tier::Low),
            other => Err(ProtocolError::ValidationFailed(format!(
                "Unknown tier: {}",
                other
            ))),
        }
    }
}

/// Transport channel used for a send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendMode {
    /// Ordered, retransmitted by the session layer
    Reliable,
    /// Unordered, may be dropped
    BestEffort,
}

/// Priority level for message queuing (0-255)
///
/// - 0-63: BACKGROUND
/// - 64-127: LOW
/// - 128-191: NORMAL
/// - 192-223: HIGH
/// - 224-255: EMERGENCY
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(u8);

impl Priority {
    pub const BACKGROUND_MAX: u8 = 63;
    pub const LOW_MAX: u8 = 127;
    pub const NORMAL_MAX: u8 = 191;
    pub const HIGH_MAX: u8 = 223;

    /// Create priority from u8 (any value 0-255 is valid)
    pub fn from_u8(value: u8) -> Self {
        Priority(value)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn background() -> Self {
        Priority(32)
    }

    pub fn low() -> Self {
        Priority(96)
    }

    pub fn normal() -> Self {
        Priority(160)
    }

    pub fn high() -> Self {
        Priority(208)
    }

    pub fn emergency() -> Self {
        Priority(240)
    }

    /// Default priority for a message type
    pub fn for_type(message_type: MessageType) -> Self {
        match message_type {
            MessageType::Emergency => Priority::emergency(),
            MessageType::Ack => Priority::high(),
            MessageType::Chat => Priority::normal(),
            MessageType::Location | MessageType::Status => Priority::low(),
            MessageType::Ping | MessageType::Pong => Priority::background(),
        }
    }

    pub fn is_emergency(&self) -> bool {
        self.0 > Self::HIGH_MAX
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::normal()
    }
}
