//! Topology broadcast messages
//!
//! Each peer periodically announces the set of peers it is directly linked
//! to. Announcements use the same flood control as application messages and
//! are sent best-effort: a lost broadcast is corrected by the next one.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::{now_millis, FloodControl, MessageId};
use crate::types::{Destination, PeerId};

/// Default TTL for topology broadcasts
pub const TOPOLOGY_TTL: u8 = 4;

/// "Who I am directly connected to"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyMessage {
    /// Unique broadcast identifier
    pub id: MessageId,

    /// Announcing peer
    pub sender: PeerId,

    /// Sender's direct links at broadcast time
    pub direct_peers: Vec<PeerId>,

    /// TTL, hop count and visited list
    pub flood: FloodControl,

    /// Per-sender broadcast counter
    pub sequence: u32,

    /// Creation time (Unix milliseconds)
    pub timestamp: u64,
}

impl TopologyMessage {
    pub fn new(sender: PeerId, direct_peers: Vec<PeerId>, sequence: u32, ttl: u8) -> Self {
        let timestamp = now_millis();
        let digest: Vec<u8> = direct_peers
            .iter()
            .flat_map(|p| p.as_str().as_bytes().iter().copied())
            .collect();
        let id = MessageId::generate(
            &sender,
            &Destination::Broadcast,
            &digest,
            timestamp,
            sequence,
        );
        let flood = FloodControl::new(ttl, &sender);

        TopologyMessage {
            id,
            sender,
            direct_peers,
            flood,
            sequence,
            timestamp,
        }
    }

    /// Copy prepared for relay through `local`, or None if the loop guard
    /// forbids it
    pub fn relayed_by(&self, local: &PeerId) -> Option<TopologyMessage> {
        let mut relayed = self.clone();
        if relayed.flood.advance(local) {
            Some(relayed)
        } else {
            None
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.flood.validate()
    }
}
