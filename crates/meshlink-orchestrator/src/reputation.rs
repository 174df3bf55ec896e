//! In-memory reputation ledger
//!
//! Learns peer trust from connection outcomes. Nodes that are not wired to
//! an external reputation service use this as their `ReputationSource`.

use dashmap::DashMap;
use meshlink_protocol::{PeerId, Tier};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::collaborators::{ConnectionOutcome, ReputationSource};

/// Ledger scoring parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Trust assigned to peers with no history
    pub initial_score: f64,
    /// Outcomes needed before history fully outweighs the initial score
    pub min_history: u32,
    /// Penalties after which a peer is blacklisted
    pub blacklist_after: u32,
    /// Score at or above which a peer is recommended High
    pub high_priority_score: f64,
    /// Score below which a peer is recommended Low
    pub low_priority_score: f64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        ReputationConfig {
            initial_score: 0.5,
            min_history: 20,
            blacklist_after: 5,
            high_priority_score: 0.8,
            low_priority_score: 0.35,
        }
    }
}

/// Connection history of one peer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerReputation {
    /// Links that came up
    pub connections: u64,
    /// Handshakes that never completed
    pub handshake_failures: u64,
    /// Links lost without either side asking
    pub unexpected_disconnects: u64,
    /// Penalty counter for misbehaviour
    pub penalty_count: u32,
    /// Tier pinned by the host (e.g. a contact marked as family)
    pub pinned_tier: Option<Tier>,
    /// Explicitly blacklisted by the host
    pub blacklisted: bool,
}

impl PeerReputation {
    /// Score in `[0, 1]`
    ///
    /// History is blended with the initial score until `min_history`
    /// outcomes exist; each penalty then costs 10%, multiplicatively.
    pub fn score(&self, config: &ReputationConfig) -> f64 {
        let failures = self.handshake_failures + self.unexpected_disconnects;
        let total = self.connections + failures;

        let base = if total == 0 {
            config.initial_score
        } else {
            let success_rate = self.connections as f64 / total as f64;
            let weight = (total as f64 / config.min_history.max(1) as f64).min(1.0);
            config.initial_score * (1.0 - weight) + success_rate * weight
        };

        let penalty_factor = 0.9_f64.powi(self.penalty_count as i32).max(0.1);
        (base * penalty_factor).clamp(0.0, 1.0)
    }
}

/// Concurrent per-peer reputation store
#[derive(Debug, Default)]
pub struct ReputationLedger {
    config: ReputationConfig,
    peers: DashMap<PeerId, PeerReputation>,
}

impl ReputationLedger {
    pub fn new(config: ReputationConfig) -> Self {
        ReputationLedger {
            config,
            peers: DashMap::new(),
        }
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerReputation> {
        self.peers.get(peer).map(|r| r.clone())
    }

    /// Record misbehaviour; blacklists once the threshold is reached
    pub fn penalize(&self, peer: &PeerId) {
        let mut entry = self.peers.entry(peer.clone()).or_default();
        entry.penalty_count += 1;
        if entry.penalty_count >= self.config.blacklist_after && !entry.blacklisted {
            warn!("Blacklisting {} after {} penalties", peer, entry.penalty_count);
            entry.blacklisted = true;
        }
    }

    pub fn blacklist(&self, peer: &PeerId) {
        self.peers.entry(peer.clone()).or_default().blacklisted = true;
    }

    pub fn forgive(&self, peer: &PeerId) {
        if let Some(mut entry) = self.peers.get_mut(peer) {
            entry.blacklisted = false;
            entry.penalty_count = 0;
        }
    }

    /// Pin a tier regardless of score
    pub fn pin_tier(&self, peer: &PeerId, tier: Option<Tier>) {
        self.peers.entry(peer.clone()).or_default().pinned_tier = tier;
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl ReputationSource for ReputationLedger {
    fn trust_score(&self, peer: &PeerId) -> f64 {
        self.peers
            .get(peer)
            .map(|r| r.score(&self.config))
            .unwrap_or(self.config.initial_score)
    }

    fn recommended_priority(&self, peer: &PeerId) -> Tier {
        if let Some(tier) = self.peers.get(peer).and_then(|r| r.pinned_tier) {
            return tier;
        }
        let score = self.trust_score(peer);
        if score >= self.config.high_priority_score {
            Tier::High
        } else if score < self.config.low_priority_score {
            Tier::Low
        } else {
            Tier::Normal
        }
    }

    fn is_blacklisted(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).is_some_and(|r| r.blacklisted)
    }

    fn record_outcome(&self, peer: &PeerId, outcome: ConnectionOutcome) {
        let mut entry = self.peers.entry(peer.clone()).or_default();
        match outcome {
            ConnectionOutcome::Connected => entry.connections += 1,
            ConnectionOutcome::HandshakeFailed => entry.handshake_failures += 1,
            ConnectionOutcome::Disconnected { expected: false } => {
                entry.unexpected_disconnects += 1
            }
            ConnectionOutcome::Disconnected { expected: true } => {}
        }
        debug!("Reputation of {} after {:?}: {:?}", peer, outcome, *entry);
    }
}
