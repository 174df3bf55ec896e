//! Next-hop routing table
//!
//! Built from topology broadcasts. For every destination the table keeps all
//! direct peers through which that destination was recently seen, with the
//! hop distance of the observation. Entries not refreshed within a few
//! broadcast intervals expire and the destination falls back to flooding.

use meshlink_protocol::{PeerId, TopologyMessage};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// One way to reach a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextHop {
    /// Links between us and the destination through this hop
    pub distance: u8,
    pub last_seen: Instant,
}

/// All known next hops for one destination
#[derive(Debug, Clone, Default)]
pub struct RouteEntry {
    next_hops: HashMap<PeerId, NextHop>,
}

impl RouteEntry {
    pub fn next_hops(&self) -> impl Iterator<Item = (&PeerId, &NextHop)> {
        self.next_hops.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.next_hops.is_empty()
    }

    fn observe(&mut self, via: &PeerId, distance: u8, now: Instant) {
        self.next_hops.insert(
            via.clone(),
            NextHop {
                distance,
                last_seen: now,
            },
        );
    }
}

/// One row of the routing summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteSummary {
    pub destination: PeerId,
    pub next_hops: Vec<PeerId>,
    pub distance: u8,
}

/// Direct links plus learned multi-hop routes
#[derive(Debug, Clone)]
pub struct RoutingTable {
    local: PeerId,
    direct: HashSet<PeerId>,
    routes: HashMap<PeerId, RouteEntry>,
    entry_ttl: Duration,
}

impl RoutingTable {
    pub fn new(local: PeerId, entry_ttl: Duration) -> Self {
        RoutingTable {
            local,
            direct: HashSet::new(),
            routes: HashMap::new(),
            entry_ttl,
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn entry_ttl(&self) -> Duration {
        self.entry_ttl
    }

    /// Mark a link as up; true if it was not already direct
    pub fn set_direct(&mut self, peer: PeerId) -> bool {
        if peer == self.local {
            return false;
        }
        self.direct.insert(peer)
    }

    /// Mark a link as down, dropping it as a next hop everywhere
    pub fn remove_direct(&mut self, peer: &PeerId) -> bool {
        let removed = self.direct.remove(peer);
        for entry in self.routes.values_mut() {
            entry.next_hops.remove(peer);
        }
        self.routes.retain(|_, entry| !entry.is_empty());
        removed
    }

    /// Forget every direct link (transport restart)
    pub fn clear_direct(&mut self) {
        self.direct.clear();
        self.routes.clear();
    }

    pub fn is_direct(&self, peer: &PeerId) -> bool {
        self.direct.contains(peer)
    }

    /// Direct peers in stable order
    pub fn direct_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.direct.iter().cloned().collect();
        peers.sort();
        peers
    }

    /// Merge a topology broadcast received from `via`
    ///
    /// The sender becomes reachable through `via` at `hop_count + 1` links,
    /// and each peer the sender lists becomes reachable through `via` at
    /// `hop_count + 2`. Returns the number of destinations touched.
    pub fn record_topology(&mut self, message: &TopologyMessage, via: &PeerId, now: Instant) -> usize {
        if message.sender == self.local || *via == self.local {
            return 0;
        }

        let hops = message.flood.hop_count;
        let mut touched = 0;

        self.routes
            .entry(message.sender.clone())
            .or_default()
            .observe(via, hops.saturating_add(1), now);
        touched += 1;

        for peer in &message.direct_peers {
            if *peer == self.local || peer == via || *peer == message.sender {
                continue;
            }
            self.routes
                .entry(peer.clone())
                .or_default()
                .observe(via, hops.saturating_add(2), now);
            touched += 1;
        }

        touched
    }

    fn is_live(&self, hop: &NextHop, now: Instant) -> bool {
        now.saturating_duration_since(hop.last_seen) < self.entry_ttl
    }

    /// Peers to hand a message for `destination` to
    ///
    /// A direct peer routes to itself. Otherwise the live next hops that are
    /// still direct links, nearest first. Empty means flood.
    pub fn next_hops(&self, destination: &PeerId, now: Instant) -> Vec<PeerId> {
        if self.direct.contains(destination) {
            return vec![destination.clone()];
        }

        let Some(entry) = self.routes.get(destination) else {
            return Vec::new();
        };

        let mut hops: Vec<(&PeerId, &NextHop)> = entry
            .next_hops
            .iter()
            .filter(|(via, hop)| self.direct.contains(*via) && self.is_live(hop, now))
            .collect();
        hops.sort_by(|a, b| a.1.distance.cmp(&b.1.distance).then(a.0.cmp(b.0)));
        hops.into_iter().map(|(via, _)| via.clone()).collect()
    }

    pub fn has_route(&self, destination: &PeerId, now: Instant) -> bool {
        !self.next_hops(destination, now).is_empty()
    }

    /// Shortest live distance to `destination`
    pub fn distance(&self, destination: &PeerId, now: Instant) -> Option<u8> {
        if self.direct.contains(destination) {
            return Some(1);
        }
        self.routes.get(destination).and_then(|entry| {
            entry
                .next_hops
                .iter()
                .filter(|(via, hop)| self.direct.contains(*via) && self.is_live(hop, now))
                .map(|(_, hop)| hop.distance)
                .min()
        })
    }

    pub fn entry(&self, destination: &PeerId) -> Option<&RouteEntry> {
        self.routes.get(destination)
    }

    /// Drop next hops not refreshed within the entry TTL
    ///
    /// Returns destinations that no longer have any route.
    pub fn expire(&mut self, now: Instant) -> Vec<PeerId> {
        let ttl = self.entry_ttl;
        for entry in self.routes.values_mut() {
            entry
                .next_hops
                .retain(|_, hop| now.saturating_duration_since(hop.last_seen) < ttl);
        }

        let mut lost: Vec<PeerId> = self
            .routes
            .iter()
            .filter(|(_, entry)| entry.is_empty())
            .map(|(dest, _)| dest.clone())
            .collect();
        lost.sort();

        self.routes.retain(|_, entry| !entry.is_empty());
        lost
    }

    /// Every reachable destination with its next hops and distance
    pub fn summary(&self, now: Instant) -> Vec<RouteSummary> {
        let mut destinations: HashSet<&PeerId> = self.direct.iter().collect();
        destinations.extend(self.routes.keys());

        let mut rows: Vec<RouteSummary> = destinations
            .into_iter()
            .filter(|dest| **dest != self.local)
            .filter_map(|dest| {
                let distance = self.distance(dest, now)?;
                Some(RouteSummary {
                    destination: dest.clone(),
                    next_hops: self.next_hops(dest, now),
                    distance,
                })
            })
            .collect();
        rows.sort_by(|a, b| a.destination.cmp(&b.destination));
        rows
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}
