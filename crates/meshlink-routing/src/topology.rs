//! Topology protocol
//!
//! Periodic and eager adjacency broadcasts, and merging of received
//! broadcasts into the shared routing table.

use meshlink_protocol::topology::TOPOLOGY_TTL;
use meshlink_protocol::{PeerId, TopologyMessage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::deduplication::DeduplicationCache;
use crate::error::{Result, RoutingError};
use crate::routing_table::RoutingTable;

/// Topology protocol settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Periodic broadcast interval
    pub broadcast_interval: Duration,
    /// Routes expire after this many intervals without a refresh
    pub missed_intervals: u32,
    /// Flood TTL of our own broadcasts
    pub ttl: u8,
    /// Minimum gap between eager (link change) broadcasts
    pub eager_min_gap: Duration,
    /// Size of the seen-broadcast cache
    pub dedup_capacity: usize,
}

impl TopologyConfig {
    pub fn entry_ttl(&self) -> Duration {
        self.broadcast_interval
            .saturating_mul(self.missed_intervals.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.broadcast_interval.is_zero() {
            return Err(RoutingError::InvalidConfig(
                "topology broadcast interval must be non-zero".to_string(),
            ));
        }
        if self.ttl == 0 || self.ttl > meshlink_protocol::message::MAX_TTL {
            return Err(RoutingError::InvalidConfig(format!(
                "topology ttl {} out of range",
                self.ttl
            )));
        }
        Ok(())
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        TopologyConfig {
            broadcast_interval: Duration::from_secs(30),
            missed_intervals: 3,
            ttl: TOPOLOGY_TTL,
            eager_min_gap: Duration::from_secs(1),
            dedup_capacity: 4096,
        }
    }
}

/// What to do with a received broadcast
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyDisposition {
    /// Destinations updated in the routing table
    pub merged: usize,
    /// Copy to forward and the peers to forward it to
    pub relay: Option<(TopologyMessage, Vec<PeerId>)>,
}

impl TopologyDisposition {
    fn ignored() -> Self {
        TopologyDisposition {
            merged: 0,
            relay: None,
        }
    }
}

#[derive(Debug, Default)]
struct BroadcastState {
    sequence: u32,
    last_eager: Option<Instant>,
}

/// Adjacency broadcaster and merger
pub struct TopologyProtocol {
    local: PeerId,
    config: TopologyConfig,
    table: Arc<RwLock<RoutingTable>>,
    seen: Arc<RwLock<DeduplicationCache>>,
    state: Arc<RwLock<BroadcastState>>,
}

impl TopologyProtocol {
    pub fn new(local: PeerId, config: TopologyConfig, table: Arc<RwLock<RoutingTable>>) -> Self {
        let seen = DeduplicationCache::new(config.dedup_capacity, config.entry_ttl());
        TopologyProtocol {
            local,
            config,
            table,
            seen: Arc::new(RwLock::new(seen)),
            state: Arc::new(RwLock::new(BroadcastState::default())),
        }
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    pub fn table(&self) -> Arc<RwLock<RoutingTable>> {
        Arc::clone(&self.table)
    }

    async fn build(&self, now: Instant) -> TopologyMessage {
        let direct_peers = self.table.read().await.direct_peers();
        let sequence = {
            let mut state = self.state.write().await;
            state.sequence = state.sequence.wrapping_add(1);
            state.sequence
        };

        let message = TopologyMessage::new(self.local.clone(), direct_peers, sequence, self.config.ttl);
        // Our own broadcast coming back around is dropped as a duplicate
        self.seen.write().await.mark_seen(message.id, now);
        message
    }

    /// Periodic announcement of our direct links
    pub async fn local_broadcast(&self, now: Instant) -> TopologyMessage {
        let message = self.build(now).await;
        debug!(
            "Topology broadcast #{} with {} direct peers",
            message.sequence,
            message.direct_peers.len()
        );
        message
    }

    /// Announcement after a link change, at most one per `eager_min_gap`
    pub async fn eager_broadcast(&self, now: Instant) -> Option<TopologyMessage> {
        {
            let mut state = self.state.write().await;
            if let Some(last) = state.last_eager {
                if now.saturating_duration_since(last) < self.config.eager_min_gap {
                    trace!("Eager topology broadcast suppressed");
                    return None;
                }
            }
            state.last_eager = Some(now);
        }

        let message = self.build(now).await;
        debug!(
            "Eager topology broadcast #{} with {} direct peers",
            message.sequence,
            message.direct_peers.len()
        );
        Some(message)
    }

    /// Merge a broadcast received over the link to `from`
    pub async fn handle_inbound(
        &self,
        message: TopologyMessage,
        from: &PeerId,
        now: Instant,
    ) -> Result<TopologyDisposition> {
        message.validate()?;

        if !self.seen.write().await.should_process(message.id, now) {
            trace!("Duplicate topology broadcast {} from {}", message.id, from);
            return Ok(TopologyDisposition::ignored());
        }

        if message.sender == self.local {
            return Ok(TopologyDisposition::ignored());
        }

        let (merged, direct) = {
            let mut table = self.table.write().await;
            let merged = table.record_topology(&message, from, now);
            (merged, table.direct_peers())
        };

        let relay = message.relayed_by(&self.local).and_then(|relayed| {
            let targets: Vec<PeerId> = direct
                .into_iter()
                .filter(|p| p != from && !message.flood.has_visited(p))
                .collect();
            if targets.is_empty() {
                None
            } else {
                Some((relayed, targets))
            }
        });

        debug!(
            "Merged topology from {} via {} ({} destinations, relay: {})",
            message.sender,
            from,
            merged,
            relay.is_some()
        );

        Ok(TopologyDisposition { merged, relay })
    }

    /// Drop stale routes
    pub async fn expire(&self, now: Instant) -> Vec<PeerId> {
        let lost = self.table.write().await.expire(now);
        if !lost.is_empty() {
            debug!("Routes expired for {} destinations", lost.len());
        }
        self.seen.write().await.cleanup_expired(now);
        lost
    }
}
