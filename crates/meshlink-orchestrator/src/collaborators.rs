//! Collaborator interfaces
//!
//! Reputation, leader election and device monitoring live outside this
//! crate. The orchestrator consumes them through these traits; static
//! implementations are provided for nodes without the real services.

use meshlink_protocol::{PeerId, Tier};
use parking_lot::RwLock;

/// Connection outcome fed back to reputation learning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// The link came up
    Connected,
    /// The handshake never completed
    HandshakeFailed,
    /// The link went down
    Disconnected { expected: bool },
}

/// Peer trust as judged by the reputation service
pub trait ReputationSource: Send + Sync {
    /// Trust in `[0, 1]`
    fn trust_score(&self, peer: &PeerId) -> f64;

    /// Slot tier the peer deserves absent context flags
    fn recommended_priority(&self, peer: &PeerId) -> Tier;

    fn is_blacklisted(&self, peer: &PeerId) -> bool;

    fn record_outcome(&self, peer: &PeerId, outcome: ConnectionOutcome);
}

/// Cluster coordinator view
pub trait LeaderView: Send + Sync {
    fn is_leader(&self) -> bool;

    fn current_leader_id(&self) -> Option<PeerId>;
}

/// Device state
pub trait SystemMonitor: Send + Sync {
    /// Battery level in `[0, 1]`
    fn battery_level(&self) -> f64;

    /// System-wide load in `[0, 1]`
    fn network_load(&self) -> f64;
}

/// Leader view with a settable leader
#[derive(Debug, Default)]
pub struct StaticLeaderView {
    is_leader: RwLock<bool>,
    leader: RwLock<Option<PeerId>>,
}

impl StaticLeaderView {
    /// No coordinator: every node admits on its own
    pub fn none() -> Self {
        Self::default()
    }

    /// This node coordinates
    pub fn leader() -> Self {
        StaticLeaderView {
            is_leader: RwLock::new(true),
            leader: RwLock::new(None),
        }
    }

    /// Another node coordinates
    pub fn follower_of(leader: PeerId) -> Self {
        StaticLeaderView {
            is_leader: RwLock::new(false),
            leader: RwLock::new(Some(leader)),
        }
    }

    pub fn set(&self, is_leader: bool, leader: Option<PeerId>) {
        *self.is_leader.write() = is_leader;
        *self.leader.write() = leader;
    }
}

impl LeaderView for StaticLeaderView {
    fn is_leader(&self) -> bool {
        *self.is_leader.read()
    }

    fn current_leader_id(&self) -> Option<PeerId> {
        self.leader.read().clone()
    }
}

/// Monitor reporting values set by the host
#[derive(Debug)]
pub struct StaticSystemMonitor {
    battery: RwLock<f64>,
    load: RwLock<f64>,
}

impl StaticSystemMonitor {
    pub fn new(battery: f64, load: f64) -> Self {
        StaticSystemMonitor {
            battery: RwLock::new(battery),
            load: RwLock::new(load),
        }
    }

    pub fn set_battery_level(&self, level: f64) {
        *self.battery.write() = level;
    }

    pub fn set_network_load(&self, load: f64) {
        *self.load.write() = load;
    }
}

impl Default for StaticSystemMonitor {
    /// Mains power, idle network
    fn default() -> Self {
        Self::new(1.0, 0.0)
    }
}

impl SystemMonitor for StaticSystemMonitor {
    fn battery_level(&self) -> f64 {
        *self.battery.read()
    }

    fn network_load(&self) -> f64 {
        *self.load.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_leader_view() {
        let view = StaticLeaderView::none();
        assert!(!view.is_leader());
        assert!(view.current_leader_id().is_none());

        let leader = PeerId::new("boss").unwrap();
        view.set(false, Some(leader.clone()));
        assert_eq!(view.current_leader_id(), Some(leader));

        assert!(StaticLeaderView::leader().is_leader());
    }

    #[test]
    fn test_static_monitor() {
        let monitor = StaticSystemMonitor::default();
        assert_eq!(monitor.battery_level(), 1.0);
        monitor.set_battery_level(0.1);
        monitor.set_network_load(0.9);
        assert_eq!(monitor.battery_level(), 0.1);
        assert_eq!(monitor.network_load(), 0.9);
    }
}
