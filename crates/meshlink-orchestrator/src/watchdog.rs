//! Handshake watchdog and stuck-peer detection
//!
//! Both are plain state machines driven by the node's sweep worker.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use meshlink_protocol::PeerId;
use tracing::warn;

/// At most one handshake per peer; abandoned attempts are released on sweep
#[derive(Debug)]
pub struct HandshakeWatchdog {
    timeout: Duration,
    in_flight: HashMap<PeerId, Instant>,
}

impl HandshakeWatchdog {
    pub fn new(timeout: Duration) -> Self {
        HandshakeWatchdog {
            timeout,
            in_flight: HashMap::new(),
        }
    }

    /// Take the handshake lock for `peer`; false if one is already running
    pub fn begin(&mut self, peer: &PeerId, now: Instant) -> bool {
        if self.in_flight.contains_key(peer) {
            return false;
        }
        self.in_flight.insert(peer.clone(), now);
        true
    }

    pub fn finish(&mut self, peer: &PeerId) -> bool {
        self.in_flight.remove(peer).is_some()
    }

    pub fn is_in_flight(&self, peer: &PeerId) -> bool {
        self.in_flight.contains_key(peer)
    }

    /// Release locks held longer than the timeout
    pub fn sweep(&mut self, now: Instant) -> Vec<PeerId> {
        let timeout = self.timeout;
        let mut stale: Vec<PeerId> = self
            .in_flight
            .iter()
            .filter(|(_, started)| now.saturating_duration_since(**started) >= timeout)
            .map(|(peer, _)| peer.clone())
            .collect();
        stale.sort();

        for peer in &stale {
            self.in_flight.remove(peer);
            warn!("Handshake with {} timed out after {:?}", peer, timeout);
        }
        stale
    }

    pub fn clear(&mut self) {
        self.in_flight.clear();
    }
}

#[derive(Debug, Clone, Copy)]
struct Wait {
    since: Instant,
    strikes: u32,
}

/// Detects peers we have been waiting on for too long
///
/// Each time a peer is reported stuck the threshold for it doubles, up to
/// `max_threshold`, so a peer that keeps stalling is not hammered with
/// reconnects.
#[derive(Debug)]
pub struct StuckDetector {
    base_threshold: Duration,
    max_threshold: Duration,
    waiting: HashMap<PeerId, Wait>,
}

impl StuckDetector {
    pub fn new(base_threshold: Duration, max_threshold: Duration) -> Self {
        StuckDetector {
            base_threshold,
            max_threshold: max_threshold.max(base_threshold),
            waiting: HashMap::new(),
        }
    }

    /// Start waiting on `peer` unless already waiting
    pub fn waiting_on(&mut self, peer: &PeerId, now: Instant) {
        self.waiting
            .entry(peer.clone())
            .or_insert(Wait { since: now, strikes: 0 });
    }

    /// The peer answered; forget its strikes
    pub fn resolved(&mut self, peer: &PeerId) {
        self.waiting.remove(peer);
    }

    pub fn is_waiting_on(&self, peer: &PeerId) -> bool {
        self.waiting.contains_key(peer)
    }

    fn threshold(&self, strikes: u32) -> Duration {
        let factor = 2u32.saturating_pow(strikes.min(16));
        self.base_threshold
            .saturating_mul(factor)
            .min(self.max_threshold)
    }

    /// Peers waited on beyond their threshold
    ///
    /// Reported peers stay tracked with the wait restarted and the next
    /// threshold doubled.
    pub fn sweep(&mut self, now: Instant) -> Vec<PeerId> {
        let mut stuck = Vec::new();
        let thresholds: Vec<(PeerId, Duration)> = self
            .waiting
            .iter()
            .map(|(peer, wait)| (peer.clone(), self.threshold(wait.strikes)))
            .collect();

        for (peer, threshold) in thresholds {
            if let Some(wait) = self.waiting.get_mut(&peer) {
                if now.saturating_duration_since(wait.since) >= threshold {
                    wait.since = now;
                    wait.strikes = wait.strikes.saturating_add(1);
                    warn!("Peer {} stuck for {:?}, strike {}", peer, threshold, wait.strikes);
                    stuck.push(peer);
                }
            }
        }
        stuck.sort();
        stuck
    }

    pub fn clear(&mut self) {
        self.waiting.clear();
    }
}
