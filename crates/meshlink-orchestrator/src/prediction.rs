//! Disconnection prediction
//!
//! Tracks per-peer link quality (exponential moving averages of latency and
//! loss) together with a short history of connection outcomes, and turns
//! them into a risk classification the orchestrator uses when admitting
//! peers.

use dashmap::DashMap;
use meshlink_protocol::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::collaborators::ConnectionOutcome;

/// EMA factor for link samples (1/8)
const ALPHA: f64 = 0.125;

/// EMA factor for the latency baseline
const BASELINE_ALPHA: f64 = 0.1;

/// Latency below which the link is considered healthy
const LATENCY_FLOOR_MS: f64 = 200.0;

/// Latency span over which the latency factor grows from 0 to 1
const LATENCY_SPAN_MS: f64 = 800.0;

const IMMINENT_RISK: f64 = 0.7;
const LIKELY_RISK: f64 = 0.4;

/// Predicted link risk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectionRisk {
    Stable,
    /// Expected to drop within the given time
    Likely(Duration),
    /// Expected to drop very soon
    Imminent(Duration),
}

impl DisconnectionRisk {
    fn severity(&self) -> u8 {
        match self {
            DisconnectionRisk::Stable => 0,
            DisconnectionRisk::Likely(_) => 1,
            DisconnectionRisk::Imminent(_) => 2,
        }
    }

    /// Whether `self` is a worse class than `other`
    pub fn is_worse_than(&self, other: &DisconnectionRisk) -> bool {
        self.severity() > other.severity()
    }

    fn from_risk(risk: f64) -> Self {
        if risk >= IMMINENT_RISK {
            let secs = ((1.0 - risk) * 100.0).max(5.0);
            DisconnectionRisk::Imminent(Duration::from_secs_f64(secs))
        } else if risk >= LIKELY_RISK {
            DisconnectionRisk::Likely(Duration::from_secs_f64((1.0 - risk) * 300.0))
        } else {
            DisconnectionRisk::Stable
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorConfig {
    /// How long a computed prediction is reused
    pub prediction_ttl: Duration,
    /// Connection outcomes remembered per peer
    pub outcome_window: usize,
    /// Link samples needed before link metrics count
    pub min_samples: u64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        PredictorConfig {
            prediction_ttl: Duration::from_secs(10),
            outcome_window: 10,
            min_samples: 3,
        }
    }
}

/// Rolling link quality
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkMetrics {
    pub latency_ms: f64,
    pub loss_rate: f64,
    pub baseline_latency_ms: f64,
    pub sample_count: u64,
    pub last_updated: Option<Instant>,
}

impl LinkMetrics {
    /// Fold in one probe result; lost probes carry no latency
    pub fn update(&mut self, latency_ms: f64, lost: bool, now: Instant) {
        let latency_ms = if latency_ms.is_finite() {
            latency_ms.max(0.0)
        } else {
            0.0
        };
        let loss = if lost { 1.0 } else { 0.0 };

        if self.sample_count == 0 {
            self.loss_rate = loss;
        } else {
            self.loss_rate = ALPHA * loss + (1.0 - ALPHA) * self.loss_rate;
        }

        if !lost {
            if self.baseline_latency_ms == 0.0 {
                self.latency_ms = latency_ms;
                self.baseline_latency_ms = latency_ms;
            } else {
                self.latency_ms = ALPHA * latency_ms + (1.0 - ALPHA) * self.latency_ms;
                self.baseline_latency_ms = (1.0 - BASELINE_ALPHA) * self.baseline_latency_ms
                    + BASELINE_ALPHA * latency_ms;
            }
        }

        self.sample_count += 1;
        self.last_updated = Some(now);
    }

    /// Latency contribution in `[0, 1]`
    fn latency_factor(&self) -> f64 {
        let mut factor = ((self.latency_ms - LATENCY_FLOOR_MS) / LATENCY_SPAN_MS).clamp(0.0, 1.0);
        if self.baseline_latency_ms > 0.0 && self.latency_ms > 3.0 * self.baseline_latency_ms {
            factor *= 2.0;
        }
        factor.min(1.0)
    }
}

#[derive(Debug, Default)]
struct PeerLinkState {
    metrics: LinkMetrics,
    /// true for a clean outcome
    outcomes: VecDeque<bool>,
    cached: Option<(DisconnectionRisk, Instant)>,
    last_classification: Option<DisconnectionRisk>,
}

impl PeerLinkState {
    fn success_ratio(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 1.0;
        }
        let clean = self.outcomes.iter().filter(|ok| **ok).count();
        clean as f64 / self.outcomes.len() as f64
    }

    fn compute(&self, config: &PredictorConfig) -> DisconnectionRisk {
        let enough_samples = self.metrics.sample_count >= config.min_samples;
        if !enough_samples && self.outcomes.is_empty() {
            return DisconnectionRisk::Stable;
        }

        let (loss, latency) = if enough_samples {
            (self.metrics.loss_rate, self.metrics.latency_factor())
        } else {
            (0.0, 0.0)
        };
        let risk = 0.4 * loss + 0.3 * (1.0 - self.success_ratio()) + 0.3 * latency;
        DisconnectionRisk::from_risk(risk)
    }
}

/// A prediction produced by a new link sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictionUpdate {
    pub risk: DisconnectionRisk,
    /// The class got worse than the previous prediction
    pub worsened: bool,
}

/// Per-peer disconnection predictor
#[derive(Debug, Default)]
pub struct DisconnectionPredictor {
    config: PredictorConfig,
    peers: DashMap<PeerId, PeerLinkState>,
}

impl DisconnectionPredictor {
    pub fn new(config: PredictorConfig) -> Self {
        DisconnectionPredictor {
            config,
            peers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    /// Current prediction, reusing a cached one younger than `prediction_ttl`
    pub fn predict(&self, peer: &PeerId, now: Instant) -> DisconnectionRisk {
        let Some(mut state) = self.peers.get_mut(peer) else {
            return DisconnectionRisk::Stable;
        };

        if let Some((risk, at)) = state.cached {
            if now.saturating_duration_since(at) < self.config.prediction_ttl {
                return risk;
            }
        }

        let risk = state.compute(&self.config);
        state.cached = Some((risk, now));
        state.last_classification = Some(risk);
        risk
    }

    /// Fold in a probe result and reclassify
    pub fn record_sample(
        &self,
        peer: &PeerId,
        latency_ms: f64,
        lost: bool,
        now: Instant,
    ) -> PredictionUpdate {
        let mut state = self.peers.entry(peer.clone()).or_default();
        state.metrics.update(latency_ms, lost, now);

        let risk = state.compute(&self.config);
        let previous = state
            .last_classification
            .unwrap_or(DisconnectionRisk::Stable);
        let worsened = risk.is_worse_than(&previous);
        if worsened {
            debug!("Link to {} degraded: {:?} -> {:?}", peer, previous, risk);
        }

        state.cached = Some((risk, now));
        state.last_classification = Some(risk);
        PredictionUpdate { risk, worsened }
    }

    /// Remember a connection outcome
    pub fn record_outcome(&self, peer: &PeerId, outcome: ConnectionOutcome) {
        let clean = match outcome {
            ConnectionOutcome::Connected => true,
            ConnectionOutcome::Disconnected { expected } => expected,
            ConnectionOutcome::HandshakeFailed => false,
        };

        let mut state = self.peers.entry(peer.clone()).or_default();
        state.outcomes.push_back(clean);
        while state.outcomes.len() > self.config.outcome_window {
            state.outcomes.pop_front();
        }
        state.cached = None;
    }

    /// Drop the cached prediction and link metrics, keeping outcome history
    pub fn clear_link(&self, peer: &PeerId) {
        if let Some(mut state) = self.peers.get_mut(peer) {
            state.metrics = LinkMetrics::default();
            state.cached = None;
            state.last_classification = None;
        }
    }

    /// Forget everything about a peer
    pub fn forget(&self, peer: &PeerId) {
        self.peers.remove(peer);
    }

    pub fn metrics(&self, peer: &PeerId) -> Option<LinkMetrics> {
        self.peers.get(peer).map(|s| s.metrics.clone())
    }

    pub fn is_cached(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).is_some_and(|s| s.cached.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> PeerId {
        PeerId::new(name).unwrap()
    }

    #[test]
    fn test_unknown_peer_is_stable() {
        let predictor = DisconnectionPredictor::default();
        assert_eq!(
            predictor.predict(&peer("x"), Instant::now()),
            DisconnectionRisk::Stable
        );
    }

    #[test]
    fn test_too_few_samples_is_stable() {
        let predictor = DisconnectionPredictor::default();
        let now = Instant::now();
        predictor.record_sample(&peer("a"), 0.0, true, now);
        let update = predictor.record_sample(&peer("a"), 0.0, true, now);
        assert_eq!(update.risk, DisconnectionRisk::Stable);
    }

    #[test]
    fn test_healthy_link_is_stable() {
        let predictor = DisconnectionPredictor::default();
        let now = Instant::now();
        for _ in 0..10 {
            predictor.record_sample(&peer("a"), 40.0, false, now);
        }
        assert_eq!(predictor.predict(&peer("a"), now), DisconnectionRisk::Stable);
    }

    #[test]
    fn test_lossy_slow_link_is_imminent() {
        let predictor = DisconnectionPredictor::default();
        let now = Instant::now();
        for _ in 0..5 {
            predictor.record_outcome(&peer("a"), ConnectionOutcome::Disconnected { expected: false });
        }
        predictor.record_sample(&peer("a"), 50.0, false, now);
        for _ in 0..10 {
            predictor.record_sample(&peer("a"), 1500.0, false, now);
        }
        let mut last = None;
        for _ in 0..30 {
            last = Some(predictor.record_sample(&peer("a"), 0.0, true, now));
        }

        let update = last.unwrap();
        assert_eq!(update.risk, DisconnectionRisk::Imminent(Duration::from_secs(5)));
    }

    #[test]
    fn test_likely_when_history_is_bad_and_link_lossy() {
        let predictor = DisconnectionPredictor::default();
        let now = Instant::now();
        // Success ratio 0 gives 0.3; add loss to pass 0.4
        for _ in 0..4 {
            predictor.record_outcome(&peer("a"), ConnectionOutcome::HandshakeFailed);
        }
        predictor.record_sample(&peer("a"), 100.0, false, now);
        predictor.record_sample(&peer("a"), 100.0, true, now);
        let update = predictor.record_sample(&peer("a"), 100.0, true, now);

        // loss = ((0 * 7/8) + 1/8) * 7/8 + 1/8 = 0.234; risk = 0.094 + 0.3 = 0.394
        assert_eq!(update.risk, DisconnectionRisk::Stable);

        let update = predictor.record_sample(&peer("a"), 100.0, true, now);
        // loss = 0.330; risk = 0.432
        match update.risk {
            DisconnectionRisk::Likely(within) => {
                assert!(within > Duration::from_secs(160) && within < Duration::from_secs(175))
            }
            other => panic!("expected likely, got {:?}", other),
        }
        assert!(update.worsened);
    }

    #[test]
    fn test_worsened_only_on_class_change() {
        let predictor = DisconnectionPredictor::default();
        let now = Instant::now();
        for _ in 0..10 {
            predictor.record_outcome(&peer("a"), ConnectionOutcome::HandshakeFailed);
        }
        for _ in 0..3 {
            predictor.record_sample(&peer("a"), 100.0, true, now);
        }
        let first = predictor.record_sample(&peer("a"), 100.0, true, now);
        let second = predictor.record_sample(&peer("a"), 100.0, true, now);
        assert!(first.risk.is_worse_than(&DisconnectionRisk::Stable));
        assert!(!second.worsened);
    }

    #[test]
    fn test_outcome_ring_is_bounded() {
        let predictor = DisconnectionPredictor::default();
        let now = Instant::now();
        for _ in 0..10 {
            predictor.record_outcome(&peer("a"), ConnectionOutcome::HandshakeFailed);
        }
        for _ in 0..10 {
            predictor.record_outcome(&peer("a"), ConnectionOutcome::Connected);
        }
        // Only clean outcomes remain in the window
        assert_eq!(predictor.predict(&peer("a"), now), DisconnectionRisk::Stable);
    }

    #[test]
    fn test_prediction_is_cached_until_ttl() {
        let predictor = DisconnectionPredictor::default();
        let start = Instant::now();
        assert_eq!(predictor.predict(&peer("a"), start), DisconnectionRisk::Stable);
        // Unknown peers are never cached
        assert!(!predictor.is_cached(&peer("a")));

        predictor.record_sample(&peer("a"), 50.0, false, start);
        assert!(predictor.is_cached(&peer("a")));
        assert_eq!(
            predictor.predict(&peer("a"), start + Duration::from_secs(11)),
            DisconnectionRisk::Stable
        );
    }

    #[test]
    fn test_clear_link_keeps_history() {
        let predictor = DisconnectionPredictor::default();
        let now = Instant::now();
        for _ in 0..10 {
            predictor.record_outcome(&peer("a"), ConnectionOutcome::HandshakeFailed);
        }
        predictor.record_sample(&peer("a"), 50.0, false, now);
        predictor.clear_link(&peer("a"));

        assert!(!predictor.is_cached(&peer("a")));
        assert_eq!(predictor.metrics(&peer("a")).unwrap().sample_count, 0);
        // History alone: risk = 0.3, still stable
        assert_eq!(predictor.predict(&peer("a"), now), DisconnectionRisk::Stable);

        predictor.forget(&peer("a"));
        assert!(predictor.metrics(&peer("a")).is_none());
    }

    #[test]
    fn test_latency_factor_doubles_over_baseline() {
        let mut metrics = LinkMetrics {
            latency_ms: 600.0,
            baseline_latency_ms: 100.0,
            ..Default::default()
        };
        assert!((metrics.latency_factor() - 1.0).abs() < 1e-9);
        metrics.baseline_latency_ms = 500.0;
        assert!((metrics.latency_factor() - 0.5).abs() < 1e-9);
    }
}
