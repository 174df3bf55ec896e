//! Connection orchestrator
//!
//! Decides whether a peer may connect, executes the decision against the
//! slot pool and keeps the cluster view, reputation and link predictions in
//! step with connects and disconnects.

use dashmap::{DashMap, DashSet};
use meshlink_protocol::{PeerId, Tier};
use meshlink_slots::SlotManager;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::collaborators::{ConnectionOutcome, LeaderView, ReputationSource, SystemMonitor};
use crate::context::{ConnectionContext, ConnectionRequest};
use crate::decision::{AcceptCondition, AdmissionResult, OrchestrationDecision, RejectReason};
use crate::error::{OrchestratorError, Result};
use crate::prediction::{
    DisconnectionPredictor, DisconnectionRisk, PredictionUpdate, PredictorConfig,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Admission thresholds and delays
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Battery level below which untrusted peers are refused
    pub critical_battery: f64,
    /// Trust that overrides low battery and earns a retry when slots are full
    pub auto_accept_floor: f64,
    /// Trust below which peers are refused outright
    pub auto_reject_floor: f64,
    pub slot_retry_delay: Duration,
    /// Network load above which non-critical requests wait
    pub high_load_threshold: f64,
    pub high_load_delay: Duration,
    /// Wait imposed by followers while a coordinator exists
    pub coordinator_delay: Duration,
    /// Imminent predictions within this horizon are refused
    pub imminent_reject_within: Duration,
    /// Likely predictions within this horizon are admitted conditionally
    pub likely_conditional_within: Duration,
    pub prediction_ttl: Duration,
    /// Idle timeout applied to conditionally admitted peers
    pub conditional_idle_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            critical_battery: 0.15,
            auto_accept_floor: 0.7,
            auto_reject_floor: 0.2,
            slot_retry_delay: Duration::from_secs(5),
            high_load_threshold: 0.85,
            high_load_delay: Duration::from_secs(30),
            coordinator_delay: Duration::from_secs(2),
            imminent_reject_within: Duration::from_secs(30),
            likely_conditional_within: Duration::from_secs(120),
            prediction_ttl: Duration::from_secs(10),
            conditional_idle_timeout: Duration::from_secs(60),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, value: f64| {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(OrchestratorError::InvalidConfig(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )))
            }
        };
        unit("critical_battery", self.critical_battery)?;
        unit("auto_accept_floor", self.auto_accept_floor)?;
        unit("auto_reject_floor", self.auto_reject_floor)?;
        unit("high_load_threshold", self.high_load_threshold)?;

        if self.auto_reject_floor > self.auto_accept_floor {
            return Err(OrchestratorError::InvalidConfig(
                "auto_reject_floor exceeds auto_accept_floor".to_string(),
            ));
        }
        if self.conditional_idle_timeout.is_zero() {
            return Err(OrchestratorError::InvalidConfig(
                "conditional_idle_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Why a peer went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Either side asked to disconnect
    Requested,
    /// Displaced by a higher-priority peer
    Evicted,
    IdleTimeout,
    /// The link dropped unexpectedly
    LinkLost,
    HandshakeTimeout,
    /// The transport session was restarted
    TransportRestart,
}

impl DisconnectReason {
    /// Whether the disconnect was our own doing rather than a link failure
    pub fn expected(&self) -> bool {
        matches!(
            self,
            DisconnectReason::Requested
                | DisconnectReason::Evicted
                | DisconnectReason::IdleTimeout
                | DisconnectReason::TransportRestart
        )
    }

    fn outcome(&self) -> ConnectionOutcome {
        match self {
            DisconnectReason::HandshakeTimeout => ConnectionOutcome::HandshakeFailed,
            other => ConnectionOutcome::Disconnected {
                expected: other.expected(),
            },
        }
    }
}

/// Orchestrator notification
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    PeerAdmitted {
        peer: PeerId,
        tier: Tier,
        slot_id: usize,
        conditions: Vec<AcceptCondition>,
    },
    PeerRejected {
        peer: PeerId,
        reason: RejectReason,
    },
    PeerPostponed {
        peer: PeerId,
        resume_at: Instant,
    },
    /// `peer` lost its slot to `by`
    PeerEvicted {
        peer: PeerId,
        tier: Tier,
        by: PeerId,
    },
    PeerDisconnected {
        peer: PeerId,
        reason: DisconnectReason,
    },
    DisconnectionPredicted {
        peer: PeerId,
        risk: DisconnectionRisk,
    },
}

/// An admitted peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMember {
    pub peer: PeerId,
    pub tier: Tier,
    pub slot_id: usize,
    pub admitted_at: Instant,
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

fn sanitize(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        fallback
    }
}

/// Admission control for the local node
pub struct Orchestrator {
    config: OrchestratorConfig,
    slots: SlotManager,
    reputation: Arc<dyn ReputationSource>,
    leader: Arc<dyn LeaderView>,
    monitor: Arc<dyn SystemMonitor>,
    predictor: DisconnectionPredictor,
    cluster: DashMap<PeerId, ClusterMember>,
    /// Conditionally admitted peers probed more often
    monitored: DashSet<PeerId>,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        slots: SlotManager,
        reputation: Arc<dyn ReputationSource>,
        leader: Arc<dyn LeaderView>,
        monitor: Arc<dyn SystemMonitor>,
    ) -> Result<Self> {
        config.validate()?;
        let predictor = DisconnectionPredictor::new(PredictorConfig {
            prediction_ttl: config.prediction_ttl,
            ..PredictorConfig::default()
        });
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Orchestrator {
            config,
            slots,
            reputation,
            leader,
            monitor,
            predictor,
            cluster: DashMap::new(),
            monitored: DashSet::new(),
            events,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn slots(&self) -> &SlotManager {
        &self.slots
    }

    pub fn predictor(&self) -> &DisconnectionPredictor {
        &self.predictor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.events.send(event);
    }

    /// Decide on a connection request without side effects
    pub fn evaluate(&self, peer: &PeerId, context: &str) -> OrchestrationDecision {
        self.evaluate_at(peer, context, now())
    }

    pub fn evaluate_at(&self, peer: &PeerId, context: &str, now: Instant) -> OrchestrationDecision {
        self.decide(peer, &ConnectionContext::parse(context), now).0
    }

    /// Tier the peer would be admitted at with this context
    pub fn effective_tier(&self, peer: &PeerId, context: &ConnectionContext) -> Tier {
        context.effective_tier(self.reputation.recommended_priority(peer))
    }

    fn decide(
        &self,
        peer: &PeerId,
        context: &ConnectionContext,
        now: Instant,
    ) -> (OrchestrationDecision, Tier) {
        let tier = self.effective_tier(peer, context);
        let reject = |reason| (OrchestrationDecision::Reject(reason), tier);
        let postpone = |delay| (OrchestrationDecision::Postpone { resume_at: now + delay }, tier);

        if self.reputation.is_blacklisted(peer) {
            return reject(RejectReason::Blacklisted);
        }

        // Unknown trust is no trust; unknown battery is not an emergency
        let trust = sanitize(self.reputation.trust_score(peer), 0.0);
        let battery = sanitize(self.monitor.battery_level(), 1.0);
        let load = sanitize(self.monitor.network_load(), 0.0);

        if battery < self.config.critical_battery && trust < self.config.auto_accept_floor {
            return reject(RejectReason::LowBatteryUntrusted);
        }
        if trust < self.config.auto_reject_floor {
            return reject(RejectReason::LowReputation);
        }

        if !self.slots.can_admit(peer, tier) {
            if trust > self.config.auto_accept_floor {
                return postpone(self.config.slot_retry_delay);
            }
            return reject(RejectReason::NoSlotAvailable);
        }

        if load > self.config.high_load_threshold && tier != Tier::Critical {
            return postpone(self.config.high_load_delay);
        }

        if !self.leader.is_leader() {
            if let Some(leader) = self.leader.current_leader_id() {
                // The coordinator itself never waits on itself
                if &leader != peer {
                    return postpone(self.config.coordinator_delay);
                }
            }
        }

        match self.predictor.predict(peer, now) {
            DisconnectionRisk::Imminent(within) if within <= self.config.imminent_reject_within => {
                reject(RejectReason::UnstableLink)
            }
            DisconnectionRisk::Likely(within)
                if within <= self.config.likely_conditional_within =>
            {
                (
                    OrchestrationDecision::ConditionalAccept(vec![
                        AcceptCondition::DegradedMonitoring,
                        AcceptCondition::ShortIdleTimeout(self.config.conditional_idle_timeout),
                    ]),
                    tier,
                )
            }
            _ => (OrchestrationDecision::Accept, tier),
        }
    }

    /// Evaluate and, when admitted, allocate the slot
    pub fn execute_connection(&self, peer: &PeerId, context: &str) -> AdmissionResult {
        self.execute_request(&self.request(peer, context))
    }

    /// A request from `peer` arriving now with a raw context string
    pub fn request(&self, peer: &PeerId, context: &str) -> ConnectionRequest {
        let context = ConnectionContext::parse(context);
        ConnectionRequest::new(
            peer.clone(),
            self.reputation.recommended_priority(peer),
            context,
            now(),
        )
    }

    /// Run admission for a request, possibly one postponed earlier
    ///
    /// The tier is derived again from the request's context so a changed
    /// reputation is taken into account.
    pub fn execute_request(&self, request: &ConnectionRequest) -> AdmissionResult {
        let now = now();
        let peer = &request.peer;
        let (decision, tier) = self.decide(peer, &request.context, now);
        if tier != request.requested_tier {
            debug!(
                "{} asked at {} tier, now admitted at {}",
                peer, request.requested_tier, tier
            );
        }

        let conditions = match decision {
            OrchestrationDecision::Accept => Vec::new(),
            OrchestrationDecision::ConditionalAccept(conditions) => conditions,
            OrchestrationDecision::Reject(reason) => return self.rejected(peer, reason),
            OrchestrationDecision::Postpone { resume_at } => {
                debug!("Postponed {} until {:?}", peer, resume_at);
                self.emit(OrchestratorEvent::PeerPostponed {
                    peer: peer.clone(),
                    resume_at,
                });
                return AdmissionResult::Postponed { resume_at };
            }
        };

        let Some(allocation) = self.slots.allocate(peer, tier) else {
            warn!("Slot for {} vanished between evaluation and allocation", peer);
            return self.rejected(peer, RejectReason::SlotRace);
        };

        for condition in &conditions {
            match condition {
                AcceptCondition::DegradedMonitoring => {
                    self.monitored.insert(peer.clone());
                }
                AcceptCondition::ShortIdleTimeout(limit) => {
                    self.slots.limit_idle_timeout(peer, *limit);
                }
            }
        }

        if let Some(eviction) = &allocation.evicted {
            self.cluster.remove(&eviction.peer);
            self.monitored.remove(&eviction.peer);
            self.emit(OrchestratorEvent::PeerEvicted {
                peer: eviction.peer.clone(),
                tier: eviction.tier,
                by: peer.clone(),
            });
        }

        if !allocation.existing {
            self.cluster.insert(
                peer.clone(),
                ClusterMember {
                    peer: peer.clone(),
                    tier,
                    slot_id: allocation.slot_id,
                    admitted_at: now,
                },
            );
            self.reputation
                .record_outcome(peer, ConnectionOutcome::Connected);
            self.predictor
                .record_outcome(peer, ConnectionOutcome::Connected);

            info!(
                "Admitted {} at {} tier into slot {}{}",
                peer,
                tier,
                allocation.slot_id,
                if conditions.is_empty() { "" } else { " (conditional)" }
            );
            self.emit(OrchestratorEvent::PeerAdmitted {
                peer: peer.clone(),
                tier,
                slot_id: allocation.slot_id,
                conditions: conditions.clone(),
            });
        }

        AdmissionResult::Admitted {
            slot_id: allocation.slot_id,
            tier,
            conditions,
            evicted: allocation.evicted,
        }
    }

    fn rejected(&self, peer: &PeerId, reason: RejectReason) -> AdmissionResult {
        info!("Rejected {}: {}", peer, reason);
        self.emit(OrchestratorEvent::PeerRejected {
            peer: peer.clone(),
            reason,
        });
        AdmissionResult::Rejected(reason)
    }

    /// Tear down everything held for `peer`
    ///
    /// Safe to call for peers that never held a slot.
    pub fn handle_disconnection(&self, peer: &PeerId, reason: DisconnectReason) {
        let slot = self.slots.release(peer);
        let outcome = reason.outcome();
        self.reputation.record_outcome(peer, outcome);
        self.predictor.record_outcome(peer, outcome);
        self.predictor.clear_link(peer);
        self.cluster.remove(peer);
        self.monitored.remove(peer);

        debug!("{} disconnected ({:?}), freed slot {:?}", peer, reason, slot);
        self.emit(OrchestratorEvent::PeerDisconnected {
            peer: peer.clone(),
            reason,
        });
    }

    /// Feed a probe result into the predictor
    pub fn record_link_sample(&self, peer: &PeerId, latency_ms: f64, lost: bool) -> PredictionUpdate {
        let update = self.predictor.record_sample(peer, latency_ms, lost, now());
        if update.worsened && update.risk != DisconnectionRisk::Stable {
            warn!("Predicted disconnection of {}: {:?}", peer, update.risk);
            self.emit(OrchestratorEvent::DisconnectionPredicted {
                peer: peer.clone(),
                risk: update.risk,
            });
        }
        update
    }

    pub fn cluster_members(&self) -> Vec<ClusterMember> {
        let mut members: Vec<ClusterMember> =
            self.cluster.iter().map(|m| m.value().clone()).collect();
        members.sort_by(|a, b| a.peer.cmp(&b.peer));
        members
    }

    pub fn is_member(&self, peer: &PeerId) -> bool {
        self.cluster.contains_key(peer)
    }

    pub fn is_monitored(&self, peer: &PeerId) -> bool {
        self.monitored.contains(peer)
    }

    /// Forget all admitted peers after a transport restart
    pub fn reset(&self) -> Vec<PeerId> {
        let released = self.slots.release_all();
        self.cluster.clear();
        self.monitored.clear();
        for peer in &released {
            self.predictor.clear_link(peer);
            self.emit(OrchestratorEvent::PeerDisconnected {
                peer: peer.clone(),
                reason: DisconnectReason::TransportRestart,
            });
        }
        released
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("slots", &self.slots)
            .field("members", &self.cluster.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{StaticLeaderView, StaticSystemMonitor};
    use meshlink_slots::{SlotPoolConfig, TierCounts};
    use parking_lot::{Mutex, RwLock};
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    struct FixedReputation {
        trust: RwLock<HashMap<PeerId, f64>>,
        tiers: RwLock<HashMap<PeerId, Tier>>,
        blacklist: RwLock<HashSet<PeerId>>,
        outcomes: Mutex<Vec<(PeerId, ConnectionOutcome)>>,
    }

    impl FixedReputation {
        fn set(&self, peer: &PeerId, trust: f64, tier: Tier) {
            self.trust.write().insert(peer.clone(), trust);
            self.tiers.write().insert(peer.clone(), tier);
        }
    }

    impl ReputationSource for FixedReputation {
        fn trust_score(&self, peer: &PeerId) -> f64 {
            self.trust.read().get(peer).copied().unwrap_or(0.5)
        }

        fn recommended_priority(&self, peer: &PeerId) -> Tier {
            self.tiers.read().get(peer).copied().unwrap_or(Tier::Normal)
        }

        fn is_blacklisted(&self, peer: &PeerId) -> bool {
            self.blacklist.read().contains(peer)
        }

        fn record_outcome(&self, peer: &PeerId, outcome: ConnectionOutcome) {
            self.outcomes.lock().push((peer.clone(), outcome));
        }
    }

    struct Fixture {
        orchestrator: Orchestrator,
        reputation: Arc<FixedReputation>,
        leader: Arc<StaticLeaderView>,
        monitor: Arc<StaticSystemMonitor>,
    }

    fn fixture(counts: TierCounts) -> Fixture {
        let slots = SlotManager::new(SlotPoolConfig {
            tier_counts: counts,
            ..SlotPoolConfig::default()
        })
        .unwrap();
        let reputation = Arc::new(FixedReputation::default());
        let leader = Arc::new(StaticLeaderView::none());
        let monitor = Arc::new(StaticSystemMonitor::default());
        let orchestrator = Orchestrator::new(
            OrchestratorConfig::default(),
            slots,
            reputation.clone(),
            leader.clone(),
            monitor.clone(),
        )
        .unwrap();
        Fixture {
            orchestrator,
            reputation,
            leader,
            monitor,
        }
    }

    fn peer(name: &str) -> PeerId {
        PeerId::new(name).unwrap()
    }

    fn single_normal_slot() -> Fixture {
        fixture(TierCounts::new(0, 0, 1, 0))
    }

    #[test]
    fn test_config_validation() {
        assert!(OrchestratorConfig::default().validate().is_ok());

        let config = OrchestratorConfig {
            auto_reject_floor: 0.9,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = OrchestratorConfig {
            critical_battery: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_accept_by_default() {
        let f = single_normal_slot();
        assert_eq!(
            f.orchestrator.evaluate(&peer("a"), ""),
            OrchestrationDecision::Accept
        );
    }

    #[test]
    fn test_blacklist_wins_over_everything() {
        let f = single_normal_slot();
        f.reputation.blacklist.write().insert(peer("a"));
        f.reputation.set(&peer("a"), 1.0, Tier::High);
        assert_eq!(
            f.orchestrator.evaluate(&peer("a"), "emergency"),
            OrchestrationDecision::Reject(RejectReason::Blacklisted)
        );
    }

    #[test]
    fn test_low_battery_refuses_untrusted_peers() {
        let f = single_normal_slot();
        f.monitor.set_battery_level(0.1);

        f.reputation.set(&peer("stranger"), 0.5, Tier::Normal);
        assert_eq!(
            f.orchestrator.evaluate(&peer("stranger"), ""),
            OrchestrationDecision::Reject(RejectReason::LowBatteryUntrusted)
        );

        f.reputation.set(&peer("friend"), 0.9, Tier::Normal);
        assert_eq!(
            f.orchestrator.evaluate(&peer("friend"), ""),
            OrchestrationDecision::Accept
        );
    }

    #[test]
    fn test_low_reputation_rejected() {
        let f = single_normal_slot();
        f.reputation.set(&peer("a"), 0.1, Tier::Normal);
        assert_eq!(
            f.orchestrator.evaluate(&peer("a"), ""),
            OrchestrationDecision::Reject(RejectReason::LowReputation)
        );
    }

    #[test]
    fn test_non_finite_inputs_are_sanitized() {
        let f = single_normal_slot();
        f.reputation.set(&peer("a"), f64::NAN, Tier::Normal);
        assert_eq!(
            f.orchestrator.evaluate(&peer("a"), ""),
            OrchestrationDecision::Reject(RejectReason::LowReputation)
        );

        f.monitor.set_battery_level(f64::NAN);
        f.reputation.set(&peer("b"), 0.5, Tier::Normal);
        assert_eq!(
            f.orchestrator.evaluate(&peer("b"), ""),
            OrchestrationDecision::Accept
        );
    }

    #[test]
    fn test_full_pool_rejects_or_postpones_by_trust() {
        let f = single_normal_slot();
        assert!(f.orchestrator.execute_connection(&peer("holder"), "").is_admitted());

        let now = Instant::now();
        assert_eq!(
            f.orchestrator.evaluate_at(&peer("a"), "", now),
            OrchestrationDecision::Reject(RejectReason::NoSlotAvailable)
        );

        f.reputation.set(&peer("trusted"), 0.9, Tier::Normal);
        assert_eq!(
            f.orchestrator.evaluate_at(&peer("trusted"), "", now),
            OrchestrationDecision::Postpone {
                resume_at: now + Duration::from_secs(5)
            }
        );
    }

    #[test]
    fn test_emergency_evicts_lower_tier() {
        let f = single_normal_slot();
        let mut events = f.orchestrator.subscribe();
        assert!(f.orchestrator.execute_connection(&peer("holder"), "").is_admitted());

        let result = f.orchestrator.execute_connection(&peer("rescuer"), "EMERGENCY");
        match &result {
            AdmissionResult::Admitted { tier, evicted, .. } => {
                assert_eq!(*tier, Tier::Critical);
                assert_eq!(evicted.as_ref().map(|e| e.peer.clone()), Some(peer("holder")));
            }
            other => panic!("expected admission, got {:?}", other),
        }
        assert_eq!(result.evicted_peer(), Some(&peer("holder")));
        assert!(!f.orchestrator.is_member(&peer("holder")));
        assert!(f.orchestrator.is_member(&peer("rescuer")));

        let mut saw_eviction = false;
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::PeerEvicted { peer: p, by, .. } = event {
                assert_eq!(p, peer("holder"));
                assert_eq!(by, peer("rescuer"));
                saw_eviction = true;
            }
        }
        assert!(saw_eviction);
    }

    #[test]
    fn test_high_load_postpones_non_critical() {
        let f = single_normal_slot();
        f.monitor.set_network_load(0.95);
        let now = Instant::now();

        assert_eq!(
            f.orchestrator.evaluate_at(&peer("a"), "", now),
            OrchestrationDecision::Postpone {
                resume_at: now + Duration::from_secs(30)
            }
        );
        assert_eq!(
            f.orchestrator.evaluate_at(&peer("a"), "critical", now),
            OrchestrationDecision::Accept
        );
    }

    #[test]
    fn test_followers_defer_to_coordinator() {
        let f = single_normal_slot();
        f.leader.set(false, Some(peer("boss")));
        let now = Instant::now();

        assert_eq!(
            f.orchestrator.evaluate_at(&peer("a"), "", now),
            OrchestrationDecision::Postpone {
                resume_at: now + Duration::from_secs(2)
            }
        );
        assert_eq!(
            f.orchestrator.evaluate_at(&peer("boss"), "", now),
            OrchestrationDecision::Accept
        );

        f.leader.set(true, None);
        assert_eq!(
            f.orchestrator.evaluate_at(&peer("a"), "", now),
            OrchestrationDecision::Accept
        );
    }

    #[test]
    fn test_postponed_request_admitted_later() {
        let f = fixture(TierCounts::new(0, 1, 1, 0));
        f.leader.set(false, Some(peer("boss")));

        let request = f.orchestrator.request(&peer("a"), "family");
        assert_eq!(request.requested_tier, Tier::High);
        assert!(matches!(
            f.orchestrator.execute_request(&request),
            AdmissionResult::Postponed { .. }
        ));
        assert!(!f.orchestrator.is_member(&peer("a")));

        f.leader.set(false, None);
        assert!(matches!(
            f.orchestrator.execute_request(&request),
            AdmissionResult::Admitted {
                tier: Tier::High,
                ..
            }
        ));
        assert!(f.orchestrator.is_member(&peer("a")));
    }

    #[test]
    fn test_unstable_link_rejected() {
        let f = single_normal_slot();
        let p = peer("shaky");
        for _ in 0..10 {
            f.orchestrator
                .handle_disconnection(&p, DisconnectReason::HandshakeTimeout);
        }
        f.orchestrator.record_link_sample(&p, 2000.0, false);
        for _ in 0..20 {
            f.orchestrator.record_link_sample(&p, 0.0, true);
        }

        assert_eq!(
            f.orchestrator.evaluate(&p, ""),
            OrchestrationDecision::Reject(RejectReason::UnstableLink)
        );
    }

    #[test]
    fn test_likely_disconnect_admits_conditionally() {
        let f = single_normal_slot();
        let p = peer("wobbly");
        for _ in 0..10 {
            f.orchestrator
                .handle_disconnection(&p, DisconnectReason::HandshakeTimeout);
        }
        f.orchestrator.record_link_sample(&p, 100.0, false);
        for _ in 0..12 {
            f.orchestrator.record_link_sample(&p, 0.0, true);
        }

        let expected = vec![
            AcceptCondition::DegradedMonitoring,
            AcceptCondition::ShortIdleTimeout(Duration::from_secs(60)),
        ];
        assert_eq!(
            f.orchestrator.evaluate(&p, ""),
            OrchestrationDecision::ConditionalAccept(expected.clone())
        );

        match f.orchestrator.execute_connection(&p, "") {
            AdmissionResult::Admitted { conditions, .. } => assert_eq!(conditions, expected),
            other => panic!("expected admission, got {:?}", other),
        }
        assert!(f.orchestrator.is_monitored(&p));
    }

    #[test]
    fn test_execute_records_and_emits() {
        let f = single_normal_slot();
        let mut events = f.orchestrator.subscribe();

        let result = f.orchestrator.execute_connection(&peer("a"), "family");
        assert!(matches!(
            result,
            AdmissionResult::Admitted {
                tier: Tier::High,
                ..
            }
        ));

        let members = f.orchestrator.cluster_members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].peer, peer("a"));
        assert_eq!(
            f.reputation.outcomes.lock().as_slice(),
            &[(peer("a"), ConnectionOutcome::Connected)]
        );
        assert!(matches!(
            events.try_recv(),
            Ok(OrchestratorEvent::PeerAdmitted { .. })
        ));

        // Repeating the request keeps the slot without re-recording
        assert!(f.orchestrator.execute_connection(&peer("a"), "").is_admitted());
        assert_eq!(f.reputation.outcomes.lock().len(), 1);
    }

    #[test]
    fn test_rejection_emits_event() {
        let f = single_normal_slot();
        let mut events = f.orchestrator.subscribe();
        f.reputation.set(&peer("a"), 0.0, Tier::Normal);

        assert_eq!(
            f.orchestrator.execute_connection(&peer("a"), ""),
            AdmissionResult::Rejected(RejectReason::LowReputation)
        );
        assert_eq!(
            events.try_recv().ok(),
            Some(OrchestratorEvent::PeerRejected {
                peer: peer("a"),
                reason: RejectReason::LowReputation
            })
        );
    }

    #[test]
    fn test_disconnection_releases_everything() {
        let f = single_normal_slot();
        assert!(f.orchestrator.execute_connection(&peer("a"), "").is_admitted());
        f.orchestrator.record_link_sample(&peer("a"), 40.0, false);

        f.orchestrator
            .handle_disconnection(&peer("a"), DisconnectReason::LinkLost);

        assert!(!f.orchestrator.slots().is_occupant(&peer("a")));
        assert!(!f.orchestrator.is_member(&peer("a")));
        assert!(!f.orchestrator.predictor().is_cached(&peer("a")));
        assert_eq!(
            f.reputation.outcomes.lock().last(),
            Some(&(peer("a"), ConnectionOutcome::Disconnected { expected: false }))
        );

        // The freed slot is usable again
        assert!(f.orchestrator.execute_connection(&peer("b"), "").is_admitted());
    }

    #[test]
    fn test_prediction_alert_fires_once_per_worsening() {
        let f = single_normal_slot();
        let mut events = f.orchestrator.subscribe();
        let p = peer("a");
        for _ in 0..10 {
            f.orchestrator
                .handle_disconnection(&p, DisconnectReason::HandshakeTimeout);
        }
        while events.try_recv().is_ok() {}

        for _ in 0..5 {
            f.orchestrator.record_link_sample(&p, 100.0, true);
        }

        let alerts = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, OrchestratorEvent::DisconnectionPredicted { .. }))
            .count();
        assert_eq!(alerts, 1);
    }

    #[test]
    fn test_reset_releases_all() {
        let f = fixture(TierCounts::new(0, 1, 2, 0));
        assert!(f.orchestrator.execute_connection(&peer("a"), "").is_admitted());
        assert!(f.orchestrator.execute_connection(&peer("b"), "").is_admitted());

        let mut released = f.orchestrator.reset();
        released.sort();
        assert_eq!(released, vec![peer("a"), peer("b")]);
        assert!(f.orchestrator.cluster_members().is_empty());
        assert_eq!(f.orchestrator.slots().status().occupied, 0);
    }
}
