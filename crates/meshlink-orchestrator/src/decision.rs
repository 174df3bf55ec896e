//! Admission decisions

use meshlink_protocol::{PeerId, Tier};
use meshlink_slots::Eviction;
use std::fmt;
use std::time::{Duration, Instant};

/// Outcome of evaluating a connection request
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestrationDecision {
    Accept,
    Reject(RejectReason),
    /// Ask again at `resume_at`
    Postpone { resume_at: Instant },
    /// Admit, but with the listed restrictions
    ConditionalAccept(Vec<AcceptCondition>),
}

impl OrchestrationDecision {
    pub fn admits(&self) -> bool {
        matches!(
            self,
            OrchestrationDecision::Accept | OrchestrationDecision::ConditionalAccept(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    Blacklisted,
    /// Battery is critical and the peer is not trusted enough to spend it on
    LowBatteryUntrusted,
    LowReputation,
    NoSlotAvailable,
    /// The link is predicted to drop imminently
    UnstableLink,
    /// Evaluation allowed the peer but the slot was gone by allocation time
    SlotRace,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::Blacklisted => "blacklisted",
            RejectReason::LowBatteryUntrusted => "low battery, untrusted peer",
            RejectReason::LowReputation => "low reputation",
            RejectReason::NoSlotAvailable => "no slot available",
            RejectReason::UnstableLink => "link predicted to fail",
            RejectReason::SlotRace => "slot taken during admission",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptCondition {
    /// Probe the link more often than usual
    DegradedMonitoring,
    /// Release the slot after this much inactivity
    ShortIdleTimeout(Duration),
}

/// Result of `Orchestrator::execute_connection`
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionResult {
    Admitted {
        slot_id: usize,
        tier: Tier,
        conditions: Vec<AcceptCondition>,
        /// Peer displaced to make room; the caller disconnects it
        evicted: Option<Eviction>,
    },
    Rejected(RejectReason),
    Postponed {
        resume_at: Instant,
    },
}

impl AdmissionResult {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionResult::Admitted { .. })
    }

    pub fn evicted_peer(&self) -> Option<&PeerId> {
        match self {
            AdmissionResult::Admitted {
                evicted: Some(eviction),
                ..
            } => Some(&eviction.peer),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits() {
        assert!(OrchestrationDecision::Accept.admits());
        assert!(
            OrchestrationDecision::ConditionalAccept(vec![AcceptCondition::DegradedMonitoring])
                .admits()
        );
        assert!(!OrchestrationDecision::Reject(RejectReason::LowReputation).admits());
        assert!(!OrchestrationDecision::Postpone {
            resume_at: Instant::now()
        }
        .admits());
    }

    #[test]
    fn test_reject_reason_display() {
        assert_eq!(RejectReason::NoSlotAvailable.to_string(), "no slot available");
    }
}
