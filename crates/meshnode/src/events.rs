//! Application-facing node events

use meshlink_orchestrator::{
    AcceptCondition, DisconnectReason, DisconnectionRisk, OrchestratorEvent, RejectReason,
};
use meshlink_protocol::{MessageId, NetworkMessage, PeerId, Tier};
use meshlink_routing::RouterEvent;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    MessageReceived {
        message: NetworkMessage,
        from: PeerId,
    },
    MessageRelayed {
        message_id: MessageId,
        targets: Vec<PeerId>,
    },
    MessageDelivered {
        message_id: MessageId,
        acked_by: PeerId,
    },
    /// Reported once per message after the retry budget is spent
    MessageFailed {
        message_id: MessageId,
        attempts: u32,
    },
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
    /// The transport session was rebuilt; these peers lost their slots
    TransportRestarted {
        released: Vec<PeerId>,
    },
}

impl From<RouterEvent> for MeshEvent {
    fn from(event: RouterEvent) -> Self {
        match event {
            RouterEvent::Received { message, from } => MeshEvent::MessageReceived { message, from },
            RouterEvent::Delivered {
                message_id,
                acked_by,
            } => MeshEvent::MessageDelivered {
                message_id,
                acked_by,
            },
            RouterEvent::DeliveryFailed {
                message_id,
                attempts,
            } => MeshEvent::MessageFailed {
                message_id,
                attempts,
            },
            RouterEvent::Relayed {
                message_id,
                targets,
            } => MeshEvent::MessageRelayed {
                message_id,
                targets,
            },
        }
    }
}

impl From<OrchestratorEvent> for MeshEvent {
    fn from(event: OrchestratorEvent) -> Self {
        match event {
            OrchestratorEvent::PeerAdmitted {
                peer,
                tier,
                slot_id,
                conditions,
            } => MeshEvent::PeerAdmitted {
                peer,
                tier,
                slot_id,
                conditions,
            },
            OrchestratorEvent::PeerRejected { peer, reason } => {
                MeshEvent::PeerRejected { peer, reason }
            }
            OrchestratorEvent::PeerPostponed { peer, resume_at } => {
                MeshEvent::PeerPostponed { peer, resume_at }
            }
            OrchestratorEvent::PeerEvicted { peer, tier, by } => {
                MeshEvent::PeerEvicted { peer, tier, by }
            }
            OrchestratorEvent::PeerDisconnected { peer, reason } => {
                MeshEvent::PeerDisconnected { peer, reason }
            }
            OrchestratorEvent::DisconnectionPredicted { peer, risk } => {
                MeshEvent::DisconnectionPredicted { peer, risk }
            }
        }
    }
}
