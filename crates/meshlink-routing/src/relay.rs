//! Inbound message planning
//!
//! Decides, for a message that passed duplicate suppression, whether to
//! deliver it locally, acknowledge it, and relay it onward.

use meshlink_protocol::{Destination, NetworkMessage, PeerId};
use std::time::Instant;

use crate::routing_table::RoutingTable;

/// Outcome of inbound planning
#[derive(Debug, Clone, PartialEq)]
pub struct InboundPlan {
    /// Hand to the local application (or ack tracker)
    pub deliver: bool,
    /// Ack to send back toward the original sender
    pub ack: Option<NetworkMessage>,
    /// Relayed copy and the peers to send it to
    pub relay: Option<(NetworkMessage, Vec<PeerId>)>,
}

/// Peers a message for `destination` should be handed to
///
/// Uses the routing table's next hops when it has a live entry, otherwise
/// every direct peer (flood fallback).
pub fn resolve_targets(table: &RoutingTable, destination: &Destination, now: Instant) -> Vec<PeerId> {
    let routed = match destination {
        Destination::Peer(peer) => table.next_hops(peer, now),
        Destination::Broadcast => Vec::new(),
    };
    if routed.is_empty() {
        table.direct_peers()
    } else {
        routed
    }
}

/// Plan the handling of `message` received from `from`
pub fn plan_inbound(
    message: &NetworkMessage,
    from: &PeerId,
    local: &PeerId,
    table: &RoutingTable,
    now: Instant,
) -> InboundPlan {
    let deliver = message.is_for(local);

    let ack = if message.is_only_for(local) && message.requires_ack {
        Some(NetworkMessage::ack(local.clone(), message))
    } else {
        None
    };

    let relay = if message.is_only_for(local) {
        None
    } else {
        message.relayed_by(local).and_then(|relayed| {
            let targets: Vec<PeerId> = resolve_targets(table, &message.recipient, now)
                .into_iter()
                .filter(|p| p != from && !message.flood.has_visited(p))
                .collect();
            if targets.is_empty() {
                None
            } else {
                Some((relayed, targets))
            }
        })
    };

    InboundPlan {
        deliver,
        ack,
        relay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlink_protocol::topology::TOPOLOGY_TTL;
    use meshlink_protocol::{MessageType, TopologyMessage};
    use std::time::Duration;

    fn peer(name: &str) -> PeerId {
        PeerId::new(name).unwrap()
    }

    fn table(local: &str, direct: &[&str]) -> RoutingTable {
        let mut table = RoutingTable::new(peer(local), Duration::from_secs(90));
        for p in direct {
            table.set_direct(peer(p));
        }
        table
    }

    fn directed(from: &str, to: &str) -> NetworkMessage {
        NetworkMessage::new(
            peer(from),
            Destination::Peer(peer(to)),
            MessageType::Chat,
            b"hi".to_vec(),
        )
        .unwrap()
    }

    #[test]
    fn test_delivers_and_acks_own_messages() {
        let now = Instant::now();
        let table = table("c", &["b"]);
        let msg = directed("a", "c").requiring_ack(true);

        let plan = plan_inbound(&msg, &peer("b"), &peer("c"), &table, now);
        assert!(plan.deliver);
        assert!(plan.relay.is_none());
        let ack = plan.ack.unwrap();
        assert_eq!(ack.ack_for, Some(msg.id));
        assert_eq!(ack.recipient, Destination::Peer(peer("a")));
    }

    #[test]
    fn test_no_ack_unless_requested() {
        let now = Instant::now();
        let table = table("c", &["b"]);
        let plan = plan_inbound(&directed("a", "c"), &peer("b"), &peer("c"), &table, now);
        assert!(plan.deliver);
        assert!(plan.ack.is_none());
    }

    #[test]
    fn test_relay_floods_without_route() {
        let now = Instant::now();
        let table = table("b", &["a", "c", "d"]);
        let msg = directed("a", "z");

        let plan = plan_inbound(&msg, &peer("a"), &peer("b"), &table, now);
        assert!(!plan.deliver);
        let (relayed, targets) = plan.relay.unwrap();
        assert_eq!(targets, vec![peer("c"), peer("d")]);
        assert_eq!(relayed.flood.hop_count, msg.flood.hop_count + 1);
    }

    #[test]
    fn test_relay_uses_next_hops() {
        let now = Instant::now();
        let mut table = table("b", &["a", "c", "d"]);
        let topo = TopologyMessage::new(peer("z"), vec![], 1, TOPOLOGY_TTL);
        table.record_topology(&topo, &peer("d"), now);

        let plan = plan_inbound(&directed("a", "z"), &peer("a"), &peer("b"), &table, now);
        let (_, targets) = plan.relay.unwrap();
        assert_eq!(targets, vec![peer("d")]);
    }

    #[test]
    fn test_broadcast_is_delivered_and_relayed() {
        let now = Instant::now();
        let table = table("b", &["a", "c"]);
        let msg = NetworkMessage::new(peer("a"), Destination::Broadcast, MessageType::Status, vec![])
            .unwrap()
            .requiring_ack(true);

        let plan = plan_inbound(&msg, &peer("a"), &peer("b"), &table, now);
        assert!(plan.deliver);
        // Broadcasts are never acked
        assert!(plan.ack.is_none());
        assert_eq!(plan.relay.unwrap().1, vec![peer("c")]);
    }

    #[test]
    fn test_loop_guard_blocks_second_relay() {
        let now = Instant::now();
        let table = table("b", &["a", "c"]);
        let msg = directed("a", "z");

        let (relayed, _) = plan_inbound(&msg, &peer("a"), &peer("b"), &table, now)
            .relay
            .unwrap();
        // The relayed copy comes back to b through c
        let plan = plan_inbound(&relayed, &peer("c"), &peer("b"), &table, now);
        assert!(plan.relay.is_none());
    }

    #[test]
    fn test_never_relays_to_visited_peers() {
        let now = Instant::now();
        let table = table("c", &["a", "b", "d"]);
        let msg = directed("a", "z").relayed_by(&peer("b")).unwrap();

        let plan = plan_inbound(&msg, &peer("b"), &peer("c"), &table, now);
        assert_eq!(plan.relay.unwrap().1, vec![peer("d")]);
    }

    #[test]
    fn test_stops_at_ttl() {
        let now = Instant::now();
        let table = table("c", &["b", "d"]);
        let msg = directed("a", "z")
            .with_ttl(1)
            .relayed_by(&peer("b"))
            .unwrap();

        let plan = plan_inbound(&msg, &peer("b"), &peer("c"), &table, now);
        assert!(plan.relay.is_none());
    }
}
