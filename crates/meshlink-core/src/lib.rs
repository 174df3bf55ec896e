//! MeshLink Core Library
//!
//! Ties together the MeshLink components:
//! - Protocol (peer ids, messages, topology broadcasts, wire envelope)
//! - Slots (priority-tiered connection slot pool)
//! - Orchestrator (admission control, disconnection prediction)
//! - Routing (reliability layer, routing table, topology protocol)

pub use meshlink_orchestrator as orchestrator;
pub use meshlink_protocol as protocol;
pub use meshlink_routing as routing;
pub use meshlink_slots as slots;

pub use orchestrator::OrchestratorError;
pub use protocol::ProtocolError;
pub use routing::RoutingError;
pub use slots::SlotError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let peer = protocol::PeerId::new("alice").unwrap();
        assert_eq!(peer.as_str(), "alice");

        let pool = slots::SlotPoolConfig::default();
        assert!(pool.validate().is_ok());

        let orchestrator = orchestrator::OrchestratorConfig::default();
        assert!(orchestrator.validate().is_ok());

        let router = routing::RouterConfig::default();
        assert!(router.validate().is_ok());
    }
}
