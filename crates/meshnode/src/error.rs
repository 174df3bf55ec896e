//! Node error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Routing(#[from] meshlink_routing::RoutingError),

    #[error(transparent)]
    Slots(#[from] meshlink_slots::SlotError),

    #[error(transparent)]
    Orchestrator(#[from] meshlink_orchestrator::OrchestratorError),

    #[error(transparent)]
    Protocol(#[from] meshlink_protocol::ProtocolError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, NodeError>;
