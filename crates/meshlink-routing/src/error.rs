//! Routing error types

use meshlink_protocol::{Destination, MessageId};
use thiserror::Error;

/// Routing-specific errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoutingError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Duplicate message: {0}")]
    DuplicateMessage(MessageId),

    #[error("No route to {0}")]
    Unroutable(Destination),

    #[error("Priority queue {band} is full (max {max})")]
    QueueFull { band: &'static str, max: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] meshlink_protocol::ProtocolError),
}

/// Result type for routing operations
pub type Result<T> = std::result::Result<T, RoutingError>;
