//! Slot pool error types

use meshlink_protocol::Tier;
use thiserror::Error;

/// Slot pool configuration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SlotError {
    #[error("Slot pool must have at least one slot")]
    EmptyPool,

    #[error("Idle timeout for {0} tier must be non-zero")]
    InvalidIdleTimeout(Tier),

    #[error("Capacity {requested} exceeds maximum {max}")]
    CapacityTooLarge { requested: usize, max: usize },
}

/// Result type for slot operations
pub type Result<T> = std::result::Result<T, SlotError>;
