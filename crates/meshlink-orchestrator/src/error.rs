//! Orchestrator error types
//!
//! Admission outcomes are decisions, not errors. These cover configuration.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Slot pool error: {0}")]
    Slots(#[from] meshlink_slots::SlotError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
