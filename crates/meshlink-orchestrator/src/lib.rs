//! MeshLink connection orchestration
//!
//! Admission control on top of the slot pool:
//! - Ordered admission rules (blacklist, battery, reputation, slots, load,
//!   coordinator, link prediction)
//! - Slot allocation with eviction reporting
//! - Disconnection prediction from link samples and connection history
//! - Handshake watchdog and stuck-peer detection
//! - A default in-memory reputation ledger

pub mod collaborators;
pub mod context;
pub mod decision;
pub mod error;
pub mod orchestrator;
pub mod prediction;
pub mod reputation;
pub mod watchdog;

pub use collaborators::{
    ConnectionOutcome, LeaderView, ReputationSource, StaticLeaderView, StaticSystemMonitor,
    SystemMonitor,
};
pub use context::{ConnectionContext, ConnectionRequest};
pub use decision::{AcceptCondition, AdmissionResult, OrchestrationDecision, RejectReason};
pub use error::{OrchestratorError, Result};
pub use orchestrator::{
    ClusterMember, DisconnectReason, Orchestrator, OrchestratorConfig, OrchestratorEvent,
};
pub use prediction::{
    DisconnectionPredictor, DisconnectionRisk, LinkMetrics, PredictionUpdate, PredictorConfig,
};
pub use reputation::{PeerReputation, ReputationConfig, ReputationLedger};
pub use watchdog::{HandshakeWatchdog, StuckDetector};
