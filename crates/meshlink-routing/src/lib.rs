//! MeshLink message routing
//!
//! Reliability layer and routing for the mesh:
//! - Priority queue system (5 levels) drained by the node
//! - Message cache for duplicate suppression
//! - Ack tracking with bounded retries
//! - Next-hop routing table fed by topology broadcasts
//! - Relay with TTL and visited-list loop guard, flooding when no route exists

pub mod ack;
pub mod deduplication;
pub mod error;
pub mod priority_queue;
pub mod relay;
pub mod router;
pub mod routing_table;
pub mod topology;

pub use ack::{AckAction, AckTracker, PendingAck, RetryPolicy};
pub use deduplication::DeduplicationCache;
pub use error::{Result, RoutingError};
pub use priority_queue::{
    Outbound, PriorityLevel, PriorityQueue, PriorityQueueStats, QueuedMessage,
};
pub use relay::{plan_inbound, resolve_targets, InboundPlan};
pub use router::{InboundOutcome, Router, RouterConfig, RouterEvent, RouterStats};
pub use routing_table::{NextHop, RouteEntry, RouteSummary, RoutingTable};
pub use topology::{TopologyConfig, TopologyDisposition, TopologyProtocol};
