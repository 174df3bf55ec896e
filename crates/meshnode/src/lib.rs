//! MeshLink node
//!
//! Runs the slot pool, admission orchestrator, reliability layer and
//! topology protocol on top of a pluggable transport.

pub mod breaker;
pub mod config;
pub mod error;
pub mod events;
pub mod memory;
pub mod node;
pub mod transport;

pub use config::Config;
pub use error::{NodeError, Result};
pub use events::MeshEvent;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use node::{Collaborators, MeshNode};
pub use transport::{LinkState, MeshTransport, TransportEvent};
