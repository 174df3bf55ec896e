//! MeshLink Protocol Module
//!
//! Shared data structures for the MeshLink mesh: peer identities, connection
//! tiers, application and topology messages with their flood-control fields,
//! and the wire envelope that carries them.

pub mod envelope;
pub mod error;
pub mod message;
pub mod topology;
pub mod types;

pub use envelope::{Envelope, EnvelopeKind};
pub use error::{ProtocolError, Result};
pub use message::{FloodControl, MessageId, MessageType, NetworkMessage};
pub use topology::TopologyMessage;
pub use types::{Destination, PeerId, Priority, SendMode, Tier};
