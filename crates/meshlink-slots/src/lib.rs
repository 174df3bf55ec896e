//! MeshLink connection slots
//!
//! A fixed pool of direct-link slots partitioned into priority tiers. Lower
//! tiers may borrow free higher-tier slots, and a full pool evicts the
//! oldest occupant of the lowest tier strictly below the requester.

pub mod error;
pub mod manager;
pub mod pool;
pub mod slot;

pub use error::{Result, SlotError};
pub use manager::{SlotEvent, SlotManager, SweepReport};
pub use pool::{
    Allocation, Eviction, IdleRelease, IdleTimeouts, SlotPool, SlotPoolConfig, SlotSnapshot,
    SlotStatus, TierCounts, TierStatus, MAX_CAPACITY,
};
pub use slot::{ConnectionSlot, Reservation, SlotState};
