//! Priority-tiered connection slot pool
//!
//! The pool is plain state plus the eviction policy. It never reads the clock
//! itself: every operation takes `now`, which keeps reservation expiry and
//! idle sweeps deterministic. Locking lives in [`crate::SlotManager`].

use meshlink_protocol::{PeerId, Tier};
use serde::Serialize;
use std::time::{Duration, Instant};

use crate::error::{Result, SlotError};
use crate::slot::{ConnectionSlot, Reservation, SlotState};

/// Largest pool the session layer can usefully drive
pub const MAX_CAPACITY: usize = 64;

/// Number of slots per tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, serde::Deserialize)]
pub struct TierCounts {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl TierCounts {
    pub fn new(critical: usize, high: usize, normal: usize, low: usize) -> Self {
        TierCounts {
            critical,
            high,
            normal,
            low,
        }
    }

    /// Derive a tier split from total capacity
    ///
    /// A quarter Critical, a quarter High, an eighth Low (each at least one),
    /// the rest Normal. Pools of three or fewer slots are filled Normal,
    /// Critical, High in that order.
    pub fn from_capacity(capacity: usize) -> Self {
        let critical = (capacity / 4).max(1);
        let high = (capacity / 4).max(1);
        let low = (capacity / 8).max(1);

        if critical + high + low >= capacity {
            let mut counts = TierCounts::default();
            for tier in [Tier::Normal, Tier::Critical, Tier::High]
                .into_iter()
                .take(capacity)
            {
                *counts.get_mut(tier) += 1;
            }
            return counts;
        }

        TierCounts {
            critical,
            high,
            normal: capacity - critical - high - low,
            low,
        }
    }

    pub fn total(&self) -> usize {
        self.critical + self.high + self.normal + self.low
    }

    pub fn get(&self, tier: Tier) -> usize {
        match tier {
            Tier::Critical => self.critical,
            Tier::High => self.high,
            Tier::Normal => self.normal,
            Tier::Low => self.low,
        }
    }

    fn get_mut(&mut self, tier: Tier) -> &mut usize {
        match tier {
            Tier::Critical => &mut self.critical,
            Tier::High => &mut self.high,
            Tier::Normal => &mut self.normal,
            Tier::Low => &mut self.low,
        }
    }
}

/// Idle timeouts per tier; Critical slots have none
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct IdleTimeouts {
    pub high: Duration,
    pub normal: Duration,
    pub low: Duration,
}

impl IdleTimeouts {
    pub fn for_tier(&self, tier: Tier) -> Option<Duration> {
        match tier {
            Tier::Critical => None,
            Tier::High => Some(self.high),
            Tier::Normal => Some(self.normal),
            Tier::Low => Some(self.low),
        }
    }
}

impl Default for IdleTimeouts {
    fn default() -> Self {
        IdleTimeouts {
            high: Duration::from_secs(600),
            normal: Duration::from_secs(300),
            low: Duration::from_secs(120),
        }
    }
}

/// Slot pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct SlotPoolConfig {
    pub tier_counts: TierCounts,
    pub idle_timeouts: IdleTimeouts,
}

impl SlotPoolConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        SlotPoolConfig {
            tier_counts: TierCounts::from_capacity(capacity),
            idle_timeouts: IdleTimeouts::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let total = self.tier_counts.total();
        if total == 0 {
            return Err(SlotError::EmptyPool);
        }
        if total > MAX_CAPACITY {
            return Err(SlotError::CapacityTooLarge {
                requested: total,
                max: MAX_CAPACITY,
            });
        }
        for tier in [Tier::High, Tier::Normal, Tier::Low] {
            if self.idle_timeouts.for_tier(tier) == Some(Duration::ZERO) {
                return Err(SlotError::InvalidIdleTimeout(tier));
            }
        }
        Ok(())
    }
}

impl Default for SlotPoolConfig {
    fn default() -> Self {
        // Multipeer sessions top out at eight peers
        Self::with_capacity(8)
    }
}

/// A peer evicted to make room for a higher-priority request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub peer: PeerId,
    pub slot_id: usize,
    pub tier: Tier,
    pub connected_for: Duration,
}

/// Result of a successful allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub slot_id: usize,
    pub slot_tier: Tier,
    /// The peer already held this slot
    pub existing: bool,
    pub evicted: Option<Eviction>,
}

/// An occupant released by the idle sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleRelease {
    pub peer: PeerId,
    pub slot_id: usize,
    pub tier: Tier,
    pub idle_for: Duration,
}

/// Per-tier counts for status queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierStatus {
    pub tier: Tier,
    pub total: usize,
    pub occupied: usize,
    pub reserved: usize,
    pub available: usize,
}

/// Pool-wide status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    pub occupied: usize,
    pub reserved: usize,
    pub available: usize,
    pub per_tier: Vec<TierStatus>,
}

/// Point-in-time view of one slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    pub id: usize,
    pub tier: Tier,
    pub state: SlotState,
    pub occupant: Option<PeerId>,
    pub occupant_tier: Option<Tier>,
    pub reserved_for: Option<PeerId>,
    pub connected_for: Option<Duration>,
    pub idle_for: Option<Duration>,
}

/// Fixed-size array of priority-tagged slots
#[derive(Debug, Clone)]
pub struct SlotPool {
    slots: Vec<ConnectionSlot>,
    config: SlotPoolConfig,
}

fn build_slots(config: &SlotPoolConfig) -> Vec<ConnectionSlot> {
    let mut slots = Vec::with_capacity(config.tier_counts.total());
    for tier in Tier::DESCENDING {
        for _ in 0..config.tier_counts.get(tier) {
            let id = slots.len();
            slots.push(ConnectionSlot::new(
                id,
                tier,
                config.idle_timeouts.for_tier(tier),
            ));
        }
    }
    slots
}

/// Search order for a tier: the tier itself, then higher tiers nearest
/// first, then lower tiers nearest first
fn search_order(tier: Tier) -> impl Iterator<Item = Tier> {
    std::iter::once(tier).chain(tier.higher()).chain(tier.lower())
}

impl SlotPool {
    pub fn new(config: SlotPoolConfig) -> Self {
        SlotPool {
            slots: build_slots(&config),
            config,
        }
    }

    pub fn config(&self) -> &SlotPoolConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[ConnectionSlot] {
        &self.slots
    }

    fn index_of_occupant(&self, peer: &PeerId) -> Option<usize> {
        self.slots.iter().position(|s| s.is_held_by(peer))
    }

    fn index_of_reservation(&self, peer: &PeerId, now: Instant) -> Option<usize> {
        self.slots.iter().position(|s| s.is_reserved_for(peer, now))
    }

    fn find_available(&self, tier: Tier, now: Instant) -> Option<usize> {
        search_order(tier).find_map(|t| {
            self.slots
                .iter()
                .position(|s| s.tier() == t && s.state_at(now) == SlotState::Available)
        })
    }

    /// Oldest-connected occupant in the lowest tier strictly below `tier`
    fn find_victim(&self, tier: Tier) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.occupant().is_some() && s.protected_tier() < tier)
            .min_by_key(|(_, s)| (s.protected_tier(), s.connected_at()))
            .map(|(idx, _)| idx)
    }

    /// Occupy a slot for `peer` at `tier`
    ///
    /// Returns the peer's existing slot if it already has one, claims its
    /// reservation if it holds one, otherwise takes an Available slot
    /// (requested tier, then higher, then lower), otherwise evicts the oldest
    /// occupant of the lowest tier strictly below `tier`. Returns None when
    /// nothing can be freed.
    pub fn allocate(&mut self, peer: &PeerId, tier: Tier, now: Instant) -> Option<Allocation> {
        if let Some(idx) = self.index_of_occupant(peer) {
            let slot = &self.slots[idx];
            return Some(Allocation {
                slot_id: slot.id(),
                slot_tier: slot.tier(),
                existing: true,
                evicted: None,
            });
        }

        let free = self
            .index_of_reservation(peer, now)
            .or_else(|| self.find_available(tier, now));

        if let Some(idx) = free {
            let slot = &mut self.slots[idx];
            slot.occupy(peer.clone(), tier, now);
            return Some(Allocation {
                slot_id: slot.id(),
                slot_tier: slot.tier(),
                existing: false,
                evicted: None,
            });
        }

        let idx = self.find_victim(tier)?;
        let slot = &mut self.slots[idx];
        let victim_tier = slot.protected_tier();
        let connected_for = slot
            .connected_at()
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();
        let victim = slot.vacate()?;
        slot.occupy(peer.clone(), tier, now);

        Some(Allocation {
            slot_id: slot.id(),
            slot_tier: slot.tier(),
            existing: false,
            evicted: Some(Eviction {
                peer: victim,
                slot_id: slot.id(),
                tier: victim_tier,
                connected_for,
            }),
        })
    }

    /// Whether `allocate` would currently succeed for `peer` at `tier`
    pub fn can_admit(&self, peer: &PeerId, tier: Tier, now: Instant) -> bool {
        self.index_of_occupant(peer).is_some()
            || self.index_of_reservation(peer, now).is_some()
            || self.find_available(tier, now).is_some()
            || self.find_victim(tier).is_some()
    }

    /// Release the slot held by `peer`
    pub fn release(&mut self, peer: &PeerId) -> Option<usize> {
        let idx = self.index_of_occupant(peer)?;
        self.slots[idx].vacate();
        Some(self.slots[idx].id())
    }

    /// Release every occupant and reservation, keeping slot identities
    pub fn release_all(&mut self) -> Vec<PeerId> {
        self.slots.iter_mut().filter_map(|s| s.vacate()).collect()
    }

    /// Hold a slot for a peer that has not connected yet
    ///
    /// Refreshes an existing live reservation for the same peer. Fails if the
    /// peer already occupies a slot, `duration` is zero, or no slot is
    /// Available. Never evicts.
    pub fn reserve(&mut self, peer: &PeerId, tier: Tier, duration: Duration, now: Instant) -> bool {
        if duration.is_zero() || self.index_of_occupant(peer).is_some() {
            return false;
        }

        let expires_at = now + duration;

        if let Some(idx) = self.index_of_reservation(peer, now) {
            self.slots[idx].extend_reservation(expires_at);
            return true;
        }

        match self.find_available(tier, now) {
            Some(idx) => {
                let slot = &mut self.slots[idx];
                slot.clear_reservation();
                slot.reserve(Reservation {
                    peer: peer.clone(),
                    tier,
                    expires_at,
                })
            }
            None => false,
        }
    }

    /// Drop a pending reservation for `peer`
    pub fn cancel_reservation(&mut self, peer: &PeerId) -> bool {
        for slot in &mut self.slots {
            if slot.occupant().is_none() && slot.reservation().is_some_and(|r| &r.peer == peer) {
                slot.clear_reservation();
                return true;
            }
        }
        false
    }

    /// Clear reservations whose deadline has passed (`expires_at <= now`)
    pub fn expire_reservations(&mut self, now: Instant) -> Vec<PeerId> {
        self.slots
            .iter_mut()
            .filter(|s| s.reservation().is_some_and(|r| !r.is_live(now)))
            .filter_map(|s| s.clear_reservation().map(|r| r.peer))
            .collect()
    }

    pub fn record_activity(&mut self, peer: &PeerId, now: Instant) -> bool {
        match self.index_of_occupant(peer) {
            Some(idx) => {
                self.slots[idx].touch(now);
                true
            }
            None => false,
        }
    }

    /// Shorten the idle timeout for `peer` while it holds its slot
    pub fn limit_idle_timeout(&mut self, peer: &PeerId, limit: Duration) -> bool {
        match self.index_of_occupant(peer) {
            Some(idx) => self.slots[idx].limit_idle(Some(limit)),
            None => false,
        }
    }

    /// Release occupants idle past their slot's timeout
    ///
    /// Critical slots and Critical occupants are never released here.
    pub fn sweep_idle(&mut self, now: Instant) -> Vec<IdleRelease> {
        let mut released = Vec::new();
        for slot in &mut self.slots {
            if !slot.is_idle(now) {
                continue;
            }
            let idle_for = slot.idle_for(now).unwrap_or_default();
            let tier = slot.protected_tier();
            if let Some(peer) = slot.vacate() {
                released.push(IdleRelease {
                    peer,
                    slot_id: slot.id(),
                    tier,
                    idle_for,
                });
            }
        }
        released
    }

    /// Rebuild the pool with new tier counts
    ///
    /// Occupants are migrated to a slot of their old slot's tier when one
    /// exists, otherwise to any Available slot (higher tiers first). Higher
    /// tiers are placed first and, within a tier, the longest-connected peer
    /// first. Returns occupants that could not be placed; the caller must
    /// disconnect them. Counts the pool could not be built with are refused
    /// and leave it untouched.
    pub fn set_tier_counts(&mut self, counts: TierCounts) -> Result<Vec<PeerId>> {
        SlotPoolConfig {
            tier_counts: counts,
            ..self.config.clone()
        }
        .validate()?;

        let old = std::mem::take(&mut self.slots);
        self.config.tier_counts = counts;
        self.slots = build_slots(&self.config);

        let mut occupants: Vec<ConnectionSlot> = old
            .iter()
            .filter(|s| s.occupant().is_some())
            .cloned()
            .collect();
        occupants.sort_by(|a, b| {
            b.protected_tier()
                .cmp(&a.protected_tier())
                .then(a.connected_at().cmp(&b.connected_at()))
        });

        let mut dropped = Vec::new();
        for previous in occupants {
            let Some(peer) = previous.occupant().cloned() else {
                continue;
            };
            match self.find_structurally_free(previous.tier()) {
                Some(idx) => {
                    let slot = &mut self.slots[idx];
                    slot.restore(
                        peer,
                        previous.occupant_tier(),
                        previous.connected_at(),
                        previous.last_activity(),
                    );
                    slot.limit_idle(previous.idle_limit());
                }
                None => dropped.push(peer),
            }
        }

        for previous in old.iter().filter(|s| s.occupant().is_none()) {
            let Some(reservation) = previous.reservation().cloned() else {
                continue;
            };
            if let Some(idx) = self.find_structurally_free(previous.tier()) {
                self.slots[idx].reserve(reservation);
            }
        }

        Ok(dropped)
    }

    /// Rebuild the pool for a new total capacity
    pub fn set_capacity(&mut self, capacity: usize) -> Result<Vec<PeerId>> {
        self.set_tier_counts(TierCounts::from_capacity(capacity))
    }

    fn find_structurally_free(&self, tier: Tier) -> Option<usize> {
        search_order(tier).find_map(|t| {
            self.slots
                .iter()
                .position(|s| s.tier() == t && s.state() == SlotState::Available)
        })
    }

    pub fn occupant_slot(&self, peer: &PeerId) -> Option<&ConnectionSlot> {
        self.index_of_occupant(peer).map(|idx| &self.slots[idx])
    }

    pub fn occupants(&self) -> Vec<PeerId> {
        self.slots
            .iter()
            .filter_map(|s| s.occupant().cloned())
            .collect()
    }

    pub fn status(&self, now: Instant) -> SlotStatus {
        let per_tier: Vec<TierStatus> = Tier::DESCENDING
            .into_iter()
            .map(|tier| {
                let mut status = TierStatus {
                    tier,
                    total: 0,
                    occupied: 0,
                    reserved: 0,
                    available: 0,
                };
                for slot in self.slots.iter().filter(|s| s.tier() == tier) {
                    status.total += 1;
                    match slot.state_at(now) {
                        SlotState::Occupied => status.occupied += 1,
                        SlotState::Reserved => status.reserved += 1,
                        SlotState::Available => status.available += 1,
                    }
                }
                status
            })
            .collect();

        SlotStatus {
            occupied: per_tier.iter().map(|t| t.occupied).sum(),
            reserved: per_tier.iter().map(|t| t.reserved).sum(),
            available: per_tier.iter().map(|t| t.available).sum(),
            per_tier,
        }
    }

    pub fn snapshot(&self, now: Instant) -> Vec<SlotSnapshot> {
        self.slots
            .iter()
            .map(|s| SlotSnapshot {
                id: s.id(),
                tier: s.tier(),
                state: s.state_at(now),
                occupant: s.occupant().cloned(),
                occupant_tier: s.occupant_tier(),
                reserved_for: s
                    .reservation()
                    .filter(|r| r.is_live(now))
                    .map(|r| r.peer.clone()),
                connected_for: s.connected_at().map(|t| now.saturating_duration_since(t)),
                idle_for: s.idle_for(now),
            })
            .collect()
    }
}

impl Default for SlotPool {
    fn default() -> Self {
        Self::new(SlotPoolConfig::default())
    }
}
