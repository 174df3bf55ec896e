//! A single connection slot

use meshlink_protocol::{PeerId, Tier};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Observable slot state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SlotState {
    Available,
    Reserved,
    Occupied,
}

/// A slot held for a peer that has not connected yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub peer: PeerId,
    pub tier: Tier,
    pub expires_at: Instant,
}

impl Reservation {
    /// Reservations expire at `expires_at`, never before
    pub fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// One unit of direct-link capacity
///
/// The occupant and the reservation are mutually exclusive; every mutation
/// goes through a method that keeps them so.
#[derive(Debug, Clone)]
pub struct ConnectionSlot {
    id: usize,
    tier: Tier,
    occupant: Option<PeerId>,
    occupant_tier: Option<Tier>,
    reservation: Option<Reservation>,
    connected_at: Option<Instant>,
    last_activity: Option<Instant>,
    idle_timeout: Option<Duration>,
    idle_limit: Option<Duration>,
}

impl ConnectionSlot {
    pub(crate) fn new(id: usize, tier: Tier, idle_timeout: Option<Duration>) -> Self {
        ConnectionSlot {
            id,
            tier,
            occupant: None,
            occupant_tier: None,
            reservation: None,
            connected_at: None,
            last_activity: None,
            idle_timeout,
            idle_limit: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn occupant(&self) -> Option<&PeerId> {
        self.occupant.as_ref()
    }

    /// Tier the occupant was admitted at (may differ from the slot tier when
    /// it borrowed a slot or was migrated)
    pub fn occupant_tier(&self) -> Option<Tier> {
        self.occupant_tier
    }

    pub fn reservation(&self) -> Option<&Reservation> {
        self.reservation.as_ref()
    }

    pub fn connected_at(&self) -> Option<Instant> {
        self.connected_at
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Idle timeout applied to the current occupant: the slot's timeout,
    /// shortened by any per-occupant limit
    pub fn effective_idle_timeout(&self) -> Option<Duration> {
        match (self.idle_timeout, self.idle_limit) {
            (Some(timeout), Some(limit)) => Some(timeout.min(limit)),
            (timeout, limit) => timeout.or(limit),
        }
    }

    pub fn idle_limit(&self) -> Option<Duration> {
        self.idle_limit
    }

    /// State as of `now`; an expired reservation reads as Available
    pub fn state_at(&self, now: Instant) -> SlotState {
        if self.occupant.is_some() {
            SlotState::Occupied
        } else if self.reservation.as_ref().is_some_and(|r| r.is_live(now)) {
            SlotState::Reserved
        } else {
            SlotState::Available
        }
    }

    /// Structural state, ignoring reservation expiry
    pub fn state(&self) -> SlotState {
        if self.occupant.is_some() {
            SlotState::Occupied
        } else if self.reservation.is_some() {
            SlotState::Reserved
        } else {
            SlotState::Available
        }
    }

    pub fn is_held_by(&self, peer: &PeerId) -> bool {
        self.occupant.as_ref() == Some(peer)
    }

    pub fn is_reserved_for(&self, peer: &PeerId, now: Instant) -> bool {
        self.occupant.is_none()
            && self
                .reservation
                .as_ref()
                .is_some_and(|r| &r.peer == peer && r.is_live(now))
    }

    /// Tier used for eviction and sweep decisions: the higher of slot and
    /// occupant tier
    pub(crate) fn protected_tier(&self) -> Tier {
        match self.occupant_tier {
            Some(t) => t.max(self.tier),
            None => self.tier,
        }
    }

    /// Occupy the slot, clearing any reservation
    pub(crate) fn occupy(&mut self, peer: PeerId, tier: Tier, now: Instant) {
        self.reservation = None;
        self.occupant = Some(peer);
        self.occupant_tier = Some(tier);
        self.connected_at = Some(now);
        self.last_activity = Some(now);
        self.idle_limit = None;
    }

    /// Place a migrated occupant, keeping its timestamps
    pub(crate) fn restore(
        &mut self,
        peer: PeerId,
        tier: Option<Tier>,
        connected_at: Option<Instant>,
        last_activity: Option<Instant>,
    ) {
        self.reservation = None;
        self.occupant = Some(peer);
        self.occupant_tier = tier;
        self.connected_at = connected_at;
        self.last_activity = last_activity;
        self.idle_limit = None;
    }

    /// Empty the slot, returning the previous occupant
    pub(crate) fn vacate(&mut self) -> Option<PeerId> {
        self.occupant_tier = None;
        self.connected_at = None;
        self.last_activity = None;
        self.idle_limit = None;
        self.reservation = None;
        self.occupant.take()
    }

    /// Reserve an unoccupied slot; returns false if occupied
    pub(crate) fn reserve(&mut self, reservation: Reservation) -> bool {
        if self.occupant.is_some() {
            return false;
        }
        self.reservation = Some(reservation);
        true
    }

    pub(crate) fn clear_reservation(&mut self) -> Option<Reservation> {
        self.reservation.take()
    }

    pub(crate) fn extend_reservation(&mut self, expires_at: Instant) {
        if let Some(r) = self.reservation.as_mut() {
            r.expires_at = expires_at;
        }
    }

    /// Shorten the idle timeout for the current occupant
    pub(crate) fn limit_idle(&mut self, limit: Option<Duration>) -> bool {
        if self.occupant.is_none() {
            return false;
        }
        self.idle_limit = limit;
        true
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        if self.occupant.is_some() {
            self.last_activity = Some(now);
        }
    }

    /// Time since last activity, if occupied
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        self.last_activity
            .map(|t| now.saturating_duration_since(t))
    }

    /// True if the idle sweep should release this slot
    ///
    /// Critical slots and Critical occupants are exempt.
    pub fn is_idle(&self, now: Instant) -> bool {
        if self.occupant.is_none() || self.protected_tier() == Tier::Critical {
            return false;
        }
        match (self.effective_idle_timeout(), self.idle_for(now)) {
            (Some(timeout), Some(idle)) => idle >= timeout,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> PeerId {
        PeerId::new(name).unwrap()
    }

    #[test]
    fn test_new_slot_is_available() {
        let slot = ConnectionSlot::new(0, Tier::Normal, Some(Duration::from_secs(60)));
        let now = Instant::now();
        assert_eq!(slot.state_at(now), SlotState::Available);
        assert!(slot.occupant().is_none());
        assert!(slot.reservation().is_none());
    }

    #[test]
    fn test_occupy_then_vacate_returns_to_available() {
        let now = Instant::now();
        let mut slot = ConnectionSlot::new(0, Tier::Normal, None);
        slot.reserve(Reservation {
            peer: peer("x"),
            tier: Tier::Normal,
            expires_at: now + Duration::from_secs(10),
        });
        assert_eq!(slot.state_at(now), SlotState::Reserved);

        slot.occupy(peer("x"), Tier::Normal, now);
        assert_eq!(slot.state_at(now), SlotState::Occupied);
        assert!(slot.reservation().is_none());

        assert_eq!(slot.vacate(), Some(peer("x")));
        assert_eq!(slot.state_at(now), SlotState::Available);
        assert!(slot.occupant().is_none());
        assert!(slot.reservation().is_none());
        assert!(slot.connected_at().is_none());
    }

    #[test]
    fn test_cannot_reserve_occupied_slot() {
        let now = Instant::now();
        let mut slot = ConnectionSlot::new(0, Tier::Low, None);
        slot.occupy(peer("a"), Tier::Low, now);
        assert!(!slot.reserve(Reservation {
            peer: peer("b"),
            tier: Tier::Low,
            expires_at: now + Duration::from_secs(5),
        }));
        assert!(slot.is_held_by(&peer("a")));
    }

    #[test]
    fn test_expired_reservation_reads_available() {
        let now = Instant::now();
        let mut slot = ConnectionSlot::new(0, Tier::High, None);
        slot.reserve(Reservation {
            peer: peer("x"),
            tier: Tier::High,
            expires_at: now + Duration::from_secs(10),
        });

        assert_eq!(
            slot.state_at(now + Duration::from_millis(9_999)),
            SlotState::Reserved
        );
        assert_eq!(
            slot.state_at(now + Duration::from_secs(10)),
            SlotState::Available
        );
    }

    #[test]
    fn test_critical_never_idle() {
        let now = Instant::now();
        let mut slot = ConnectionSlot::new(0, Tier::Critical, Some(Duration::from_secs(1)));
        slot.occupy(peer("a"), Tier::Critical, now);
        assert!(!slot.is_idle(now + Duration::from_secs(3600)));

        // A Critical occupant in a lower slot is exempt too
        let mut slot = ConnectionSlot::new(1, Tier::Low, Some(Duration::from_secs(1)));
        slot.occupy(peer("b"), Tier::Critical, now);
        assert!(!slot.is_idle(now + Duration::from_secs(3600)));
    }

    #[test]
    fn test_idle_detection() {
        let now = Instant::now();
        let mut slot = ConnectionSlot::new(0, Tier::Normal, Some(Duration::from_secs(30)));
        slot.occupy(peer("a"), Tier::Normal, now);
        assert!(!slot.is_idle(now + Duration::from_secs(29)));
        assert!(slot.is_idle(now + Duration::from_secs(30)));

        slot.touch(now + Duration::from_secs(20));
        assert!(!slot.is_idle(now + Duration::from_secs(30)));
    }

    #[test]
    fn test_idle_limit_shortens_timeout_until_vacated() {
        let now = Instant::now();
        let mut slot = ConnectionSlot::new(0, Tier::High, Some(Duration::from_secs(600)));
        assert!(!slot.limit_idle(Some(Duration::from_secs(60))));

        slot.occupy(peer("a"), Tier::High, now);
        assert!(slot.limit_idle(Some(Duration::from_secs(60))));
        assert_eq!(slot.effective_idle_timeout(), Some(Duration::from_secs(60)));
        assert!(slot.is_idle(now + Duration::from_secs(60)));

        slot.vacate();
        slot.occupy(peer("b"), Tier::High, now);
        assert_eq!(slot.effective_idle_timeout(), Some(Duration::from_secs(600)));
    }
}
