//! Shared slot pool handle
//!
//! `SlotManager` is the single writer for the pool. It is called from the
//! transport event path without awaiting, so the pool sits behind a
//! `parking_lot::RwLock`; status readers take the read lock and never see a
//! slot half way through a transition.

use meshlink_protocol::{PeerId, Tier};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::pool::{
    Allocation, Eviction, IdleRelease, SlotPool, SlotPoolConfig, SlotSnapshot, SlotStatus,
    TierCounts,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Slot pool event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotEvent {
    Allocated {
        peer: PeerId,
        slot_id: usize,
        tier: Tier,
    },
    /// The session layer must disconnect this peer
    Evicted(Eviction),
    Released {
        peer: PeerId,
        slot_id: usize,
    },
    IdleReleased(IdleRelease),
    ReservationExpired {
        peer: PeerId,
    },
    DroppedOnResize {
        peer: PeerId,
    },
}

/// Result of a periodic sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub idle: Vec<IdleRelease>,
    pub expired_reservations: Vec<PeerId>,
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Thread-safe slot pool with change notifications
#[derive(Clone)]
pub struct SlotManager {
    pool: Arc<RwLock<SlotPool>>,
    events: broadcast::Sender<SlotEvent>,
}

impl SlotManager {
    pub fn new(config: SlotPoolConfig) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            "Slot pool ready: {} slots (critical {}, high {}, normal {}, low {})",
            config.tier_counts.total(),
            config.tier_counts.critical,
            config.tier_counts.high,
            config.tier_counts.normal,
            config.tier_counts.low
        );

        Ok(SlotManager {
            pool: Arc::new(RwLock::new(SlotPool::new(config))),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SlotEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SlotEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn expire_locked(&self, pool: &mut SlotPool, now: Instant) -> Vec<PeerId> {
        let expired = pool.expire_reservations(now);
        for peer in &expired {
            debug!("Reservation for {} expired", peer);
        }
        expired
    }

    fn emit_expired(&self, expired: Vec<PeerId>) {
        for peer in expired {
            self.emit(SlotEvent::ReservationExpired { peer });
        }
    }

    /// Occupy a slot for `peer`, evicting a lower-tier occupant if needed
    pub fn allocate(&self, peer: &PeerId, tier: Tier) -> Option<Allocation> {
        let now = now();
        let (expired, allocation) = {
            let mut pool = self.pool.write();
            let expired = self.expire_locked(&mut pool, now);
            (expired, pool.allocate(peer, tier, now))
        };
        self.emit_expired(expired);

        let Some(allocation) = allocation else {
            debug!("No slot for {} at {} tier", peer, tier);
            return None;
        };

        if allocation.existing {
            return Some(allocation);
        }

        if let Some(eviction) = &allocation.evicted {
            warn!(
                "Evicted {} ({} tier, connected {:?}) from slot {} for {} ({} tier)",
                eviction.peer, eviction.tier, eviction.connected_for, eviction.slot_id, peer, tier
            );
            self.emit(SlotEvent::Evicted(eviction.clone()));
        }

        info!(
            "Allocated slot {} ({} tier) to {} at {} tier",
            allocation.slot_id, allocation.slot_tier, peer, tier
        );
        self.emit(SlotEvent::Allocated {
            peer: peer.clone(),
            slot_id: allocation.slot_id,
            tier,
        });

        Some(allocation)
    }

    pub fn can_admit(&self, peer: &PeerId, tier: Tier) -> bool {
        self.pool.read().can_admit(peer, tier, now())
    }

    pub fn release(&self, peer: &PeerId) -> Option<usize> {
        let slot_id = self.pool.write().release(peer)?;
        debug!("Released slot {} held by {}", slot_id, peer);
        self.emit(SlotEvent::Released {
            peer: peer.clone(),
            slot_id,
        });
        Some(slot_id)
    }

    pub fn reserve(&self, peer: &PeerId, tier: Tier, duration: Duration) -> bool {
        let now = now();
        let (expired, reserved) = {
            let mut pool = self.pool.write();
            let expired = self.expire_locked(&mut pool, now);
            (expired, pool.reserve(peer, tier, duration, now))
        };
        self.emit_expired(expired);

        if reserved {
            debug!("Reserved a {} slot for {} ({:?})", tier, peer, duration);
        }
        reserved
    }

    pub fn cancel_reservation(&self, peer: &PeerId) -> bool {
        self.pool.write().cancel_reservation(peer)
    }

    /// Shorten the idle timeout for a conditionally admitted peer
    pub fn limit_idle_timeout(&self, peer: &PeerId, limit: Duration) -> bool {
        let limited = self.pool.write().limit_idle_timeout(peer, limit);
        if limited {
            debug!("Idle timeout for {} limited to {:?}", peer, limit);
        }
        limited
    }

    pub fn record_activity(&self, peer: &PeerId) -> bool {
        self.pool.write().record_activity(peer, now())
    }

    /// Release idle occupants and expired reservations
    pub fn sweep(&self) -> SweepReport {
        let now = now();
        let report = {
            let mut pool = self.pool.write();
            let expired_reservations = self.expire_locked(&mut pool, now);
            SweepReport {
                idle: pool.sweep_idle(now),
                expired_reservations,
            }
        };

        for release in &report.idle {
            info!(
                "Released idle peer {} from slot {} after {:?}",
                release.peer, release.slot_id, release.idle_for
            );
            self.emit(SlotEvent::IdleReleased(release.clone()));
        }
        self.emit_expired(report.expired_reservations.clone());

        report
    }

    /// Rebuild the pool; returns peers that must be disconnected
    ///
    /// Invalid counts are refused and the pool is left as it was.
    pub fn set_tier_counts(&self, counts: TierCounts) -> Result<Vec<PeerId>> {
        let dropped = self.pool.write().set_tier_counts(counts)?;
        info!(
            "Slot pool resized to {} slots ({} peers dropped)",
            counts.total(),
            dropped.len()
        );
        for peer in &dropped {
            warn!("No slot for {} after resize", peer);
            self.emit(SlotEvent::DroppedOnResize { peer: peer.clone() });
        }
        Ok(dropped)
    }

    pub fn set_capacity(&self, capacity: usize) -> Result<Vec<PeerId>> {
        self.set_tier_counts(TierCounts::from_capacity(capacity))
    }

    /// Release every occupant (transport restart); slot identities are kept
    pub fn release_all(&self) -> Vec<PeerId> {
        let released = self.pool.write().release_all();
        if !released.is_empty() {
            info!("Released all {} slot occupants", released.len());
        }
        released
    }

    pub fn status(&self) -> SlotStatus {
        self.pool.read().status(now())
    }

    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        self.pool.read().snapshot(now())
    }

    pub fn occupant_tier(&self, peer: &PeerId) -> Option<Tier> {
        self.pool
            .read()
            .occupant_slot(peer)
            .and_then(|s| s.occupant_tier())
    }

    pub fn is_occupant(&self, peer: &PeerId) -> bool {
        self.pool.read().occupant_slot(peer).is_some()
    }

    pub fn occupants(&self) -> Vec<PeerId> {
        self.pool.read().occupants()
    }

    pub fn capacity(&self) -> usize {
        self.pool.read().capacity()
    }
}

impl std::fmt::Debug for SlotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotManager")
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SlotError;
    use crate::pool::MAX_CAPACITY;

    fn peer(name: &str) -> PeerId {
        PeerId::new(name).unwrap()
    }

    fn manager() -> SlotManager {
        SlotManager::new(SlotPoolConfig {
            tier_counts: TierCounts::new(2, 1, 1, 1),
            idle_timeouts: Default::default(),
        })
        .unwrap()
    }

    #[test]
    fn test_rejects_empty_pool() {
        assert!(SlotManager::new(SlotPoolConfig::with_capacity(0)).is_err());
    }

    #[tokio::test]
    async fn test_allocation_events() {
        let slots = manager();
        let mut events = slots.subscribe();

        for (name, tier) in [
            ("c1", Tier::Critical),
            ("c2", Tier::Critical),
            ("h1", Tier::High),
            ("n1", Tier::Normal),
            ("l1", Tier::Low),
        ] {
            slots.allocate(&peer(name), tier).unwrap();
        }
        for _ in 0..5 {
            assert!(matches!(
                events.recv().await.unwrap(),
                SlotEvent::Allocated { .. }
            ));
        }

        let alloc = slots.allocate(&peer("h2"), Tier::High).unwrap();
        assert_eq!(alloc.evicted.as_ref().unwrap().peer, peer("l1"));

        match events.recv().await.unwrap() {
            SlotEvent::Evicted(eviction) => assert_eq!(eviction.peer, peer("l1")),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            events.recv().await.unwrap(),
            SlotEvent::Allocated { .. }
        ));

        // Re-allocating an existing occupant emits nothing
        slots.allocate(&peer("h2"), Tier::High).unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reservation_expires_lazily() {
        let slots = manager();
        let mut events = slots.subscribe();

        assert!(slots.reserve(&peer("x"), Tier::Normal, Duration::from_secs(10)));
        assert_eq!(slots.status().reserved, 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(slots.status().reserved, 0);

        // The next mutating call clears it
        slots.allocate(&peer("y"), Tier::Low).unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            SlotEvent::ReservationExpired { peer: peer("x") }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_releases_idle_peers() {
        let slots = manager();
        slots.allocate(&peer("c1"), Tier::Critical).unwrap();
        slots.allocate(&peer("l1"), Tier::Low).unwrap();

        tokio::time::advance(Duration::from_secs(3600)).await;
        let report = slots.sweep();

        assert_eq!(report.idle.len(), 1);
        assert_eq!(report.idle[0].peer, peer("l1"));
        assert!(slots.is_occupant(&peer("c1")));
        assert!(!slots.is_occupant(&peer("l1")));
    }

    #[test]
    fn test_release_and_status() {
        let slots = manager();
        slots.allocate(&peer("a"), Tier::Normal).unwrap();
        assert_eq!(slots.occupant_tier(&peer("a")), Some(Tier::Normal));
        assert_eq!(slots.status().occupied, 1);

        assert!(slots.release(&peer("a")).is_some());
        assert!(slots.release(&peer("a")).is_none());
        assert_eq!(slots.status().available, 5);
    }

    #[test]
    fn test_resize_reports_dropped_peers() {
        let slots = manager();
        let mut events = slots.subscribe();
        slots.allocate(&peer("a"), Tier::Normal).unwrap();
        slots.allocate(&peer("b"), Tier::Low).unwrap();
        while events.try_recv().is_ok() {}

        let dropped = slots.set_capacity(1).unwrap();
        assert_eq!(dropped, vec![peer("b")]);
        assert_eq!(
            events.try_recv().unwrap(),
            SlotEvent::DroppedOnResize { peer: peer("b") }
        );
        assert_eq!(slots.capacity(), 1);
    }

    #[test]
    fn test_invalid_resize_leaves_pool_alone() {
        let slots = manager();
        slots.allocate(&peer("a"), Tier::Normal).unwrap();
        let before = slots.status();

        assert!(matches!(slots.set_capacity(0), Err(SlotError::EmptyPool)));
        assert!(matches!(
            slots.set_capacity(MAX_CAPACITY + 1),
            Err(SlotError::CapacityTooLarge { .. })
        ));
        assert!(slots.set_tier_counts(TierCounts::new(0, 0, 0, 0)).is_err());

        assert_eq!(slots.capacity(), 5);
        assert_eq!(slots.status(), before);
        assert!(slots.is_occupant(&peer("a")));
    }

    #[test]
    fn test_release_all_keeps_capacity() {
        let slots = manager();
        slots.allocate(&peer("a"), Tier::Normal).unwrap();
        slots.allocate(&peer("b"), Tier::High).unwrap();

        assert_eq!(slots.release_all().len(), 2);
        assert_eq!(slots.capacity(), 5);
        assert!(slots.occupants().is_empty());
    }
}
