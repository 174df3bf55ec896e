//! Outbound priority queue
//!
//! Five FIFO bands. The drain always serves the highest non-empty band, so
//! priority beats arrival order; within a band, arrival order is kept.

use meshlink_protocol::{Envelope, MessageId, PeerId, Priority, SendMode};
use std::collections::VecDeque;
use std::time::Instant;

use crate::error::{Result, RoutingError};

/// Priority bands for outbound traffic, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PriorityLevel {
    Background,
    Low,
    Normal,
    High,
    Emergency,
}

impl PriorityLevel {
    const ALL: [PriorityLevel; 5] = [
        PriorityLevel::Background,
        PriorityLevel::Low,
        PriorityLevel::Normal,
        PriorityLevel::High,
        PriorityLevel::Emergency,
    ];

    /// Band for a raw priority byte; each band spans 64 values except the
    /// top two, which split 192..=255
    pub fn from_priority(priority: u8) -> Self {
        match priority {
            0..=63 => PriorityLevel::Background,
            64..=127 => PriorityLevel::Low,
            128..=191 => PriorityLevel::Normal,
            192..=223 => PriorityLevel::High,
            _ => PriorityLevel::Emergency,
        }
    }

    fn band(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityLevel::Background => "background",
            PriorityLevel::Low => "low",
            PriorityLevel::Normal => "normal",
            PriorityLevel::High => "high",
            PriorityLevel::Emergency => "emergency",
        }
    }
}

impl From<Priority> for PriorityLevel {
    fn from(priority: Priority) -> Self {
        PriorityLevel::from_priority(priority.as_u8())
    }
}

/// A send waiting for the drain worker
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub envelope: Envelope,
    pub targets: Vec<PeerId>,
    pub mode: SendMode,
    pub priority: Priority,
    /// Set for application messages and acks
    pub message_id: Option<MessageId>,
}

/// Outbound send with queue metadata
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub outbound: Outbound,

    /// When the send was queued
    pub queued_at: Instant,

    /// 1 for the first transmission, incremented on every retry
    pub attempt: u32,
}

impl QueuedMessage {
    pub fn new(outbound: Outbound, queued_at: Instant, attempt: u32) -> Self {
        QueuedMessage {
            outbound,
            queued_at,
            attempt,
        }
    }

    pub fn priority(&self) -> Priority {
        self.outbound.priority
    }
}

/// Outbound queue: one bounded FIFO per band
#[derive(Debug)]
pub struct PriorityQueue {
    bands: [VecDeque<QueuedMessage>; 5],
    band_capacity: usize,
}

impl PriorityQueue {
    pub fn new(band_capacity: usize) -> Self {
        PriorityQueue {
            bands: Default::default(),
            band_capacity,
        }
    }

    /// Append to the band matching the send's priority
    ///
    /// Fails when that band is full; other bands are unaffected.
    pub fn enqueue(&mut self, message: QueuedMessage) -> Result<()> {
        let level = PriorityLevel::from(message.priority());
        let band = &mut self.bands[level.band()];
        if band.len() >= self.band_capacity {
            return Err(RoutingError::QueueFull {
                band: level.as_str(),
                max: self.band_capacity,
            });
        }
        band.push_back(message);
        Ok(())
    }

    /// Put a dequeued send back at the head of its band
    pub fn requeue(&mut self, message: QueuedMessage) -> Result<()> {
        let level = PriorityLevel::from(message.priority());
        let band = &mut self.bands[level.band()];
        if band.len() >= self.band_capacity {
            return Err(RoutingError::QueueFull {
                band: level.as_str(),
                max: self.band_capacity,
            });
        }
        band.push_front(message);
        Ok(())
    }

    /// Oldest send of the highest non-empty band
    pub fn dequeue(&mut self) -> Option<QueuedMessage> {
        self.bands.iter_mut().rev().find_map(VecDeque::pop_front)
    }

    pub fn peek(&self) -> Option<&QueuedMessage> {
        self.bands.iter().rev().find_map(VecDeque::front)
    }

    pub fn len(&self) -> usize {
        self.bands.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.iter().all(VecDeque::is_empty)
    }

    pub fn band_len(&self, level: PriorityLevel) -> usize {
        self.bands[level.band()].len()
    }

    pub fn clear(&mut self) {
        self.bands.iter_mut().for_each(VecDeque::clear);
    }

    pub fn stats(&self) -> PriorityQueueStats {
        let [background, low, normal, high, emergency] = PriorityLevel::ALL.map(|l| self.band_len(l));
        PriorityQueueStats {
            emergency,
            high,
            normal,
            low,
            background,
            total: self.len(),
        }
    }
}

/// Queued sends per band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct PriorityQueueStats {
    pub emergency: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub background: usize,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlink_protocol::{Destination, MessageType, NetworkMessage};

    fn queued(priority: Priority) -> QueuedMessage {
        let message = NetworkMessage::new(
            PeerId::new("a").unwrap(),
            Destination::Broadcast,
            MessageType::Chat,
            b"test".to_vec(),
        )
        .unwrap()
        .with_priority(priority);

        QueuedMessage::new(
            Outbound {
                message_id: Some(message.id),
                envelope: Envelope::Message(message),
                targets: vec![PeerId::new("b").unwrap()],
                mode: SendMode::Reliable,
                priority,
            },
            Instant::now(),
            1,
        )
    }

    #[test]
    fn test_band_boundaries() {
        let cases = [
            (0, PriorityLevel::Background),
            (63, PriorityLevel::Background),
            (64, PriorityLevel::Low),
            (128, PriorityLevel::Normal),
            (191, PriorityLevel::Normal),
            (192, PriorityLevel::High),
            (224, PriorityLevel::Emergency),
            (255, PriorityLevel::Emergency),
        ];
        for (raw, level) in cases {
            assert_eq!(PriorityLevel::from_priority(raw), level, "priority {}", raw);
        }
        assert!(PriorityLevel::Emergency > PriorityLevel::High);
    }

    #[test]
    fn test_priority_beats_arrival_order() {
        let mut queue = PriorityQueue::new(100);

        queue.enqueue(queued(Priority::low())).unwrap();
        queue.enqueue(queued(Priority::emergency())).unwrap();
        queue.enqueue(queued(Priority::normal())).unwrap();
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.dequeue().unwrap().priority(), Priority::emergency());
        assert_eq!(queue.dequeue().unwrap().priority(), Priority::normal());
        assert_eq!(queue.dequeue().unwrap().priority(), Priority::low());
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_fifo_within_band() {
        let mut queue = PriorityQueue::new(100);
        let first = queued(Priority::normal());
        let second = queued(Priority::normal());
        let first_id = first.outbound.message_id;
        let second_id = second.outbound.message_id;

        queue.enqueue(first).unwrap();
        queue.enqueue(second).unwrap();

        assert_eq!(queue.dequeue().unwrap().outbound.message_id, first_id);
        assert_eq!(queue.dequeue().unwrap().outbound.message_id, second_id);
    }

    #[test]
    fn test_requeue_goes_ahead_of_band() {
        let mut queue = PriorityQueue::new(2);
        let first = queued(Priority::normal());
        let first_id = first.outbound.message_id;
        queue.enqueue(first).unwrap();
        queue.enqueue(queued(Priority::normal())).unwrap();

        let taken = queue.dequeue().unwrap();
        assert_eq!(taken.outbound.message_id, first_id);
        queue.requeue(taken).unwrap();
        assert_eq!(queue.peek().unwrap().outbound.message_id, first_id);
        assert_eq!(queue.len(), 2);

        // No room left in the normal band
        assert!(queue.requeue(queued(Priority::normal())).is_err());
    }

    #[test]
    fn test_full_band_rejects() {
        let mut queue = PriorityQueue::new(2);
        for _ in 0..2 {
            queue.enqueue(queued(Priority::normal())).unwrap();
        }

        let result = queue.enqueue(queued(Priority::normal()));
        assert!(matches!(
            result,
            Err(RoutingError::QueueFull { band: "normal", .. })
        ));

        // Other bands are unaffected
        assert!(queue.enqueue(queued(Priority::high())).is_ok());
    }

    #[test]
    fn test_peek_leaves_queue_intact() {
        let mut queue = PriorityQueue::new(8);
        assert!(queue.peek().is_none());

        queue.enqueue(queued(Priority::low())).unwrap();
        queue.enqueue(queued(Priority::high())).unwrap();
        assert_eq!(queue.peek().map(|q| q.priority()), Some(Priority::high()));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_band_counts() {
        let mut queue = PriorityQueue::new(8);
        for priority in [Priority::emergency(), Priority::emergency(), Priority::normal()] {
            queue.enqueue(queued(priority)).unwrap();
        }

        assert_eq!(
            queue.stats(),
            PriorityQueueStats {
                emergency: 2,
                normal: 1,
                total: 3,
                ..Default::default()
            }
        );
        assert_eq!(queue.band_len(PriorityLevel::Emergency), 2);

        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.stats().total, 0);
    }
}
