//! Acknowledgment tracking
//!
//! Messages that require an ack are registered here when first queued. Each
//! poll re-sends overdue messages with a growing, capped interval; once the
//! retry budget is spent the message is reported failed exactly once and
//! forgotten.

use meshlink_protocol::{MessageId, NetworkMessage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::{Result, RoutingError};

/// Retry schedule for unacknowledged messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first transmission
    pub max_retries: u32,
    /// Wait before the first retry
    pub base_interval: Duration,
    /// Growth factor applied per retry
    pub multiplier: f64,
    /// Upper bound on the wait between retries
    pub max_interval: Duration,
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.base_interval.is_zero() {
            return Err(RoutingError::InvalidConfig(
                "ack base interval must be non-zero".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(RoutingError::InvalidConfig(format!(
                "ack retry multiplier must be >= 1.0 (got {})",
                self.multiplier
            )));
        }
        if self.max_interval < self.base_interval {
            return Err(RoutingError::InvalidConfig(
                "ack max interval is below the base interval".to_string(),
            ));
        }
        Ok(())
    }

    /// Wait after the `retries`-th retry (0 = after the first transmission)
    pub fn interval_for(&self, retries: u32) -> Duration {
        let exponent = i32::try_from(retries).unwrap_or(i32::MAX);
        let secs = self.base_interval.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_interval: Duration::from_secs(2),
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
        }
    }
}

/// A message waiting for its ack
#[derive(Debug, Clone)]
pub struct PendingAck {
    pub message: NetworkMessage,
    pub retry_count: u32,
    pub first_sent: Instant,
    pub last_retry: Option<Instant>,
    pub next_due: Instant,
}

/// What the caller must do for an overdue message
#[derive(Debug, Clone)]
pub enum AckAction {
    /// Send the message again (same id)
    Retry {
        message: NetworkMessage,
        attempt: u32,
    },
    /// Retry budget spent; reported once
    Failed {
        message_id: MessageId,
        attempts: u32,
    },
}

/// Pending acknowledgments keyed by message id
#[derive(Debug)]
pub struct AckTracker {
    policy: RetryPolicy,
    pending: HashMap<MessageId, PendingAck>,
}

impl AckTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        AckTracker {
            policy,
            pending: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Start tracking `message`; false if it is already tracked
    pub fn register(&mut self, message: NetworkMessage, now: Instant) -> bool {
        if self.pending.contains_key(&message.id) {
            return false;
        }
        let next_due = now + self.policy.interval_for(0);
        self.pending.insert(
            message.id,
            PendingAck {
                message,
                retry_count: 0,
                first_sent: now,
                last_retry: None,
                next_due,
            },
        );
        true
    }

    /// Remove the entry for an acknowledged message
    pub fn acknowledge(&mut self, id: &MessageId) -> Option<PendingAck> {
        self.pending.remove(id)
    }

    /// Retry or fail every overdue entry
    pub fn poll(&mut self, now: Instant) -> Vec<AckAction> {
        let mut overdue: Vec<&mut PendingAck> = self
            .pending
            .values_mut()
            .filter(|p| p.next_due <= now)
            .collect();
        overdue.sort_by_key(|p| p.first_sent);

        let mut actions = Vec::with_capacity(overdue.len());
        for pending in overdue {
            if pending.retry_count < self.policy.max_retries {
                pending.retry_count += 1;
                pending.last_retry = Some(now);
                pending.next_due = now + self.policy.interval_for(pending.retry_count);
                actions.push(AckAction::Retry {
                    message: pending.message.clone(),
                    attempt: pending.retry_count + 1,
                });
            } else {
                actions.push(AckAction::Failed {
                    message_id: pending.message.id,
                    attempts: pending.retry_count + 1,
                });
            }
        }

        for action in &actions {
            if let AckAction::Failed { message_id, .. } = action {
                self.pending.remove(message_id);
            }
        }

        actions
    }

    pub fn is_pending(&self, id: &MessageId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
