//! Reliability layer
//!
//! The router owns the outbound priority queue, the message cache and the
//! ack tracker. Queuing is fast and never touches the transport; the node's
//! drain worker pulls from [`Router::next_outbound`] and performs the send.
//!
//! Inbound processing order:
//! 1. Validation of flood-control fields
//! 2. Duplicate suppression (silent discard on a cache hit)
//! 3. Ack matching, local delivery, ack generation, relay

use crate::{
    ack::{AckAction, AckTracker, RetryPolicy},
    deduplication::DeduplicationCache,
    priority_queue::{Outbound, PriorityQueue, PriorityQueueStats, QueuedMessage},
    relay::{plan_inbound, resolve_targets},
    routing_table::RoutingTable,
    Result, RoutingError,
};
use meshlink_protocol::{
    Destination, Envelope, MessageId, MessageType, NetworkMessage, PeerId, Priority, SendMode,
    TopologyMessage,
};
use serde::{Deserialize, Serialize};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};

/// Topology broadcasts share the high band with acks
const TOPOLOGY_PRIORITY: u8 = 200;

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Router settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Messages per priority band
    pub queue_capacity: usize,
    /// Message cache size
    pub dedup_capacity: usize,
    /// How long a seen id suppresses duplicates
    pub dedup_ttl: Duration,
    /// Ack retry schedule
    pub retry: RetryPolicy,
}

impl RouterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(RoutingError::InvalidConfig(
                "queue capacity must be non-zero".to_string(),
            ));
        }
        if self.dedup_ttl.is_zero() {
            return Err(RoutingError::InvalidConfig(
                "dedup ttl must be non-zero".to_string(),
            ));
        }
        self.retry.validate()
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            queue_capacity: 1000,
            dedup_capacity: 10_000,
            dedup_ttl: Duration::from_secs(600),
            retry: RetryPolicy::default(),
        }
    }
}

/// Router statistics
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub messages_routed: u64,
    pub messages_delivered: u64,
    pub messages_relayed: u64,
    pub duplicates_dropped: u64,
    pub messages_dropped: u64,
    pub invalid_messages: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub retries: u64,
    pub delivery_failures: u64,
}

/// Router notifications
#[derive(Debug, Clone, PartialEq)]
pub enum RouterEvent {
    /// A message for us (or a broadcast) arrived
    Received { message: NetworkMessage, from: PeerId },
    /// An ack arrived for one of our messages
    Delivered { message_id: MessageId, acked_by: PeerId },
    /// Retry budget spent without an ack
    DeliveryFailed { message_id: MessageId, attempts: u32 },
    /// A message passed through us
    Relayed { message_id: MessageId, targets: Vec<PeerId> },
}

/// What happened to an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Already seen; discarded
    Duplicate,
    Processed {
        delivered: bool,
        acked: bool,
        relayed_to: Vec<PeerId>,
    },
}

/// Message router
pub struct Router {
    /// Local peer
    local: PeerId,

    config: RouterConfig,

    /// Routing table shared with the topology protocol
    table: Arc<RwLock<RoutingTable>>,

    /// Priority queue for outbound sends
    outbound_queue: Arc<RwLock<PriorityQueue>>,

    /// Message cache
    dedup_cache: Arc<RwLock<DeduplicationCache>>,

    /// Messages waiting for an ack
    acks: Arc<RwLock<AckTracker>>,

    stats: Arc<RwLock<RouterStats>>,

    event_tx: Option<mpsc::UnboundedSender<RouterEvent>>,
}

impl Router {
    pub fn new(local: PeerId, config: RouterConfig, table: Arc<RwLock<RoutingTable>>) -> Self {
        Router {
            outbound_queue: Arc::new(RwLock::new(PriorityQueue::new(config.queue_capacity))),
            dedup_cache: Arc::new(RwLock::new(DeduplicationCache::new(
                config.dedup_capacity,
                config.dedup_ttl,
            ))),
            acks: Arc::new(RwLock::new(AckTracker::new(config.retry.clone()))),
            stats: Arc::new(RwLock::new(RouterStats::default())),
            event_tx: None,
            local,
            config,
            table,
        }
    }

    /// Set the channel router events are sent to
    pub fn set_event_channel(&mut self, tx: mpsc::UnboundedSender<RouterEvent>) {
        self.event_tx = Some(tx);
    }

    pub fn create_event_channel() -> (
        mpsc::UnboundedSender<RouterEvent>,
        mpsc::UnboundedReceiver<RouterEvent>,
    ) {
        mpsc::unbounded_channel()
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    fn emit(&self, event: RouterEvent) {
        if let Some(tx) = &self.event_tx {
            if tx.send(event).is_err() {
                trace!("Router event channel closed");
            }
        }
    }

    async fn resolve(&self, destination: &Destination, now: Instant) -> Vec<PeerId> {
        resolve_targets(&*self.table.read().await, destination, now)
    }

    async fn enqueue(&self, outbound: Outbound, now: Instant, attempt: u32) -> Result<()> {
        let result = self
            .outbound_queue
            .write()
            .await
            .enqueue(QueuedMessage::new(outbound, now, attempt));
        if result.is_err() {
            self.stats.write().await.messages_dropped += 1;
        }
        result
    }

    fn message_outbound(message: NetworkMessage, targets: Vec<PeerId>) -> Outbound {
        Outbound {
            priority: message.priority,
            message_id: Some(message.id),
            envelope: Envelope::Message(message),
            targets,
            mode: SendMode::Reliable,
        }
    }

    /// Build and queue a new message from the local peer
    pub async fn send_message(
        &self,
        payload: Vec<u8>,
        message_type: MessageType,
        destination: Destination,
        requires_ack: bool,
    ) -> Result<MessageId> {
        let message = NetworkMessage::new(self.local.clone(), destination, message_type, payload)?
            .requiring_ack(requires_ack && message_type != MessageType::Ack);
        self.send(message).await
    }

    /// Queue a message originating at the local peer
    ///
    /// A message requiring an ack is tracked even when no peer is reachable
    /// yet; retries re-resolve targets and exhaustion reports a failure.
    pub async fn send(&self, message: NetworkMessage) -> Result<MessageId> {
        message.validate()?;
        if message.sender != self.local {
            return Err(RoutingError::InvalidMessage(format!(
                "sender {} is not the local peer",
                message.sender
            )));
        }

        let now = now();
        let id = message.id;
        // Echoes of our own message are dropped
        self.dedup_cache.write().await.mark_seen(id, now);

        let tracked = message.requires_ack && message.recipient.peer().is_some();
        if tracked {
            self.acks.write().await.register(message.clone(), now);
        }

        let targets = self.resolve(&message.recipient, now).await;
        if targets.is_empty() {
            if tracked {
                debug!("No peers for {} yet; waiting for retry", id);
                return Ok(id);
            }
            self.stats.write().await.messages_dropped += 1;
            return Err(RoutingError::Unroutable(message.recipient));
        }

        debug!(
            "Queued {:?} {} for {} via {:?}",
            message.message_type, id, message.recipient, targets
        );
        self.enqueue(Self::message_outbound(message, targets), now, 1)
            .await?;
        self.stats.write().await.messages_routed += 1;

        Ok(id)
    }

    /// Process a message received over the link to `from`
    pub async fn handle_inbound(
        &self,
        message: NetworkMessage,
        from: &PeerId,
    ) -> Result<InboundOutcome> {
        if let Err(e) = message.validate() {
            let mut stats = self.stats.write().await;
            stats.invalid_messages += 1;
            stats.messages_dropped += 1;
            return Err(RoutingError::InvalidMessage(e.to_string()));
        }

        let now = now();

        if !self.dedup_cache.write().await.should_process(message.id, now) {
            trace!("Duplicate {} from {}", message.id, from);
            self.stats.write().await.duplicates_dropped += 1;
            return Ok(InboundOutcome::Duplicate);
        }

        let plan = {
            let table = self.table.read().await;
            plan_inbound(&message, from, &self.local, &table, now)
        };

        let mut delivered = false;
        if plan.deliver {
            delivered = self.deliver_local(&message, from).await;
        }

        let acked = match plan.ack {
            Some(ack) => {
                self.send_ack(ack, now).await;
                true
            }
            None => false,
        };

        let mut relayed_to = Vec::new();
        if let Some((relayed, targets)) = plan.relay {
            let id = relayed.id;
            match self
                .enqueue(Self::message_outbound(relayed, targets.clone()), now, 1)
                .await
            {
                Ok(()) => {
                    debug!("Relaying {} from {} to {:?}", id, from, targets);
                    self.stats.write().await.messages_relayed += 1;
                    self.emit(RouterEvent::Relayed {
                        message_id: id,
                        targets: targets.clone(),
                    });
                    relayed_to = targets;
                }
                Err(e) => warn!("Dropped relay of {}: {}", id, e),
            }
        }

        Ok(InboundOutcome::Processed {
            delivered,
            acked,
            relayed_to,
        })
    }

    async fn deliver_local(&self, message: &NetworkMessage, from: &PeerId) -> bool {
        if message.message_type == MessageType::Ack {
            let Some(original) = message.ack_for else {
                return false;
            };
            if !message.is_only_for(&self.local) {
                return false;
            }
            return match self.acks.write().await.acknowledge(&original) {
                Some(pending) => {
                    info!(
                        "{} acknowledged by {} after {} retries",
                        original, message.sender, pending.retry_count
                    );
                    self.stats.write().await.acks_received += 1;
                    self.emit(RouterEvent::Delivered {
                        message_id: original,
                        acked_by: message.sender.clone(),
                    });
                    true
                }
                None => {
                    trace!("Ack for unknown or settled {}", original);
                    false
                }
            };
        }

        self.stats.write().await.messages_delivered += 1;
        self.emit(RouterEvent::Received {
            message: message.clone(),
            from: from.clone(),
        });
        true
    }

    async fn send_ack(&self, ack: NetworkMessage, now: Instant) {
        let id = ack.id;
        self.dedup_cache.write().await.mark_seen(id, now);

        let targets = self.resolve(&ack.recipient, now).await;
        if targets.is_empty() {
            debug!("No peers to carry ack {}", id);
            return;
        }

        match self.enqueue(Self::message_outbound(ack, targets), now, 1).await {
            Ok(()) => self.stats.write().await.acks_sent += 1,
            Err(e) => warn!("Dropped ack {}: {}", id, e),
        }
    }

    /// Queue a topology broadcast (best effort)
    pub async fn enqueue_topology(&self, message: TopologyMessage, targets: Vec<PeerId>) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let outbound = Outbound {
            envelope: Envelope::Topology(message),
            targets,
            mode: SendMode::BestEffort,
            priority: Priority::from_u8(TOPOLOGY_PRIORITY),
            message_id: None,
        };
        self.enqueue(outbound, now(), 1).await
    }

    /// Queue a control envelope (ping, pong, discovery token)
    pub async fn enqueue_control(
        &self,
        envelope: Envelope,
        targets: Vec<PeerId>,
        mode: SendMode,
    ) -> Result<()> {
        let outbound = Outbound {
            envelope,
            targets,
            mode,
            priority: Priority::background(),
            message_id: None,
        };
        self.enqueue(outbound, now(), 1).await
    }

    /// Next send for the drain worker, highest priority first
    pub async fn next_outbound(&self) -> Option<QueuedMessage> {
        self.outbound_queue.write().await.dequeue()
    }

    /// Retry overdue messages and report exhausted ones
    pub async fn poll_acks(&self) -> Vec<AckAction> {
        let now = now();
        let actions = self.acks.write().await.poll(now);

        for action in &actions {
            match action {
                AckAction::Retry { message, attempt } => {
                    let targets = self.resolve(&message.recipient, now).await;
                    if targets.is_empty() {
                        debug!("Retry {} of {}: no peers", attempt, message.id);
                        continue;
                    }
                    debug!("Retry {} of {} via {:?}", attempt, message.id, targets);
                    let outbound = Self::message_outbound(message.clone(), targets);
                    if self.enqueue(outbound, now, *attempt).await.is_ok() {
                        self.stats.write().await.retries += 1;
                    }
                }
                AckAction::Failed {
                    message_id,
                    attempts,
                } => {
                    warn!("{} failed after {} attempts", message_id, attempts);
                    self.stats.write().await.delivery_failures += 1;
                    self.emit(RouterEvent::DeliveryFailed {
                        message_id: *message_id,
                        attempts: *attempts,
                    });
                }
            }
        }

        actions
    }

    /// Drop expired cache entries
    pub async fn cleanup(&self) -> usize {
        self.dedup_cache.write().await.cleanup_expired(now())
    }

    /// Return a send the transport failed to carry
    ///
    /// It goes back at the head of its band so ordering within the band is
    /// kept.
    pub async fn requeue(&self, queued: QueuedMessage) -> Result<()> {
        self.outbound_queue.write().await.requeue(queued)
    }

    /// Discard queued sends (transport restart)
    pub async fn clear_queue(&self) -> usize {
        let mut queue = self.outbound_queue.write().await;
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    pub async fn pending_acks(&self) -> usize {
        self.acks.read().await.len()
    }

    pub async fn is_pending(&self, id: &MessageId) -> bool {
        self.acks.read().await.is_pending(id)
    }

    pub async fn queue_stats(&self) -> PriorityQueueStats {
        self.outbound_queue.read().await.stats()
    }

    pub async fn get_stats(&self) -> RouterStats {
        self.stats.read().await.clone()
    }

    pub async fn clear_stats(&self) {
        *self.stats.write().await = RouterStats::default();
    }
}
