//! Mesh node
//!
//! Wires the slot pool, orchestrator, router and topology protocol to a
//! transport and runs the periodic workers:
//!
//! - transport event loop (discovery, link changes, inbound bytes)
//! - outbound drain, highest priority first
//! - ack retry sweep
//! - slot idle sweep, handshake watchdog, stuck detection, postponed retries
//! - periodic topology broadcast and route expiry
//! - liveness pings feeding the disconnection predictor
//!
//! Every worker stops on the shared shutdown channel and its handle is kept
//! so `shutdown` can wait for it.

use meshlink_orchestrator::{
    AdmissionResult, ClusterMember, ConnectionRequest, DisconnectReason, HandshakeWatchdog,
    LeaderView, Orchestrator, ReputationLedger, ReputationSource, StaticLeaderView,
    StaticSystemMonitor, StuckDetector, SystemMonitor,
};
use meshlink_protocol::{
    Destination, Envelope, MessageId, MessageType, PeerId, SendMode, TopologyMessage,
};
use meshlink_routing::{
    RouteSummary, Router, RouterEvent, RouterStats, RoutingTable, TopologyDisposition,
    TopologyProtocol,
};
use meshlink_slots::{SlotManager, SlotStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::breaker::{BreakerState, TransportBreaker};
use crate::config::Config;
use crate::error::{NodeError, Result};
use crate::events::MeshEvent;
use crate::transport::{LinkState, MeshTransport, TransportEvent};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Services the orchestrator consults
#[derive(Clone)]
pub struct Collaborators {
    pub reputation: Arc<dyn ReputationSource>,
    pub leader: Arc<dyn LeaderView>,
    pub monitor: Arc<dyn SystemMonitor>,
}

impl Collaborators {
    /// Local reputation ledger, no coordinator, mains power
    pub fn standalone(config: &Config) -> Self {
        Self {
            reputation: Arc::new(ReputationLedger::new(config.reputation.clone())),
            leader: Arc::new(StaticLeaderView::none()),
            monitor: Arc::new(StaticSystemMonitor::default()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WorkerSettings {
    drain_interval: Duration,
    ack_poll_interval: Duration,
    sweep_interval: Duration,
    broadcast_interval: Duration,
    ping_interval: Duration,
    monitored_ping_interval: Duration,
    ping_timeout: Duration,
}

impl WorkerSettings {
    fn from_config(config: &Config) -> Self {
        Self {
            drain_interval: Duration::from_millis(config.reliability.drain_interval_ms),
            ack_poll_interval: Duration::from_millis(config.reliability.ack_poll_interval_ms),
            sweep_interval: Duration::from_secs(config.slots.sweep_interval_secs),
            broadcast_interval: Duration::from_secs(config.topology.broadcast_interval_secs),
            ping_interval: Duration::from_secs(config.transport.ping_interval_secs),
            monitored_ping_interval: Duration::from_secs(
                config.transport.monitored_ping_interval_secs,
            ),
            ping_timeout: Duration::from_secs(config.transport.ping_timeout_secs),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingPing {
    peer: PeerId,
    sent: Instant,
}

#[derive(Debug, Clone)]
struct Postponed {
    resume_at: Instant,
    request: ConnectionRequest,
}

/// State shared by the node handle and its workers
struct NodeInner {
    local: PeerId,
    settings: WorkerSettings,
    transport: Arc<dyn MeshTransport>,
    orchestrator: Arc<Orchestrator>,
    router: Router,
    topology: TopologyProtocol,
    table: Arc<RwLock<RoutingTable>>,
    watchdog: Mutex<HandshakeWatchdog>,
    stuck: Mutex<StuckDetector>,
    breaker: Mutex<TransportBreaker>,
    backoff_until: Mutex<Option<Instant>>,
    pings: Mutex<HashMap<u64, PendingPing>>,
    last_pinged: Mutex<HashMap<PeerId, Instant>>,
    next_nonce: AtomicU64,
    postponed: Mutex<HashMap<PeerId, Postponed>>,
    /// An eager broadcast was suppressed and is still owed
    eager_pending: AtomicBool,
    events: broadcast::Sender<MeshEvent>,
    started: Instant,
}

/// A running mesh node
pub struct MeshNode {
    inner: Arc<NodeInner>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshNode {
    /// Build the node and spawn its workers
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(
        config: &Config,
        transport: Arc<dyn MeshTransport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| NodeError::Config(format!("{:#}", e)))?;
        let local = config
            .peer_id()
            .map_err(|e| NodeError::Config(format!("{:#}", e)))?;

        let slots = SlotManager::new(config.slot_pool())?;
        let orchestrator = Arc::new(Orchestrator::new(
            config.admission(),
            slots,
            collaborators.reputation,
            collaborators.leader,
            collaborators.monitor,
        )?);

        let topology_config = config.topology_protocol();
        let table = Arc::new(RwLock::new(RoutingTable::new(
            local.clone(),
            topology_config.entry_ttl(),
        )));

        let mut router = Router::new(local.clone(), config.router(), Arc::clone(&table));
        let (router_tx, router_rx) = Router::create_event_channel();
        router.set_event_channel(router_tx);

        let topology = TopologyProtocol::new(local.clone(), topology_config, Arc::clone(&table));

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let inner = Arc::new(NodeInner {
            local: local.clone(),
            settings: WorkerSettings::from_config(config),
            transport,
            orchestrator,
            router,
            topology,
            table,
            watchdog: Mutex::new(HandshakeWatchdog::new(Duration::from_secs(
                config.transport.handshake_timeout_secs,
            ))),
            stuck: Mutex::new(StuckDetector::new(
                Duration::from_secs(config.transport.stuck_base_secs),
                Duration::from_secs(config.transport.stuck_max_secs),
            )),
            breaker: Mutex::new(TransportBreaker::new(config.breaker())),
            backoff_until: Mutex::new(None),
            pings: Mutex::new(HashMap::new()),
            last_pinged: Mutex::new(HashMap::new()),
            next_nonce: AtomicU64::new(1),
            postponed: Mutex::new(HashMap::new()),
            eager_pending: AtomicBool::new(false),
            events,
            started: now(),
        });

        let node = MeshNode {
            inner,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        };
        node.spawn_workers(transport_events, router_rx);

        info!("Mesh node {} started", local);
        Ok(node)
    }

    fn spawn_workers(
        &self,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        router_events: mpsc::UnboundedReceiver<RouterEvent>,
    ) {
        let settings = self.inner.settings;
        let handles = vec![
            self.spawn_transport_loop(transport_events),
            self.spawn_router_forwarder(router_events),
            self.spawn_orchestrator_forwarder(),
            self.spawn_periodic("drain", settings.drain_interval, |inner| async move {
                inner.drain().await
            }),
            self.spawn_periodic("ack", settings.ack_poll_interval, |inner| async move {
                inner.router.poll_acks().await;
            }),
            self.spawn_periodic("sweep", settings.sweep_interval, |inner| async move {
                inner.sweep().await
            }),
            self.spawn_periodic("topology", settings.broadcast_interval, |inner| async move {
                inner.topology_tick().await
            }),
            self.spawn_periodic("ping", settings.monitored_ping_interval, |inner| async move {
                inner.ping_tick().await
            }),
        ];
        self.tasks.lock().extend(handles);
    }

    fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(Arc<NodeInner>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("{} worker shutting down", name);
                        break;
                    }
                    _ = ticker.tick() => tick(Arc::clone(&inner)).await,
                }
            }
        })
    }

    fn spawn_transport_loop(
        &self,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    event = transport_events.recv() => match event {
                        Some(event) => inner.handle_transport_event(event).await,
                        None => {
                            warn!("Transport event stream closed");
                            break;
                        }
                    },
                }
            }
        })
    }

    fn spawn_router_forwarder(
        &self,
        mut router_events: mpsc::UnboundedReceiver<RouterEvent>,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    event = router_events.recv() => match event {
                        Some(event) => inner.emit(event.into()),
                        None => break,
                    },
                }
            }
        })
    }

    fn spawn_orchestrator_forwarder(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let mut orchestrator_events = self.inner.orchestrator.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    event = orchestrator_events.recv() => match event {
                        Ok(event) => inner.emit(event.into()),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Missed {} orchestrator events", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    pub fn local(&self) -> &PeerId {
        &self.inner.local
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.inner.events.subscribe()
    }

    /// Queue an application message
    pub async fn send_message(
        &self,
        content: Vec<u8>,
        message_type: MessageType,
        destination: Destination,
        requires_ack: bool,
    ) -> Result<MessageId> {
        let id = self
            .inner
            .router
            .send_message(content, message_type, destination, requires_ack)
            .await?;
        Ok(id)
    }

    /// Handle a discovery reported outside the transport event stream
    pub async fn peer_discovered(&self, peer: PeerId, context: &str) {
        self.inner.admit(peer, context.to_string()).await;
    }

    /// Disconnect a peer on request
    pub async fn disconnect(&self, peer: &PeerId) {
        self.inner
            .release_peer(peer, DisconnectReason::Requested)
            .await;
    }

    /// Tear down the transport session and re-derive state
    pub async fn restart_transport(&self) {
        self.inner.restart_transport().await;
    }

    pub fn slot_status(&self) -> SlotStatus {
        self.inner.orchestrator.slots().status()
    }

    pub fn cluster_members(&self) -> Vec<ClusterMember> {
        self.inner.orchestrator.cluster_members()
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.inner.orchestrator
    }

    pub async fn routing_summary(&self) -> Vec<RouteSummary> {
        self.inner.table.read().await.summary(now())
    }

    pub async fn direct_peers(&self) -> Vec<PeerId> {
        self.inner.table.read().await.direct_peers()
    }

    pub async fn next_hops(&self, destination: &PeerId) -> Vec<PeerId> {
        self.inner.table.read().await.next_hops(destination, now())
    }

    pub async fn router_stats(&self) -> RouterStats {
        self.inner.router.get_stats().await
    }

    /// Stop every worker and wait for them to finish
    pub async fn shutdown(&self) {
        info!("Shutting down mesh node {}", self.inner.local);
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker ended abnormally: {}", e);
            }
        }
        info!("Mesh node {} stopped", self.inner.local);
    }
}

impl NodeInner {
    fn emit(&self, event: MeshEvent) {
        let _ = self.events.send(event);
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::PeerDiscovered { peer, context } => {
                self.admit(peer, context).await;
            }
            TransportEvent::PeerLost(peer) => {
                self.postponed.lock().remove(&peer);
                self.link_down(&peer, DisconnectReason::LinkLost).await;
            }
            TransportEvent::LinkStateChanged(peer, LinkState::Connected) => {
                self.link_up(peer).await;
            }
            TransportEvent::LinkStateChanged(peer, LinkState::Disconnected) => {
                self.link_down(&peer, DisconnectReason::LinkLost).await;
            }
            TransportEvent::LinkStateChanged(peer, LinkState::Connecting) => {
                trace!("Link to {} connecting", peer);
            }
            TransportEvent::Received { from, bytes } => {
                self.receive(from, &bytes).await;
            }
        }
    }

    /// Run admission for a peer that wants to connect
    async fn admit(&self, peer: PeerId, context: String) {
        let request = self.orchestrator.request(&peer, &context);
        self.admit_request(request).await;
    }

    async fn admit_request(&self, request: ConnectionRequest) {
        let peer = request.peer.clone();
        if peer == self.local || self.orchestrator.is_member(&peer) {
            return;
        }
        if !self.watchdog.lock().begin(&peer, now()) {
            debug!("Handshake with {} already in flight", peer);
            return;
        }

        match self.orchestrator.execute_request(&request) {
            AdmissionResult::Admitted { evicted, .. } => {
                self.postponed.lock().remove(&peer);
                if let Some(eviction) = evicted {
                    self.release_peer(&eviction.peer, DisconnectReason::Evicted)
                        .await;
                }
                // The handshake completes when the link comes up
                match self.transport.invite_or_accept(&peer).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!("{} is out of reach", peer);
                        self.abandon_handshake(&peer);
                    }
                    Err(e) => {
                        warn!("Invite to {} failed: {}", peer, e);
                        self.abandon_handshake(&peer);
                    }
                }
            }
            AdmissionResult::Postponed { resume_at } => {
                self.watchdog.lock().finish(&peer);
                self.postponed
                    .lock()
                    .insert(peer, Postponed { resume_at, request });
            }
            AdmissionResult::Rejected(_) => {
                self.watchdog.lock().finish(&peer);
            }
        }
    }

    fn abandon_handshake(&self, peer: &PeerId) {
        self.watchdog.lock().finish(peer);
        self.orchestrator
            .handle_disconnection(peer, DisconnectReason::HandshakeTimeout);
    }

    async fn link_up(&self, peer: PeerId) {
        self.watchdog.lock().finish(&peer);

        if !self.orchestrator.is_member(&peer) {
            // A link we did not ask for still needs a slot
            match self.orchestrator.execute_connection(&peer, "") {
                AdmissionResult::Admitted { evicted, .. } => {
                    if let Some(eviction) = evicted {
                        self.release_peer(&eviction.peer, DisconnectReason::Evicted)
                            .await;
                    }
                }
                _ => {
                    debug!("Refusing inbound link from {}", peer);
                    if let Err(e) = self.transport.disconnect(&peer).await {
                        warn!("Failed to disconnect {}: {}", peer, e);
                    }
                    return;
                }
            }
        }

        self.table.write().await.set_direct(peer.clone());
        self.orchestrator.slots().record_activity(&peer);
        info!("Link up: {}", peer);
        self.request_eager_broadcast().await;
    }

    async fn link_down(&self, peer: &PeerId, reason: DisconnectReason) {
        self.watchdog.lock().finish(peer);
        self.forget_link(peer);

        let was_direct = self.table.write().await.remove_direct(peer);
        if self.orchestrator.is_member(peer) {
            self.orchestrator.handle_disconnection(peer, reason);
        }
        if was_direct {
            info!("Link down: {}", peer);
            self.request_eager_broadcast().await;
        }
    }

    /// Drop a peer on our own initiative
    async fn release_peer(&self, peer: &PeerId, reason: DisconnectReason) {
        // Tear down local state first so the transport's disconnect event
        // finds nothing left to do
        self.orchestrator.handle_disconnection(peer, reason);
        self.table.write().await.remove_direct(peer);
        self.forget_link(peer);

        if let Err(e) = self.transport.disconnect(peer).await {
            warn!("Failed to disconnect {}: {}", peer, e);
        }
        self.request_eager_broadcast().await;
    }

    fn forget_link(&self, peer: &PeerId) {
        self.stuck.lock().resolved(peer);
        self.last_pinged.lock().remove(peer);
        self.pings.lock().retain(|_, ping| &ping.peer != peer);
    }

    async fn request_eager_broadcast(&self) {
        match self.topology.eager_broadcast(now()).await {
            Some(message) => {
                self.eager_pending.store(false, Ordering::Relaxed);
                self.broadcast_topology(message).await;
            }
            None => {
                self.eager_pending.store(true, Ordering::Relaxed);
            }
        }
    }

    async fn broadcast_topology(&self, message: TopologyMessage) {
        let targets = self.table.read().await.direct_peers();
        if let Err(e) = self.router.enqueue_topology(message, targets).await {
            warn!("Dropped topology broadcast: {}", e);
        }
    }

    async fn receive(&self, from: PeerId, bytes: &[u8]) {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping undecodable envelope from {}: {}", from, e);
                return;
            }
        };

        self.orchestrator.slots().record_activity(&from);
        self.stuck.lock().resolved(&from);

        match envelope {
            Envelope::Message(message) => {
                if let Err(e) = self.router.handle_inbound(message, &from).await {
                    debug!("Inbound message from {} dropped: {}", from, e);
                }
            }
            Envelope::Topology(message) => {
                match self.topology.handle_inbound(message, &from, now()).await {
                    Ok(TopologyDisposition {
                        relay: Some((relayed, targets)),
                        ..
                    }) => {
                        if let Err(e) = self.router.enqueue_topology(relayed, targets).await {
                            warn!("Dropped topology relay: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Invalid topology broadcast from {}: {}", from, e);
                    }
                }
            }
            Envelope::Ping { nonce, sent_at_ms } => {
                let pong = Envelope::Pong { nonce, sent_at_ms };
                if let Err(e) = self
                    .router
                    .enqueue_control(pong, vec![from], SendMode::BestEffort)
                    .await
                {
                    debug!("Dropped pong: {}", e);
                }
            }
            Envelope::Pong { nonce, .. } => {
                let pending = self.pings.lock().remove(&nonce);
                if let Some(ping) = pending.filter(|p| p.peer == from) {
                    let rtt = now().saturating_duration_since(ping.sent);
                    self.orchestrator
                        .record_link_sample(&from, rtt.as_secs_f64() * 1000.0, false);
                }
            }
            Envelope::DiscoveryToken { peer, token } => {
                let context = String::from_utf8_lossy(&token).into_owned();
                self.admit(peer, context).await;
            }
        }
    }

    /// Hand queued sends to the transport
    async fn drain(&self) {
        let backoff_until = *self.backoff_until.lock();
        if backoff_until.is_some_and(|until| now() < until) {
            return;
        }

        while let Some(queued) = self.router.next_outbound().await {
            let bytes = match queued.outbound.envelope.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Dropping unencodable envelope: {}", e);
                    continue;
                }
            };

            let result = self
                .transport
                .send(&queued.outbound.targets, &bytes, queued.outbound.mode)
                .await;
            if let Err(e) = result {
                warn!("Send to {:?} failed: {}", queued.outbound.targets, e);
                let state = self.breaker.lock().record_failure();
                match state {
                    BreakerState::Retry { after } => {
                        *self.backoff_until.lock() = Some(now() + after);
                        if let Err(e) = self.router.requeue(queued).await {
                            warn!("Dropped failed send: {}", e);
                        }
                    }
                    // The restart discards the queue, this send included
                    BreakerState::RestartRequired => {
                        self.restart_transport().await;
                    }
                }
                return;
            }

            self.breaker.lock().record_success();
            trace!(
                "Sent {:?} (attempt {}) to {:?}",
                queued.outbound.envelope.kind(),
                queued.attempt,
                queued.outbound.targets
            );
        }
    }

    async fn sweep(&self) {
        let now = now();

        let report = self.orchestrator.slots().sweep();
        for release in report.idle {
            self.release_peer(&release.peer, DisconnectReason::IdleTimeout)
                .await;
        }

        let timed_out = self.watchdog.lock().sweep(now);
        for peer in timed_out {
            self.orchestrator
                .handle_disconnection(&peer, DisconnectReason::HandshakeTimeout);
            if let Err(e) = self.transport.disconnect(&peer).await {
                warn!("Failed to disconnect {}: {}", peer, e);
            }
        }

        let stuck = self.stuck.lock().sweep(now);
        for peer in stuck {
            warn!("Forcing reconnect to {}", peer);
            match self.transport.invite_or_accept(&peer).await {
                Ok(true) => {}
                Ok(false) => self.link_down(&peer, DisconnectReason::LinkLost).await,
                Err(e) => warn!("Reconnect to {} failed: {}", peer, e),
            }
        }

        let due: Vec<ConnectionRequest> = {
            let mut postponed = self.postponed.lock();
            let ready: Vec<PeerId> = postponed
                .iter()
                .filter(|(_, p)| p.resume_at <= now)
                .map(|(peer, _)| peer.clone())
                .collect();
            ready
                .into_iter()
                .filter_map(|peer| postponed.remove(&peer).map(|p| p.request))
                .collect()
        };
        for request in due {
            debug!(
                "Retrying request from {} after {:?}",
                request.peer,
                now.saturating_duration_since(request.arrived_at)
            );
            self.admit_request(request).await;
        }

        if self.eager_pending.load(Ordering::Relaxed) {
            self.request_eager_broadcast().await;
        }

        self.router.cleanup().await;
    }

    async fn topology_tick(&self) {
        let now = now();
        let message = self.topology.local_broadcast(now).await;
        self.broadcast_topology(message).await;

        let lost = self.topology.expire(now).await;
        for destination in lost {
            debug!("No route left to {}", destination);
        }
    }

    async fn ping_tick(&self) {
        let now = now();
        let timeout = self.settings.ping_timeout;

        let unanswered: Vec<PeerId> = {
            let mut pings = self.pings.lock();
            let expired: Vec<u64> = pings
                .iter()
                .filter(|(_, p)| now.saturating_duration_since(p.sent) >= timeout)
                .map(|(nonce, _)| *nonce)
                .collect();
            expired
                .into_iter()
                .filter_map(|nonce| pings.remove(&nonce))
                .map(|p| p.peer)
                .collect()
        };
        for peer in unanswered {
            self.orchestrator.record_link_sample(&peer, 0.0, true);
        }

        let direct = self.table.read().await.direct_peers();
        for peer in direct {
            let every = if self.orchestrator.is_monitored(&peer) {
                self.settings.monitored_ping_interval
            } else {
                self.settings.ping_interval
            };
            let due = {
                let mut last = self.last_pinged.lock();
                let due = last
                    .get(&peer)
                    .map_or(true, |at| now.saturating_duration_since(*at) >= every);
                if due {
                    last.insert(peer.clone(), now);
                }
                due
            };
            if !due {
                continue;
            }

            let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
            self.pings.lock().insert(
                nonce,
                PendingPing {
                    peer: peer.clone(),
                    sent: now,
                },
            );
            self.stuck.lock().waiting_on(&peer, now);

            let sent_at_ms = now.saturating_duration_since(self.started).as_millis() as u64;
            let ping = Envelope::Ping { nonce, sent_at_ms };
            if let Err(e) = self
                .router
                .enqueue_control(ping, vec![peer], SendMode::BestEffort)
                .await
            {
                debug!("Dropped ping: {}", e);
            }
        }
    }

    async fn restart_transport(&self) {
        warn!("Restarting transport session");

        let dropped = self.router.clear_queue().await;
        let released = self.orchestrator.reset();
        self.table.write().await.clear_direct();
        self.watchdog.lock().clear();
        self.stuck.lock().clear();
        self.pings.lock().clear();
        self.last_pinged.lock().clear();
        self.breaker.lock().reset();
        *self.backoff_until.lock() = None;

        if let Err(e) = self.transport.restart().await {
            error!("Transport restart failed: {}", e);
        }

        info!(
            "Transport restarted: released {} peers, dropped {} queued sends",
            released.len(),
            dropped
        );
        self.emit(MeshEvent::TransportRestarted { released });
    }
}
