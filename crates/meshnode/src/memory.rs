//! In-process transport
//!
//! `MemoryNetwork` simulates radio range and links between nodes living in
//! the same process. Recent sends are kept so tests can assert on exactly
//! what went over the air; the history is bounded and drops its oldest
//! records first.

use meshlink_protocol::{Envelope, PeerId, SendMode};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{NodeError, Result};
use crate::transport::{LinkState, MeshTransport, TransportEvent};

/// Sends kept by `MemoryNetwork::new`
pub const DEFAULT_SEND_HISTORY: usize = 10_000;

/// One recorded `send` call
#[derive(Debug, Clone, PartialEq)]
pub struct SentRecord {
    pub from: PeerId,
    pub targets: Vec<PeerId>,
    pub mode: SendMode,
    /// Decoded copy of what was sent
    pub envelope: Option<Envelope>,
}

type Pair = (PeerId, PeerId);

fn pair(a: &PeerId, b: &PeerId) -> Pair {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    nodes: HashMap<PeerId, mpsc::UnboundedSender<TransportEvent>>,
    in_range: HashMap<Pair, String>,
    connected: HashSet<Pair>,
    failing: HashSet<PeerId>,
    /// Sends accepted but never delivered
    muted: HashSet<PeerId>,
    /// Invites accepted but the link never comes up
    stalled: HashSet<PeerId>,
    sent: VecDeque<SentRecord>,
    history: usize,
    restarts: HashMap<PeerId, usize>,
    invites: HashMap<PeerId, usize>,
}

impl NetworkState {
    fn notify(&self, peer: &PeerId, event: TransportEvent) {
        if let Some(tx) = self.nodes.get(peer) {
            if tx.send(event).is_err() {
                trace!("{} no longer listening", peer);
            }
        }
    }

    fn drop_link(&mut self, a: &PeerId, b: &PeerId) {
        if self.connected.remove(&pair(a, b)) {
            self.notify(a, TransportEvent::LinkStateChanged(b.clone(), LinkState::Disconnected));
            self.notify(b, TransportEvent::LinkStateChanged(a.clone(), LinkState::Disconnected));
        }
    }
}

/// Shared medium connecting in-process transports
#[derive(Debug)]
pub struct MemoryNetwork {
    state: Mutex<NetworkState>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Self::with_history(DEFAULT_SEND_HISTORY)
    }

    /// Network keeping at most `history` send records
    pub fn with_history(history: usize) -> Arc<Self> {
        Arc::new(MemoryNetwork {
            state: Mutex::new(NetworkState {
                history,
                ..NetworkState::default()
            }),
        })
    }

    /// Register a node and get its transport and event stream
    pub fn attach(
        self: &Arc<Self>,
        peer: PeerId,
    ) -> (Arc<MemoryTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().nodes.insert(peer.clone(), tx);
        let transport = Arc::new(MemoryTransport {
            local: peer,
            network: Arc::clone(self),
        });
        (transport, rx)
    }

    /// Bring two nodes into range with no context
    pub fn link(&self, a: &PeerId, b: &PeerId) {
        self.link_with_context(a, b, "");
    }

    /// Bring two nodes into range; both discover each other with `context`
    pub fn link_with_context(&self, a: &PeerId, b: &PeerId, context: &str) {
        let mut state = self.state.lock();
        state.in_range.insert(pair(a, b), context.to_string());
        state.notify(
            a,
            TransportEvent::PeerDiscovered {
                peer: b.clone(),
                context: context.to_string(),
            },
        );
        state.notify(
            b,
            TransportEvent::PeerDiscovered {
                peer: a.clone(),
                context: context.to_string(),
            },
        );
    }

    /// Bring two nodes into range without either noticing
    pub fn place_in_range(&self, a: &PeerId, b: &PeerId, context: &str) {
        self.state
            .lock()
            .in_range
            .insert(pair(a, b), context.to_string());
    }

    /// Take two nodes out of range without notifying them; an open link
    /// stays up until someone tries to re-establish it
    pub fn leave_range(&self, a: &PeerId, b: &PeerId) {
        self.state.lock().in_range.remove(&pair(a, b));
    }

    /// Move two nodes out of range, dropping their link
    pub fn unlink(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.state.lock();
        state.in_range.remove(&pair(a, b));
        state.drop_link(a, b);
        state.notify(a, TransportEvent::PeerLost(b.clone()));
        state.notify(b, TransportEvent::PeerLost(a.clone()));
    }

    /// Make every send from `peer` fail
    pub fn set_failing(&self, peer: &PeerId, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing.insert(peer.clone());
        } else {
            state.failing.remove(peer);
        }
    }

    /// Accept every send from `peer` but deliver none of them
    pub fn set_muted(&self, peer: &PeerId, muted: bool) {
        let mut state = self.state.lock();
        if muted {
            state.muted.insert(peer.clone());
        } else {
            state.muted.remove(peer);
        }
    }

    /// Accept invites from `peer` without ever bringing the link up
    pub fn set_stalled(&self, peer: &PeerId, stalled: bool) {
        let mut state = self.state.lock();
        if stalled {
            state.stalled.insert(peer.clone());
        } else {
            state.stalled.remove(peer);
        }
    }

    /// Deliver a raw event to a node
    pub fn inject(&self, peer: &PeerId, event: TransportEvent) {
        self.state.lock().notify(peer, event);
    }

    pub fn is_connected(&self, a: &PeerId, b: &PeerId) -> bool {
        self.state.lock().connected.contains(&pair(a, b))
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.state.lock().sent.iter().cloned().collect()
    }

    pub fn sends_from(&self, peer: &PeerId) -> Vec<SentRecord> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|r| &r.from == peer)
            .cloned()
            .collect()
    }

    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    pub fn restarts(&self, peer: &PeerId) -> usize {
        self.state.lock().restarts.get(peer).copied().unwrap_or(0)
    }

    /// `invite_or_accept` calls made by `peer`
    pub fn invites(&self, peer: &PeerId) -> usize {
        self.state.lock().invites.get(peer).copied().unwrap_or(0)
    }
}

/// A node's handle on the memory network
#[derive(Debug)]
pub struct MemoryTransport {
    local: PeerId,
    network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    pub fn local(&self) -> &PeerId {
        &self.local
    }
}

#[async_trait::async_trait]
impl MeshTransport for MemoryTransport {
    async fn send(&self, targets: &[PeerId], bytes: &[u8], mode: SendMode) -> Result<()> {
        let mut state = self.network.state.lock();
        if state.failing.contains(&self.local) {
            return Err(NodeError::Transport(format!(
                "send from {} failed",
                self.local
            )));
        }

        if state.history > 0 {
            if state.sent.len() >= state.history {
                state.sent.pop_front();
            }
            state.sent.push_back(SentRecord {
                from: self.local.clone(),
                targets: targets.to_vec(),
                mode,
                envelope: Envelope::decode(bytes).ok(),
            });
        }

        if state.muted.contains(&self.local) {
            trace!("{} is muted", self.local);
            return Ok(());
        }

        for target in targets {
            if state.connected.contains(&pair(&self.local, target)) {
                state.notify(
                    target,
                    TransportEvent::Received {
                        from: self.local.clone(),
                        bytes: bytes.to_vec(),
                    },
                );
            } else {
                trace!("{} -> {} dropped: no link", self.local, target);
            }
        }
        Ok(())
    }

    async fn invite_or_accept(&self, peer: &PeerId) -> Result<bool> {
        let mut state = self.network.state.lock();
        *state.invites.entry(self.local.clone()).or_default() += 1;
        let key = pair(&self.local, peer);
        if !state.in_range.contains_key(&key) {
            return Ok(false);
        }
        if state.stalled.contains(&self.local) {
            trace!("Invite from {} to {} stalled", self.local, peer);
            return Ok(true);
        }
        if state.connected.insert(key) {
            state.notify(
                &self.local,
                TransportEvent::LinkStateChanged(peer.clone(), LinkState::Connected),
            );
            state.notify(
                peer,
                TransportEvent::LinkStateChanged(self.local.clone(), LinkState::Connected),
            );
        }
        Ok(true)
    }

    async fn disconnect(&self, peer: &PeerId) -> Result<()> {
        self.network.state.lock().drop_link(&self.local, peer);
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        let mut state = self.network.state.lock();
        *state.restarts.entry(self.local.clone()).or_default() += 1;

        let links: Vec<Pair> = state
            .connected
            .iter()
            .filter(|(a, b)| a == &self.local || b == &self.local)
            .cloned()
            .collect();
        for (a, b) in links {
            state.drop_link(&a, &b);
        }

        // A fresh session rediscovers everything in range
        let neighbours: Vec<(PeerId, String)> = state
            .in_range
            .iter()
            .filter_map(|((a, b), context)| {
                if a == &self.local {
                    Some((b.clone(), context.clone()))
                } else if b == &self.local {
                    Some((a.clone(), context.clone()))
                } else {
                    None
                }
            })
            .collect();
        for (peer, context) in neighbours {
            state.notify(&self.local, TransportEvent::PeerDiscovered { peer, context });
        }
        Ok(())
    }
}
