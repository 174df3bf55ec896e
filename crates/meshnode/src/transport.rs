//! Transport abstraction
//!
//! The physical link layer (radio, BLE, Wi-Fi Direct...) lives outside the
//! node. It is driven through [`MeshTransport`] and reports what happens on
//! the air through a channel of [`TransportEvent`]s.

use meshlink_protocol::{PeerId, SendMode};

use crate::error::Result;

/// Link state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
}

/// Something the transport observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer came into range, announcing a context string
    PeerDiscovered { peer: PeerId, context: String },
    /// A peer went out of range
    PeerLost(PeerId),
    LinkStateChanged(PeerId, LinkState),
    /// Bytes arrived over the link to `from`
    Received { from: PeerId, bytes: Vec<u8> },
}

/// Session-level transport
#[async_trait::async_trait]
pub trait MeshTransport: Send + Sync {
    /// Send one encoded envelope to every target
    async fn send(&self, targets: &[PeerId], bytes: &[u8], mode: SendMode) -> Result<()>;

    /// Invite `peer` or accept its pending invitation
    ///
    /// Returns false when the peer can't be reached.
    async fn invite_or_accept(&self, peer: &PeerId) -> Result<bool>;

    /// Drop the link to `peer`
    async fn disconnect(&self, peer: &PeerId) -> Result<()>;

    /// Tear down and rebuild the session
    async fn restart(&self) -> Result<()>;
}
