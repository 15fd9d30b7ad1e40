//! Transport seams and routing.
//!
//! The BLE GATT stack, the WiFi-Direct P2P stack, and the Noise
//! handshake engine are external collaborators. The engine reaches them
//! through the [`MeshTransport`] capability; the transports call back
//! into the engine's inbound entry points. Neither side owns the other:
//! the two are cross-wired at construction time.

mod router;

pub use router::{BlePeerInfo, TransportRouter, WifiPeerInfo};

use crate::chat::message::MessageId;
use crate::error::Result;
use crate::identity::PeerAddress;

/// A radio link able to carry a packet to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Bluetooth Low Energy: short range, cheap on battery.
    Ble,
    /// WiFi-Direct: longer range, higher throughput.
    WifiDirect,
}

/// Outbound capability handed to the conversation engine.
///
/// Implementations must not block: `send_*` enqueue work and return
/// without awaiting delivery. Delivery and read confirmations come back
/// asynchronously through the engine's inbound entry points.
pub trait MeshTransport: Send + Sync {
    /// Whether an established Noise session exists with the peer.
    fn has_session(&self, peer: &PeerAddress) -> bool;

    /// Start a Noise handshake with the peer.
    fn initiate_handshake(&self, peer: &PeerAddress) -> Result<()>;

    /// Send an encrypted private message. Returns once the packet is
    /// queued, not once it is delivered.
    fn send_private(
        &self,
        content: &str,
        to: &PeerAddress,
        recipient_nickname: &str,
        id: &MessageId,
    ) -> Result<()>;

    /// Send a read receipt for one message. Best effort.
    fn send_read_receipt(&self, to: &PeerAddress, id: &MessageId) -> Result<()>;

    /// Send an identity announcement to the peer.
    fn send_announce(&self, to: &PeerAddress) -> Result<()>;
}
