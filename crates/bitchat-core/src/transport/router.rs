//! Adaptive transport selection.
//!
//! Given what is known about a peer's reachability, the radio signal,
//! the battery level, and the payload size, pick BLE or WiFi-Direct.
//! The decision table is ordered; the first matching row wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::debug;

use super::Transport;
use crate::identity::{Fingerprint, PeerAddress};
use crate::logging::RedactedAddr;

/// Below this battery level BLE is forced unconditionally.
pub const BATTERY_CRITICAL_PERCENT: u8 = 10;

/// Below this level BLE is preferred when both radios reach the peer.
pub const BATTERY_CONSERVATIVE_PERCENT: u8 = 20;

/// Payloads larger than this go over WiFi when available.
pub const LARGE_PACKET_BYTES: usize = 10_000;

/// RSSI above which the BLE link is considered strong.
pub const RSSI_STRONG_DBM: i16 = -60;

/// RSSI below which the BLE link is considered weak.
pub const RSSI_WEAK_DBM: i16 = -80;

/// BLE reachability info for a peer.
#[derive(Debug, Clone)]
pub struct BlePeerInfo {
    /// BLE transport address.
    pub addr: PeerAddress,
    /// Last observed signal strength (dBm).
    pub rssi: i16,
    /// Last sighting (Unix millis).
    pub last_seen: i64,
}

/// WiFi-Direct reachability info for a peer.
#[derive(Debug, Clone)]
pub struct WifiPeerInfo {
    /// WiFi transport address.
    pub addr: PeerAddress,
    /// Last sighting (Unix millis).
    pub last_seen: i64,
}

/// Transport selector and WiFi peer map.
///
/// BLE addresses resolve through the contact store's address index (the
/// single source of truth for BLE); the router owns only the WiFi side
/// of the `address ↔ identity` mapping.
pub struct TransportRouter {
    wifi_by_addr: Mutex<HashMap<PeerAddress, Fingerprint>>,
    wifi_by_identity: Mutex<HashMap<Fingerprint, PeerAddress>>,
    ble_count: AtomicU64,
    wifi_count: AtomicU64,
}

impl Default for TransportRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self {
            wifi_by_addr: Mutex::new(HashMap::new()),
            wifi_by_identity: Mutex::new(HashMap::new()),
            ble_count: AtomicU64::new(0),
            wifi_count: AtomicU64::new(0),
        }
    }

    /// Pick the transport for one packet. First matching row of the
    /// decision table wins; an unreachable peer defaults to BLE, where
    /// the mesh layer queues for store-and-forward.
    pub fn select(
        &self,
        peer: &PeerAddress,
        packet_size: usize,
        battery_percent: u8,
        ble: Option<&BlePeerInfo>,
        wifi: Option<&WifiPeerInfo>,
    ) -> Transport {
        let choice = Self::decide(packet_size, battery_percent, ble, wifi);

        match choice {
            Transport::Ble => self.ble_count.fetch_add(1, Ordering::Relaxed),
            Transport::WifiDirect => self.wifi_count.fetch_add(1, Ordering::Relaxed),
        };

        debug!(
            peer = %RedactedAddr(peer.as_str()),
            size = packet_size,
            battery = battery_percent,
            transport = ?choice,
            "Selected transport"
        );
        choice
    }

    fn decide(
        packet_size: usize,
        battery_percent: u8,
        ble: Option<&BlePeerInfo>,
        wifi: Option<&WifiPeerInfo>,
    ) -> Transport {
        if battery_percent < BATTERY_CRITICAL_PERCENT {
            return Transport::Ble;
        }

        let ble = match (ble, wifi) {
            (None, Some(_)) => return Transport::WifiDirect,
            (Some(_), None) => return Transport::Ble,
            (None, None) => return Transport::Ble,
            (Some(ble), Some(_)) => ble,
        };

        if packet_size > LARGE_PACKET_BYTES {
            return Transport::WifiDirect;
        }
        if ble.rssi > RSSI_STRONG_DBM {
            return Transport::Ble;
        }
        if ble.rssi < RSSI_WEAK_DBM {
            return Transport::WifiDirect;
        }
        if battery_percent < BATTERY_CONSERVATIVE_PERCENT {
            return Transport::Ble;
        }
        Transport::WifiDirect
    }

    /// Bind a WiFi address to an identity, replacing any stale binding
    /// in either direction.
    pub fn map_wifi_peer(&self, addr: PeerAddress, identity: Fingerprint) {
        let mut by_addr = self.wifi_by_addr.lock().unwrap_or_else(|e| e.into_inner());
        let mut by_id = self
            .wifi_by_identity
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        if let Some(old_id) = by_addr.insert(addr.clone(), identity.clone()) {
            by_id.remove(&old_id);
        }
        if let Some(old_addr) = by_id.insert(identity, addr) {
            by_addr.remove(&old_addr);
        }
    }

    /// Drop the binding for a departed WiFi peer.
    pub fn unmap_wifi_peer(&self, addr: &PeerAddress) {
        let mut by_addr = self.wifi_by_addr.lock().unwrap_or_else(|e| e.into_inner());
        let mut by_id = self
            .wifi_by_identity
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        if let Some(identity) = by_addr.remove(addr) {
            by_id.remove(&identity);
        }
    }

    /// Resolve a WiFi address to its identity.
    pub fn wifi_identity(&self, addr: &PeerAddress) -> Option<Fingerprint> {
        self.wifi_by_addr
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(addr)
            .cloned()
    }

    /// Resolve an identity to its current WiFi address.
    pub fn wifi_address(&self, identity: &Fingerprint) -> Option<PeerAddress> {
        self.wifi_by_identity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(identity)
            .cloned()
    }

    /// Usage counters: (ble, wifi) selections since startup.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.ble_count.load(Ordering::Relaxed),
            self.wifi_count.load(Ordering::Relaxed),
        )
    }
}
