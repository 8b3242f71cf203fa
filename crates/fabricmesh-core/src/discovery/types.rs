//! Wire types and constants for the discovery protocol.

use serde::{Deserialize, Serialize};

/// The `heartbeat` body of a discovery datagram, signed and carried
/// alongside its signature in `SignedHeartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatBody {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub cpu_percent_used: f64,
    pub ram_free_gb: f64,
    pub ram_total_gb: f64,
    pub gpu_name: Option<String>,
    pub gpu_memory_free_gb: Option<f64>,
    pub status: PeerStatus,
    pub timestamp: f64,
}

/// `{ "heartbeat": {...}, "sig": "<hex hmac>" }` — the full datagram.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignedHeartbeat {
    pub heartbeat: HeartbeatBody,
    pub sig: String,
}

/// Advertised readiness to accept jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Idle,
    Busy,
}

/// A peer's live view, as maintained by the discovery component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Peer {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub cpu_percent_used: f64,
    pub ram_free_gb: f64,
    pub ram_total_gb: f64,
    pub gpu_name: Option<String>,
    pub gpu_memory_free_gb: Option<f64>,
    pub status: PeerStatus,
    /// Unix-epoch seconds, local wall clock of the receiver.
    pub last_seen: f64,
}

impl Peer {
    pub fn is_alive_at(&self, now: f64, peer_timeout_secs: f64) -> bool {
        now - self.last_seen < peer_timeout_secs
    }
}

/// Fired when a peer's membership changes.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    PeerJoined(Peer),
    PeerLeft(Peer),
}

pub const DEFAULT_DISCOVERY_PORT: u16 = 5555;
pub const DEFAULT_WORKER_PORT: u16 = 5556;
pub const HEARTBEAT_READ_BUF_BYTES: usize = 4096;
