//! LAN peer discovery: signed heartbeats over UDP broadcast + unicast,
//! a live peer map, and a reaper that evicts stale entries.

pub mod heartbeat;
pub mod service;
pub mod types;

pub use heartbeat::PeerTable;
pub use service::{read_fresh_peer_cache, Discovery};
pub use types::{DiscoveryEvent, HeartbeatBody, Peer, PeerStatus, SignedHeartbeat};
