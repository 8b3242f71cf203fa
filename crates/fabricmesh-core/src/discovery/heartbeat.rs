//! The live peer map — a pure state machine, no I/O.
//!
//! The caller (the UDP receive loop and the reaper task) drives it by
//! calling `record_heartbeat_at` and `reap_at` with wall-clock
//! timestamps it obtains itself. Keeping timestamps as a parameter
//! rather than reading the clock internally makes the whole thing
//! deterministically testable.

use std::collections::HashMap;

use super::types::{DiscoveryEvent, Peer, PeerStatus};

/// Tracks known peers and their liveness.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<String, Peer>,
    peer_timeout_secs: f64,
}

impl PeerTable {
    pub fn new(peer_timeout_secs: f64) -> Self {
        Self {
            peers: HashMap::new(),
            peer_timeout_secs,
        }
    }

    /// Record a verified, non-self heartbeat. Returns `PeerJoined` if
    /// this is the first time `name` has been seen (or it had been
    /// reaped and is rejoining).
    pub fn record_heartbeat_at(&mut self, peer: Peer, now: f64) -> Option<DiscoveryEvent> {
        let mut peer = peer;
        peer.last_seen = now;
        let is_new = !self.peers.contains_key(&peer.name);
        let joined = if is_new {
            Some(DiscoveryEvent::PeerJoined(peer.clone()))
        } else {
            None
        };
        self.peers.insert(peer.name.clone(), peer);
        joined
    }

    /// Evict every peer whose `last_seen` is `peer_timeout_secs` or more
    /// in the past, returning a `PeerLeft` event for each.
    pub fn reap_at(&mut self, now: f64) -> Vec<DiscoveryEvent> {
        let dead: Vec<String> = self
            .peers
            .values()
            .filter(|p| !p.is_alive_at(now, self.peer_timeout_secs))
            .map(|p| p.name.clone())
            .collect();

        dead.into_iter()
            .filter_map(|name| self.peers.remove(&name))
            .map(DiscoveryEvent::PeerLeft)
            .collect()
    }

    /// Snapshot of currently alive peers (liveness re-checked against `now`,
    /// in case the reaper hasn't run yet).
    pub fn alive_peers_at(&self, now: f64) -> Vec<Peer> {
        self.peers
            .values()
            .filter(|p| p.is_alive_at(now, self.peer_timeout_secs))
            .cloned()
            .collect()
    }

    pub fn get_at(&self, name: &str, now: f64) -> Option<&Peer> {
        self.peers
            .get(name)
            .filter(|p| p.is_alive_at(now, self.peer_timeout_secs))
    }

    pub fn tracked_count(&self) -> usize {
        self.peers.len()
    }
}

fn make_peer(name: &str, last_seen: f64, status: PeerStatus) -> Peer {
    Peer {
        name: name.to_string(),
        ip: "10.0.0.1".to_string(),
        port: 5556,
        cpu_percent_used: 10.0,
        ram_free_gb: 8.0,
        ram_total_gb: 16.0,
        gpu_name: None,
        gpu_memory_free_gb: None,
        status,
        last_seen,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_heartbeat_emits_peer_joined() {
        let mut table = PeerTable::new(10.0);
        let event = table.record_heartbeat_at(make_peer("bob", 0.0, PeerStatus::Idle), 100.0);
        assert!(matches!(event, Some(DiscoveryEvent::PeerJoined(p)) if p.name == "bob"));
    }

    #[test]
    fn repeat_heartbeat_emits_no_event() {
        let mut table = PeerTable::new(10.0);
        table.record_heartbeat_at(make_peer("bob", 0.0, PeerStatus::Idle), 100.0);
        let event = table.record_heartbeat_at(make_peer("bob", 0.0, PeerStatus::Idle), 101.0);
        assert!(event.is_none());
    }

    #[test]
    fn heartbeat_updates_last_seen_to_receipt_time() {
        let mut table = PeerTable::new(10.0);
        table.record_heartbeat_at(make_peer("bob", 0.0, PeerStatus::Idle), 100.0);
        let peer = table.get_at("bob", 100.0).unwrap();
        assert_eq!(peer.last_seen, 100.0);
    }

    #[test]
    fn peer_alive_just_under_timeout() {
        let mut table = PeerTable::new(10.0);
        table.record_heartbeat_at(make_peer("bob", 0.0, PeerStatus::Idle), 0.0);
        assert!(table.get_at("bob", 9.9).is_some());
    }

    #[test]
    fn peer_dead_at_exact_timeout_boundary() {
        let mut table = PeerTable::new(10.0);
        table.record_heartbeat_at(make_peer("bob", 0.0, PeerStatus::Idle), 0.0);
        // now - last_seen < peer_timeout is the liveness test; at exactly
        // peer_timeout the peer is no longer alive.
        assert!(table.get_at("bob", 10.0).is_none());
    }

    #[test]
    fn reap_evicts_and_emits_peer_left() {
        let mut table = PeerTable::new(10.0);
        table.record_heartbeat_at(make_peer("bob", 0.0, PeerStatus::Idle), 0.0);
        let events = table.reap_at(20.0);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], DiscoveryEvent::PeerLeft(p) if p.name == "bob"));
        assert_eq!(table.tracked_count(), 0);
    }

    #[test]
    fn reap_leaves_live_peers_untouched() {
        let mut table = PeerTable::new(10.0);
        table.record_heartbeat_at(make_peer("bob", 0.0, PeerStatus::Idle), 5.0);
        let events = table.reap_at(6.0);
        assert!(events.is_empty());
        assert_eq!(table.tracked_count(), 1);
    }

    #[test]
    fn rejoin_after_reap_emits_peer_joined_again() {
        let mut table = PeerTable::new(10.0);
        table.record_heartbeat_at(make_peer("bob", 0.0, PeerStatus::Idle), 0.0);
        table.reap_at(20.0);
        let event = table.record_heartbeat_at(make_peer("bob", 0.0, PeerStatus::Idle), 21.0);
        assert!(matches!(event, Some(DiscoveryEvent::PeerJoined(_))));
    }

    #[test]
    fn alive_peers_at_filters_by_current_time() {
        let mut table = PeerTable::new(10.0);
        table.record_heartbeat_at(make_peer("bob", 0.0, PeerStatus::Idle), 0.0);
        table.record_heartbeat_at(make_peer("ann", 0.0, PeerStatus::Idle), 15.0);
        let alive = table.alive_peers_at(16.0);
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].name, "ann");
    }
}
