//! UDP broadcast discovery service.
//!
//! Drives the pure `PeerTable` state machine with real sockets and a
//! wall clock. Three background tasks: broadcast, listen, reap.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

use crate::config::GroupConfig;
use crate::crypto;
use crate::discovery::heartbeat::PeerTable;
use crate::discovery::types::{
    DiscoveryEvent, HeartbeatBody, Peer, PeerStatus, SignedHeartbeat, HEARTBEAT_READ_BUF_BYTES,
};
use crate::error::Result;
use crate::probe;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs_f64()
}

/// Handle to a running discovery service. Dropping or calling `stop`
/// closes the sockets, which unblocks the background tasks.
pub struct Discovery {
    config: GroupConfig,
    table: Arc<Mutex<PeerTable>>,
    status: Arc<Mutex<PeerStatus>>,
    direct_peers: Arc<Mutex<Vec<String>>>,
    events_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<DiscoveryEvent>>>,
    broadcast_socket: Arc<UdpSocket>,
    listen_socket: Arc<UdpSocket>,
    running: Arc<std::sync::atomic::AtomicBool>,
}

impl Discovery {
    /// Bind sockets and load the direct-peers file, but do not yet
    /// start background tasks — call `start` for that.
    pub async fn bind(config: GroupConfig, listen: bool) -> Result<Self> {
        let broadcast_socket = UdpSocket::bind("0.0.0.0:0").await?;
        broadcast_socket.set_broadcast(true)?;

        let bind_addr = if listen {
            format!("0.0.0.0:{}", config.discovery_port)
        } else {
            "0.0.0.0:0".to_string()
        };
        let listen_socket = UdpSocket::bind(&bind_addr).await?;
        listen_socket.set_broadcast(true)?;

        let direct_peers = load_direct_peers().unwrap_or_default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            table: Arc::new(Mutex::new(PeerTable::new(config.peer_timeout_secs))),
            status: Arc::new(Mutex::new(PeerStatus::Idle)),
            direct_peers: Arc::new(Mutex::new(direct_peers)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            broadcast_socket: Arc::new(broadcast_socket),
            listen_socket: Arc::new(listen_socket),
            running: Arc::new(std::sync::atomic::AtomicBool::new(true)),
            config,
        })
    }

    /// Take the event receiver — `PeerJoined`/`PeerLeft` — once. Only
    /// the first caller gets it.
    pub async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DiscoveryEvent>> {
        self.events_rx.lock().await.take()
    }

    pub async fn set_status(&self, status: PeerStatus) {
        *self.status.lock().await = status;
    }

    pub async fn get_peers(&self) -> Vec<Peer> {
        self.table.lock().await.alive_peers_at(now_secs())
    }

    pub async fn get_peer(&self, name: &str) -> Option<Peer> {
        self.table
            .lock()
            .await
            .get_at(name, now_secs())
            .cloned()
    }

    pub async fn direct_peers(&self) -> Vec<String> {
        self.direct_peers.lock().await.clone()
    }

    pub async fn add_direct_peer(&self, ip: String) -> Result<()> {
        let mut peers = self.direct_peers.lock().await;
        if !peers.contains(&ip) {
            peers.push(ip);
            save_direct_peers(&peers)?;
        }
        Ok(())
    }

    pub async fn remove_direct_peer(&self, ip: &str) -> Result<()> {
        let mut peers = self.direct_peers.lock().await;
        peers.retain(|p| p != ip);
        if peers.is_empty() {
            let _ = std::fs::remove_file(direct_peers_path()?);
        } else {
            save_direct_peers(&peers)?;
        }
        Ok(())
    }

    /// Persist the current alive-peer snapshot to `peer_cache.json` for
    /// short-lived callers (e.g. a one-shot query) to read without
    /// running their own listener.
    pub async fn write_peer_cache(&self) -> Result<()> {
        let peers = self.get_peers().await;
        let cache = PeerCache {
            timestamp: now_secs(),
            peers,
        };
        let raw = serde_json::to_string(&cache)?;
        crate::config::ensure_home_state_dir()?;
        std::fs::write(peer_cache_path()?, raw)?;
        Ok(())
    }

    pub fn stop(&self) {
        self.running
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Spawn the broadcast, listen, and reap loops. Returns immediately;
    /// the loops run until `stop()` is called.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let broadcast = Arc::clone(self);
        tokio::spawn(async move { broadcast.broadcast_loop().await });

        let listen = Arc::clone(self);
        tokio::spawn(async move { listen.listen_loop().await });

        let reap = Arc::clone(self);
        tokio::spawn(async move { reap.reap_loop().await });
    }

    async fn broadcast_loop(&self) {
        let interval = std::time::Duration::from_secs_f64(self.config.heartbeat_interval_secs);
        while self.running.load(std::sync::atomic::Ordering::SeqCst) {
            if let Err(e) = self.broadcast_once().await {
                tracing::trace!(error = %e, "heartbeat broadcast failed");
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn broadcast_once(&self) -> Result<()> {
        let stats = probe::snapshot().await;
        let status = *self.status.lock().await;
        let heartbeat = HeartbeatBody {
            name: self.config.name.clone(),
            ip: local_ip(),
            port: self.config.worker_port,
            cpu_percent_used: stats.cpu_percent_used,
            ram_free_gb: round2(stats.ram_free_gb),
            ram_total_gb: round2(stats.ram_total_gb),
            gpu_name: stats.gpu_name,
            gpu_memory_free_gb: stats.gpu_memory_free_gb.map(round2),
            status,
            timestamp: now_secs(),
        };

        let canonical = crypto::canonical_json(&heartbeat)?;
        let sig = crypto::sign(self.config.group_secret.as_bytes(), &canonical);
        let signed = SignedHeartbeat { heartbeat, sig };
        let message = serde_json::to_vec(&signed)?;

        let broadcast_addr: SocketAddr =
            format!("255.255.255.255:{}", self.config.discovery_port).parse().unwrap();
        if let Err(e) = self.broadcast_socket.send_to(&message, broadcast_addr).await {
            tracing::trace!(error = %e, "broadcast send failed");
        }

        for ip in self.direct_peers().await {
            let addr = format!("{ip}:{}", self.config.discovery_port);
            if let Ok(addr) = addr.parse::<SocketAddr>() {
                if let Err(e) = self.broadcast_socket.send_to(&message, addr).await {
                    tracing::trace!(error = %e, peer = %ip, "direct heartbeat send failed");
                }
            }
        }

        Ok(())
    }

    async fn listen_loop(&self) {
        let mut buf = [0u8; HEARTBEAT_READ_BUF_BYTES];
        while self.running.load(std::sync::atomic::Ordering::SeqCst) {
            let recv = tokio::time::timeout(
                std::time::Duration::from_secs(1),
                self.listen_socket.recv_from(&mut buf),
            )
            .await;

            let (n, _addr) = match recv {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    tracing::trace!(error = %e, "discovery recv failed");
                    continue;
                }
                Err(_timeout) => continue,
            };

            self.handle_datagram(&buf[..n]).await;
        }
    }

    async fn handle_datagram(&self, data: &[u8]) {
        let Ok(signed) = serde_json::from_slice::<SignedHeartbeat>(data) else {
            return;
        };

        let Ok(canonical) = crypto::canonical_json(&signed.heartbeat) else {
            return;
        };
        if !crypto::verify(self.config.group_secret.as_bytes(), &canonical, &signed.sig) {
            tracing::warn!("dropped heartbeat with invalid signature");
            return;
        }

        if signed.heartbeat.name == self.config.name {
            return;
        }

        let peer = Peer {
            name: signed.heartbeat.name,
            ip: signed.heartbeat.ip,
            port: signed.heartbeat.port,
            cpu_percent_used: signed.heartbeat.cpu_percent_used,
            ram_free_gb: signed.heartbeat.ram_free_gb,
            ram_total_gb: signed.heartbeat.ram_total_gb,
            gpu_name: signed.heartbeat.gpu_name,
            gpu_memory_free_gb: signed.heartbeat.gpu_memory_free_gb,
            status: signed.heartbeat.status,
            last_seen: 0.0,
        };

        let event = self.table.lock().await.record_heartbeat_at(peer, now_secs());
        if let Some(event) = event {
            tracing::info!(?event, "peer joined");
            let _ = self.events_tx.send(event);
        }
    }

    async fn reap_loop(&self) {
        let interval = std::time::Duration::from_secs_f64(self.config.peer_timeout_secs / 2.0);
        while self.running.load(std::sync::atomic::Ordering::SeqCst) {
            tokio::time::sleep(interval).await;
            let events = self.table.lock().await.reap_at(now_secs());
            for event in events {
                tracing::info!(?event, "peer left");
                let _ = self.events_tx.send(event);
            }
        }
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct PeerCache {
    timestamp: f64,
    peers: Vec<Peer>,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Best-effort local LAN address via the UDP-connect trick: no packets
/// are actually sent to the target, only a route is resolved.
fn local_ip() -> String {
    match std::net::UdpSocket::bind("0.0.0.0:0").and_then(|s| {
        s.connect("8.8.8.8:80")?;
        s.local_addr()
    }) {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => "127.0.0.1".to_string(),
    }
}

fn direct_peers_path() -> Result<std::path::PathBuf> {
    Ok(crate::config::home_state_dir()?.join("peers"))
}

fn peer_cache_path() -> Result<std::path::PathBuf> {
    Ok(crate::config::home_state_dir()?.join("peer_cache.json"))
}

fn load_direct_peers() -> Result<Vec<String>> {
    let path = direct_peers_path()?;
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

fn save_direct_peers(peers: &[String]) -> Result<()> {
    crate::config::ensure_home_state_dir()?;
    let content = if peers.is_empty() {
        String::new()
    } else {
        format!("{}\n", peers.join("\n"))
    };
    std::fs::write(direct_peers_path()?, content)?;
    Ok(())
}

/// Reads a peer cache written by `write_peer_cache`, valid for 10s.
pub fn read_fresh_peer_cache() -> Result<Option<Vec<Peer>>> {
    let path = peer_cache_path()?;
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let cache: PeerCache = serde_json::from_str(&raw)?;
    if now_secs() - cache.timestamp < 10.0 {
        Ok(Some(cache.peers))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round2_rounds_to_two_decimals() {
        assert_eq!(round2(1.23456), 1.23);
        assert_eq!(round2(1.005), 1.0);
    }
}
