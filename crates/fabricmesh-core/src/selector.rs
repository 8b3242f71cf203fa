//! Peer selection — pure logic over a peer snapshot, no I/O.
//!
//! Mirrors the discovery layer's "caller owns the clock/state, this is
//! just a function of its inputs" shape.

use crate::discovery::{Peer, PeerStatus};
use crate::error::{FabricMeshError, Result};

/// GPU bonus added to the score when a job requires a GPU and the
/// candidate has one.
const GPU_BONUS: f64 = 2.0;

/// Constraints a caller places on peer selection.
#[derive(Debug, Clone, Default)]
pub struct SelectionConstraints {
    pub specific_name: Option<String>,
    pub require_gpu: bool,
}

/// `ram_free_gb * (100 - cpu_percent_used) / 100 + gpu_bonus`.
pub fn score(peer: &Peer, require_gpu: bool) -> f64 {
    let cpu_score = (100.0 - peer.cpu_percent_used) / 100.0;
    let gpu_bonus = if require_gpu && peer.gpu_name.is_some() {
        GPU_BONUS
    } else {
        0.0
    };
    peer.ram_free_gb * cpu_score + gpu_bonus
}

/// Select the best peer to run a job given the current snapshot and
/// constraints. Deterministic given identical inputs up to tie-break.
pub fn select_best(peers: &[Peer], constraints: &SelectionConstraints) -> Result<Peer> {
    if let Some(name) = &constraints.specific_name {
        return peers
            .iter()
            .find(|p| &p.name == name)
            .cloned()
            .ok_or_else(|| FabricMeshError::PeerNotFound { name: name.clone() });
    }

    let candidates: Vec<&Peer> = peers
        .iter()
        .filter(|p| {
            p.status == PeerStatus::Idle && (!constraints.require_gpu || p.gpu_name.is_some())
        })
        .collect();

    candidates
        .into_iter()
        .max_by(|a, b| {
            score(a, constraints.require_gpu)
                .partial_cmp(&score(b, constraints.require_gpu))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .cloned()
        .ok_or(FabricMeshError::NoAvailablePeers)
}
