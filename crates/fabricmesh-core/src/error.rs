/// Crate-wide error type for fabricmesh.
///
/// Every fallible operation across discovery, the job protocol,
/// sandbox execution, and history storage resolves to one of these
/// variants rather than a per-module error type.
#[derive(Debug, thiserror::Error)]
pub enum FabricMeshError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("peer not found: {name}")]
    PeerNotFound { name: String },

    #[error("no available peers")]
    NoAvailablePeers,

    #[error("oversize frame: {len} bytes exceeds limit")]
    OversizeFrame { len: u64 },

    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    #[error("job execution failed: {0}")]
    Execution(String),

    #[error("connection timed out")]
    Timeout,

    #[error("connection closed by peer")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FabricMeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_auth_failed() {
        let err = FabricMeshError::AuthFailed {
            reason: "bad signature".into(),
        };
        assert_eq!(err.to_string(), "authentication failed: bad signature");
    }

    #[test]
    fn test_display_peer_not_found() {
        let err = FabricMeshError::PeerNotFound { name: "bob".into() };
        assert_eq!(err.to_string(), "peer not found: bob");
    }

    #[test]
    fn test_display_oversize_frame() {
        let err = FabricMeshError::OversizeFrame { len: 999 };
        assert_eq!(err.to_string(), "oversize frame: 999 bytes exceeds limit");
    }

    #[test]
    fn test_display_no_available_peers() {
        assert_eq!(
            FabricMeshError::NoAvailablePeers.to_string(),
            "no available peers"
        );
    }
}
