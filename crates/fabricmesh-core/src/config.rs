//! Node configuration — loaded once at startup, immutable for the process.
//!
//! Lives at `~/.homie/config.yaml`. The file format itself is a thin
//! collaborator outside this crate's core concerns, but every other
//! component needs the struct and its defaults to run, so both are
//! specified here in full.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::Result;

const CONFIG_FILE_NAME: &str = "config.yaml";

/// Group-wide and per-node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupConfig {
    pub name: String,
    pub discovery_port: u16,
    pub worker_port: u16,
    pub group_secret: String,

    pub container_cpu_limit: f64,
    pub container_memory_limit: String,
    pub container_timeout_secs: u64,
    pub container_network: String,
    pub gpu_image: String,
    pub pids_limit: i64,

    pub envs: HashMap<String, String>,
    pub default_env: String,

    pub heartbeat_interval_secs: f64,
    pub peer_timeout_secs: f64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        let mut envs = HashMap::new();
        envs.insert("py".to_string(), "python:3.11-slim".to_string());

        Self {
            name: std::env::var("USER").unwrap_or_else(|_| "homie".to_string()),
            discovery_port: 5555,
            worker_port: 5556,
            group_secret: generate_group_secret(),
            container_cpu_limit: 2.0,
            container_memory_limit: "4g".to_string(),
            container_timeout_secs: 600,
            container_network: "none".to_string(),
            gpu_image: "nvidia/cuda:12.1-runtime-ubuntu22.04".to_string(),
            pids_limit: 100,
            envs,
            default_env: "py".to_string(),
            heartbeat_interval_secs: 2.0,
            peer_timeout_secs: 10.0,
        }
    }
}

/// 16 random bytes, URL-safe base64 encoded — mirrors `secrets.token_urlsafe(16)`.
fn generate_group_secret() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Resolves `~/.homie` — used by config, the direct-peers file, the
/// peer cache, and the history log. The directory name is part of the
/// external interface, not a free naming choice.
pub fn home_state_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no home directory")
    })?;
    Ok(home.join(".homie"))
}

pub fn ensure_home_state_dir() -> Result<PathBuf> {
    let dir = home_state_dir()?;
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn config_path() -> Result<PathBuf> {
    Ok(home_state_dir()?.join(CONFIG_FILE_NAME))
}

impl GroupConfig {
    /// Load from disk, falling back to a freshly generated default that
    /// is immediately persisted.
    pub fn load_or_create() -> Result<Self> {
        let path = config_path()?;
        if path.exists() {
            Self::load()
        } else {
            let config = Self::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load() -> Result<Self> {
        let path = config_path()?;
        let raw = std::fs::read_to_string(path)?;
        let config: GroupConfig = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        ensure_home_state_dir()?;
        let raw = serde_yaml::to_string(self)?;
        std::fs::write(config_path()?, raw)?;
        Ok(())
    }

    /// Resolve the container image for a job, preferring an explicit
    /// image, falling back to the configured default environment.
    pub fn resolve_image<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        if let Some(image) = requested {
            return image;
        }
        self.envs
            .get(&self.default_env)
            .map(|s| s.as_str())
            .unwrap_or("python:3.11-slim")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = GroupConfig::default();
        assert_eq!(config.discovery_port, 5555);
        assert_eq!(config.worker_port, 5556);
        assert_eq!(config.heartbeat_interval_secs, 2.0);
        assert_eq!(config.peer_timeout_secs, 10.0);
        assert_eq!(config.default_env, "py");
        assert_eq!(config.envs.get("py").unwrap(), "python:3.11-slim");
    }

    #[test]
    fn group_secret_is_nonempty_and_varies() {
        let a = generate_group_secret();
        let b = generate_group_secret();
        assert!(!a.is_empty());
        assert_ne!(a, b);
    }

    #[test]
    fn resolve_image_prefers_explicit() {
        let config = GroupConfig::default();
        assert_eq!(config.resolve_image(Some("custom:latest")), "custom:latest");
        assert_eq!(config.resolve_image(None), "python:3.11-slim");
    }

    #[test]
    fn yaml_roundtrip() {
        let config = GroupConfig::default();
        let raw = serde_yaml::to_string(&config).unwrap();
        let decoded: GroupConfig = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(config, decoded);
    }
}
