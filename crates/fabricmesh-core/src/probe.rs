//! Local resource probing — CPU, RAM, and optional GPU.
//!
//! Feeds heartbeat construction (`discovery`) and is read directly by
//! anything that wants this node's current load.

use serde::{Deserialize, Serialize};
use sysinfo::System;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemStats {
    pub hostname: String,
    pub cpu_count: usize,
    pub cpu_percent_used: f64,
    pub ram_total_gb: f64,
    pub ram_free_gb: f64,
    pub gpu_name: Option<String>,
    pub gpu_memory_total_gb: Option<f64>,
    pub gpu_memory_free_gb: Option<f64>,
}

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

pub fn hostname() -> String {
    System::host_name().unwrap_or_else(|| "unknown".to_string())
}

/// Snapshot of CPU/RAM via `sysinfo`, plus GPU info via `nvidia-smi`.
///
/// `sysinfo` needs one refresh cycle for CPU usage to be meaningful;
/// callers that want cheap repeated polling should hold a `System` and
/// call `refresh` themselves instead of using this one-shot helper.
pub async fn snapshot() -> SystemStats {
    let mut sys = System::new_all();
    sys.refresh_cpu_usage();
    // cpu_usage() on first refresh reads 0 — sysinfo documents a short
    // delay is needed between refreshes for a meaningful value.
    tokio::time::sleep(std::time::Duration::from_millis(120)).await;
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_percent_used = if sys.cpus().is_empty() {
        0.0
    } else {
        (sys.cpus().iter().map(|c| c.cpu_usage() as f64).sum::<f64>() / sys.cpus().len() as f64)
            .clamp(0.0, 100.0)
    };

    let (gpu_name, gpu_memory_total_gb, gpu_memory_free_gb) = probe_gpu().await;

    SystemStats {
        hostname: hostname(),
        cpu_count: sys.cpus().len().max(1),
        cpu_percent_used,
        ram_total_gb: sys.total_memory() as f64 / BYTES_PER_GB,
        ram_free_gb: sys.available_memory() as f64 / BYTES_PER_GB,
        gpu_name,
        gpu_memory_total_gb,
        gpu_memory_free_gb,
    }
}

/// Shell out to `nvidia-smi`; any failure (missing binary, non-zero
/// exit, timeout, unparseable output) yields `(None, None, None)`.
async fn probe_gpu() -> (Option<String>, Option<f64>, Option<f64>) {
    let result = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        tokio::process::Command::new("nvidia-smi")
            .args([
                "--query-gpu=name,memory.total,memory.free",
                "--format=csv,noheader,nounits",
            ])
            .output(),
    )
    .await;

    let output = match result {
        Ok(Ok(output)) if output.status.success() => output,
        _ => return (None, None, None),
    };

    parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
}

fn parse_nvidia_smi(stdout: &str) -> (Option<String>, Option<f64>, Option<f64>) {
    let line = match stdout.lines().next() {
        Some(line) if !line.trim().is_empty() => line.trim(),
        _ => return (None, None, None),
    };

    let parts: Vec<&str> = line.split(',').map(|p| p.trim()).collect();
    if parts.len() < 3 {
        return (None, None, None);
    }

    let (Ok(total_mb), Ok(free_mb)) = (parts[1].parse::<f64>(), parts[2].parse::<f64>()) else {
        return (None, None, None);
    };

    (
        Some(parts[0].to_string()),
        Some(total_mb / 1024.0),
        Some(free_mb / 1024.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_nvidia_smi_well_formed() {
        let (name, total, free) = parse_nvidia_smi("NVIDIA A100, 40960, 20480\n");
        assert_eq!(name.as_deref(), Some("NVIDIA A100"));
        assert_eq!(total, Some(40.0));
        assert_eq!(free, Some(20.0));
    }

    #[test]
    fn parse_nvidia_smi_empty_output() {
        assert_eq!(parse_nvidia_smi(""), (None, None, None));
    }

    #[test]
    fn parse_nvidia_smi_malformed() {
        assert_eq!(parse_nvidia_smi("garbage\n"), (None, None, None));
    }

    #[tokio::test]
    async fn snapshot_reports_at_least_one_cpu() {
        let stats = snapshot().await;
        assert!(stats.cpu_count >= 1);
        assert!(stats.ram_total_gb >= 0.0);
    }
}
