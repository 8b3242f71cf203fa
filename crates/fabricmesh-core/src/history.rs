//! Durable job history — an append-then-patch JSONL log.
//!
//! Two write operations (`append_start`, `patch_completion`) and a set
//! of read-only queries (`read_history`, `stats`). Writers must be
//! serialized by the caller to avoid torn lines — `HistoryLog` holds an
//! internal mutex for exactly that purpose.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;

pub const MAX_HISTORY_ENTRIES: usize = 1000;
const HISTORY_FILE_NAME: &str = "job_history.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Executor,
}

/// One record in the history log. Identity fields are set at
/// `append_start`; completion fields are `None` until `patch_completion`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub job_id: String,
    pub sender: String,
    pub peer: String,
    pub filename: String,
    pub args: Vec<String>,
    pub image: Option<String>,
    pub require_gpu: bool,
    pub role: Role,
    pub start_time: f64,

    pub end_time: Option<f64>,
    pub runtime_seconds: Option<f64>,
    pub exit_code: Option<i32>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub output_file_count: Option<usize>,
}

impl HistoryEntry {
    pub fn is_complete(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Completion fields to patch onto an open entry.
#[derive(Debug, Clone)]
pub struct Completion {
    pub end_time: f64,
    pub runtime_seconds: f64,
    pub exit_code: i32,
    pub success: bool,
    pub error: Option<String>,
    pub output_file_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub role: Option<Role>,
    pub peer: Option<String>,
    pub success: Option<bool>,
    /// Only entries with `start_time >= since`.
    pub since: Option<f64>,
    /// Only entries with `start_time <= until`.
    pub until: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct HistoryStats {
    pub total_jobs: usize,
    pub success_rate: f64,
    pub average_runtime_seconds: f64,
}

/// Guards the history file against concurrent torn writes.
pub struct HistoryLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl HistoryLog {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// The well-known path named in the external interface: `~/.homie/job_history.jsonl`.
    pub fn default_path() -> Result<Self> {
        Ok(Self::at(
            crate::config::home_state_dir()?.join(HISTORY_FILE_NAME),
        ))
    }

    pub async fn append_start(&self, entry: &HistoryEntry) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Rewrite the file, replacing the most-recent matching open entry
    /// for `(job_id, role)` with its completed form, then truncating to
    /// `MAX_HISTORY_ENTRIES`.
    pub async fn patch_completion(
        &self,
        job_id: &str,
        role: Role,
        completion: Completion,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = read_all(&self.path)?;

        let mut patched = false;
        for entry in entries.iter_mut().rev() {
            if entry.job_id == job_id && entry.role == role && !entry.is_complete() {
                entry.end_time = Some(completion.end_time);
                entry.runtime_seconds = Some(completion.runtime_seconds);
                entry.exit_code = Some(completion.exit_code);
                entry.success = Some(completion.success);
                entry.error = completion.error;
                entry.output_file_count = Some(completion.output_file_count);
                patched = true;
                break;
            }
        }

        if !patched {
            tracing::warn!(job_id, ?role, "patch_completion found no matching open entry");
        }

        write_all(&self.path, &entries)
    }

    pub async fn read_history(
        &self,
        filter: &HistoryFilter,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryEntry>> {
        let mut entries = read_all(&self.path)?;
        entries.sort_by(|a, b| b.start_time.partial_cmp(&a.start_time).unwrap());

        let filtered: Vec<HistoryEntry> = entries
            .into_iter()
            .filter(|e| filter.role.map_or(true, |r| r == e.role))
            .filter(|e| filter.peer.as_ref().map_or(true, |p| p == &e.peer))
            .filter(|e| {
                filter
                    .success
                    .map_or(true, |want| e.success == Some(want))
            })
            .filter(|e| filter.since.map_or(true, |since| e.start_time >= since))
            .filter(|e| filter.until.map_or(true, |until| e.start_time <= until))
            .collect();

        Ok(match limit {
            Some(n) => filtered.into_iter().take(n).collect(),
            None => filtered,
        })
    }

    pub async fn stats(&self) -> Result<HistoryStats> {
        let entries = read_all(&self.path)?;
        let completed: Vec<&HistoryEntry> = entries.iter().filter(|e| e.is_complete()).collect();

        if completed.is_empty() {
            return Ok(HistoryStats::default());
        }

        let successes = completed.iter().filter(|e| e.success == Some(true)).count();
        let total_runtime: f64 = completed
            .iter()
            .filter_map(|e| e.runtime_seconds)
            .sum();

        Ok(HistoryStats {
            total_jobs: completed.len(),
            success_rate: successes as f64 / completed.len() as f64,
            average_runtime_seconds: total_runtime / completed.len() as f64,
        })
    }

    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

fn read_all(path: &Path) -> Result<Vec<HistoryEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    let entries = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<HistoryEntry>(line) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed history line");
                None
            }
        })
        .collect();
    Ok(entries)
}

fn write_all(path: &Path, entries: &[HistoryEntry]) -> Result<()> {
    let truncated = if entries.len() > MAX_HISTORY_ENTRIES {
        &entries[entries.len() - MAX_HISTORY_ENTRIES..]
    } else {
        entries
    };

    let mut content = String::new();
    for entry in truncated {
        content.push_str(&serde_json::to_string(entry)?);
        content.push('\n');
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(job_id: &str, role: Role, start_time: f64) -> HistoryEntry {
        HistoryEntry {
            job_id: job_id.to_string(),
            sender: "alice".to_string(),
            peer: "bob".to_string(),
            filename: "e.py".to_string(),
            args: vec![],
            image: None,
            require_gpu: false,
            role,
            start_time,
            end_time: None,
            runtime_seconds: None,
            exit_code: None,
            success: None,
            error: None,
            output_file_count: None,
        }
    }

    #[tokio::test]
    async fn append_then_patch_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let log = HistoryLog::at(dir.path().join("h.jsonl"));

        log.append_start(&entry("abc123", Role::Sender, 100.0))
            .await
            .unwrap();
        log.patch_completion(
            "abc123",
            Role::Sender,
            Completion {
                end_time: 105.0,
                runtime_seconds: 5.0,
                exit_code: 0,
                success: true,
                error: None,
                output_file_count: 1,
            },
        )
        .await
        .unwrap();

        let all = log.read_history(&HistoryFilter::default(), None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].exit_code, Some(0));
        assert_eq!(all[0].output_file_count, Some(1));
    }

    #[tokio::test]
    async fn patch_targets_most_recent_matching_open_entry() {
        let dir = tempfile::tempdir().unwrap();
        let log = HistoryLog::at(dir.path().join("h.jsonl"));

        log.append_start(&entry("abc123", Role::Sender, 100.0)).await.unwrap();
        log.append_start(&entry("abc123", Role::Sender, 200.0)).await.unwrap();

        log.patch_completion(
            "abc123",
            Role::Sender,
            Completion {
                end_time: 210.0,
                runtime_seconds: 10.0,
                exit_code: 0,
                success: true,
                error: None,
                output_file_count: 0,
            },
        )
        .await
        .unwrap();

        let all = log.read_history(&HistoryFilter::default(), None).await.unwrap();
        let completed: Vec<_> = all.iter().filter(|e| e.is_complete()).collect();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].start_time, 200.0);
    }

    #[tokio::test]
    async fn read_history_newest_first_and_limited() {
        let dir = tempfile::tempdir().unwrap();
        let log = HistoryLog::at(dir.path().join("h.jsonl"));

        for (id, t) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
            log.append_start(&entry(id, Role::Sender, t)).await.unwrap();
        }

        let top = log.read_history(&HistoryFilter::default(), Some(2)).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].job_id, "c");
        assert_eq!(top[1].job_id, "b");
    }

    #[tokio::test]
    async fn read_history_filters_by_peer_and_success() {
        let dir = tempfile::tempdir().unwrap();
        let log = HistoryLog::at(dir.path().join("h.jsonl"));

        let mut e1 = entry("a", Role::Sender, 1.0);
        e1.peer = "carol".to_string();
        e1.end_time = Some(2.0);
        e1.success = Some(false);
        log.append_start(&e1).await.unwrap();

        let mut e2 = entry("b", Role::Sender, 2.0);
        e2.peer = "bob".to_string();
        e2.end_time = Some(3.0);
        e2.success = Some(true);
        log.append_start(&e2).await.unwrap();

        let filtered = log
            .read_history(
                &HistoryFilter {
                    peer: Some("bob".to_string()),
                    success: Some(true),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].job_id, "b");
    }

    #[tokio::test]
    async fn read_history_filters_by_time_window() {
        let dir = tempfile::tempdir().unwrap();
        let log = HistoryLog::at(dir.path().join("h.jsonl"));

        for (id, t) in [("a", 10.0), ("b", 20.0), ("c", 30.0)] {
            log.append_start(&entry(id, Role::Sender, t)).await.unwrap();
        }

        let windowed = log
            .read_history(
                &HistoryFilter {
                    since: Some(15.0),
                    until: Some(25.0),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].job_id, "b");
    }

    #[tokio::test]
    async fn stats_over_completed_entries_only() {
        let dir = tempfile::tempdir().unwrap();
        let log = HistoryLog::at(dir.path().join("h.jsonl"));

        let mut done = entry("a", Role::Sender, 1.0);
        done.end_time = Some(11.0);
        done.runtime_seconds = Some(10.0);
        done.success = Some(true);
        log.append_start(&done).await.unwrap();

        log.append_start(&entry("b", Role::Sender, 2.0)).await.unwrap(); // still running

        let stats = log.stats().await.unwrap();
        assert_eq!(stats.total_jobs, 1);
        assert_eq!(stats.success_rate, 1.0);
        assert_eq!(stats.average_runtime_seconds, 10.0);
    }

    #[tokio::test]
    async fn rewrite_truncates_to_max_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.jsonl");
        let entries: Vec<HistoryEntry> = (0..(MAX_HISTORY_ENTRIES + 10))
            .map(|i| entry(&format!("j{i}"), Role::Sender, i as f64))
            .collect();
        write_all(&path, &entries).unwrap();

        let read_back = read_all(&path).unwrap();
        assert_eq!(read_back.len(), MAX_HISTORY_ENTRIES);
        assert_eq!(read_back[0].job_id, "j10");
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.jsonl");
        let mut content = serde_json::to_string(&entry("ok", Role::Sender, 1.0)).unwrap();
        content.push('\n');
        content.push_str("not json at all\n");
        std::fs::write(&path, content).unwrap();

        let entries = read_all(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].job_id, "ok");
    }
}
