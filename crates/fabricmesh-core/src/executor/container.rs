//! Docker-backed sandbox execution.
//!
//! One container per job, resource-constrained and network-isolated by
//! default. This is the system's only defense against untrusted code —
//! every constraint here must stay in force for every container.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceRequest, HostConfig};
use bollard::Docker;
use futures_util::stream::StreamExt;
use tokio::sync::mpsc;

use crate::config::GroupConfig;
use crate::job::{Job, JobResult};

use super::workspace;

/// A chunk of output as observed from the container's combined log
/// stream. The container has no TTY, so stdout/stderr are not
/// demultiplexed by the daemon — everything surfaces as `Stdout`,
/// matching the non-TTY log behavior Docker itself exposes.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A job currently bound to a running container.
#[derive(Debug, Clone)]
pub struct RunningJob {
    pub job: Job,
    pub start_time: f64,
    pub container_id: String,
    /// Set by `RunningJobs::kill` when an explicit kill request is
    /// honored, so `execute()` can report the job as killed even though
    /// the container's own exit happens well inside the job timeout.
    pub killed: Arc<AtomicBool>,
}

/// Table of jobs currently executing. Owned by the executor; the
/// worker interrogates it through these narrow accessors rather than
/// reaching through to container handles directly.
#[derive(Default, Clone)]
pub struct RunningJobs {
    inner: std::sync::Arc<tokio::sync::Mutex<HashMap<String, RunningJob>>>,
}

impl RunningJobs {
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert(&self, running: RunningJob) {
        self.inner.lock().await.insert(running.job.job_id.clone(), running);
    }

    async fn remove(&self, job_id: &str) -> Option<RunningJob> {
        self.inner.lock().await.remove(job_id)
    }

    pub async fn list(&self) -> Vec<crate::job::RunningJobSummary> {
        self.inner
            .lock()
            .await
            .values()
            .map(|r| crate::job::RunningJobSummary {
                job_id: r.job.job_id.clone(),
                sender: r.job.sender.clone(),
                filename: r.job.filename.clone(),
                start_time: r.start_time,
            })
            .collect()
    }

    /// Kill `job_id` iff it is running and `requester` matches the
    /// original sender. Returns whether a kill was issued.
    pub async fn kill(&self, docker: &Docker, job_id: &str, requester: &str) -> bool {
        let (container_id, killed_flag) = {
            let jobs = self.inner.lock().await;
            match jobs.get(job_id) {
                Some(running) if running.job.sender == requester => {
                    (running.container_id.clone(), Arc::clone(&running.killed))
                }
                _ => return false,
            }
        };

        killed_flag.store(true, Ordering::SeqCst);
        docker
            .kill_container(&container_id, None::<KillContainerOptions<String>>)
            .await
            .is_ok()
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs_f64()
}

/// Entry command chosen by filename extension; `.py` (and anything
/// unrecognized) defaults to `python`. This is a trust-affecting policy
/// choice inherited unchanged: whichever interpreter runs, the
/// container sandbox is the actual security boundary.
fn entry_command(filename: &str, args: &[String]) -> Vec<String> {
    let interpreter = match filename.rsplit('.').next() {
        Some("js") => "node",
        Some("sh") => "bash",
        Some("rb") => "ruby",
        Some("pl") => "perl",
        Some("php") => "php",
        _ => "python",
    };
    let mut cmd = vec![interpreter.to_string(), filename.to_string()];
    cmd.extend(args.iter().cloned());
    cmd
}

pub struct ContainerExecutor {
    docker: Docker,
    config: GroupConfig,
    pub running: RunningJobs,
}

impl ContainerExecutor {
    pub fn connect(config: GroupConfig) -> crate::error::Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            config,
            running: RunningJobs::new(),
        })
    }

    pub async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    pub async fn list_running(&self) -> Vec<crate::job::RunningJobSummary> {
        self.running.list().await
    }

    pub async fn kill(&self, job_id: &str, requester: &str) -> bool {
        self.running.kill(&self.docker, job_id, requester).await
    }

    /// Run `job` inside a fresh container, streaming output chunks on
    /// `output_tx` as they arrive and returning the final result. Never
    /// returns an `Err` — every failure mode is folded into the
    /// returned `JobResult`'s `error` field, matching the submission
    /// client's "always yields a result" contract.
    pub async fn execute(&self, job: Job, output_tx: mpsc::Sender<OutputChunk>) -> JobResult {
        let start = Instant::now();
        let start_time = now_secs();

        let workspace_dir = match workspace::prepare(&job) {
            Ok(dir) => dir,
            Err(e) => return JobResult::failure(job.job_id, format!("workspace error: {e}")),
        };

        let image = if job.require_gpu {
            self.config.gpu_image.clone()
        } else {
            self.config.resolve_image(job.image.as_deref()).to_string()
        };

        if let Err(e) = self.ensure_image(&image).await {
            return JobResult::failure(
                job.job_id,
                format!("Docker image not found: {image} ({e})"),
            );
        }

        let container_name = format!("homie_{}", job.job_id);
        let host_config = self.host_config(&workspace_dir, &job);
        let command = entry_command(&job.filename, &job.args);

        let container_config = Config {
            image: Some(image),
            cmd: Some(command),
            working_dir: Some("/workspace".to_string()),
            env: Some(vec![
                format!("HOMIE_JOB_ID={}", job.job_id),
                "PYTHONUNBUFFERED=1".to_string(),
            ]),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await;

        let container_id = match create {
            Ok(response) => response.id,
            Err(e) => {
                workspace::remove(&workspace_dir.path().to_path_buf());
                return JobResult::failure(job.job_id, e.to_string());
            }
        };

        if let Err(e) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = self.cleanup(&container_id, &workspace_dir.path().to_path_buf()).await;
            return JobResult::failure(job.job_id, e.to_string());
        }

        let killed_flag = Arc::new(AtomicBool::new(false));
        self.running
            .insert(RunningJob {
                job: job.clone(),
                start_time,
                container_id: container_id.clone(),
                killed: Arc::clone(&killed_flag),
            })
            .await;

        let (stdout, stderr, timed_out) = self
            .stream_logs(&container_id, self.config.container_timeout_secs, &output_tx)
            .await;

        let killed = killed_flag.load(Ordering::SeqCst);

        let exit_code = if timed_out {
            let _ = self
                .docker
                .kill_container(&container_id, None::<KillContainerOptions<String>>)
                .await;
            -1
        } else if killed {
            -1
        } else {
            self.read_exit_code(&container_id).await
        };

        let output_files = workspace::collect_outputs(workspace_dir.path(), &job).unwrap_or_default();

        self.running.remove(&job.job_id).await;
        let _ = self.cleanup(&container_id, &workspace_dir.path().to_path_buf()).await;

        JobResult {
            job_id: job.job_id,
            exit_code,
            stdout,
            stderr,
            output_files,
            runtime_seconds: start.elapsed().as_secs_f64(),
            error: if timed_out {
                Some("Execution timed out".to_string())
            } else if killed {
                Some("Job killed by requester".to_string())
            } else {
                None
            },
        }
    }

    async fn ensure_image(&self, image: &str) -> crate::error::Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(result) = stream.next().await {
            result?;
        }
        Ok(())
    }

    fn host_config(&self, workspace_dir: &tempfile::TempDir, job: &Job) -> HostConfig {
        let nano_cpus = (self.config.container_cpu_limit * 1_000_000_000.0) as i64;
        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), "size=100M,mode=1777".to_string());

        HostConfig {
            binds: Some(vec![format!(
                "{}:/workspace:rw",
                workspace_dir.path().display()
            )]),
            nano_cpus: Some(nano_cpus),
            memory: Some(parse_memory_limit(&self.config.container_memory_limit)),
            pids_limit: Some(self.config.pids_limit),
            network_mode: Some(self.config.container_network.clone()),
            readonly_rootfs: Some(true),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            tmpfs: Some(tmpfs),
            device_requests: if job.require_gpu {
                Some(vec![DeviceRequest {
                    driver: Some("nvidia".to_string()),
                    count: Some(-1),
                    capabilities: Some(vec![vec!["gpu".to_string()]]),
                    ..Default::default()
                }])
            } else {
                None
            },
            ..Default::default()
        }
    }

    /// Drain the container's combined log stream, forwarding each
    /// chunk to `output_tx`, until the container exits or `timeout_secs`
    /// elapses.
    async fn stream_logs(
        &self,
        container_id: &str,
        timeout_secs: u64,
        output_tx: &mpsc::Sender<OutputChunk>,
    ) -> (String, String, bool) {
        let mut stdout = String::new();
        let mut stderr = String::new();

        let logs = self.docker.logs(
            container_id,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let drain = async {
            let mut logs = logs;
            while let Some(chunk) = logs.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                        let _ = output_tx
                            .send(OutputChunk {
                                stream: OutputStream::Stdout,
                                data: message.to_vec(),
                            })
                            .await;
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                        let _ = output_tx
                            .send(OutputChunk {
                                stream: OutputStream::Stderr,
                                data: message.to_vec(),
                            })
                            .await;
                    }
                    Ok(LogOutput::Console { message }) => {
                        // No TTY requested — surfaced as stdout with full fidelity.
                        stdout.push_str(&String::from_utf8_lossy(&message));
                        let _ = output_tx
                            .send(OutputChunk {
                                stream: OutputStream::Stdout,
                                data: message.to_vec(),
                            })
                            .await;
                    }
                    Ok(LogOutput::StdIn { .. }) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "log stream error");
                        break;
                    }
                }
            }
        };

        let timed_out = tokio::time::timeout(Duration::from_secs(timeout_secs), drain)
            .await
            .is_err();

        (stdout, stderr, timed_out)
    }

    async fn read_exit_code(&self, container_id: &str) -> i32 {
        let mut wait = self.docker.wait_container(
            container_id,
            None::<WaitContainerOptions<String>>,
        );
        match wait.next().await {
            Some(Ok(response)) => response.status_code as i32,
            _ => -1,
        }
    }

    async fn cleanup(&self, container_id: &str, workspace_dir: &std::path::PathBuf) -> crate::error::Result<()> {
        let _ = self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        workspace::remove(workspace_dir);
        Ok(())
    }
}

fn parse_memory_limit(limit: &str) -> i64 {
    let lower = limit.to_lowercase();
    let (digits, multiplier) = if let Some(stripped) = lower.strip_suffix('g') {
        (stripped, 1024 * 1024 * 1024)
    } else if let Some(stripped) = lower.strip_suffix('m') {
        (stripped, 1024 * 1024)
    } else if let Some(stripped) = lower.strip_suffix('k') {
        (stripped, 1024)
    } else {
        (lower.as_str(), 1)
    };
    digits.parse::<i64>().unwrap_or(0) * multiplier
}
