//! Worker server — accepts TCP connections, demultiplexes message
//! kinds, and dispatches to the sandbox executor.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::config::GroupConfig;
use crate::discovery::{Discovery, PeerStatus};
use crate::error::Result;
use crate::executor::{ContainerExecutor, OutputChunk, OutputStream as ExecOutputStream};
use crate::framing;
use crate::history::{Completion, HistoryEntry, HistoryLog, Role};
use crate::job::{JobEnvelope, JobResult, KillRequest, ListRequest, ListResponse};

const MSG_JOB: u8 = b'J';
const MSG_KILL: u8 = b'K';
const MSG_LIST: u8 = b'L';

const FRAME_STDOUT: u8 = b'O';
const FRAME_STDERR: u8 = b'E';
const FRAME_RESULT: u8 = b'R';

fn now_secs_i64() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

fn now_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs_f64()
}

pub struct Worker {
    config: GroupConfig,
    executor: Arc<ContainerExecutor>,
    discovery: Option<Arc<Discovery>>,
    history: Arc<HistoryLog>,
}

impl Worker {
    pub fn new(
        config: GroupConfig,
        executor: Arc<ContainerExecutor>,
        discovery: Option<Arc<Discovery>>,
        history: Arc<HistoryLog>,
    ) -> Self {
        Self {
            config,
            executor,
            discovery,
            history,
        }
    }

    /// Bind the worker TCP port and serve forever (until the listener
    /// errors out, e.g. on process shutdown).
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.worker_port)).await?;
        tracing::info!(port = self.config.worker_port, "worker server listening");

        loop {
            // 1-second accept timeout keeps the loop cancellable, matching
            // the rest of the system's suspension-point discipline.
            let accepted = tokio::time::timeout(std::time::Duration::from_secs(1), listener.accept()).await;
            let (stream, addr) = match accepted {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
                Err(_timeout) => continue,
            };

            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = worker.handle_connection(stream).await {
                    tracing::debug!(error = %e, peer = %addr, "connection handling failed");
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let kind = framing::read_kind(&mut stream).await?;
        match kind {
            MSG_JOB => self.handle_job(stream).await,
            MSG_KILL => self.handle_kill(stream).await,
            MSG_LIST => self.handle_list(stream).await,
            other => {
                tracing::warn!(kind = other, "unknown message kind");
                Ok(())
            }
        }
    }

    async fn handle_job(&self, mut stream: TcpStream) -> Result<()> {
        let body = match framing::read_body(&mut stream).await {
            Ok(body) => body,
            Err(e) => {
                self.write_error_result(&mut stream, "unknown", &e.to_string())
                    .await?;
                return Ok(());
            }
        };

        let envelope = match JobEnvelope::from_json(&body) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.write_error_result(&mut stream, "unknown", &format!("malformed job: {e}"))
                    .await?;
                return Ok(());
            }
        };

        let job_id = envelope.job.job_id.clone();
        let job = match envelope.open(self.config.group_secret.as_bytes(), now_secs_i64()) {
            Ok(job) => job,
            Err(e) => {
                self.write_error_result(
                    &mut stream,
                    &job_id,
                    &format!("authentication failed: {e}"),
                )
                .await?;
                return Ok(());
            }
        };

        let start_entry = HistoryEntry {
            job_id: job.job_id.clone(),
            sender: job.sender.clone(),
            peer: job.sender.clone(),
            filename: job.filename.clone(),
            args: job.args.clone(),
            image: job.image.clone(),
            require_gpu: job.require_gpu,
            role: Role::Executor,
            start_time: now_secs_f64(),
            end_time: None,
            runtime_seconds: None,
            exit_code: None,
            success: None,
            error: None,
            output_file_count: None,
        };
        if let Err(e) = self.history.append_start(&start_entry).await {
            tracing::warn!(error = %e, "failed to append history start entry");
        }

        if let Some(discovery) = &self.discovery {
            discovery.set_status(PeerStatus::Busy).await;
        }

        let (tx, mut rx) = mpsc::channel::<OutputChunk>(64);
        let executor = Arc::clone(&self.executor);
        let run_job = job.clone();
        let execution = tokio::spawn(async move { executor.execute(run_job, tx).await });

        while let Some(chunk) = rx.recv().await {
            let kind = match chunk.stream {
                ExecOutputStream::Stdout => FRAME_STDOUT,
                ExecOutputStream::Stderr => FRAME_STDERR,
            };
            if let Err(e) = framing::write_frame(&mut stream, kind, &chunk.data).await {
                tracing::debug!(error = %e, "failed to stream output frame, job continues");
            }
        }

        let result = match execution.await {
            Ok(result) => result,
            Err(e) => JobResult::failure(job.job_id.clone(), format!("executor task failed: {e}")),
        };

        if let Some(discovery) = &self.discovery {
            discovery.set_status(PeerStatus::Idle).await;
        }

        let completion = Completion {
            end_time: now_secs_f64(),
            runtime_seconds: result.runtime_seconds,
            exit_code: result.exit_code,
            success: result.exit_code == 0 && result.error.is_none(),
            error: result.error.clone(),
            output_file_count: result.output_files.len(),
        };
        if let Err(e) = self
            .history
            .patch_completion(&job.job_id, Role::Executor, completion)
            .await
        {
            tracing::warn!(error = %e, "failed to patch history completion");
        }

        let payload = serde_json::to_vec(&result)?;
        framing::write_frame(&mut stream, FRAME_RESULT, &payload).await?;
        Ok(())
    }

    async fn write_error_result(
        &self,
        stream: &mut TcpStream,
        job_id: &str,
        error: &str,
    ) -> Result<()> {
        let result = JobResult::failure(job_id.to_string(), error.to_string());
        let payload = serde_json::to_vec(&result)?;
        framing::write_frame(stream, FRAME_RESULT, &payload).await?;
        Ok(())
    }

    async fn handle_kill(&self, mut stream: TcpStream) -> Result<()> {
        let body = framing::read_body(&mut stream).await?;
        let request: KillRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(_) => return self.write_status_byte(&mut stream, false).await,
        };

        let authorized = request
            .auth
            .verify_job(self.config.group_secret.as_bytes(), &request.job_id, now_secs_i64());

        if !authorized {
            return self.write_status_byte(&mut stream, false).await;
        }

        let killed = self
            .executor
            .kill(&request.job_id, &request.requester)
            .await;
        self.write_status_byte(&mut stream, killed).await
    }

    async fn handle_list(&self, mut stream: TcpStream) -> Result<()> {
        let body = framing::read_body(&mut stream).await?;
        let request: ListRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(_) => return self.write_status_byte(&mut stream, false).await,
        };

        let authorized = request
            .auth
            .verify_list(self.config.group_secret.as_bytes(), now_secs_i64());
        if !authorized {
            return self.write_status_byte(&mut stream, false).await;
        }

        let jobs = self.executor.list_running().await;
        let response = ListResponse { jobs };
        let payload = serde_json::to_vec(&response)?;

        stream.write_all(&[b'1']).await?;
        framing::write_frame_body(&mut stream, &payload).await?;
        Ok(())
    }

    async fn write_status_byte(&self, stream: &mut TcpStream, ok: bool) -> Result<()> {
        stream.write_all(&[if ok { b'1' } else { b'0' }]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_secs_are_monotonic_enough_for_tests() {
        assert!(now_secs_i64() > 0);
        assert!(now_secs_f64() > 0.0);
    }
}
