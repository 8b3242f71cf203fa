//! Submission client — connects to a chosen peer, sends a signed job,
//! and streams output back to the caller. Never surfaces transport
//! errors to its caller: every call yields a `JobResult`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::TcpStream;

use crate::framing;
use crate::history::{Completion, HistoryEntry, HistoryLog, Role};
use crate::job::{JobEnvelope, JobResult, KillRequest, ListRequest, ListResponse, RequestAuth};

const MSG_JOB: u8 = b'J';
const MSG_KILL: u8 = b'K';
const MSG_LIST: u8 = b'L';

const FRAME_STDOUT: u8 = b'O';
const FRAME_STDERR: u8 = b'E';
const FRAME_RESULT: u8 = b'R';

pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

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

/// Callbacks the caller supplies to receive streamed output as it
/// arrives, ahead of the final `JobResult`.
pub trait OutputSink: Send {
    fn on_stdout(&mut self, chunk: &[u8]);
    fn on_stderr(&mut self, chunk: &[u8]);
}

/// Submit `envelope` to `(ip, port)` on peer `peer_name`, driving the
/// streaming response and recording a `Role::Sender` history entry
/// around the whole exchange — the symmetric counterpart to the
/// `Role::Executor` entry the receiving worker records.
#[allow(clippy::too_many_arguments)]
pub async fn submit_job(
    ip: &str,
    port: u16,
    peer_name: &str,
    envelope: &JobEnvelope,
    timeout_secs: u64,
    history: &HistoryLog,
    sink: &mut dyn OutputSink,
) -> JobResult {
    let job = &envelope.job;
    let job_id = job.job_id.clone();
    let deadline = Duration::from_secs(timeout_secs);

    let start_entry = HistoryEntry {
        job_id: job.job_id.clone(),
        sender: job.sender.clone(),
        peer: peer_name.to_string(),
        filename: job.filename.clone(),
        args: job.args.clone(),
        image: job.image.clone(),
        require_gpu: job.require_gpu,
        role: Role::Sender,
        start_time: now_secs_f64(),
        end_time: None,
        runtime_seconds: None,
        exit_code: None,
        success: None,
        error: None,
        output_file_count: None,
    };
    if let Err(e) = history.append_start(&start_entry).await {
        tracing::warn!(error = %e, "failed to append history start entry");
    }

    let outcome = tokio::time::timeout(deadline, run_submission(ip, port, envelope, sink)).await;

    let result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => JobResult::failure(job_id.clone(), e.to_string()),
        Err(_elapsed) => JobResult::failure(job_id.clone(), "Connection timed out"),
    };

    let completion = Completion {
        end_time: now_secs_f64(),
        runtime_seconds: result.runtime_seconds,
        exit_code: result.exit_code,
        success: result.exit_code == 0 && result.error.is_none(),
        error: result.error.clone(),
        output_file_count: result.output_files.len(),
    };
    if let Err(e) = history.patch_completion(&job_id, Role::Sender, completion).await {
        tracing::warn!(error = %e, "failed to patch history completion");
    }

    result
}

async fn run_submission(
    ip: &str,
    port: u16,
    envelope: &JobEnvelope,
    sink: &mut dyn OutputSink,
) -> crate::error::Result<JobResult> {
    let mut stream = TcpStream::connect((ip, port)).await?;

    let body = envelope.to_json()?;
    framing::write_frame(&mut stream, MSG_JOB, &body).await?;

    loop {
        let kind = match framing::read_kind(&mut stream).await {
            Ok(kind) => kind,
            Err(_) => {
                return Ok(JobResult::failure(
                    envelope.job.job_id.clone(),
                    "Connection closed by peer",
                ))
            }
        };

        let payload = framing::read_body(&mut stream).await?;
        match kind {
            FRAME_STDOUT => sink.on_stdout(&payload),
            FRAME_STDERR => sink.on_stderr(&payload),
            FRAME_RESULT => return Ok(serde_json::from_slice(&payload)?),
            _ => {}
        }
    }
}

/// Send a kill request, authorized as `requester`. Returns `false` on
/// any I/O error or negative response.
pub async fn send_kill(ip: &str, port: u16, secret: &[u8], job_id: &str, requester: &str) -> bool {
    match try_send_kill(ip, port, secret, job_id, requester).await {
        Ok(ok) => ok,
        Err(e) => {
            tracing::debug!(error = %e, "kill request failed");
            false
        }
    }
}

async fn try_send_kill(
    ip: &str,
    port: u16,
    secret: &[u8],
    job_id: &str,
    requester: &str,
) -> crate::error::Result<bool> {
    let mut stream = TcpStream::connect((ip, port)).await?;
    let now = now_secs_i64();
    let request = KillRequest {
        job_id: job_id.to_string(),
        requester: requester.to_string(),
        auth: RequestAuth::for_job(secret, job_id, now),
    };
    let body = serde_json::to_vec(&request)?;
    framing::write_frame(&mut stream, MSG_KILL, &body).await?;

    let mut status = [0u8; 1];
    use tokio::io::AsyncReadExt;
    stream.read_exact(&mut status).await?;
    Ok(status[0] == b'1')
}

/// List the jobs currently running on a peer. Returns `None` — the
/// "unknown" outcome described in the external interfaces — on any
/// I/O error or negative auth response.
pub async fn send_list(ip: &str, port: u16, secret: &[u8]) -> Option<ListResponse> {
    try_send_list(ip, port, secret).await.ok().flatten()
}

async fn try_send_list(
    ip: &str,
    port: u16,
    secret: &[u8],
) -> crate::error::Result<Option<ListResponse>> {
    let mut stream = TcpStream::connect((ip, port)).await?;
    let now = now_secs_i64();
    let request = ListRequest {
        auth: RequestAuth::for_list(secret, now),
    };
    let body = serde_json::to_vec(&request)?;
    framing::write_frame(&mut stream, MSG_LIST, &body).await?;

    use tokio::io::AsyncReadExt;
    let mut status = [0u8; 1];
    stream.read_exact(&mut status).await?;
    if status[0] != b'1' {
        return Ok(None);
    }

    let payload = framing::read_body(&mut stream).await?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct CapturingSink {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    }

    impl OutputSink for CapturingSink {
        fn on_stdout(&mut self, chunk: &[u8]) {
            self.stdout.extend_from_slice(chunk);
        }
        fn on_stderr(&mut self, chunk: &[u8]) {
            self.stderr.extend_from_slice(chunk);
        }
    }

    #[tokio::test]
    async fn submit_job_streams_output_then_result() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let kind = framing::read_kind(&mut stream).await.unwrap();
            assert_eq!(kind, MSG_JOB);
            let _job_body = framing::read_body(&mut stream).await.unwrap();

            framing::write_frame(&mut stream, FRAME_STDOUT, b"hi\n").await.unwrap();
            let result = JobResult {
                job_id: "abc12345".to_string(),
                exit_code: 0,
                stdout: "hi\n".to_string(),
                stderr: String::new(),
                output_files: HashMap::new(),
                runtime_seconds: 0.1,
                error: None,
            };
            let payload = serde_json::to_vec(&result).unwrap();
            framing::write_frame(&mut stream, FRAME_RESULT, &payload).await.unwrap();
        });

        let job = crate::job::Job::new(
            "alice",
            "e.py",
            b"print('hi')".to_vec(),
            vec![],
            HashMap::new(),
            false,
            None,
        );
        let envelope = JobEnvelope::seal(job, b"secret");

        let dir = tempfile::tempdir().unwrap();
        let history = HistoryLog::at(dir.path().join("h.jsonl"));
        let mut sink = CapturingSink::default();
        let result = submit_job(
            &addr.ip().to_string(),
            addr.port(),
            "bob",
            &envelope,
            5,
            &history,
            &mut sink,
        )
        .await;

        server.await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(sink.stdout, b"hi\n");

        let entries = history
            .read_history(&crate::history::HistoryFilter::default(), None)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].role, Role::Sender);
        assert_eq!(entries[0].peer, "bob");
        assert!(entries[0].is_complete());
        assert_eq!(entries[0].success, Some(true));
    }

    #[tokio::test]
    async fn submit_job_synthesizes_result_on_early_close() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = framing::read_kind(&mut stream).await;
            let _ = framing::read_body(&mut stream).await;
            // Close without sending a result frame.
        });

        let job = crate::job::Job::new(
            "alice",
            "e.py",
            vec![],
            vec![],
            HashMap::new(),
            false,
            None,
        );
        let envelope = JobEnvelope::seal(job, b"secret");
        let dir = tempfile::tempdir().unwrap();
        let history = HistoryLog::at(dir.path().join("h.jsonl"));
        let mut sink = CapturingSink::default();
        let result = submit_job(
            &addr.ip().to_string(),
            addr.port(),
            "bob",
            &envelope,
            5,
            &history,
            &mut sink,
        )
        .await;

        server.await.unwrap();
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.error.as_deref(), Some("Connection closed by peer"));
    }

    #[tokio::test]
    async fn submit_job_fails_fast_on_connection_refused() {
        let job = crate::job::Job::new(
            "alice",
            "e.py",
            vec![],
            vec![],
            HashMap::new(),
            false,
            None,
        );
        let envelope = JobEnvelope::seal(job, b"secret");
        let dir = tempfile::tempdir().unwrap();
        let history = HistoryLog::at(dir.path().join("h.jsonl"));
        let mut sink = CapturingSink::default();
        // Port 0 never accepts connections.
        let result = submit_job("127.0.0.1", 0, "bob", &envelope, 5, &history, &mut sink).await;
        assert_eq!(result.exit_code, -1);
        assert!(result.error.is_some());
    }
}
