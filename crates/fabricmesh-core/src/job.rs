//! Job and JobResult types, and the auth envelope that wraps a job on
//! the wire.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::error::{FabricMeshError, Result};

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

/// An immutable request to execute `filename` (plus `files`) inside a
/// constrained container on a peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub sender: String,
    pub filename: String,
    #[serde(with = "base64_bytes")]
    pub code: Vec<u8>,
    pub args: Vec<String>,
    #[serde(with = "base64_bytes_map")]
    pub files: HashMap<String, Vec<u8>>,
    pub require_gpu: bool,
    pub image: Option<String>,
    pub timestamp: i64,
}

impl Job {
    pub fn new(
        sender: impl Into<String>,
        filename: impl Into<String>,
        code: Vec<u8>,
        args: Vec<String>,
        files: HashMap<String, Vec<u8>>,
        require_gpu: bool,
        image: Option<String>,
    ) -> Self {
        Self {
            job_id: generate_job_id(),
            sender: sender.into(),
            filename: filename.into(),
            code,
            args,
            files,
            require_gpu,
            image,
            timestamp: now_secs(),
        }
    }

    /// All input paths — used by the executor to distinguish inputs
    /// from generated output artifacts.
    pub fn input_paths(&self) -> std::collections::HashSet<String> {
        let mut set: std::collections::HashSet<String> = self.files.keys().cloned().collect();
        set.insert(self.filename.clone());
        set
    }
}

/// 8 hex characters — mirrors `uuid.uuid4().hex[:8]`.
pub fn generate_job_id() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The outcome of running a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobResult {
    pub job_id: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(with = "base64_bytes_map", default)]
    pub output_files: HashMap<String, Vec<u8>>,
    pub runtime_seconds: f64,
    pub error: Option<String>,
}

impl JobResult {
    pub fn failure(job_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            output_files: HashMap::new(),
            runtime_seconds: 0.0,
            error: Some(error.into()),
        }
    }
}

/// `{ "hmac": "..." }` auth envelope for job submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobAuth {
    pub hmac: String,
}

/// The full wire envelope for a job submission: `{ job, auth }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEnvelope {
    pub job: Job,
    pub auth: JobAuth,
}

impl JobEnvelope {
    pub fn seal(job: Job, secret: &[u8]) -> Self {
        let message = crypto::job_auth_message(&job.job_id, job.timestamp);
        let hmac = crypto::sign(secret, &message);
        Self {
            job,
            auth: JobAuth { hmac },
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Verify HMAC and freshness. Returns the job on success.
    pub fn open(self, secret: &[u8], now: i64) -> Result<Job> {
        let message = crypto::job_auth_message(&self.job.job_id, self.job.timestamp);
        if !crypto::verify(secret, &message, &self.auth.hmac) {
            return Err(FabricMeshError::AuthFailed {
                reason: "invalid job signature".to_string(),
            });
        }
        if !crypto::is_fresh(now, self.job.timestamp) {
            return Err(FabricMeshError::AuthFailed {
                reason: "job timestamp outside freshness window".to_string(),
            });
        }
        Ok(self.job)
    }
}

/// Auth envelope for kill/list requests: `{ hmac, timestamp }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestAuth {
    pub hmac: String,
    pub timestamp: i64,
}

impl RequestAuth {
    pub fn for_job(secret: &[u8], job_id: &str, timestamp: i64) -> Self {
        let message = crypto::job_auth_message(job_id, timestamp);
        Self {
            hmac: crypto::sign(secret, &message),
            timestamp,
        }
    }

    pub fn for_list(secret: &[u8], timestamp: i64) -> Self {
        let message = crypto::list_auth_message(timestamp);
        Self {
            hmac: crypto::sign(secret, &message),
            timestamp,
        }
    }

    pub fn verify_job(&self, secret: &[u8], job_id: &str, now: i64) -> bool {
        let message = crypto::job_auth_message(job_id, self.timestamp);
        crypto::verify(secret, &message, &self.hmac) && crypto::is_fresh(now, self.timestamp)
    }

    pub fn verify_list(&self, secret: &[u8], now: i64) -> bool {
        let message = crypto::list_auth_message(self.timestamp);
        crypto::verify(secret, &message, &self.hmac) && crypto::is_fresh(now, self.timestamp)
    }
}

/// Kill request body: `{ job_id, requester, auth }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KillRequest {
    pub job_id: String,
    pub requester: String,
    pub auth: RequestAuth,
}

/// List request body: `{ auth }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListRequest {
    pub auth: RequestAuth,
}

/// One entry in a list response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunningJobSummary {
    pub job_id: String,
    pub sender: String,
    pub filename: String,
    pub start_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListResponse {
    pub jobs: Vec<RunningJobSummary>,
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

mod base64_bytes_map {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::HashMap;

    pub fn serialize<S: Serializer>(
        map: &HashMap<String, Vec<u8>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut m = s.serialize_map(Some(map.len()))?;
        for (k, v) in map {
            m.serialize_entry(k, &base64::engine::general_purpose::STANDARD.encode(v))?;
        }
        m.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<HashMap<String, Vec<u8>>, D::Error> {
        let raw: HashMap<String, String> = HashMap::deserialize(d)?;
        raw.into_iter()
            .map(|(k, v)| {
                base64::engine::general_purpose::STANDARD
                    .decode(v)
                    .map(|bytes| (k, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
