//! Job data model: specs, step results, run records and fingerprints.

use crate::OrcaError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

/// Terminal and in-flight states of a job run.
///
/// `Skipped` only appears in workflow job-status maps; a sandbox run record
/// always terminates in one of the other terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failed,
    TimedOut,
    Cancelled,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    /// Whether a dependent with `on_complete = success` may run after this.
    pub fn counts_as_success(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Skipped)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::TimedOut | JobStatus::Cancelled)
    }

    /// Lowercase form used by condition expressions (`jobs.<name>.status`).
    pub fn as_condition_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Skipped => "skipped",
        }
    }
}

/// Container removal policy applied once a run reaches a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    AlwaysRemove,
    #[default]
    RemoveOnCompletion,
    KeepOnCompletion,
    RemoveOnTimeout,
    NeverRemove,
}

impl CleanupPolicy {
    /// Whether the sandbox container should be removed for the given
    /// terminal status.
    pub fn should_remove(&self, status: JobStatus) -> bool {
        match self {
            CleanupPolicy::AlwaysRemove => true,
            CleanupPolicy::RemoveOnCompletion => status == JobStatus::Success,
            CleanupPolicy::KeepOnCompletion => false,
            CleanupPolicy::RemoveOnTimeout => status == JobStatus::TimedOut,
            CleanupPolicy::NeverRemove => false,
        }
    }
}

/// Outcome of the cleanup phase, recorded independently of the run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStatus {
    #[default]
    Pending,
    Removed,
    Kept,
    Failed,
}

/// A single sandbox job: one image, an ordered command list, optional
/// artifact globs and a total execution deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: String,
    pub workspace_id: String,
    pub image: String,
    /// Ordered argv vectors, executed fail-fast.
    pub commands: Vec<Vec<String>>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Glob patterns resolved inside the container after execution.
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub ttl_seconds: u64,
    /// Falls back to the workspace's default cleanup policy when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_policy: Option<CleanupPolicy>,
    pub triggered_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl JobSpec {
    /// Minimal spec against the default workspace; callers override fields
    /// as needed.
    pub fn new(image: impl Into<String>, commands: Vec<Vec<String>>) -> Self {
        Self {
            job_id: generate_job_id(),
            workspace_id: crate::workspace::DEFAULT_WORKSPACE_ID.to_string(),
            image: image.into(),
            commands,
            env: HashMap::new(),
            artifacts: Vec::new(),
            ttl_seconds: 300,
            cleanup_policy: None,
            triggered_by: "api".to_string(),
            intent: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Rejects malformed specs before admission. Validation failures are
    /// never admitted and never audited as policy violations.
    pub fn validate(&self) -> Result<(), OrcaError> {
        validate_job_id(&self.job_id)?;
        if self.image.trim().is_empty() {
            return Err(OrcaError::Validation("image must not be empty".to_string()));
        }
        if self.commands.is_empty() {
            return Err(OrcaError::Validation("commands must not be empty".to_string()));
        }
        if self.commands.iter().any(|argv| argv.is_empty()) {
            return Err(OrcaError::Validation(
                "each command must have at least one argv element".to_string(),
            ));
        }
        if self.ttl_seconds == 0 {
            return Err(OrcaError::Validation("ttl_seconds must be greater than zero".to_string()));
        }
        if self.workspace_id.trim().is_empty() {
            return Err(OrcaError::Validation("workspace_id must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.image, &self.commands)
    }
}

/// Allowed character set for caller-supplied job ids.
pub fn validate_job_id(job_id: &str) -> Result<(), OrcaError> {
    if job_id.is_empty() || job_id.len() > 64 {
        return Err(OrcaError::Validation(format!(
            "job_id must be 1-64 characters, got {}",
            job_id.len()
        )));
    }
    if !job_id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-') {
        return Err(OrcaError::Validation(format!(
            "job_id '{job_id}' contains characters outside [A-Za-z0-9._-]"
        )));
    }
    Ok(())
}

pub fn generate_job_id() -> String {
    format!("job-{}", Uuid::new_v4().simple())
}

/// Deterministic identity of an `(image, commands)` pair.
///
/// Argv items are joined with 0x1F and commands with 0x00, so argv boundaries
/// are part of the canonical form: `["echo", "a b"]` and `["echo", "a", "b"]`
/// hash differently.
pub fn fingerprint_of(image: &str, commands: &[Vec<String>]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image.trim().as_bytes());
    hasher.update([0x00]);
    for (i, argv) in commands.iter().enumerate() {
        if i > 0 {
            hasher.update([0x00]);
        }
        for (j, arg) in argv.iter().enumerate() {
            if j > 0 {
                hasher.update([0x1f]);
            }
            hasher.update(arg.as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}

/// Result of one executed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub command: Vec<String>,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_seconds: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Metadata for one artifact copied out of the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub path_in_container: String,
    pub local_path: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub content_type: String,
}

/// Final resource snapshot collected from the backend at run end.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_peak_mb: Option<f64>,
    #[serde(default)]
    pub net_rx_bytes: u64,
    #[serde(default)]
    pub net_tx_bytes: u64,
    #[serde(default)]
    pub disk_read_bytes: u64,
    #[serde(default)]
    pub disk_write_bytes: u64,
}

/// Sanitized environment and image identity captured at container creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentCapture {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,
    /// Environment passed to the container, secret-like values redacted.
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub captured_at: DateTime<Utc>,
}

/// The durable record of one job execution.
///
/// Created at admission, mutated only by the owning executor, finalized
/// exactly once with a terminal status, then read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub fingerprint: String,
    #[serde(default)]
    pub steps: Vec<StepResult>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_capture: Option<EnvironmentCapture>,
    #[serde(default)]
    pub cleanup_status: CleanupStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub anomalies: Vec<crate::baseline::Anomaly>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub spec: JobSpec,
}

impl RunRecord {
    pub fn new(spec: JobSpec) -> Self {
        let fingerprint = spec.fingerprint();
        Self {
            job_id: spec.job_id.clone(),
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            fingerprint,
            steps: Vec::new(),
            artifacts: Vec::new(),
            resource_usage: None,
            environment_capture: None,
            cleanup_status: CleanupStatus::default(),
            error: None,
            summary: None,
            anomalies: Vec::new(),
            warnings: Vec::new(),
            spec,
        }
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    /// Transitions to a terminal status exactly once. Later phases that
    /// receive an already-terminal record must not call this again.
    pub fn finalize(&mut self, status: JobStatus, error: Option<String>) {
        debug_assert!(status.is_terminal());
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        if self.started_at.is_none() {
            self.started_at = Some(self.created_at);
        }
        self.finished_at = Some(Utc::now());
        if error.is_some() {
            self.error = error;
        }
    }
}
