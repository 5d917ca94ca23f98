//! Single-job execution: container up, ordered commands, timeout, artifact
//! extraction, observability, teardown.

use crate::analyzer::LogAnalyzer;
use crate::backend::{ContainerBackend, CreateOptions};
use crate::baseline::BaselineTracker;
use crate::policy::PolicyEngine;
use crate::quota::{QuotaKind, QuotaTracker};
use crate::store::RunStore;
use crate::types::{
    ArtifactMetadata, CleanupStatus, EnvironmentCapture, JobSpec, JobStatus, ResourceUsage,
    RunRecord, StepResult,
};
use crate::workspace::Workspace;
use crate::{OrcaConfig, OrcaError};
use chrono::Utc;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Extra wiring handed down by the workflow layer: service network
/// membership and injected service endpoints.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub network: Option<String>,
    pub extra_env: HashMap<String, String>,
}

/// Executes one job spec to a terminal run record.
///
/// The runner never returns an error: every failure mode folds into the
/// record's terminal status and `error` field. Admission (validation,
/// policy, quota) has already happened in the manager by the time a spec
/// reaches `run`.
pub struct JobRunner {
    backend: Arc<dyn ContainerBackend>,
    store: RunStore,
    policy: Arc<PolicyEngine>,
    quota: Arc<QuotaTracker>,
    baselines: Arc<BaselineTracker>,
    analyzer: LogAnalyzer,
    secret_patterns: Vec<Regex>,
}

impl JobRunner {
    pub fn new(
        config: &OrcaConfig,
        backend: Arc<dyn ContainerBackend>,
        store: RunStore,
        policy: Arc<PolicyEngine>,
        quota: Arc<QuotaTracker>,
        baselines: Arc<BaselineTracker>,
    ) -> Self {
        let secret_patterns = config
            .secret_env_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %pattern, error = %e, "skipping invalid secret pattern");
                    None
                }
            })
            .collect();
        Self {
            backend,
            store,
            policy,
            quota,
            baselines,
            analyzer: LogAnalyzer::new(),
            secret_patterns,
        }
    }

    fn container_name(job_id: &str) -> String {
        format!("orcaops-job-{job_id}")
    }

    /// Runs the full lifecycle for one admitted spec.
    pub async fn run(
        &self,
        spec: JobSpec,
        workspace: Workspace,
        cancel: watch::Receiver<bool>,
        ctx: RunContext,
    ) -> RunRecord {
        let mut record = RunRecord::new(spec);
        self.persist(&record);
        tracing::info!(job_id = %record.job_id, image = %record.spec.image, "job admitted");

        if let Err(e) = self.backend.pull(&record.spec.image).await {
            record.finalize(JobStatus::Failed, Some(format!("image pull failed: {e}")));
            record.summary = Some(format!("Job failed before start: {e}"));
            self.persist(&record);
            return record;
        }

        if let Err(e) = self.quota.check_and_reserve(&workspace, QuotaKind::Sandbox) {
            record.finalize(JobStatus::Failed, Some(e.to_string()));
            self.persist(&record);
            return record;
        }

        let container = match self.create_container(&record.spec, &workspace, &ctx).await {
            Ok(id) => id,
            Err(e) => {
                self.quota.release(&workspace.id, QuotaKind::Sandbox);
                record.finalize(JobStatus::Failed, Some(format!("container create failed: {e}")));
                self.persist(&record);
                return record;
            }
        };

        record.environment_capture = Some(self.capture_environment(&record.spec, &ctx).await);
        record.status = JobStatus::Running;
        record.started_at = Some(Utc::now());
        self.persist(&record);

        let ttl = record
            .spec
            .ttl_seconds
            .min(workspace.limits.max_job_duration_seconds);
        let (status, error) = self
            .execute_commands(&container, ttl, &mut record, cancel)
            .await;
        record.finalize(status, error);
        tracing::info!(
            job_id = %record.job_id,
            status = ?record.status,
            steps = record.steps.len(),
            "job reached terminal status"
        );

        self.collect_artifacts(&container, &workspace, &mut record).await;
        self.observe(&container, &mut record).await;
        let cleanup_policy = record
            .spec
            .cleanup_policy
            .unwrap_or(workspace.settings.default_cleanup_policy);
        self.cleanup(&container, cleanup_policy, &mut record).await;
        self.quota.release(&workspace.id, QuotaKind::Sandbox);

        self.persist(&record);
        record
    }

    async fn create_container(
        &self,
        spec: &JobSpec,
        workspace: &Workspace,
        ctx: &RunContext,
    ) -> Result<String, OrcaError> {
        let mut env = spec.env.clone();
        env.extend(ctx.extra_env.clone());

        let opts = CreateOptions {
            name: Self::container_name(&spec.job_id),
            image: spec.image.clone(),
            env,
            network: ctx.network.clone(),
            security_opts: self.policy.container_security_opts(workspace),
            cpu_limit: Some(workspace.limits.max_cpu_per_job),
            memory_limit_mb: Some(workspace.limits.max_memory_per_job_mb),
            labels: HashMap::from([("orcaops.job_id".to_string(), spec.job_id.clone())]),
            // Keepalive entry process; job commands run as execs.
            command: vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()],
        };
        let container = self.backend.create(&opts).await?;
        self.backend.start(&container).await?;
        Ok(container)
    }

    async fn capture_environment(&self, spec: &JobSpec, ctx: &RunContext) -> EnvironmentCapture {
        let mut env: HashMap<String, String> = HashMap::new();
        for (key, value) in spec.env.iter().chain(ctx.extra_env.iter()) {
            let value = if self.secret_patterns.iter().any(|re| re.is_match(key)) {
                "[REDACTED]".to_string()
            } else {
                value.clone()
            };
            env.insert(key.clone(), value);
        }
        let image_digest = match self.backend.image_digest(&spec.image).await {
            Ok(digest) => digest,
            Err(e) => {
                tracing::debug!(job_id = %spec.job_id, error = %e, "image digest unavailable");
                None
            }
        };
        EnvironmentCapture { image_digest, env, captured_at: Utc::now() }
    }

    /// Fail-fast command loop under the TTL watchdog and the cancel signal.
    async fn execute_commands(
        &self,
        container: &str,
        ttl_seconds: u64,
        record: &mut RunRecord,
        mut cancel: watch::Receiver<bool>,
    ) -> (JobStatus, Option<String>) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(ttl_seconds);
        let commands = record.spec.commands.clone();

        for (index, command) in commands.iter().enumerate() {
            if *cancel.borrow() {
                self.stop_container(container).await;
                return (JobStatus::Cancelled, Some("cancelled before step".to_string()));
            }

            let started_at = Utc::now();
            let exec = self.backend.exec(container, command);
            tokio::pin!(exec);

            let cancel_requested = async {
                loop {
                    if cancel.changed().await.is_err() {
                        // Sender gone: no cancellation can arrive anymore.
                        futures::future::pending::<()>().await;
                    }
                    if *cancel.borrow() {
                        return;
                    }
                }
            };
            tokio::pin!(cancel_requested);

            let output = tokio::select! {
                output = &mut exec => output,
                _ = tokio::time::sleep_until(deadline) => {
                    self.stop_container(container).await;
                    return (
                        JobStatus::TimedOut,
                        Some(format!("ttl of {ttl_seconds}s exceeded at step {index}")),
                    );
                }
                _ = &mut cancel_requested => {
                    self.stop_container(container).await;
                    return (JobStatus::Cancelled, Some(format!("cancelled during step {index}")));
                }
            };

            let output = match output {
                Ok(output) => output,
                Err(e) => {
                    return (JobStatus::Failed, Some(format!("step {index} exec failed: {e}")));
                }
            };

            let finished_at = Utc::now();
            let step = StepResult {
                index,
                command: command.clone(),
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
                duration_seconds: (finished_at - started_at).num_milliseconds() as f64 / 1000.0,
                started_at,
                finished_at,
            };
            if let Err(e) = self.store.append_step(&record.job_id, &step) {
                tracing::warn!(job_id = %record.job_id, error = %e, "failed to append step log");
            }
            let exit_code = step.exit_code;
            record.steps.push(step);

            if exit_code != 0 {
                return (
                    JobStatus::Failed,
                    Some(format!("step {index} exited with code {exit_code}")),
                );
            }
        }
        (JobStatus::Success, None)
    }

    async fn stop_container(&self, container: &str) {
        if let Err(e) = self.backend.stop(container, STOP_GRACE).await {
            tracing::warn!(container = container, error = %e, "graceful stop failed");
        }
    }

    /// Resolves artifact globs inside the container and copies matches into
    /// the run directory, up to the workspace size cap. Missing matches are
    /// warnings, never failures.
    async fn collect_artifacts(
        &self,
        container: &str,
        workspace: &Workspace,
        record: &mut RunRecord,
    ) {
        if record.spec.artifacts.is_empty() {
            return;
        }
        let cap_bytes = workspace.limits.max_artifacts_size_mb * 1024 * 1024;
        let run_dir = self.store.run_dir(&record.job_id);
        let patterns = record.spec.artifacts.clone();
        let mut total_bytes = 0u64;

        'collection: for pattern in &patterns {
            let matches = match self.backend.list_matching(container, pattern).await {
                Ok(matches) => matches,
                Err(e) => {
                    record.warnings.push(format!("artifact glob '{pattern}' failed: {e}"));
                    continue;
                }
            };
            if matches.is_empty() {
                record.warnings.push(format!("no artifacts matched '{pattern}'"));
                continue;
            }
            for container_path in matches {
                let file_name = Path::new(&container_path)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "artifact".to_string());
                let local_path = run_dir.join(&file_name);
                if let Err(e) = self.backend.copy_from(container, &container_path, &local_path).await
                {
                    record
                        .warnings
                        .push(format!("failed to copy artifact '{container_path}': {e}"));
                    continue;
                }
                let size_bytes = std::fs::metadata(&local_path).map(|m| m.len()).unwrap_or(0);
                if total_bytes + size_bytes > cap_bytes {
                    let _ = std::fs::remove_file(&local_path);
                    record.warnings.push(format!(
                        "artifact collection truncated at {} MB cap",
                        workspace.limits.max_artifacts_size_mb
                    ));
                    break 'collection;
                }
                total_bytes += size_bytes;
                let sha256 = sha256_file(&local_path).unwrap_or_default();
                record.artifacts.push(ArtifactMetadata {
                    path_in_container: container_path.clone(),
                    local_path: local_path.to_string_lossy().to_string(),
                    size_bytes,
                    sha256,
                    content_type: content_type_for(&file_name).to_string(),
                });
            }
        }
    }

    /// Final stats snapshot, log analysis, summary and baseline push.
    /// Failures here are logged and the affected field omitted; the terminal
    /// status is never altered.
    async fn observe(&self, container: &str, record: &mut RunRecord) {
        match self.backend.stats(container).await {
            Ok(snapshot) => {
                let cpu_seconds = match (snapshot.cpu_percent, record.duration_seconds()) {
                    (Some(pct), Some(duration)) => Some(pct / 100.0 * duration),
                    _ => None,
                };
                record.resource_usage = Some(ResourceUsage {
                    cpu_seconds,
                    memory_peak_mb: snapshot.memory_mb,
                    net_rx_bytes: snapshot.net_rx_bytes,
                    net_tx_bytes: snapshot.net_tx_bytes,
                    disk_read_bytes: snapshot.disk_read_bytes,
                    disk_write_bytes: snapshot.disk_write_bytes,
                });
            }
            Err(e) => {
                tracing::warn!(job_id = %record.job_id, error = %e, "resource stats unavailable");
            }
        }

        let stdout: String =
            record.steps.iter().map(|s| s.stdout.as_str()).collect::<Vec<_>>().join("");
        let stderr: String =
            record.steps.iter().map(|s| s.stderr.as_str()).collect::<Vec<_>>().join("");
        let analysis = self.analyzer.analyze(&stdout, &stderr);
        if record.status == JobStatus::Failed && record.error.is_none() {
            record.error = analysis.errors.first().cloned();
        }

        let recommendations =
            self.baselines.recommendations(&record.fingerprint, Some(record.spec.ttl_seconds));
        record.summary =
            Some(self.analyzer.summarize(record, &analysis, recommendations.first().map(String::as_str)));

        match self.baselines.record_run(record) {
            Ok(anomalies) => record.anomalies = anomalies,
            Err(e) => {
                tracing::warn!(job_id = %record.job_id, error = %e, "baseline update failed");
            }
        }
    }

    /// Applies the cleanup policy. A container that should be gone but
    /// resists removal is retried once and then reported via
    /// `cleanup_status = failed` without failing the job.
    async fn cleanup(
        &self,
        container: &str,
        policy: crate::types::CleanupPolicy,
        record: &mut RunRecord,
    ) {
        let should_remove = policy.should_remove(record.status);
        if !should_remove {
            self.stop_container(container).await;
            record.cleanup_status = CleanupStatus::Kept;
            return;
        }

        for attempt in 0..2 {
            match self.backend.remove(container).await {
                Ok(()) => {
                    record.cleanup_status = CleanupStatus::Removed;
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %record.job_id,
                        container = container,
                        attempt = attempt,
                        error = %e,
                        "container removal failed"
                    );
                }
            }
        }
        record.cleanup_status = CleanupStatus::Failed;
    }

    fn persist(&self, record: &RunRecord) {
        if let Err(e) = self.store.put(record) {
            tracing::error!(job_id = %record.job_id, error = %e, "failed to persist run record");
        }
    }
}

fn sha256_file(path: &Path) -> Option<String> {
    let mut file = std::fs::File::open(path).ok()?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer).ok()?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Some(hex::encode(hasher.finalize()))
}

fn content_type_for(file_name: &str) -> &'static str {
    match Path::new(file_name).extension().and_then(|e| e.to_str()).unwrap_or("") {
        "json" => "application/json",
        "txt" | "log" | "md" => "text/plain",
        "csv" => "text/csv",
        "xml" => "application/xml",
        "html" | "htm" => "text/html",
        "tar" => "application/x-tar",
        "gz" | "tgz" => "application/gzip",
        "zip" => "application/zip",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}
