//! OrcaOps Core - Container Sandbox Execution Kernel
//!
//! This crate provides the execution kernel for the OrcaOps platform:
//! - Job lifecycle management with admission, dispatch and cancellation
//! - Container command execution with timeouts and artifact extraction
//! - Workflow DAG scheduling with conditions, matrices and service containers
//! - Workspace-scoped policy and quota guardrails with audited refusal
//! - Run record persistence, EMA baselines and anomaly detection

pub mod analyzer;
pub mod audit;
pub mod backend;
pub mod baseline;
pub mod condition;
pub mod manager;
pub mod policy;
pub mod quota;
pub mod runner;
pub mod services;
pub mod store;
pub mod types;
pub mod workflow;
pub mod workflow_manager;
pub mod workflow_runner;
pub mod workspace;

pub use analyzer::{LogAnalysis, LogAnalyzer};
pub use audit::{AuditAction, AuditEvent, AuditFilter, AuditLogger, AuditOutcome};
pub use backend::{ContainerBackend, CreateOptions, DockerBackend, ExecOutput, ResourceSnapshot};
pub use baseline::{Anomaly, AnomalyKind, AnomalySeverity, Baseline, BaselineTracker};
pub use condition::{ConditionContext, ConditionEvaluator};
pub use manager::JobManager;
pub use policy::{PolicyDecision, PolicyEngine, SecurityPolicy, Violation};
pub use quota::{QuotaKind, QuotaTracker};
pub use runner::{JobRunner, RunContext};
pub use services::{ServiceManager, StartedServices};
pub use store::{RunFilter, RunStore};
pub use types::{
    fingerprint_of, ArtifactMetadata, CleanupPolicy, CleanupStatus, EnvironmentCapture, JobSpec,
    JobStatus, ResourceUsage, RunRecord, StepResult,
};
pub use workflow::{
    compile, CompiledWorkflow, MatrixConfig, OnComplete, ServiceDefinition, WorkflowJob,
    WorkflowRecord, WorkflowSpec, WorkflowStatus,
};
pub use workflow_manager::WorkflowManager;
pub use workflow_runner::WorkflowRunner;
pub use workspace::{Workspace, WorkspaceLimits, WorkspaceSettings, WorkspaceStatus, WorkspaceStore};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Environment variable that bypasses container backend probing at startup.
pub const SKIP_BACKEND_INIT_ENV: &str = "ORCAOPS_SKIP_BACKEND_INIT";

#[derive(Error, Debug)]
pub enum OrcaError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Policy denied: {0}")]
    PolicyDenied(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Condition error: {0}")]
    Condition(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Top-level configuration for the execution kernel.
///
/// Constructed once and handed to each service explicitly; there are no
/// process-wide singletons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrcaConfig {
    /// Base directory for all persisted state (runs, workflows, baselines,
    /// anomalies, audit, workspaces).
    pub base_dir: PathBuf,
    pub security: SecurityPolicy,
    /// Regexes matched against environment variable names; matching values
    /// are redacted in environment captures.
    pub secret_env_patterns: Vec<String>,
    /// Maximum jobs dispatched concurrently within one workflow level.
    pub workflow_parallelism: usize,
    /// Completed job entries kept in memory before eviction to the RunStore.
    pub registry_eviction_cap: usize,
    pub retry: RetryConfig,
}

/// Retry tuning for transient container backend failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

impl Default for OrcaConfig {
    fn default() -> Self {
        let base_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".orcaops");

        Self {
            base_dir,
            security: SecurityPolicy::default(),
            secret_env_patterns: vec![
                r"(?i)secret".to_string(),
                r"(?i)token".to_string(),
                r"(?i)passw(or)?d".to_string(),
                r"(?i)api[_-]?key".to_string(),
                r"(?i)private[_-]?key".to_string(),
                r"(?i)credential".to_string(),
            ],
            workflow_parallelism: 4,
            registry_eviction_cap: 100,
            retry: RetryConfig::default(),
        }
    }
}

impl OrcaConfig {
    /// Configuration rooted at an explicit base directory, with defaults for
    /// everything else. Test harnesses point this at a temp dir.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// Whether backend probing should be skipped at startup.
    pub fn skip_backend_init() -> bool {
        std::env::var(SKIP_BACKEND_INIT_ENV).map(|v| v == "1").unwrap_or(false)
    }
}
