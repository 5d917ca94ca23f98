//! Level-parallel workflow execution.

use crate::condition::{ConditionContext, ConditionEvaluator};
use crate::manager::JobManager;
use crate::runner::RunContext;
use crate::services::ServiceManager;
use crate::store::RunStore;
use crate::types::{JobSpec, JobStatus};
use crate::workflow::{
    compile, CompiledWorkflow, OnComplete, WorkflowJob, WorkflowRecord, WorkflowSpec,
    WorkflowStatus,
};
use crate::OrcaConfig;
use chrono::Utc;
use futures::future::join_all;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

/// Outcome of one scheduled workflow job.
struct JobOutcome {
    name: String,
    status: JobStatus,
    run_id: Option<String>,
    error: Option<String>,
}

/// Schedules a compiled workflow level by level, delegating job execution
/// to the JobManager and service lifecycles to the ServiceManager.
pub struct WorkflowRunner {
    manager: Arc<JobManager>,
    services: Arc<ServiceManager>,
    store: RunStore,
    evaluator: ConditionEvaluator,
    parallelism: usize,
}

impl WorkflowRunner {
    pub fn new(
        config: &OrcaConfig,
        manager: Arc<JobManager>,
        services: Arc<ServiceManager>,
        store: RunStore,
    ) -> Self {
        Self {
            manager,
            services,
            store,
            evaluator: ConditionEvaluator::new(),
            parallelism: config.workflow_parallelism.max(1),
        }
    }

    /// Runs the workflow to a terminal record. Cancellation arrives through
    /// `cancel` and propagates to every in-flight job.
    pub async fn run(
        &self,
        workflow_id: String,
        spec: WorkflowSpec,
        cancel: watch::Receiver<bool>,
        actor: &str,
    ) -> WorkflowRecord {
        let mut record = WorkflowRecord::new(workflow_id.clone(), spec.name.clone());

        let compiled = match compile(&spec) {
            Ok(compiled) => compiled,
            Err(e) => {
                record.status = WorkflowStatus::Failed;
                record.error = Some(e.to_string());
                record.finished_at = Some(Utc::now());
                self.persist(&record);
                return record;
            }
        };

        record.status = WorkflowStatus::Running;
        record.started_at = Some(Utc::now());
        self.persist(&record);
        tracing::info!(
            workflow_id = %workflow_id,
            spec = %spec.name,
            jobs = compiled.jobs.len(),
            levels = compiled.levels.len(),
            "workflow started"
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(spec.timeout_seconds);
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut timed_out = false;

        'levels: for level in &compiled.levels {
            if *cancel.borrow() {
                break 'levels;
            }
            let futures: Vec<_> = level
                .iter()
                .map(|name| {
                    let job = compiled.jobs.get(name).cloned();
                    self.run_job(
                        &workflow_id,
                        &spec,
                        &record,
                        name.clone(),
                        job,
                        deadline,
                        cancel.clone(),
                        semaphore.clone(),
                    )
                })
                .collect();

            let outcomes = join_all(futures).await;
            for outcome in outcomes {
                record.job_statuses.insert(outcome.name.clone(), outcome.status);
                if let Some(run_id) = outcome.run_id {
                    record.job_run_ids.insert(outcome.name.clone(), run_id);
                }
                if let Some(error) = outcome.error {
                    if record.error.is_none() {
                        record.error = Some(format!("{}: {error}", outcome.name));
                    }
                }
            }
            self.persist(&record);

            if tokio::time::Instant::now() >= deadline {
                timed_out = true;
                break 'levels;
            }
        }

        record.status = if *cancel.borrow() {
            WorkflowStatus::Cancelled
        } else if timed_out {
            record.error = Some("workflow_timeout".to_string());
            WorkflowStatus::Failed
        } else {
            aggregate_status(&record.job_statuses)
        };
        record.finished_at = Some(Utc::now());
        self.persist(&record);
        tracing::info!(
            workflow_id = %workflow_id,
            status = ?record.status,
            actor = actor,
            "workflow finished"
        );
        record
    }

    /// Gates, submits and awaits a single workflow job.
    #[allow(clippy::too_many_arguments)]
    async fn run_job(
        &self,
        workflow_id: &str,
        spec: &WorkflowSpec,
        record: &WorkflowRecord,
        name: String,
        job: Option<WorkflowJob>,
        deadline: tokio::time::Instant,
        cancel: watch::Receiver<bool>,
        semaphore: Arc<Semaphore>,
    ) -> JobOutcome {
        let Some(job) = job else {
            return JobOutcome {
                name: name.clone(),
                status: JobStatus::Failed,
                run_id: None,
                error: Some("job vanished during compilation".to_string()),
            };
        };

        if !upstream_gate_open(&job, &record.job_statuses) {
            return JobOutcome { name, status: JobStatus::Skipped, run_id: None, error: None };
        }

        match self.condition_gate(&job, spec, record) {
            Ok(true) => {}
            Ok(false) => {
                return JobOutcome { name, status: JobStatus::Skipped, run_id: None, error: None };
            }
            Err(e) => {
                return JobOutcome {
                    name,
                    status: JobStatus::Failed,
                    run_id: None,
                    error: Some(e.to_string()),
                };
            }
        }

        let _permit = match semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return JobOutcome {
                    name,
                    status: JobStatus::Failed,
                    run_id: None,
                    error: Some("scheduler shut down".to_string()),
                };
            }
        };

        // Services come up before the sandbox and die with the job.
        let started_services = if job.services.is_empty() {
            None
        } else {
            match self.services.start(workflow_id, &name, &job.services).await {
                Ok(services) => Some(services),
                Err(e) => {
                    return JobOutcome {
                        name,
                        status: JobStatus::Failed,
                        run_id: None,
                        error: Some(e.to_string()),
                    };
                }
            }
        };

        let remaining = deadline
            .saturating_duration_since(tokio::time::Instant::now())
            .as_secs()
            .max(1);
        let job_spec = build_job_spec(workflow_id, spec, &name, &job, remaining);
        let job_id = job_spec.job_id.clone();
        let ctx = RunContext {
            network: started_services.as_ref().map(|s| s.network.clone()),
            extra_env: started_services.as_ref().map(|s| s.env.clone()).unwrap_or_default(),
        };

        let submitted = self
            .manager
            .submit(job_spec, ctx, &format!("workflow:{workflow_id}"))
            .await;
        let outcome = match submitted {
            Ok(run_id) => {
                let status = self.await_job(&run_id, deadline, cancel).await;
                JobOutcome { name, status, run_id: Some(run_id), error: None }
            }
            Err(e) => JobOutcome {
                name,
                status: JobStatus::Failed,
                run_id: None,
                error: Some(e.to_string()),
            },
        };

        if let Some(services) = started_services {
            self.services.teardown(services).await;
        }
        outcome
    }

    /// Polls the job to terminal state, translating workflow cancellation
    /// and the workflow deadline into job cancellation.
    async fn await_job(
        &self,
        run_id: &str,
        deadline: tokio::time::Instant,
        cancel: watch::Receiver<bool>,
    ) -> JobStatus {
        let mut cancel_sent = false;
        loop {
            let record = match self.manager.get(run_id).await {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(job_id = run_id, error = %e, "lost track of workflow job");
                    return JobStatus::Failed;
                }
            };
            if record.status.is_terminal() {
                return record.status;
            }
            let past_deadline = tokio::time::Instant::now() >= deadline;
            if (!cancel_sent) && (*cancel.borrow() || past_deadline) {
                if let Err(e) = self.manager.cancel(run_id).await {
                    tracing::warn!(job_id = run_id, error = %e, "failed to cancel workflow job");
                }
                cancel_sent = true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    fn condition_gate(
        &self,
        job: &WorkflowJob,
        spec: &WorkflowSpec,
        record: &WorkflowRecord,
    ) -> Result<bool, crate::OrcaError> {
        if job.if_condition.is_none() && job.unless_condition.is_none() {
            return Ok(true);
        }

        let mut env = spec.env.clone();
        env.extend(job.env.clone());
        let mut job_statuses: HashMap<String, JobStatus> = record
            .job_statuses
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        // Matrix bases aggregate over their variants so conditions can say
        // `jobs.build.status` without naming a variant.
        for (base, statuses) in aggregate_groups(record) {
            job_statuses.entry(base).or_insert(statuses);
        }
        let ctx = ConditionContext { job_statuses, env };

        if let Some(condition) = &job.if_condition {
            if !self.evaluator.evaluate(condition, &ctx)? {
                return Ok(false);
            }
        }
        if let Some(condition) = &job.unless_condition {
            if self.evaluator.evaluate(condition, &ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn persist(&self, record: &WorkflowRecord) {
        if let Err(e) = self.store.put_workflow(record) {
            tracing::error!(workflow_id = %record.workflow_id, error = %e, "failed to persist workflow record");
        }
    }
}

/// Whether the `on_complete` gate lets a job run given its dependencies.
/// Skipped dependencies count as successes, so a skip cascades through
/// `success` chains and never satisfies a `failure` gate.
fn upstream_gate_open(job: &WorkflowJob, statuses: &std::collections::BTreeMap<String, JobStatus>) -> bool {
    if job.requires.is_empty() {
        return true;
    }
    let outcomes: Vec<JobStatus> = job
        .requires
        .iter()
        .map(|dep| statuses.get(dep).copied().unwrap_or(JobStatus::Failed))
        .collect();
    match job.on_complete {
        OnComplete::Success => outcomes.iter().all(|s| s.counts_as_success()),
        OnComplete::Failure => outcomes.iter().any(|s| s.is_failure()),
        OnComplete::Always => true,
    }
}

/// Variant statuses folded to one status per matrix base: failed if any
/// variant failed, running if any is unfinished, else success.
fn aggregate_groups(record: &WorkflowRecord) -> HashMap<String, JobStatus> {
    let mut grouped: HashMap<String, Vec<JobStatus>> = HashMap::new();
    for (name, status) in &record.job_statuses {
        if let Some(base) = name.split('[').next() {
            if base != name {
                grouped.entry(base.to_string()).or_default().push(*status);
            }
        }
    }
    grouped
        .into_iter()
        .map(|(base, statuses)| {
            let folded = if statuses.iter().any(|s| s.is_failure()) {
                JobStatus::Failed
            } else if statuses.iter().all(|s| s.is_terminal()) {
                JobStatus::Success
            } else {
                JobStatus::Running
            };
            (base, folded)
        })
        .collect()
}

/// Workflow terminal status from per-job outcomes: SUCCESS when nothing
/// failed, FAILED when everything executed failed, PARTIAL on a mix.
fn aggregate_status(statuses: &std::collections::BTreeMap<String, JobStatus>) -> WorkflowStatus {
    let executed: Vec<JobStatus> = statuses
        .values()
        .copied()
        .filter(|s| *s != JobStatus::Skipped)
        .collect();
    if executed.is_empty() {
        return WorkflowStatus::Success;
    }
    let failures = executed.iter().filter(|s| s.is_failure()).count();
    if failures == 0 {
        WorkflowStatus::Success
    } else if failures == executed.len() {
        WorkflowStatus::Failed
    } else {
        WorkflowStatus::Partial
    }
}

/// Derives the sandbox JobSpec for one workflow job. The workflow env is
/// overlaid by the job env; service endpoints arrive separately through the
/// RunContext.
fn build_job_spec(
    workflow_id: &str,
    spec: &WorkflowSpec,
    job_name: &str,
    job: &WorkflowJob,
    remaining_workflow_secs: u64,
) -> JobSpec {
    let mut env = spec.env.clone();
    env.extend(job.env.clone());

    let ttl = job.timeout_seconds.unwrap_or(3600).min(remaining_workflow_secs).max(1);

    let mut job_spec = JobSpec::new(job.image.clone(), job.commands.clone());
    job_spec.job_id = derive_job_id(workflow_id, job_name);
    job_spec.env = env;
    job_spec.artifacts = job.artifacts.clone();
    job_spec.ttl_seconds = ttl;
    job_spec.cleanup_policy = Some(spec.cleanup_policy);
    job_spec.triggered_by = format!("workflow:{workflow_id}");
    job_spec.tags = vec!["workflow".to_string()];
    job_spec
        .metadata
        .insert("workflow_job".to_string(), serde_json::Value::String(job_name.to_string()));
    job_spec
}

/// Sandbox job ids carry a restricted charset; matrix variant names do not.
/// A short digest keeps sanitized collisions apart.
fn derive_job_id(workflow_id: &str, job_name: &str) -> String {
    let sanitized: String = job_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let digest = hex::encode(Sha256::digest(format!("{workflow_id}/{job_name}").as_bytes()));
    let mut id = format!("{workflow_id}-{sanitized}");
    let max_prefix = 64 - 9;
    if id.len() > max_prefix {
        id.truncate(max_prefix);
    }
    format!("{id}-{}", &digest[..8])
}
