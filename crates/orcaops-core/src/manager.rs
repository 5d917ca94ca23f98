//! Concurrent job lifecycle registry: admission, dispatch, cancellation,
//! eviction and startup reconciliation.

use crate::audit::{AuditAction, AuditEvent, AuditLogger, AuditOutcome};
use crate::policy::PolicyEngine;
use crate::quota::{QuotaKind, QuotaTracker};
use crate::runner::{JobRunner, RunContext};
use crate::store::{RunFilter, RunStore};
use crate::types::{JobSpec, JobStatus, RunRecord};
use crate::workspace::WorkspaceStore;
use crate::{OrcaConfig, OrcaError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

/// One tracked job: the live record plus its cancellation signal.
struct JobEntry {
    record: RwLock<RunRecord>,
    cancel_tx: watch::Sender<bool>,
    workspace_id: String,
}

/// Admits jobs, spawns one executor task per job, and answers
/// status/cancel/list queries from memory with RunStore fallback.
pub struct JobManager {
    store: RunStore,
    policy: Arc<PolicyEngine>,
    quota: Arc<QuotaTracker>,
    audit: Arc<AuditLogger>,
    workspaces: Arc<WorkspaceStore>,
    runner: Arc<JobRunner>,
    registry: Arc<RwLock<HashMap<String, Arc<JobEntry>>>>,
    eviction_cap: usize,
}

impl JobManager {
    pub fn new(
        config: &OrcaConfig,
        store: RunStore,
        policy: Arc<PolicyEngine>,
        quota: Arc<QuotaTracker>,
        audit: Arc<AuditLogger>,
        workspaces: Arc<WorkspaceStore>,
        runner: Arc<JobRunner>,
    ) -> Result<Self, OrcaError> {
        let manager = Self {
            store,
            policy,
            quota,
            audit,
            workspaces,
            runner,
            registry: Arc::new(RwLock::new(HashMap::new())),
            eviction_cap: config.registry_eviction_cap,
        };
        manager.reconcile_orphans()?;
        Ok(manager)
    }

    /// Marks runs left non-terminal by a previous process as FAILED. Their
    /// quota reservations died with that process, so none are re-reserved.
    fn reconcile_orphans(&self) -> Result<(), OrcaError> {
        let mut orphaned = 0usize;
        for mut record in self.store.list(&RunFilter::default())? {
            if record.status.is_terminal() {
                continue;
            }
            record.finalize(JobStatus::Failed, Some("orphaned".to_string()));
            self.store.put(&record)?;
            self.audit_event(
                AuditEvent::new(
                    record.spec.workspace_id.clone(),
                    AuditAction::JobCompleted,
                    "job",
                    record.job_id.clone(),
                    AuditOutcome::Error,
                )
                .detail("reason", "orphaned"),
            );
            orphaned += 1;
        }
        if orphaned > 0 {
            tracing::warn!(count = orphaned, "reconciled orphaned runs from a previous process");
        }
        Ok(())
    }

    /// Admission pipeline: validation, duplicate check, policy, quota. On
    /// success an executor task owns the run to its terminal state.
    /// Returns the admitted job id.
    pub async fn submit(
        &self,
        spec: JobSpec,
        ctx: RunContext,
        actor: &str,
    ) -> Result<String, OrcaError> {
        spec.validate()?;
        let workspace = self.workspaces.get_active(&spec.workspace_id).await?;
        let job_id = spec.job_id.clone();

        // Duplicate check and registry insert are one critical section, so
        // of two concurrent submits with the same id at most one is
        // admitted.
        let entry = {
            let mut registry = self.registry.write().await;
            if registry.contains_key(&job_id) || self.store.get(&job_id)?.is_some() {
                return Err(OrcaError::Validation(format!("job_id '{job_id}' already exists")));
            }
            let (cancel_tx, _) = watch::channel(false);
            let entry = Arc::new(JobEntry {
                record: RwLock::new(RunRecord::new(spec.clone())),
                cancel_tx,
                workspace_id: workspace.id.clone(),
            });
            registry.insert(job_id.clone(), entry.clone());
            entry
        };

        let decision = self.policy.validate_job(&workspace, &spec);
        if !decision.allowed {
            self.registry.write().await.remove(&job_id);
            for violation in &decision.violations {
                self.audit_event(
                    AuditEvent::new(
                        workspace.id.clone(),
                        AuditAction::PolicyViolated,
                        "job",
                        job_id.clone(),
                        AuditOutcome::Denied,
                    )
                    .actor("user", actor)
                    .detail("rule", violation.rule.clone())
                    .detail("subject", violation.subject.clone()),
                );
            }
            let reason = decision
                .violations
                .first()
                .map(|v| v.message.clone())
                .unwrap_or_else(|| "policy denied".to_string());
            self.audit_event(
                AuditEvent::new(
                    workspace.id.clone(),
                    AuditAction::JobDenied,
                    "job",
                    job_id.clone(),
                    AuditOutcome::Denied,
                )
                .actor("user", actor)
                .detail("reason", reason.clone()),
            );
            return Err(OrcaError::PolicyDenied(reason));
        }

        if let Err(e) = self.quota.check_and_reserve(&workspace, QuotaKind::Job) {
            self.registry.write().await.remove(&job_id);
            self.audit_event(
                AuditEvent::new(
                    workspace.id.clone(),
                    AuditAction::JobDenied,
                    "job",
                    job_id.clone(),
                    AuditOutcome::Denied,
                )
                .actor("user", actor)
                .detail("reason", e.to_string()),
            );
            return Err(e);
        }

        self.audit_event(
            AuditEvent::new(
                workspace.id.clone(),
                AuditAction::JobCreated,
                "job",
                job_id.clone(),
                AuditOutcome::Success,
            )
            .actor("user", actor),
        );

        let runner = self.runner.clone();
        let quota = self.quota.clone();
        let audit = self.audit.clone();
        let registry = self.registry.clone();
        let eviction_cap = self.eviction_cap;
        let cancel_rx = entry.cancel_tx.subscribe();
        let task_spec = spec;
        let task_entry = entry;
        let task_workspace = workspace;

        tokio::spawn(async move {
            let record = runner.run(task_spec, task_workspace, cancel_rx, ctx).await;
            let workspace_id = task_entry.workspace_id.clone();
            let outcome = match record.status {
                JobStatus::Success => AuditOutcome::Success,
                _ => AuditOutcome::Error,
            };
            let event = AuditEvent::new(
                workspace_id.clone(),
                AuditAction::JobCompleted,
                "job",
                record.job_id.clone(),
                outcome,
            )
            .detail("status", format!("{:?}", record.status));
            if let Err(e) = audit.append(&event) {
                tracing::warn!(error = %e, "failed to append completion audit event");
            }

            *task_entry.record.write().await = record;
            quota.release(&workspace_id, QuotaKind::Job);
            evict_completed(&registry, eviction_cap).await;
        });

        Ok(job_id)
    }

    /// Memory first, RunStore fallback for evicted entries. While the
    /// executor owns the run, the persisted record is the fresher source;
    /// the in-memory entry is written back at completion.
    pub async fn get(&self, job_id: &str) -> Result<RunRecord, OrcaError> {
        if let Some(entry) = self.registry.read().await.get(job_id) {
            let record = entry.record.read().await.clone();
            if !record.status.is_terminal() {
                if let Some(persisted) = self.store.get(job_id)? {
                    return Ok(persisted);
                }
            }
            return Ok(record);
        }
        self.store
            .get(job_id)?
            .ok_or_else(|| OrcaError::JobNotFound(job_id.to_string()))
    }

    /// Sets the cancel signal. The executor observes it between steps and
    /// at watchdog ticks; a container stop forces the issue. Returns false
    /// when the job was already terminal.
    pub async fn cancel(&self, job_id: &str) -> Result<bool, OrcaError> {
        let registry = self.registry.read().await;
        let Some(entry) = registry.get(job_id) else {
            // Fall back to the store only to produce an accurate error.
            return match self.store.get(job_id)? {
                Some(_) => Ok(false),
                None => Err(OrcaError::JobNotFound(job_id.to_string())),
            };
        };
        let mut current = entry.record.read().await.clone();
        if !current.status.is_terminal() {
            if let Some(persisted) = self.store.get(job_id)? {
                current = persisted;
            }
        }
        if current.status.is_terminal() {
            return Ok(false);
        }
        entry.cancel_tx.send_replace(true);
        tracing::info!(job_id = job_id, "cancellation requested");
        Ok(true)
    }

    /// Union of in-memory entries and persisted records. Completed entries
    /// override the store; in-flight runs defer to it, since the executor
    /// persists progress there.
    pub async fn list(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, OrcaError> {
        let mut by_id: HashMap<String, RunRecord> = self
            .store
            .list(filter)?
            .into_iter()
            .map(|r| (r.job_id.clone(), r))
            .collect();
        for (job_id, entry) in self.registry.read().await.iter() {
            let record = entry.record.read().await.clone();
            if !record.status.is_terminal() && by_id.contains_key(job_id) {
                // The store copy is fresher while the executor owns the run.
                continue;
            }
            if filter.matches(&record) {
                by_id.insert(job_id.clone(), record);
            } else {
                by_id.remove(job_id);
            }
        }
        let mut records: Vec<RunRecord> = by_id.into_values().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Polls until the job reaches a terminal status or the timeout runs
    /// out. Used by the workflow layer and tests.
    pub async fn wait_for_terminal(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<RunRecord, OrcaError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let record = self.get(job_id).await?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OrcaError::Timeout(timeout.as_secs()));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    fn audit_event(&self, event: AuditEvent) {
        if let Err(e) = self.audit.append(&event) {
            tracing::warn!(error = %e, "failed to append audit event");
        }
    }
}

/// Drops the oldest completed entries once the registry exceeds its cap.
/// Evicted entries stay reachable through the RunStore fallback.
async fn evict_completed(registry: &RwLock<HashMap<String, Arc<JobEntry>>>, cap: usize) {
    let mut registry = registry.write().await;
    if registry.len() <= cap {
        return;
    }
    let mut completed: Vec<(String, chrono::DateTime<chrono::Utc>)> = Vec::new();
    for (job_id, entry) in registry.iter() {
        let record = entry.record.read().await;
        if record.status.is_terminal() {
            completed.push((job_id.clone(), record.finished_at.unwrap_or(record.created_at)));
        }
    }
    completed.sort_by(|a, b| a.1.cmp(&b.1));
    let excess = registry.len().saturating_sub(cap);
    for (job_id, _) in completed.into_iter().take(excess) {
        registry.remove(&job_id);
    }
}
