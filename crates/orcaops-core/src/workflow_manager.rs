//! Workflow-level registry: submit, get, cancel, list.

use crate::audit::{AuditAction, AuditEvent, AuditLogger, AuditOutcome};
use crate::store::RunStore;
use crate::workflow::{WorkflowRecord, WorkflowSpec, WorkflowStatus};
use crate::workflow_runner::WorkflowRunner;
use crate::OrcaError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

struct WorkflowEntry {
    record: RwLock<WorkflowRecord>,
    cancel_tx: watch::Sender<bool>,
}

/// Mirrors the JobManager for workflows. Cancellation of a workflow
/// propagates to its in-flight jobs through the runner's polling loop.
pub struct WorkflowManager {
    runner: Arc<WorkflowRunner>,
    store: RunStore,
    audit: Arc<AuditLogger>,
    registry: Arc<RwLock<HashMap<String, Arc<WorkflowEntry>>>>,
}

impl WorkflowManager {
    pub fn new(runner: Arc<WorkflowRunner>, store: RunStore, audit: Arc<AuditLogger>) -> Self {
        Self {
            runner,
            store,
            audit,
            registry: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Validates the spec shape eagerly (cycles and unknown references fail
    /// here), then hands execution to a spawned workflow executor. Returns
    /// the workflow id.
    pub async fn submit(&self, spec: WorkflowSpec, actor: &str) -> Result<String, OrcaError> {
        crate::workflow::compile(&spec)?;

        let workflow_id = format!("wf-{}", Uuid::new_v4().simple());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let entry = Arc::new(WorkflowEntry {
            record: RwLock::new(WorkflowRecord::new(workflow_id.clone(), spec.name.clone())),
            cancel_tx,
        });
        self.registry.write().await.insert(workflow_id.clone(), entry.clone());

        if let Err(e) = self.audit.append(
            &AuditEvent::new(
                crate::workspace::DEFAULT_WORKSPACE_ID,
                AuditAction::WorkflowCreated,
                "workflow",
                workflow_id.clone(),
                AuditOutcome::Success,
            )
            .actor("user", actor)
            .detail("spec", spec.name.clone()),
        ) {
            tracing::warn!(error = %e, "failed to append workflow audit event");
        }

        let runner = self.runner.clone();
        let audit = self.audit.clone();
        let task_id = workflow_id.clone();
        let task_actor = actor.to_string();
        tokio::spawn(async move {
            let record = runner.run(task_id.clone(), spec, cancel_rx, &task_actor).await;
            let outcome = match record.status {
                WorkflowStatus::Success => AuditOutcome::Success,
                _ => AuditOutcome::Error,
            };
            if let Err(e) = audit.append(
                &AuditEvent::new(
                    crate::workspace::DEFAULT_WORKSPACE_ID,
                    AuditAction::WorkflowCompleted,
                    "workflow",
                    task_id,
                    outcome,
                )
                .detail("status", format!("{:?}", record.status)),
            ) {
                tracing::warn!(error = %e, "failed to append workflow completion audit event");
            }
            *entry.record.write().await = record;
        });

        Ok(workflow_id)
    }

    pub async fn get(&self, workflow_id: &str) -> Result<WorkflowRecord, OrcaError> {
        if let Some(entry) = self.registry.read().await.get(workflow_id) {
            let record = entry.record.read().await.clone();
            // Until the executor writes back, the persisted record is the
            // fresher source.
            if !record.status.is_terminal() {
                if let Some(persisted) = self.store.get_workflow(workflow_id)? {
                    return Ok(persisted);
                }
            }
            return Ok(record);
        }
        self.store
            .get_workflow(workflow_id)?
            .ok_or_else(|| OrcaError::Workflow(format!("workflow '{workflow_id}' not found")))
    }

    /// Requests cancellation; the workflow executor cancels its in-flight
    /// jobs. Returns false when the workflow was already terminal.
    pub async fn cancel(&self, workflow_id: &str) -> Result<bool, OrcaError> {
        let registry = self.registry.read().await;
        let Some(entry) = registry.get(workflow_id) else {
            return match self.store.get_workflow(workflow_id)? {
                Some(_) => Ok(false),
                None => Err(OrcaError::Workflow(format!("workflow '{workflow_id}' not found"))),
            };
        };
        let current = self.get(workflow_id).await?;
        if current.status.is_terminal() {
            return Ok(false);
        }
        entry.cancel_tx.send_replace(true);
        tracing::info!(workflow_id = workflow_id, "workflow cancellation requested");
        Ok(true)
    }

    pub async fn list(&self) -> Result<Vec<WorkflowRecord>, OrcaError> {
        let mut by_id: HashMap<String, WorkflowRecord> = self
            .store
            .list_workflows()?
            .into_iter()
            .map(|r| (r.workflow_id.clone(), r))
            .collect();
        for (workflow_id, entry) in self.registry.read().await.iter() {
            let record = entry.record.read().await.clone();
            if record.status.is_terminal() {
                by_id.insert(workflow_id.clone(), record);
            }
        }
        let mut records: Vec<WorkflowRecord> = by_id.into_values().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Polls to a terminal record, for callers that want synchronous
    /// completion semantics.
    pub async fn wait_for_terminal(
        &self,
        workflow_id: &str,
        timeout: Duration,
    ) -> Result<WorkflowRecord, OrcaError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let record = self.get(workflow_id).await?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OrcaError::Timeout(timeout.as_secs()));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}
