//! Append-only audit event stream, partitioned by local date.

use crate::OrcaError;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    #[serde(rename = "job.created")]
    JobCreated,
    #[serde(rename = "job.denied")]
    JobDenied,
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "workflow.created")]
    WorkflowCreated,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "policy.violated")]
    PolicyViolated,
    #[serde(rename = "workspace.created")]
    WorkspaceCreated,
    #[serde(rename = "workspace.updated")]
    WorkspaceUpdated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Denied,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub workspace_id: String,
    pub actor_type: String,
    pub actor_id: String,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
    pub outcome: AuditOutcome,
}

impl AuditEvent {
    pub fn new(
        workspace_id: impl Into<String>,
        action: AuditAction,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            event_id: format!("evt-{}", Uuid::new_v4().simple()),
            timestamp: Utc::now(),
            workspace_id: workspace_id.into(),
            actor_type: "system".to_string(),
            actor_id: "system".to_string(),
            action,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            details: HashMap::new(),
            outcome,
        }
    }

    pub fn actor(mut self, actor_type: impl Into<String>, actor_id: impl Into<String>) -> Self {
        self.actor_type = actor_type.into();
        self.actor_id = actor_id.into();
        self
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Read-side filter for [`AuditLogger::query`].
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub workspace_id: Option<String>,
    pub action: Option<AuditAction>,
    pub outcome: Option<AuditOutcome>,
    pub actor_id: Option<String>,
    pub resource_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl AuditFilter {
    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(ws) = &self.workspace_id {
            if &event.workspace_id != ws {
                return false;
            }
        }
        if let Some(action) = self.action {
            if event.action != action {
                return false;
            }
        }
        if let Some(outcome) = self.outcome {
            if event.outcome != outcome {
                return false;
            }
        }
        if let Some(actor) = &self.actor_id {
            if &event.actor_id != actor {
                return false;
            }
        }
        if let Some(resource) = &self.resource_id {
            if &event.resource_id != resource {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.timestamp > until {
                return false;
            }
        }
        true
    }
}

/// Appends audit events to `<base>/audit/YYYY-MM-DD.jsonl`.
///
/// A single writer mutex orders all appends; each event is written as one
/// whole line so concurrent readers never see a partial record.
#[derive(Debug)]
pub struct AuditLogger {
    audit_dir: PathBuf,
    writer: Mutex<()>,
}

impl AuditLogger {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, OrcaError> {
        let audit_dir = base_dir.into().join("audit");
        fs::create_dir_all(&audit_dir)?;
        Ok(Self { audit_dir, writer: Mutex::new(()) })
    }

    pub fn append(&self, event: &AuditEvent) -> Result<(), OrcaError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let path = self.audit_dir.join(format!("{}.jsonl", chrono::Local::now().format("%Y-%m-%d")));

        let _guard = self.writer.lock();
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Scans date files newest-first, returning events newest-first.
    pub fn query(
        &self,
        filter: &AuditFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AuditEvent>, OrcaError> {
        let mut files: Vec<(NaiveDate, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.audit_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(".jsonl") else { continue };
            if let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") {
                files.push((date, entry.path()));
            }
        }
        files.sort_by(|a, b| b.0.cmp(&a.0));

        let mut matched = Vec::new();
        let mut to_skip = offset;
        'files: for (_, path) in files {
            let contents = fs::read_to_string(&path)?;
            // Within one file appends are chronological; reverse for
            // newest-first output.
            for line in contents.lines().rev() {
                let Ok(event) = serde_json::from_str::<AuditEvent>(line) else {
                    continue;
                };
                if !filter.matches(&event) {
                    continue;
                }
                if to_skip > 0 {
                    to_skip -= 1;
                    continue;
                }
                matched.push(event);
                if matched.len() >= limit {
                    break 'files;
                }
            }
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn logger() -> (TempDir, AuditLogger) {
        let dir = TempDir::new().unwrap();
        let logger = AuditLogger::new(dir.path()).unwrap();
        (dir, logger)
    }

    #[test]
    fn append_writes_one_line_per_event() {
        let (dir, logger) = logger();
        for i in 0..3 {
            logger
                .append(&AuditEvent::new(
                    "ws_default",
                    AuditAction::JobCreated,
                    "job",
                    format!("job-{i}"),
                    AuditOutcome::Success,
                ))
                .unwrap();
        }
        let file = dir
            .path()
            .join("audit")
            .join(format!("{}.jsonl", chrono::Local::now().format("%Y-%m-%d")));
        let contents = std::fs::read_to_string(file).unwrap();
        assert_eq!(contents.lines().count(), 3);
    }

    #[test]
    fn timestamps_are_non_decreasing_per_file() {
        let (dir, logger) = logger();
        for i in 0..10 {
            logger
                .append(&AuditEvent::new(
                    "ws_default",
                    AuditAction::JobCompleted,
                    "job",
                    format!("job-{i}"),
                    AuditOutcome::Success,
                ))
                .unwrap();
        }
        let file = dir
            .path()
            .join("audit")
            .join(format!("{}.jsonl", chrono::Local::now().format("%Y-%m-%d")));
        let contents = std::fs::read_to_string(file).unwrap();
        let timestamps: Vec<DateTime<Utc>> = contents
            .lines()
            .map(|l| serde_json::from_str::<AuditEvent>(l).unwrap().timestamp)
            .collect();
        assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn query_filters_and_paginates() {
        let (_dir, logger) = logger();
        for i in 0..5 {
            logger
                .append(&AuditEvent::new(
                    "ws_a",
                    AuditAction::JobCreated,
                    "job",
                    format!("job-{i}"),
                    AuditOutcome::Success,
                ))
                .unwrap();
        }
        logger
            .append(&AuditEvent::new(
                "ws_b",
                AuditAction::JobDenied,
                "job",
                "job-x",
                AuditOutcome::Denied,
            ))
            .unwrap();

        let denied = logger
            .query(
                &AuditFilter { outcome: Some(AuditOutcome::Denied), ..Default::default() },
                10,
                0,
            )
            .unwrap();
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].workspace_id, "ws_b");

        let page = logger
            .query(
                &AuditFilter { workspace_id: Some("ws_a".to_string()), ..Default::default() },
                2,
                1,
            )
            .unwrap();
        assert_eq!(page.len(), 2);
        // Newest-first: offset 1 skips job-4.
        assert_eq!(page[0].resource_id, "job-3");
        assert_eq!(page[1].resource_id, "job-2");
    }
}
