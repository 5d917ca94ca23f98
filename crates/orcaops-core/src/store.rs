//! On-disk persistence for run and workflow records.
//!
//! Directory-per-run layout under the configured base:
//! `artifacts/<job_id>/run.json`, `artifacts/<job_id>/steps.jsonl`, extracted
//! artifact files alongside. Workflow records live in a parallel hierarchy
//! `workflows/<workflow_id>/workflow.json`. All record writes go through
//! write-temp-then-rename so readers never observe a torn document.

use crate::types::{JobStatus, RunRecord, StepResult};
use crate::workflow::WorkflowRecord;
use crate::OrcaError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Filter predicate for [`RunStore::list`]. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<JobStatus>,
    /// Filename-style glob matched against the spec image.
    pub image: Option<String>,
    /// Every listed tag must be present on the run.
    pub tags: Vec<String>,
    pub triggered_by: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub min_duration_seconds: Option<f64>,
    pub max_duration_seconds: Option<f64>,
}

impl RunFilter {
    pub fn matches(&self, record: &RunRecord) -> bool {
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(pattern) = &self.image {
            match glob::Pattern::new(pattern) {
                Ok(p) if p.matches(&record.spec.image) => {}
                _ => return false,
            }
        }
        if !self.tags.iter().all(|t| record.spec.tags.contains(t)) {
            return false;
        }
        if let Some(trigger) = &self.triggered_by {
            if &record.spec.triggered_by != trigger {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if record.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if record.created_at > before {
                return false;
            }
        }
        if self.min_duration_seconds.is_some() || self.max_duration_seconds.is_some() {
            let Some(duration) = record.duration_seconds() else {
                return false;
            };
            if let Some(min) = self.min_duration_seconds {
                if duration < min {
                    return false;
                }
            }
            if let Some(max) = self.max_duration_seconds {
                if duration > max {
                    return false;
                }
            }
        }
        true
    }
}

/// Durable store for run records, step streams and workflow records.
#[derive(Debug, Clone)]
pub struct RunStore {
    base_dir: PathBuf,
}

impl RunStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, OrcaError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(base_dir.join("artifacts"))?;
        fs::create_dir_all(base_dir.join("workflows"))?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory holding `run.json`, `steps.jsonl` and extracted artifacts
    /// for one job. Created on first `put`.
    pub fn run_dir(&self, job_id: &str) -> PathBuf {
        self.base_dir.join("artifacts").join(job_id)
    }

    pub fn put(&self, record: &RunRecord) -> Result<(), OrcaError> {
        let dir = self.run_dir(&record.job_id);
        fs::create_dir_all(&dir)?;
        atomic_write_json(&dir.join("run.json"), record)
    }

    pub fn get(&self, job_id: &str) -> Result<Option<RunRecord>, OrcaError> {
        let path = self.run_dir(job_id).join("run.json");
        read_json(&path)
    }

    /// Appends one step to the job's streaming log. A whole line is written
    /// in a single call so concurrent readers see complete entries.
    pub fn append_step(&self, job_id: &str, step: &StepResult) -> Result<(), OrcaError> {
        let dir = self.run_dir(job_id);
        fs::create_dir_all(&dir)?;
        let mut line = serde_json::to_string(step)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("steps.jsonl"))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Scans run directories, newest first. Unreadable entries are skipped;
    /// the atomic-replace discipline means a readable `run.json` is always a
    /// complete document.
    pub fn list(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, OrcaError> {
        let artifacts = self.base_dir.join("artifacts");
        let mut records = Vec::new();
        for entry in fs::read_dir(&artifacts)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path().join("run.json");
            let Ok(Some(record)) = read_json::<RunRecord>(&path) else {
                continue;
            };
            if filter.matches(&record) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    pub fn delete(&self, job_id: &str) -> Result<bool, OrcaError> {
        let dir = self.run_dir(job_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Removes terminal runs created before the cutoff. Returns the number
    /// of runs deleted. In-flight runs are never removed.
    pub fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, OrcaError> {
        let mut removed = 0;
        for record in self.list(&RunFilter::default())? {
            if record.status.is_terminal() && record.created_at < older_than {
                if self.delete(&record.job_id)? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    pub fn workflow_dir(&self, workflow_id: &str) -> PathBuf {
        self.base_dir.join("workflows").join(workflow_id)
    }

    pub fn put_workflow(&self, record: &WorkflowRecord) -> Result<(), OrcaError> {
        let dir = self.workflow_dir(&record.workflow_id);
        fs::create_dir_all(&dir)?;
        atomic_write_json(&dir.join("workflow.json"), record)
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowRecord>, OrcaError> {
        read_json(&self.workflow_dir(workflow_id).join("workflow.json"))
    }

    pub fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, OrcaError> {
        let root = self.base_dir.join("workflows");
        let mut records = Vec::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(Some(record)) = read_json::<WorkflowRecord>(&entry.path().join("workflow.json")) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    pub fn delete_workflow(&self, workflow_id: &str) -> Result<bool, OrcaError> {
        let dir = self.workflow_dir(workflow_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// Serializes to a sibling temp file, then renames over the target. Retries
/// the write once on failure before surfacing the error.
pub(crate) fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), OrcaError> {
    match try_atomic_write_json(path, value) {
        Ok(()) => Ok(()),
        Err(first) => {
            tracing::warn!(path = %path.display(), error = %first, "atomic write failed, retrying once");
            try_atomic_write_json(path, value)
        }
    }
}

fn try_atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), OrcaError> {
    let json = serde_json::to_vec_pretty(value)?;
    let parent = path
        .parent()
        .ok_or_else(|| OrcaError::Persistence(format!("no parent directory for {}", path.display())))?;
    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
        std::process::id()
    ));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, OrcaError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
