//! Tenant workspaces: limits, settings and on-disk persistence.

use crate::store::atomic_write_json;
use crate::types::CleanupPolicy;
use crate::OrcaError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// The workspace that always exists. Jobs without an explicit tenant land
/// here.
pub const DEFAULT_WORKSPACE_ID: &str = "ws_default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    #[default]
    Active,
    Suspended,
    Archived,
}

/// Hard resource ceilings enforced at admission and during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceLimits {
    pub max_concurrent_jobs: u32,
    pub max_concurrent_sandboxes: u32,
    pub max_job_duration_seconds: u64,
    pub max_cpu_per_job: f64,
    pub max_memory_per_job_mb: u64,
    pub max_artifacts_size_mb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_job_limit: Option<u32>,
}

impl Default for WorkspaceLimits {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            max_concurrent_sandboxes: 20,
            max_job_duration_seconds: 3600,
            max_cpu_per_job: 2.0,
            max_memory_per_job_mb: 2048,
            max_artifacts_size_mb: 512,
            daily_job_limit: None,
        }
    }
}

/// Tenant-tunable behavior merged into the global security policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceSettings {
    #[serde(default)]
    pub default_cleanup_policy: CleanupPolicy,
    /// Non-empty allow-list replaces the global allow-list (workspace wins).
    #[serde(default)]
    pub allowed_images: Vec<String>,
    /// Unioned with the global deny-list.
    #[serde(default)]
    pub blocked_images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_job_timeout: Option<u64>,
    /// Opt-in to a read-only root filesystem for sandbox containers.
    #[serde(default)]
    pub read_only_rootfs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub owner_type: String,
    pub owner_id: String,
    #[serde(default)]
    pub settings: WorkspaceSettings,
    #[serde(default)]
    pub limits: WorkspaceLimits,
    #[serde(default)]
    pub status: WorkspaceStatus,
}

impl Workspace {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            owner_type: "system".to_string(),
            owner_id: "system".to_string(),
            settings: WorkspaceSettings::default(),
            limits: WorkspaceLimits::default(),
            status: WorkspaceStatus::Active,
        }
    }

    fn default_workspace() -> Self {
        Workspace::new(DEFAULT_WORKSPACE_ID, "Default Workspace")
    }
}

/// Registry of workspaces, persisted under
/// `<base>/workspaces/<workspace_id>/workspace.json`.
///
/// Loading bootstraps `ws_default` if it is missing, so the invariant that
/// exactly one default workspace exists holds from construction onward.
#[derive(Debug)]
pub struct WorkspaceStore {
    base_dir: PathBuf,
    workspaces: RwLock<HashMap<String, Workspace>>,
}

impl WorkspaceStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, OrcaError> {
        let base_dir: PathBuf = base_dir.into();
        let root = base_dir.join("workspaces");
        fs::create_dir_all(&root)?;

        let mut workspaces = HashMap::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path().join("workspace.json");
            let Ok(bytes) = fs::read(&path) else { continue };
            match serde_json::from_slice::<Workspace>(&bytes) {
                Ok(ws) => {
                    workspaces.insert(ws.id.clone(), ws);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable workspace");
                }
            }
        }

        if !workspaces.contains_key(DEFAULT_WORKSPACE_ID) {
            let default = Workspace::default_workspace();
            persist_in(&base_dir, &default)?;
            workspaces.insert(default.id.clone(), default);
        }
        Ok(Self { base_dir, workspaces: RwLock::new(workspaces) })
    }

    pub async fn get(&self, workspace_id: &str) -> Option<Workspace> {
        self.workspaces.read().await.get(workspace_id).cloned()
    }

    /// Fetches a workspace, failing admission-style when it does not exist
    /// or is not active.
    pub async fn get_active(&self, workspace_id: &str) -> Result<Workspace, OrcaError> {
        let ws = self
            .get(workspace_id)
            .await
            .ok_or_else(|| OrcaError::Validation(format!("unknown workspace '{workspace_id}'")))?;
        if ws.status != WorkspaceStatus::Active {
            return Err(OrcaError::Validation(format!("workspace '{workspace_id}' is not active")));
        }
        Ok(ws)
    }

    pub async fn upsert(&self, workspace: Workspace) -> Result<(), OrcaError> {
        self.persist(&workspace)?;
        self.workspaces.write().await.insert(workspace.id.clone(), workspace);
        Ok(())
    }

    pub async fn list(&self) -> Vec<Workspace> {
        let mut all: Vec<_> = self.workspaces.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// The default workspace cannot be deleted.
    pub async fn delete(&self, workspace_id: &str) -> Result<bool, OrcaError> {
        if workspace_id == DEFAULT_WORKSPACE_ID {
            return Err(OrcaError::Validation("the default workspace cannot be deleted".to_string()));
        }
        let existed = self.workspaces.write().await.remove(workspace_id).is_some();
        let dir = self.base_dir.join("workspaces").join(workspace_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(existed)
    }

    fn persist(&self, workspace: &Workspace) -> Result<(), OrcaError> {
        persist_in(&self.base_dir, workspace)
    }
}

fn persist_in(base_dir: &std::path::Path, workspace: &Workspace) -> Result<(), OrcaError> {
    let dir = base_dir.join("workspaces").join(&workspace.id);
    fs::create_dir_all(&dir)?;
    atomic_write_json(&dir.join("workspace.json"), workspace)
}
