//! Shared test harness: an in-memory container backend and a fully wired
//! platform rooted at a temp directory.

#![allow(dead_code)]

use async_trait::async_trait;
use orcaops_core::backend::{ContainerBackend, CreateOptions, ExecOutput, ResourceSnapshot};
use orcaops_core::{
    AuditLogger, BaselineTracker, JobManager, JobRunner, OrcaConfig, OrcaError, PolicyEngine,
    QuotaTracker, RunStore, SecurityPolicy, ServiceManager, WorkflowManager, WorkflowRunner,
    WorkspaceStore,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Default)]
struct MockContainer {
    running: bool,
    files: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    networks: HashSet<String>,
    pulled: Vec<String>,
    removed: Vec<String>,
    unpullable: HashSet<String>,
}

/// Simulates a container runtime in memory. Commands understood by `exec`:
/// `echo`, `true`, `false`, `exit <code>`, `sleep <secs>`,
/// `mkfile <path> <contents>` and `sh -c <anything>` (always healthy).
#[derive(Debug, Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_pulls_of(&self, image: &str) {
        self.state.lock().unpullable.insert(image.to_string());
    }

    pub fn pulled_images(&self) -> Vec<String> {
        self.state.lock().pulled.clone()
    }

    pub fn live_containers(&self) -> Vec<String> {
        self.state.lock().containers.keys().cloned().collect()
    }

    pub fn networks(&self) -> Vec<String> {
        self.state.lock().networks.iter().cloned().collect()
    }

    pub fn removed_containers(&self) -> Vec<String> {
        self.state.lock().removed.clone()
    }
}

#[async_trait]
impl ContainerBackend for MockBackend {
    async fn pull(&self, image: &str) -> Result<(), OrcaError> {
        let mut state = self.state.lock();
        if state.unpullable.contains(image) {
            return Err(OrcaError::Backend(format!("No such image: {image}")));
        }
        state.pulled.push(image.to_string());
        Ok(())
    }

    async fn create(&self, opts: &CreateOptions) -> Result<String, OrcaError> {
        let mut state = self.state.lock();
        if state.containers.contains_key(&opts.name) {
            return Err(OrcaError::Backend(format!("name '{}' already in use", opts.name)));
        }
        state.containers.insert(opts.name.clone(), MockContainer::default());
        Ok(opts.name.clone())
    }

    async fn start(&self, container_id: &str) -> Result<(), OrcaError> {
        let mut state = self.state.lock();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| OrcaError::Backend(format!("no such container: {container_id}")))?;
        container.running = true;
        Ok(())
    }

    async fn exec(&self, container_id: &str, command: &[String]) -> Result<ExecOutput, OrcaError> {
        {
            let state = self.state.lock();
            let container = state
                .containers
                .get(container_id)
                .ok_or_else(|| OrcaError::Backend(format!("no such container: {container_id}")))?;
            if !container.running {
                return Ok(ExecOutput {
                    exit_code: 126,
                    stdout: String::new(),
                    stderr: "container is not running".to_string(),
                });
            }
        }

        let argv0 = command.first().map(String::as_str).unwrap_or("");
        match argv0 {
            "echo" => Ok(ExecOutput {
                exit_code: 0,
                stdout: format!("{}\n", command[1..].join(" ")),
                stderr: String::new(),
            }),
            "true" => Ok(ExecOutput { exit_code: 0, stdout: String::new(), stderr: String::new() }),
            "false" => Ok(ExecOutput { exit_code: 1, stdout: String::new(), stderr: String::new() }),
            "exit" => {
                let code = command.get(1).and_then(|c| c.parse().ok()).unwrap_or(1);
                Ok(ExecOutput {
                    exit_code: code,
                    stdout: String::new(),
                    stderr: format!("exited with {code}\n"),
                })
            }
            "sleep" => {
                let secs: f64 = command.get(1).and_then(|s| s.parse().ok()).unwrap_or(0.0);
                tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                Ok(ExecOutput { exit_code: 0, stdout: String::new(), stderr: String::new() })
            }
            "mkfile" => {
                let path = command.get(1).cloned().unwrap_or_default();
                let contents = command.get(2).cloned().unwrap_or_default();
                let mut state = self.state.lock();
                if let Some(container) = state.containers.get_mut(container_id) {
                    container.files.insert(path, contents.into_bytes());
                }
                Ok(ExecOutput { exit_code: 0, stdout: String::new(), stderr: String::new() })
            }
            "sh" => Ok(ExecOutput { exit_code: 0, stdout: String::new(), stderr: String::new() }),
            other => Ok(ExecOutput {
                exit_code: 127,
                stdout: String::new(),
                stderr: format!("{other}: command not found\n"),
            }),
        }
    }

    async fn stop(&self, container_id: &str, _grace: Duration) -> Result<(), OrcaError> {
        let mut state = self.state.lock();
        if let Some(container) = state.containers.get_mut(container_id) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), OrcaError> {
        let mut state = self.state.lock();
        state.containers.remove(container_id);
        state.removed.push(container_id.to_string());
        Ok(())
    }

    async fn copy_from(
        &self,
        container_id: &str,
        container_path: &str,
        host_path: &Path,
    ) -> Result<(), OrcaError> {
        let bytes = {
            let state = self.state.lock();
            let container = state
                .containers
                .get(container_id)
                .ok_or_else(|| OrcaError::Backend(format!("no such container: {container_id}")))?;
            container
                .files
                .get(container_path)
                .cloned()
                .ok_or_else(|| OrcaError::Backend(format!("no such path: {container_path}")))?
        };
        std::fs::write(host_path, bytes)?;
        Ok(())
    }

    async fn stats(&self, _container_id: &str) -> Result<ResourceSnapshot, OrcaError> {
        Ok(ResourceSnapshot {
            cpu_percent: Some(12.5),
            memory_mb: Some(64.0),
            net_rx_bytes: 1024,
            net_tx_bytes: 512,
            disk_read_bytes: 0,
            disk_write_bytes: 0,
        })
    }

    async fn create_network(&self, name: &str) -> Result<String, OrcaError> {
        self.state.lock().networks.insert(name.to_string());
        Ok(name.to_string())
    }

    async fn remove_network(&self, name: &str) -> Result<(), OrcaError> {
        self.state.lock().networks.remove(name);
        Ok(())
    }

    async fn connect_network(&self, container_id: &str, network: &str) -> Result<(), OrcaError> {
        let state = self.state.lock();
        if !state.containers.contains_key(container_id) || !state.networks.contains(network) {
            return Err(OrcaError::Backend(format!(
                "cannot connect '{container_id}' to '{network}'"
            )));
        }
        Ok(())
    }

    async fn list_matching(
        &self,
        container_id: &str,
        pattern: &str,
    ) -> Result<Vec<String>, OrcaError> {
        let matcher = glob::Pattern::new(pattern)
            .map_err(|e| OrcaError::Backend(format!("bad glob '{pattern}': {e}")))?;
        let state = self.state.lock();
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| OrcaError::Backend(format!("no such container: {container_id}")))?;
        let mut matches: Vec<String> = container
            .files
            .keys()
            .filter(|path| matcher.matches(path))
            .cloned()
            .collect();
        matches.sort();
        Ok(matches)
    }

    async fn image_digest(&self, image: &str) -> Result<Option<String>, OrcaError> {
        Ok(Some(format!("{image}@sha256:{}", "0".repeat(64))))
    }

    async fn probe(&self) -> Result<(), OrcaError> {
        Ok(())
    }
}

/// A fully wired kernel over the mock backend and a temp base directory.
pub struct TestPlatform {
    pub _dir: TempDir,
    pub backend: Arc<MockBackend>,
    pub store: RunStore,
    pub quota: Arc<QuotaTracker>,
    pub audit: Arc<AuditLogger>,
    pub workspaces: Arc<WorkspaceStore>,
    pub baselines: Arc<BaselineTracker>,
    pub manager: Arc<JobManager>,
    pub workflows: Arc<WorkflowManager>,
}

pub fn platform() -> TestPlatform {
    platform_in(TempDir::new().expect("temp dir"), SecurityPolicy::default())
}

pub fn platform_in(dir: TempDir, security: SecurityPolicy) -> TestPlatform {
    let mut config = OrcaConfig::with_base_dir(dir.path());
    config.security = security;

    let backend = Arc::new(MockBackend::new());
    let store = RunStore::new(dir.path()).expect("run store");
    let policy = Arc::new(PolicyEngine::new(config.security.clone()));
    let quota = Arc::new(QuotaTracker::new());
    let audit = Arc::new(AuditLogger::new(dir.path()).expect("audit logger"));
    let workspaces = Arc::new(WorkspaceStore::new(dir.path()).expect("workspace store"));
    let baselines = Arc::new(BaselineTracker::new(dir.path()).expect("baseline tracker"));

    let runner = Arc::new(JobRunner::new(
        &config,
        backend.clone(),
        store.clone(),
        policy.clone(),
        quota.clone(),
        baselines.clone(),
    ));
    let manager = Arc::new(
        JobManager::new(
            &config,
            store.clone(),
            policy,
            quota.clone(),
            audit.clone(),
            workspaces.clone(),
            runner,
        )
        .expect("job manager"),
    );
    let services = Arc::new(ServiceManager::new(backend.clone()));
    let workflow_runner = Arc::new(WorkflowRunner::new(
        &config,
        manager.clone(),
        services,
        store.clone(),
    ));
    let workflows = Arc::new(WorkflowManager::new(workflow_runner, store.clone(), audit.clone()));

    TestPlatform {
        _dir: dir,
        backend,
        store,
        quota,
        audit,
        workspaces,
        baselines,
        manager,
        workflows,
    }
}

pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

pub fn commands(list: &[&[&str]]) -> Vec<Vec<String>> {
    list.iter().map(|c| argv(c)).collect()
}
