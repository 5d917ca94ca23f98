//! Service container orchestration for workflow jobs.
//!
//! Each workflow job with services gets its own network
//! (`orcaops-wf-<workflow_id>-<job_name>`). Service containers attach to it,
//! are health-gated before the job starts, and are torn down with the
//! network after the job reaches a terminal state.

use crate::backend::{ContainerBackend, CreateOptions};
use crate::workflow::ServiceDefinition;
use crate::OrcaError;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

const HEALTH_WALL_CLOCK: Duration = Duration::from_secs(60);
const HEALTH_INITIAL_DELAY: Duration = Duration::from_millis(250);
const HEALTH_MAX_DELAY: Duration = Duration::from_secs(2);
const SERVICE_STOP_GRACE: Duration = Duration::from_secs(2);

/// Handle to a started service set, consumed by teardown.
#[derive(Debug, Clone)]
pub struct StartedServices {
    pub network: String,
    /// `{ALIAS}_HOST` / `{ALIAS}_PORT` pairs injected into the job env.
    pub env: HashMap<String, String>,
    containers: Vec<String>,
}

/// Starts and tears down per-job service containers.
pub struct ServiceManager {
    backend: Arc<dyn ContainerBackend>,
}

impl ServiceManager {
    pub fn new(backend: Arc<dyn ContainerBackend>) -> Self {
        Self { backend }
    }

    /// Creates the job's network and brings up every service on it,
    /// health-gated. On any failure the already-started pieces are torn
    /// down before the error surfaces.
    pub async fn start(
        &self,
        workflow_id: &str,
        job_name: &str,
        services: &BTreeMap<String, ServiceDefinition>,
    ) -> Result<StartedServices, OrcaError> {
        let network = format!(
            "orcaops-wf-{}-{}",
            sanitize_name(workflow_id),
            sanitize_name(job_name)
        );
        self.backend.create_network(&network).await?;

        let mut started = StartedServices {
            network: network.clone(),
            env: HashMap::new(),
            containers: Vec::new(),
        };

        for (alias, definition) in services {
            match self.start_service(&network, workflow_id, job_name, alias, definition).await {
                Ok(container_name) => {
                    let key = env_key(alias);
                    started.env.insert(format!("{key}_HOST"), container_name.clone());
                    if let Some(port) = definition.port {
                        started.env.insert(format!("{key}_PORT"), port.to_string());
                    }
                    started.containers.push(container_name);
                }
                Err(e) => {
                    self.teardown(started).await;
                    return Err(OrcaError::Workflow(format!(
                        "service '{alias}' failed to start: {e}"
                    )));
                }
            }
        }
        Ok(started)
    }

    async fn start_service(
        &self,
        network: &str,
        workflow_id: &str,
        job_name: &str,
        alias: &str,
        definition: &ServiceDefinition,
    ) -> Result<String, OrcaError> {
        let name = format!(
            "orcaops-svc-{}-{}-{}",
            sanitize_name(workflow_id),
            sanitize_name(job_name),
            sanitize_name(alias)
        );
        self.backend.pull(&definition.image).await?;
        let opts = CreateOptions {
            name: name.clone(),
            image: definition.image.clone(),
            env: definition.env.clone(),
            network: Some(network.to_string()),
            security_opts: Vec::new(),
            cpu_limit: None,
            memory_limit_mb: None,
            labels: HashMap::from([("orcaops.service".to_string(), alias.to_string())]),
            command: Vec::new(),
        };
        let container = self.backend.create(&opts).await?;
        self.backend.start(&container).await?;
        self.await_healthy(&container, alias, definition).await;
        Ok(name)
    }

    /// Exponential backoff on the health check (or a TCP port probe) up to
    /// a wall-clock bound. An unhealthy service after the bound is logged
    /// and the job proceeds; its own steps will surface the failure.
    async fn await_healthy(&self, container: &str, alias: &str, definition: &ServiceDefinition) {
        let probe: Option<Vec<String>> = if let Some(check) = &definition.health_check {
            Some(check.clone())
        } else {
            definition.port.map(|port| {
                vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!(
                        "(command -v nc >/dev/null 2>&1 && nc -z 127.0.0.1 {port}) || (exec 3<>/dev/tcp/127.0.0.1/{port})"
                    ),
                ]
            })
        };
        let Some(probe) = probe else {
            return;
        };

        let deadline = tokio::time::Instant::now() + HEALTH_WALL_CLOCK;
        let mut delay = HEALTH_INITIAL_DELAY;
        loop {
            match self.backend.exec(container, &probe).await {
                Ok(output) if output.exit_code == 0 => {
                    tracing::debug!(service = alias, "service healthy");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(service = alias, error = %e, "health probe errored");
                }
            }
            if tokio::time::Instant::now() + delay >= deadline {
                tracing::warn!(service = alias, "service not healthy within bound, proceeding");
                return;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(HEALTH_MAX_DELAY);
        }
    }

    /// Stops and removes every service container, then the network. Errors
    /// are logged and never alter the owning job's status.
    pub async fn teardown(&self, services: StartedServices) {
        for container in &services.containers {
            if let Err(e) = self.backend.stop(container, SERVICE_STOP_GRACE).await {
                tracing::warn!(container = %container, error = %e, "service stop failed");
            }
            if let Err(e) = self.backend.remove(container).await {
                tracing::warn!(container = %container, error = %e, "service removal failed");
            }
        }
        if let Err(e) = self.backend.remove_network(&services.network).await {
            tracing::warn!(network = %services.network, error = %e, "network removal failed");
        }
    }
}

/// Container and network names tolerate only a conservative character set;
/// matrix variant names carry brackets that must not leak into them.
fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' { c } else { '-' })
        .collect()
}

/// `ALIAS` → `ALIAS_HOST`-style env prefix.
fn env_key(alias: &str) -> String {
    alias
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}
