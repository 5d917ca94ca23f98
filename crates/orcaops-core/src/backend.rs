//! Container backend interface and the Docker CLI adapter.
//!
//! The kernel consumes containers through the narrow [`ContainerBackend`]
//! trait; [`DockerBackend`] drives a local `docker` CLI via
//! `tokio::process::Command`. Sandboxes are created with a keepalive entry
//! process and each job command runs as an exec inside the container.

use crate::{OrcaConfig, OrcaError, RetryConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

/// Result of one command executed inside a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// Point-in-time resource usage reported by the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: Option<f64>,
    pub memory_mb: Option<f64>,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
}

/// Options for creating a sandbox or service container.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub network: Option<String>,
    pub security_opts: Vec<String>,
    pub cpu_limit: Option<f64>,
    pub memory_limit_mb: Option<u64>,
    pub labels: HashMap<String, String>,
    /// Entry command. Empty means the image's default entrypoint.
    pub command: Vec<String>,
}

/// Narrow interface over the container runtime.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    async fn pull(&self, image: &str) -> Result<(), OrcaError>;
    async fn create(&self, opts: &CreateOptions) -> Result<String, OrcaError>;
    async fn start(&self, container_id: &str) -> Result<(), OrcaError>;
    async fn exec(&self, container_id: &str, command: &[String]) -> Result<ExecOutput, OrcaError>;
    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), OrcaError>;
    async fn remove(&self, container_id: &str) -> Result<(), OrcaError>;
    async fn copy_from(
        &self,
        container_id: &str,
        container_path: &str,
        host_path: &Path,
    ) -> Result<(), OrcaError>;
    async fn stats(&self, container_id: &str) -> Result<ResourceSnapshot, OrcaError>;
    async fn create_network(&self, name: &str) -> Result<String, OrcaError>;
    async fn remove_network(&self, name: &str) -> Result<(), OrcaError>;
    async fn connect_network(&self, container_id: &str, network: &str) -> Result<(), OrcaError>;
    /// Paths inside the container matching a filename-style glob.
    async fn list_matching(&self, container_id: &str, pattern: &str) -> Result<Vec<String>, OrcaError>;
    async fn image_digest(&self, image: &str) -> Result<Option<String>, OrcaError>;
    /// Startup reachability check, skippable via `ORCAOPS_SKIP_BACKEND_INIT`.
    async fn probe(&self) -> Result<(), OrcaError>;
}

/// Drives the `docker` CLI. Transient failures on pull/create/network
/// operations are retried with exponential backoff.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    retry: RetryConfig,
}

impl DockerBackend {
    pub fn new(config: &OrcaConfig) -> Self {
        Self { retry: config.retry.clone() }
    }

    async fn docker(&self, args: &[&str]) -> Result<std::process::Output, OrcaError> {
        Command::new("docker")
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| OrcaError::Backend(format!("failed to invoke docker: {e}")))
    }

    async fn docker_checked(&self, args: &[&str]) -> Result<String, OrcaError> {
        let output = self.docker(args).await?;
        if !output.status.success() {
            return Err(OrcaError::Backend(format!(
                "docker {} failed: {}",
                args.first().copied().unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, op: F) -> Result<T, OrcaError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, OrcaError>>,
    {
        let mut delay = Duration::from_millis(self.retry.initial_delay_ms);
        let mut last_err = None;
        for attempt in 1..=self.retry.max_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if is_fatal(&e) || attempt == self.retry.max_attempts {
                        return Err(e);
                    }
                    tracing::warn!(
                        operation = what,
                        attempt = attempt,
                        error = %e,
                        "transient backend failure, retrying"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(delay).await;
                    let next_ms = (delay.as_millis() as f64 * self.retry.backoff_multiplier) as u64;
                    delay = Duration::from_millis(next_ms.min(self.retry.max_delay_ms));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| OrcaError::Backend(format!("{what} failed"))))
    }
}

/// Errors that retrying cannot fix: unknown images, bad references,
/// malformed requests.
fn is_fatal(error: &OrcaError) -> bool {
    let text = error.to_string().to_lowercase();
    ["not found", "no such image", "manifest unknown", "invalid reference", "unauthorized"]
        .iter()
        .any(|needle| text.contains(needle))
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    async fn pull(&self, image: &str) -> Result<(), OrcaError> {
        self.with_retry("pull", || async {
            self.docker_checked(&["pull", image]).await.map(|_| ())
        })
        .await
    }

    async fn create(&self, opts: &CreateOptions) -> Result<String, OrcaError> {
        let args = create_args(opts);
        self.with_retry("create", || {
            let args = args.clone();
            async move {
                let refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
                self.docker_checked(&refs).await
            }
        })
        .await
    }

    async fn start(&self, container_id: &str) -> Result<(), OrcaError> {
        self.docker_checked(&["start", container_id]).await.map(|_| ())
    }

    async fn exec(&self, container_id: &str, command: &[String]) -> Result<ExecOutput, OrcaError> {
        let args = exec_args(container_id, command);
        let refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let output = self.docker(&refs).await?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1) as i64,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), OrcaError> {
        let args = stop_args(container_id, grace);
        let refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.docker_checked(&refs).await.map(|_| ())
    }

    async fn remove(&self, container_id: &str) -> Result<(), OrcaError> {
        self.docker_checked(&["rm", "-f", container_id]).await.map(|_| ())
    }

    async fn copy_from(
        &self,
        container_id: &str,
        container_path: &str,
        host_path: &Path,
    ) -> Result<(), OrcaError> {
        let args = copy_from_args(container_id, container_path, host_path);
        let refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.docker_checked(&refs).await.map(|_| ())
    }

    async fn stats(&self, container_id: &str) -> Result<ResourceSnapshot, OrcaError> {
        let json = self
            .docker_checked(&["stats", "--no-stream", "--format", "{{json .}}", container_id])
            .await?;
        let raw: serde_json::Value = serde_json::from_str(&json)
            .map_err(|e| OrcaError::Backend(format!("unparseable docker stats: {e}")))?;

        let mem_usage = raw.get("MemUsage").and_then(|v| v.as_str()).unwrap_or("");
        let memory_mb = mem_usage
            .split('/')
            .next()
            .and_then(|s| parse_size_bytes(s.trim()))
            .map(|b| b as f64 / (1024.0 * 1024.0));
        let cpu_percent = raw
            .get("CPUPerc")
            .and_then(|v| v.as_str())
            .and_then(|s| s.trim().trim_end_matches('%').parse::<f64>().ok());
        let (net_rx_bytes, net_tx_bytes) = raw
            .get("NetIO")
            .and_then(|v| v.as_str())
            .map(parse_io_pair)
            .unwrap_or((0, 0));
        let (disk_read_bytes, disk_write_bytes) = raw
            .get("BlockIO")
            .and_then(|v| v.as_str())
            .map(parse_io_pair)
            .unwrap_or((0, 0));

        Ok(ResourceSnapshot {
            cpu_percent,
            memory_mb,
            net_rx_bytes,
            net_tx_bytes,
            disk_read_bytes,
            disk_write_bytes,
        })
    }

    async fn create_network(&self, name: &str) -> Result<String, OrcaError> {
        self.with_retry("create_network", || async {
            self.docker_checked(&["network", "create", name]).await
        })
        .await
    }

    async fn remove_network(&self, name: &str) -> Result<(), OrcaError> {
        self.docker_checked(&["network", "rm", name]).await.map(|_| ())
    }

    async fn connect_network(&self, container_id: &str, network: &str) -> Result<(), OrcaError> {
        self.docker_checked(&["network", "connect", network, container_id])
            .await
            .map(|_| ())
    }

    async fn list_matching(&self, container_id: &str, pattern: &str) -> Result<Vec<String>, OrcaError> {
        // The pattern is shell-quoted so hostile globs cannot inject into
        // the in-container shell; expansion happens via the shell's own
        // globbing against the quoted-then-unquoted pattern.
        let script = format!("ls -1d -- {} 2>/dev/null", shell_quote_glob(pattern));
        let output = self
            .exec(container_id, &["sh".to_string(), "-c".to_string(), script])
            .await?;
        if output.exit_code != 0 {
            return Ok(Vec::new());
        }
        Ok(output
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn image_digest(&self, image: &str) -> Result<Option<String>, OrcaError> {
        match self
            .docker_checked(&["image", "inspect", "--format", "{{index .RepoDigests 0}}", image])
            .await
        {
            Ok(digest) if !digest.is_empty() => Ok(Some(digest)),
            Ok(_) => Ok(None),
            Err(e) => {
                tracing::debug!(image = image, error = %e, "image digest unavailable");
                Ok(None)
            }
        }
    }

    async fn probe(&self) -> Result<(), OrcaError> {
        if OrcaConfig::skip_backend_init() {
            tracing::info!("backend probe skipped via {}", crate::SKIP_BACKEND_INIT_ENV);
            return Ok(());
        }
        self.docker_checked(&["version", "--format", "{{.Server.Version}}"])
            .await
            .map(|_| ())
    }
}

/// `docker create` argv for one container. Env and labels are emitted in
/// key-sorted order so invocations are reproducible.
fn create_args(opts: &CreateOptions) -> Vec<String> {
    let mut args: Vec<String> =
        vec!["create".to_string(), "--name".to_string(), opts.name.clone()];
    for opt in &opts.security_opts {
        args.push(opt.clone());
    }
    if let Some(cpus) = opts.cpu_limit {
        args.push("--cpus".to_string());
        args.push(format!("{cpus}"));
    }
    if let Some(mem) = opts.memory_limit_mb {
        args.push("--memory".to_string());
        args.push(format!("{mem}m"));
    }
    if let Some(network) = &opts.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    let mut env: Vec<(&String, &String)> = opts.env.iter().collect();
    env.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    let mut labels: Vec<(&String, &String)> = opts.labels.iter().collect();
    labels.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(opts.image.clone());
    args.extend(opts.command.iter().cloned());
    args
}

fn exec_args(container_id: &str, command: &[String]) -> Vec<String> {
    let mut args = vec!["exec".to_string(), container_id.to_string()];
    args.extend(command.iter().cloned());
    args
}

fn stop_args(container_id: &str, grace: Duration) -> Vec<String> {
    vec![
        "stop".to_string(),
        "-t".to_string(),
        grace.as_secs().max(1).to_string(),
        container_id.to_string(),
    ]
}

fn copy_from_args(container_id: &str, container_path: &str, host_path: &Path) -> Vec<String> {
    vec![
        "cp".to_string(),
        format!("{container_id}:{container_path}"),
        host_path.to_string_lossy().to_string(),
    ]
}

/// Single-quotes a glob for `sh -c`, keeping wildcard characters literal to
/// the shell parser while still letting `ls` see them unescaped.
fn shell_quote_glob(pattern: &str) -> String {
    // Globbing must still happen, so wildcards stay outside the quotes;
    // runs of ordinary characters are single-quoted.
    let mut quoted = String::new();
    let mut run = String::new();
    let flush = |run: &mut String, out: &mut String| {
        if !run.is_empty() {
            out.push('\'');
            out.push_str(run);
            out.push('\'');
            run.clear();
        }
    };
    for ch in pattern.chars() {
        match ch {
            '*' | '?' | '[' | ']' => {
                flush(&mut run, &mut quoted);
                quoted.push(ch);
            }
            '\'' => {
                flush(&mut run, &mut quoted);
                quoted.push_str(r"\'");
            }
            _ => run.push(ch),
        }
    }
    flush(&mut run, &mut quoted);
    if quoted.is_empty() {
        "''".to_string()
    } else {
        quoted
    }
}

fn parse_io_pair(text: &str) -> (u64, u64) {
    let mut parts = text.split('/');
    let first = parts.next().and_then(|s| parse_size_bytes(s.trim())).unwrap_or(0);
    let second = parts.next().and_then(|s| parse_size_bytes(s.trim())).unwrap_or(0);
    (first, second)
}

/// Parses docker's humanized sizes ("1.5MiB", "2.3kB", "512B").
fn parse_size_bytes(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (number, unit) = text.split_at(split);
    let value: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim().to_lowercase().as_str() {
        "b" => 1.0,
        "kb" => 1000.0,
        "kib" => 1024.0,
        "mb" => 1000.0 * 1000.0,
        "mib" => 1024.0 * 1024.0,
        "gb" => 1000.0 * 1000.0 * 1000.0,
        "gib" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * multiplier) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_args_cover_hardening_caps_network_env_and_keepalive() {
        let opts = CreateOptions {
            name: "orcaops-job-build-42".to_string(),
            image: "alpine:3.19".to_string(),
            env: HashMap::from([
                ("B_VAR".to_string(), "2".to_string()),
                ("A_VAR".to_string(), "1".to_string()),
            ]),
            network: Some("orcaops-wf-1-build".to_string()),
            security_opts: vec![
                "--cap-drop=ALL".to_string(),
                "--security-opt=no-new-privileges".to_string(),
            ],
            cpu_limit: Some(2.0),
            memory_limit_mb: Some(2048),
            labels: HashMap::from([("orcaops.job_id".to_string(), "build-42".to_string())]),
            command: vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()],
        };
        assert_eq!(
            create_args(&opts),
            vec![
                "create",
                "--name",
                "orcaops-job-build-42",
                "--cap-drop=ALL",
                "--security-opt=no-new-privileges",
                "--cpus",
                "2",
                "--memory",
                "2048m",
                "--network",
                "orcaops-wf-1-build",
                "-e",
                "A_VAR=1",
                "-e",
                "B_VAR=2",
                "--label",
                "orcaops.job_id=build-42",
                "alpine:3.19",
                "tail",
                "-f",
                "/dev/null",
            ]
        );
    }

    #[test]
    fn create_args_bare_service_uses_image_entrypoint() {
        let opts = CreateOptions {
            name: "orcaops-svc-db".to_string(),
            image: "postgres:16".to_string(),
            ..CreateOptions::default()
        };
        assert_eq!(
            create_args(&opts),
            vec!["create", "--name", "orcaops-svc-db", "postgres:16"]
        );
    }

    #[test]
    fn exec_args_append_the_command_verbatim() {
        assert_eq!(
            exec_args("c1", &["echo".to_string(), "hi there".to_string()]),
            vec!["exec", "c1", "echo", "hi there"]
        );
    }

    #[test]
    fn stop_args_clamp_grace_to_a_second() {
        assert_eq!(
            stop_args("c1", Duration::from_secs(5)),
            vec!["stop", "-t", "5", "c1"]
        );
        assert_eq!(
            stop_args("c1", Duration::from_millis(100)),
            vec!["stop", "-t", "1", "c1"]
        );
    }

    #[test]
    fn copy_from_args_address_the_container_path() {
        assert_eq!(
            copy_from_args("c1", "/out/report.json", Path::new("/tmp/run/report.json")),
            vec!["cp", "c1:/out/report.json", "/tmp/run/report.json"]
        );
    }

    #[test]
    fn glob_quoting_keeps_wildcards_and_neutralizes_shells() {
        assert_eq!(shell_quote_glob("*.log"), "*'.log'");
        assert_eq!(shell_quote_glob("/out/*.tar.gz"), "'/out/'*'.tar.gz'");
        let hostile = shell_quote_glob("$(rm -rf /)/*.txt");
        assert_eq!(hostile, "'$(rm -rf /)/'*'.txt'");
        assert_eq!(shell_quote_glob("a'b*.txt"), r"'a'\''b'*'.txt'");
    }

    #[test]
    fn parses_docker_sizes() {
        assert_eq!(parse_size_bytes("512B"), Some(512));
        assert_eq!(parse_size_bytes("2kB"), Some(2000));
        assert_eq!(parse_size_bytes("1.5MiB"), Some(1_572_864));
        assert_eq!(parse_size_bytes("garbage"), None);
    }

    #[test]
    fn parses_io_pairs() {
        assert_eq!(parse_io_pair("1kB / 2kB"), (1000, 2000));
        assert_eq!(parse_io_pair("-- / --"), (0, 0));
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        assert!(is_fatal(&OrcaError::Backend("No such image: ghost:1".to_string())));
        assert!(is_fatal(&OrcaError::Backend("manifest unknown".to_string())));
        assert!(!is_fatal(&OrcaError::Backend("connection refused".to_string())));
    }
}
