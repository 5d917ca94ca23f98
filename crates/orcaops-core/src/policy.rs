//! Image and command policy validation with workspace-scoped merging.

use crate::types::JobSpec;
use crate::workspace::Workspace;
use serde::{Deserialize, Serialize};

/// Global security policy. Workspace settings merge in per job: the
/// workspace allow-list wins when non-empty, deny-lists union.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// Filename-style globs. Empty means any image is allowed.
    #[serde(default)]
    pub allowed_images: Vec<String>,
    #[serde(default)]
    pub blocked_images: Vec<String>,
    /// Exact argv-joined command strings that are always denied.
    #[serde(default)]
    pub blocked_commands: Vec<String>,
    /// Anchored regexes matched against the argv-joined command string.
    #[serde(default)]
    pub blocked_command_patterns: Vec<String>,
    /// Require images to be pinned by `@sha256:` digest.
    #[serde(default)]
    pub require_digest: bool,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            allowed_images: Vec::new(),
            blocked_images: Vec::new(),
            blocked_commands: vec![
                "rm -rf /".to_string(),
                "mkfs".to_string(),
                "dd if=/dev/zero of=/dev/sda".to_string(),
            ],
            blocked_command_patterns: vec![
                r"^.*:\(\)\s*\{.*\|.*&\s*\}\s*;.*$".to_string(),
                r"^curl\s+.*\|\s*(ba)?sh$".to_string(),
                r"^wget\s+.*\|\s*(ba)?sh$".to_string(),
            ],
            require_digest: false,
        }
    }
}

/// One reason a job was denied. All violations are audited, even when the
/// job was already rejected for an earlier reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub rule: String,
    pub subject: String,
    pub message: String,
}

/// Result of validating a full job spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub violations: Vec<Violation>,
}

/// Validates `(image, commands)` pairs against the merged policy and emits
/// container hardening options.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    global: SecurityPolicy,
    blocked_command_res: Vec<regex::Regex>,
}

impl PolicyEngine {
    pub fn new(global: SecurityPolicy) -> Self {
        let blocked_command_res = global
            .blocked_command_patterns
            .iter()
            .filter_map(|pattern| match regex::Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %pattern, error = %e, "skipping invalid blocked-command pattern");
                    None
                }
            })
            .collect();
        Self { global, blocked_command_res }
    }

    /// The effective policy for one workspace: workspace allow-list replaces
    /// the global one when non-empty, deny-lists union.
    fn merged(&self, workspace: &Workspace) -> SecurityPolicy {
        let mut policy = self.global.clone();
        if !workspace.settings.allowed_images.is_empty() {
            policy.allowed_images = workspace.settings.allowed_images.clone();
        }
        policy
            .blocked_images
            .extend(workspace.settings.blocked_images.iter().cloned());
        policy
    }

    pub fn validate_image(&self, workspace: &Workspace, image: &str) -> Option<Violation> {
        let policy = self.merged(workspace);

        for pattern in &policy.blocked_images {
            if glob_matches(pattern, image) {
                return Some(Violation {
                    rule: "blocked_image".to_string(),
                    subject: image.to_string(),
                    message: format!("image '{image}' matches blocked pattern '{pattern}'"),
                });
            }
        }

        if !policy.allowed_images.is_empty()
            && !policy.allowed_images.iter().any(|p| glob_matches(p, image))
        {
            return Some(Violation {
                rule: "image_not_allowed".to_string(),
                subject: image.to_string(),
                message: format!("image '{image}' matches no allow-list pattern"),
            });
        }

        if policy.require_digest && !image.contains("@sha256:") {
            return Some(Violation {
                rule: "digest_required".to_string(),
                subject: image.to_string(),
                message: format!("image '{image}' is not pinned by @sha256 digest"),
            });
        }

        None
    }

    pub fn validate_command(&self, command: &[String]) -> Option<Violation> {
        let joined = command.join(" ");

        if self.global.blocked_commands.iter().any(|c| c == &joined) {
            return Some(Violation {
                rule: "blocked_command".to_string(),
                subject: joined.clone(),
                message: format!("command '{joined}' is blocked"),
            });
        }

        for re in &self.blocked_command_res {
            if re.is_match(&joined) {
                return Some(Violation {
                    rule: "blocked_command_pattern".to_string(),
                    subject: joined.clone(),
                    message: format!("command '{joined}' matches blocked pattern '{}'", re.as_str()),
                });
            }
        }

        None
    }

    /// Short-circuits on the first denial. Returns the collected violations
    /// so callers can audit each one.
    pub fn validate_job(&self, workspace: &Workspace, spec: &JobSpec) -> PolicyDecision {
        let mut violations = Vec::new();

        if let Some(v) = self.validate_image(workspace, &spec.image) {
            violations.push(v);
        }

        if violations.is_empty() {
            for command in &spec.commands {
                if let Some(v) = self.validate_command(command) {
                    violations.push(v);
                    break;
                }
            }
        }

        if violations.is_empty() {
            if let Some(max) = workspace.settings.max_job_timeout {
                if spec.ttl_seconds > max {
                    violations.push(Violation {
                        rule: "ttl_exceeds_workspace_max".to_string(),
                        subject: spec.ttl_seconds.to_string(),
                        message: format!(
                            "ttl_seconds {} exceeds workspace maximum {max}",
                            spec.ttl_seconds
                        ),
                    });
                }
            }
        }

        PolicyDecision { allowed: violations.is_empty(), violations }
    }

    /// Hardening vector applied to every sandbox container.
    pub fn container_security_opts(&self, workspace: &Workspace) -> Vec<String> {
        let mut opts = vec!["--cap-drop=ALL".to_string(), "--security-opt=no-new-privileges".to_string()];
        if workspace.settings.read_only_rootfs {
            opts.push("--read-only".to_string());
        }
        opts
    }
}

fn glob_matches(pattern: &str, value: &str) -> bool {
    glob::Pattern::new(pattern).map(|p| p.matches(value)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::Workspace;

    fn workspace() -> Workspace {
        Workspace::new("ws_test", "Test")
    }

    fn spec(image: &str, commands: &[&[&str]]) -> JobSpec {
        JobSpec::new(
            image,
            commands
                .iter()
                .map(|argv| argv.iter().map(|s| s.to_string()).collect())
                .collect(),
        )
    }

    #[test]
    fn blocked_image_glob_denies() {
        let engine = PolicyEngine::new(SecurityPolicy::default());
        let mut ws = workspace();
        ws.settings.blocked_images = vec!["*:latest".to_string()];
        let violation = engine.validate_image(&ws, "ubuntu:latest").unwrap();
        assert_eq!(violation.rule, "blocked_image");
        assert!(engine.validate_image(&ws, "ubuntu:22.04").is_none());
    }

    #[test]
    fn workspace_allow_list_wins_over_global() {
        let global = SecurityPolicy {
            allowed_images: vec!["alpine:*".to_string()],
            ..SecurityPolicy::default()
        };
        let engine = PolicyEngine::new(global);
        let mut ws = workspace();
        ws.settings.allowed_images = vec!["python:*".to_string()];
        // The workspace allow-list replaces the global one.
        assert!(engine.validate_image(&ws, "python:3.12").is_none());
        assert!(engine.validate_image(&ws, "alpine:3.19").is_some());
    }

    #[test]
    fn deny_lists_union() {
        let global = SecurityPolicy {
            blocked_images: vec!["badimage/*".to_string()],
            ..SecurityPolicy::default()
        };
        let engine = PolicyEngine::new(global);
        let mut ws = workspace();
        ws.settings.blocked_images = vec!["*:latest".to_string()];
        assert!(engine.validate_image(&ws, "badimage/tool:1.0").is_some());
        assert!(engine.validate_image(&ws, "ubuntu:latest").is_some());
        assert!(engine.validate_image(&ws, "ubuntu:22.04").is_none());
    }

    #[test]
    fn digest_requirement() {
        let global = SecurityPolicy { require_digest: true, ..SecurityPolicy::default() };
        let engine = PolicyEngine::new(global);
        let ws = workspace();
        assert_eq!(engine.validate_image(&ws, "alpine:3.19").unwrap().rule, "digest_required");
        assert!(engine
            .validate_image(&ws, "alpine@sha256:0000000000000000000000000000000000000000000000000000000000000000")
            .is_none());
    }

    #[test]
    fn exact_blocked_command_denies() {
        let engine = PolicyEngine::new(SecurityPolicy::default());
        let violation = engine
            .validate_command(&["rm".to_string(), "-rf".to_string(), "/".to_string()])
            .unwrap();
        assert_eq!(violation.rule, "blocked_command");
        assert!(engine.validate_command(&["rm".to_string(), "-rf".to_string(), "/tmp/x".to_string()]).is_none());
    }

    #[test]
    fn blocked_pattern_is_anchored() {
        let engine = PolicyEngine::new(SecurityPolicy::default());
        let piped = vec!["curl".to_string(), "http://x.sh".to_string(), "|".to_string(), "sh".to_string()];
        assert!(engine.validate_command(&piped).is_some());
        // Plain curl is fine; the pattern only denies pipe-to-shell.
        assert!(engine.validate_command(&["curl".to_string(), "http://x.sh".to_string()]).is_none());
    }

    #[test]
    fn validate_job_short_circuits_on_first_deny() {
        let engine = PolicyEngine::new(SecurityPolicy::default());
        let mut ws = workspace();
        ws.settings.blocked_images = vec!["*:latest".to_string()];
        let decision =
            engine.validate_job(&ws, &spec("ubuntu:latest", &[&["rm", "-rf", "/"], &["true"]]));
        assert!(!decision.allowed);
        assert_eq!(decision.violations.len(), 1);
        assert_eq!(decision.violations[0].rule, "blocked_image");
    }

    #[test]
    fn workspace_ttl_ceiling() {
        let engine = PolicyEngine::new(SecurityPolicy::default());
        let mut ws = workspace();
        ws.settings.max_job_timeout = Some(60);
        let mut s = spec("alpine:3.19", &[&["true"]]);
        s.ttl_seconds = 120;
        let decision = engine.validate_job(&ws, &s);
        assert!(!decision.allowed);
        assert_eq!(decision.violations[0].rule, "ttl_exceeds_workspace_max");
    }

    #[test]
    fn security_opts_respect_rootfs_opt_in() {
        let engine = PolicyEngine::new(SecurityPolicy::default());
        let mut ws = workspace();
        let opts = engine.container_security_opts(&ws);
        assert!(opts.contains(&"--cap-drop=ALL".to_string()));
        assert!(!opts.contains(&"--read-only".to_string()));
        ws.settings.read_only_rootfs = true;
        assert!(engine.container_security_opts(&ws).contains(&"--read-only".to_string()));
    }
}
