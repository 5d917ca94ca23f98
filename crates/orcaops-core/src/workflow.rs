//! Workflow specifications, DAG compilation and matrix expansion.

use crate::types::{CleanupPolicy, JobStatus};
use crate::OrcaError;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use petgraph::graph::NodeIndex;
use petgraph::Graph;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Gate deciding whether a job runs given its dependencies' outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnComplete {
    #[default]
    Success,
    Failure,
    Always,
}

/// A dependency container started alongside a workflow job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub image: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Command executed inside the service container until it exits zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Matrix expansion: the Cartesian product of `axes`, minus `exclude`
/// combinations, plus `include` combinations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatrixConfig {
    #[serde(default)]
    pub axes: BTreeMap<String, Vec<serde_json::Value>>,
    #[serde(default)]
    pub exclude: Vec<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub include: Vec<BTreeMap<String, serde_json::Value>>,
}

/// One node of a workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub image: String,
    pub commands: Vec<Vec<String>>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub parallel_with: Vec<String>,
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub if_condition: Option<String>,
    #[serde(default, rename = "unless", skip_serializing_if = "Option::is_none")]
    pub unless_condition: Option<String>,
    #[serde(default)]
    pub on_complete: OnComplete,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDefinition>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<MatrixConfig>,
}

fn default_workflow_timeout() -> u64 {
    3600
}

/// A named DAG of jobs, loadable from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub jobs: BTreeMap<String, WorkflowJob>,
    #[serde(rename = "timeout", default = "default_workflow_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub cleanup_policy: CleanupPolicy,
}

impl WorkflowSpec {
    pub fn from_yaml(yaml: &str) -> Result<Self, OrcaError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| OrcaError::Workflow(format!("invalid workflow spec: {e}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Success,
    Failed,
    Partial,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Pending | WorkflowStatus::Running)
    }
}

/// Durable record of one workflow execution, owned by its executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub workflow_id: String,
    pub spec_name: String,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub job_statuses: BTreeMap<String, JobStatus>,
    #[serde(default)]
    pub job_run_ids: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowRecord {
    pub fn new(workflow_id: impl Into<String>, spec_name: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            spec_name: spec_name.into(),
            status: WorkflowStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            job_statuses: BTreeMap::new(),
            job_run_ids: BTreeMap::new(),
            error: None,
        }
    }
}

/// A validated workflow: matrices expanded, references checked, cycles
/// rejected, and jobs grouped into dependency levels.
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub jobs: BTreeMap<String, WorkflowJob>,
    /// Level k+1 jobs only run after every level k job is terminal.
    pub levels: Vec<Vec<String>>,
}

/// Expands matrices, validates the DAG and computes execution levels.
/// A cyclic spec is rejected here, before anything executes.
pub fn compile(spec: &WorkflowSpec) -> Result<CompiledWorkflow, OrcaError> {
    if spec.jobs.is_empty() {
        return Err(OrcaError::Workflow(format!("workflow '{}' has no jobs", spec.name)));
    }

    // Matrix expansion first: requires edges naming an expanded job fan out
    // to every variant.
    let mut variants_of: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut jobs: BTreeMap<String, WorkflowJob> = BTreeMap::new();
    for (name, job) in &spec.jobs {
        let expanded = expand_matrix(name, job)?;
        variants_of.insert(name.clone(), expanded.iter().map(|(n, _)| n.clone()).collect());
        for (variant_name, variant) in expanded {
            jobs.insert(variant_name, variant);
        }
    }

    let resolve = |reference: &str| -> Result<Vec<String>, OrcaError> {
        variants_of
            .get(reference)
            .cloned()
            .ok_or_else(|| OrcaError::Workflow(format!("unknown job reference '{reference}'")))
    };

    for (name, job) in &mut jobs {
        let mut resolved = Vec::new();
        for reference in &job.requires {
            let targets = resolve(reference).map_err(|_| {
                OrcaError::Workflow(format!("job '{name}' requires unknown job '{reference}'"))
            })?;
            resolved.extend(targets);
        }
        resolved.dedup();
        job.requires = resolved;
        // parallel_with is validated but adds no edges: jobs without
        // dependency ordering already share a level.
        for reference in &job.parallel_with {
            resolve(reference).map_err(|_| {
                OrcaError::Workflow(format!("job '{name}' is parallel_with unknown job '{reference}'"))
            })?;
        }
    }

    let mut graph: Graph<String, ()> = Graph::new();
    let mut indices: HashMap<String, NodeIndex> = HashMap::new();
    for name in jobs.keys() {
        let index = graph.add_node(name.clone());
        indices.insert(name.clone(), index);
    }
    for (name, job) in &jobs {
        for dep in &job.requires {
            graph.add_edge(indices[dep], indices[name], ());
        }
    }
    if petgraph::algo::is_cyclic_directed(&graph) {
        return Err(OrcaError::Workflow(format!(
            "workflow '{}' contains a dependency cycle",
            spec.name
        )));
    }

    let levels = compute_levels(&jobs);
    Ok(CompiledWorkflow { jobs, levels })
}

/// Level-grouped topological order via in-degree peeling.
fn compute_levels(jobs: &BTreeMap<String, WorkflowJob>) -> Vec<Vec<String>> {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for name in jobs.keys() {
        in_degree.insert(name, 0);
        adjacency.insert(name, Vec::new());
    }
    for (name, job) in jobs {
        for dep in &job.requires {
            *in_degree.get_mut(name.as_str()).unwrap() += 1;
            adjacency.get_mut(dep.as_str()).unwrap().push(name);
        }
    }

    let mut levels = Vec::new();
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();

    while !queue.is_empty() {
        let mut level = Vec::new();
        for _ in 0..queue.len() {
            let name = queue.pop_front().unwrap();
            level.push(name.to_string());
            for &next in &adjacency[name] {
                let degree = in_degree.get_mut(next).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }
        level.sort();
        levels.push(level);
    }
    levels
}

static MATRIX_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{\{\s*matrix\.([A-Za-z0-9_]+)\s*\}\}").unwrap());

fn matrix_value_str(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn interpolate(template: &str, combo: &BTreeMap<String, serde_json::Value>) -> String {
    MATRIX_REF
        .replace_all(template, |caps: &regex::Captures<'_>| {
            combo.get(&caps[1]).map(matrix_value_str).unwrap_or_default()
        })
        .into_owned()
}

/// Expands one job's matrix into independent variant jobs. A job without a
/// matrix, or with empty axes and no includes, yields itself unchanged.
fn expand_matrix(name: &str, job: &WorkflowJob) -> Result<Vec<(String, WorkflowJob)>, OrcaError> {
    let Some(matrix) = &job.matrix else {
        return Ok(vec![(name.to_string(), job.clone())]);
    };

    let mut combos: Vec<BTreeMap<String, serde_json::Value>> = vec![BTreeMap::new()];
    for (axis, values) in &matrix.axes {
        if values.is_empty() {
            return Err(OrcaError::Workflow(format!(
                "matrix axis '{axis}' of job '{name}' has no values"
            )));
        }
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for value in values {
                let mut extended = combo.clone();
                extended.insert(axis.clone(), value.clone());
                next.push(extended);
            }
        }
        combos = next;
    }

    combos.retain(|combo| {
        !matrix.exclude.iter().any(|excluded| {
            excluded.iter().all(|(k, v)| combo.get(k) == Some(v))
        })
    });

    for included in &matrix.include {
        if !combos.contains(included) {
            combos.push(included.clone());
        }
    }

    if combos.is_empty() || (combos.len() == 1 && combos[0].is_empty()) {
        // Identity expansion: the matrix constrained everything away or had
        // no axes at all.
        let mut variant = job.clone();
        variant.matrix = None;
        return Ok(vec![(name.to_string(), variant)]);
    }

    let mut variants = Vec::with_capacity(combos.len());
    for combo in combos {
        let suffix: Vec<String> =
            combo.iter().map(|(k, v)| format!("{k}={}", matrix_value_str(v))).collect();
        let variant_name = format!("{name}[{}]", suffix.join(","));

        let mut variant = job.clone();
        variant.matrix = None;
        variant.image = interpolate(&job.image, &combo);
        variant.commands = job
            .commands
            .iter()
            .map(|argv| argv.iter().map(|arg| interpolate(arg, &combo)).collect())
            .collect();
        variant.env = job
            .env
            .iter()
            .map(|(k, v)| (k.clone(), interpolate(v, &combo)))
            .collect();
        // Matrix values are visible to conditions and the job environment.
        for (axis, value) in &combo {
            variant
                .env
                .entry(format!("MATRIX_{}", axis.to_uppercase()))
                .or_insert_with(|| matrix_value_str(value));
        }
        variants.push((variant_name, variant));
    }
    Ok(variants)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(image: &str, requires: &[&str]) -> WorkflowJob {
        WorkflowJob {
            image: image.to_string(),
            commands: vec![vec!["true".to_string()]],
            requires: requires.iter().map(|s| s.to_string()).collect(),
            parallel_with: Vec::new(),
            if_condition: None,
            unless_condition: None,
            on_complete: OnComplete::default(),
            services: BTreeMap::new(),
            artifacts: Vec::new(),
            timeout_seconds: None,
            env: HashMap::new(),
            matrix: None,
        }
    }

    fn spec(jobs: Vec<(&str, WorkflowJob)>) -> WorkflowSpec {
        WorkflowSpec {
            name: "test".to_string(),
            description: None,
            env: HashMap::new(),
            jobs: jobs.into_iter().map(|(n, j)| (n.to_string(), j)).collect(),
            timeout_seconds: 600,
            cleanup_policy: CleanupPolicy::default(),
        }
    }

    #[test]
    fn diamond_levels() {
        let compiled = compile(&spec(vec![
            ("a", job("alpine:3.19", &[])),
            ("b", job("alpine:3.19", &["a"])),
            ("c", job("alpine:3.19", &["a"])),
            ("d", job("alpine:3.19", &["b", "c"])),
        ]))
        .unwrap();
        assert_eq!(compiled.levels.len(), 3);
        assert_eq!(compiled.levels[0], vec!["a"]);
        assert_eq!(compiled.levels[1], vec!["b", "c"]);
        assert_eq!(compiled.levels[2], vec!["d"]);
    }

    #[test]
    fn cycles_are_rejected_before_execution() {
        let result = compile(&spec(vec![
            ("a", job("alpine:3.19", &["b"])),
            ("b", job("alpine:3.19", &["a"])),
        ]));
        assert!(matches!(result, Err(OrcaError::Workflow(_))));
    }

    #[test]
    fn unknown_requires_is_rejected() {
        let result = compile(&spec(vec![("a", job("alpine:3.19", &["ghost"]))]));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("ghost"));
    }

    #[test]
    fn unknown_parallel_with_is_rejected() {
        let mut j = job("alpine:3.19", &[]);
        j.parallel_with = vec!["ghost".to_string()];
        assert!(compile(&spec(vec![("a", j)])).is_err());
    }

    #[test]
    fn matrix_expands_cartesian_product() {
        let mut j = job("rust:${{ matrix.ver }}", &[]);
        j.commands = vec![vec!["test".to_string(), "--target".to_string(), "${{ matrix.os }}".to_string()]];
        j.matrix = Some(MatrixConfig {
            axes: BTreeMap::from([
                ("os".to_string(), vec!["linux".into(), "macos".into()]),
                ("ver".to_string(), vec!["1.70".into(), "1.75".into()]),
            ]),
            exclude: vec![],
            include: vec![],
        });
        let compiled = compile(&spec(vec![("build", j)])).unwrap();
        assert_eq!(compiled.jobs.len(), 4);
        let variant = compiled.jobs.get("build[os=linux,ver=1.70]").unwrap();
        assert_eq!(variant.image, "rust:1.70");
        assert_eq!(variant.commands[0][2], "linux");
        assert_eq!(variant.env.get("MATRIX_OS").map(String::as_str), Some("linux"));
    }

    #[test]
    fn matrix_exclude_and_include() {
        let mut j = job("img:${{ matrix.os }}", &[]);
        j.matrix = Some(MatrixConfig {
            axes: BTreeMap::from([(
                "os".to_string(),
                vec!["linux".into(), "macos".into()],
            )]),
            exclude: vec![BTreeMap::from([("os".to_string(), "macos".into())])],
            include: vec![BTreeMap::from([("os".to_string(), "windows".into())])],
        });
        let compiled = compile(&spec(vec![("build", j)])).unwrap();
        let names: Vec<&String> = compiled.jobs.keys().collect();
        assert_eq!(names, vec!["build[os=linux]", "build[os=windows]"]);
    }

    #[test]
    fn empty_matrix_is_identity() {
        let mut j = job("alpine:3.19", &[]);
        j.matrix = Some(MatrixConfig::default());
        let compiled = compile(&spec(vec![("build", j)])).unwrap();
        assert_eq!(compiled.jobs.len(), 1);
        assert!(compiled.jobs.contains_key("build"));
    }

    #[test]
    fn requires_on_matrix_job_fans_out_to_variants() {
        let mut build = job("img:${{ matrix.os }}", &[]);
        build.matrix = Some(MatrixConfig {
            axes: BTreeMap::from([(
                "os".to_string(),
                vec!["linux".into(), "macos".into()],
            )]),
            exclude: vec![],
            include: vec![],
        });
        let compiled = compile(&spec(vec![
            ("build", build),
            ("publish", job("alpine:3.19", &["build"])),
        ]))
        .unwrap();
        let publish = compiled.jobs.get("publish").unwrap();
        assert_eq!(publish.requires.len(), 2);
        assert!(publish.requires.contains(&"build[os=linux]".to_string()));
        assert_eq!(compiled.levels[1], vec!["publish"]);
    }

    #[test]
    fn yaml_round_trip() {
        let yaml = r#"
name: ci
description: build and test
env:
  CI: "1"
timeout: 900
cleanup_policy: always_remove
jobs:
  build:
    image: rust:1.75
    commands:
      - ["cargo", "build"]
    artifacts:
      - "/out/*.tar.gz"
  test:
    image: rust:1.75
    commands:
      - ["cargo", "test"]
    requires: [build]
    if: "${{ env.CI == '1' }}"
    services:
      db:
        image: postgres:16
        port: 5432
        env:
          POSTGRES_PASSWORD: test
"#;
        let spec = WorkflowSpec::from_yaml(yaml).unwrap();
        assert_eq!(spec.name, "ci");
        assert_eq!(spec.timeout_seconds, 900);
        assert_eq!(spec.cleanup_policy, CleanupPolicy::AlwaysRemove);
        let test = spec.jobs.get("test").unwrap();
        assert_eq!(test.requires, vec!["build"]);
        assert!(test.if_condition.is_some());
        assert_eq!(test.services.get("db").unwrap().port, Some(5432));
        let compiled = compile(&spec).unwrap();
        assert_eq!(compiled.levels, vec![vec!["build".to_string()], vec!["test".to_string()]]);
    }
}
