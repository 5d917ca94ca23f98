//! Per-fingerprint execution baselines and anomaly detection.
//!
//! Baselines are keyed by the job fingerprint and fold in every completed
//! run: an EMA over duration, percentiles over a bounded ring of recent
//! samples, and memory/success accounting. Updates to the same fingerprint
//! are serialized; the whole store is rewritten atomically after each
//! update. Detected anomalies stream to `<base>/anomalies/YYYY-MM-DD.jsonl`
//! and are attached to the terminating run record by the runner.

use crate::store::atomic_write_json;
use crate::types::{JobStatus, RunRecord};
use crate::OrcaError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

const EMA_ALPHA: f64 = 0.1;
const RING_CAPACITY: usize = 100;
const MIN_SAMPLES: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    Duration,
    Memory,
    Flaky,
    SuccessRateDegradation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalySeverity {
    Warning,
    Critical,
}

/// One detected deviation from a fingerprint's baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub job_id: String,
    pub fingerprint: String,
    pub kind: AnomalyKind,
    pub severity: AnomalySeverity,
    pub observed: f64,
    pub baseline: f64,
    pub message: String,
    pub detected_at: DateTime<Utc>,
}

/// Accumulated execution statistics for one `(image, commands)` fingerprint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Baseline {
    pub samples: u64,
    pub duration_ema: f64,
    pub duration_stddev_estimate: f64,
    pub duration_p50: f64,
    pub duration_p95: f64,
    pub duration_p99: f64,
    pub memory_mean_mb: f64,
    pub memory_max_mb: f64,
    pub success_count: u64,
    pub failure_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    /// Bounded ring of recent durations backing the percentile estimates.
    #[serde(default)]
    recent_durations: VecDeque<f64>,
}

impl Baseline {
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return 1.0;
        }
        self.success_count as f64 / total as f64
    }

    fn observe(&mut self, duration: f64, memory_mb: Option<f64>, success: bool) {
        if self.samples == 0 {
            self.duration_ema = duration;
        } else {
            self.duration_ema = EMA_ALPHA * duration + (1.0 - EMA_ALPHA) * self.duration_ema;
        }

        self.recent_durations.push_back(duration);
        while self.recent_durations.len() > RING_CAPACITY {
            self.recent_durations.pop_front();
        }
        let mut sorted: Vec<f64> = self.recent_durations.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        self.duration_p50 = percentile(&sorted, 0.50);
        self.duration_p95 = percentile(&sorted, 0.95);
        self.duration_p99 = percentile(&sorted, 0.99);
        self.duration_stddev_estimate = stddev(&sorted);

        if let Some(mem) = memory_mb {
            let n = self.samples as f64;
            self.memory_mean_mb = (self.memory_mean_mb * n + mem) / (n + 1.0);
            if mem > self.memory_max_mb {
                self.memory_max_mb = mem;
            }
        }

        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.samples += 1;
        self.last_updated = Some(Utc::now());
    }
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

/// Tracks baselines across fingerprints, persisting to
/// `<base>/baselines.json`.
#[derive(Debug)]
pub struct BaselineTracker {
    base_dir: PathBuf,
    baselines: DashMap<String, Baseline>,
    file_lock: Mutex<()>,
}

impl BaselineTracker {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, OrcaError> {
        let base_dir: PathBuf = base_dir.into();
        fs::create_dir_all(base_dir.join("anomalies"))?;

        let baselines = DashMap::new();
        let path = base_dir.join("baselines.json");
        match fs::read(&path) {
            Ok(bytes) => {
                let loaded: BTreeMap<String, Baseline> = serde_json::from_slice(&bytes)?;
                for (fingerprint, baseline) in loaded {
                    baselines.insert(fingerprint, baseline);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self { base_dir, baselines, file_lock: Mutex::new(()) })
    }

    pub fn get(&self, fingerprint: &str) -> Option<Baseline> {
        self.baselines.get(fingerprint).map(|b| b.clone())
    }

    /// Folds a completed run into its fingerprint's baseline and returns the
    /// anomalies it triggered. Duration and memory deviations are judged
    /// against the baseline as it stood before this run; rate anomalies use
    /// the updated counts.
    pub fn record_run(&self, record: &RunRecord) -> Result<Vec<Anomaly>, OrcaError> {
        let Some(duration) = record.duration_seconds() else {
            return Ok(Vec::new());
        };
        let memory_mb = record.resource_usage.as_ref().and_then(|u| u.memory_peak_mb);
        let success = record.status == JobStatus::Success;

        let mut anomalies = Vec::new();
        {
            // The entry guard serializes concurrent updates to one
            // fingerprint; other fingerprints proceed on other shards.
            let mut entry = self.baselines.entry(record.fingerprint.clone()).or_default();

            if entry.samples >= MIN_SAMPLES {
                if let Some(a) = duration_anomaly(record, &entry, duration) {
                    anomalies.push(a);
                }
                if let Some(mem) = memory_mb {
                    if let Some(a) = memory_anomaly(record, &entry, mem) {
                        anomalies.push(a);
                    }
                }
            }

            entry.observe(duration, memory_mb, success);

            let rate = entry.success_rate();
            let total = entry.success_count + entry.failure_count;
            if total >= 10 && (0.3..=0.9).contains(&rate) {
                anomalies.push(Anomaly {
                    job_id: record.job_id.clone(),
                    fingerprint: record.fingerprint.clone(),
                    kind: AnomalyKind::Flaky,
                    severity: AnomalySeverity::Warning,
                    observed: rate,
                    baseline: 1.0,
                    message: format!("success rate {:.0}% over {total} runs looks flaky", rate * 100.0),
                    detected_at: Utc::now(),
                });
            } else if total >= 5 && rate < 0.8 {
                anomalies.push(Anomaly {
                    job_id: record.job_id.clone(),
                    fingerprint: record.fingerprint.clone(),
                    kind: AnomalyKind::SuccessRateDegradation,
                    severity: AnomalySeverity::Warning,
                    observed: rate,
                    baseline: 0.8,
                    message: format!("success rate degraded to {:.0}%", rate * 100.0),
                    detected_at: Utc::now(),
                });
            }
        }

        self.persist()?;
        for anomaly in &anomalies {
            self.append_anomaly(anomaly)?;
        }
        Ok(anomalies)
    }

    /// Operator hints derived from a fingerprint's history.
    pub fn recommendations(&self, fingerprint: &str, ttl_seconds: Option<u64>) -> Vec<String> {
        let Some(baseline) = self.get(fingerprint) else {
            return Vec::new();
        };
        if baseline.samples < MIN_SAMPLES {
            return Vec::new();
        }

        let mut recs = Vec::new();
        if let Some(ttl) = ttl_seconds {
            let ttl = ttl as f64;
            if baseline.duration_p95 > 0.0 && baseline.duration_p95 * 4.0 < ttl {
                recs.push(format!(
                    "ttl of {ttl:.0}s is generous: p95 duration is {:.1}s, consider lowering it",
                    baseline.duration_p95
                ));
            }
        }
        let total = baseline.success_count + baseline.failure_count;
        if total >= 10 && (0.3..=0.9).contains(&baseline.success_rate()) {
            recs.push(format!(
                "success rate is {:.0}% over {total} runs, investigate flaky steps",
                baseline.success_rate() * 100.0
            ));
        }
        if baseline.memory_max_mb > 0.0 {
            recs.push(format!(
                "observed memory peak is {:.0} MB, a cap near {:.0} MB leaves headroom",
                baseline.memory_max_mb,
                baseline.memory_max_mb * 1.5
            ));
        }
        recs
    }

    fn persist(&self) -> Result<(), OrcaError> {
        let snapshot: BTreeMap<String, Baseline> = self
            .baselines
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let _guard = self.file_lock.lock();
        atomic_write_json(&self.base_dir.join("baselines.json"), &snapshot)
    }

    fn append_anomaly(&self, anomaly: &Anomaly) -> Result<(), OrcaError> {
        let mut line = serde_json::to_string(anomaly)?;
        line.push('\n');
        let path = self
            .base_dir
            .join("anomalies")
            .join(format!("{}.jsonl", chrono::Local::now().format("%Y-%m-%d")));
        let _guard = self.file_lock.lock();
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

fn duration_anomaly(record: &RunRecord, baseline: &Baseline, observed: f64) -> Option<Anomaly> {
    let ema = baseline.duration_ema;
    if ema <= f64::EPSILON {
        return None;
    }

    // Prefer the z-score when the ring shows real variance.
    let severity = if baseline.duration_stddev_estimate >= 0.01 {
        let z = (observed - ema).abs() / baseline.duration_stddev_estimate;
        if z > 3.0 {
            Some(AnomalySeverity::Critical)
        } else if z > 2.0 {
            Some(AnomalySeverity::Warning)
        } else {
            None
        }
    } else if observed > 3.0 * ema {
        Some(AnomalySeverity::Critical)
    } else if observed > 2.0 * ema {
        Some(AnomalySeverity::Warning)
    } else {
        None
    }?;

    Some(Anomaly {
        job_id: record.job_id.clone(),
        fingerprint: record.fingerprint.clone(),
        kind: AnomalyKind::Duration,
        severity,
        observed,
        baseline: ema,
        message: format!("duration {observed:.1}s deviates from baseline {ema:.1}s"),
        detected_at: Utc::now(),
    })
}

fn memory_anomaly(record: &RunRecord, baseline: &Baseline, observed_mb: f64) -> Option<Anomaly> {
    let max = baseline.memory_max_mb;
    if max <= f64::EPSILON {
        return None;
    }
    let severity = if observed_mb > 2.0 * max {
        AnomalySeverity::Critical
    } else if observed_mb > 1.5 * max {
        AnomalySeverity::Warning
    } else {
        return None;
    };
    Some(Anomaly {
        job_id: record.job_id.clone(),
        fingerprint: record.fingerprint.clone(),
        kind: AnomalyKind::Memory,
        severity,
        observed: observed_mb,
        baseline: max,
        message: format!("memory peak {observed_mb:.0} MB exceeds previous max {max:.0} MB"),
        detected_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobSpec, ResourceUsage};
    use tempfile::TempDir;

    fn tracker() -> (TempDir, BaselineTracker) {
        let dir = TempDir::new().unwrap();
        let tracker = BaselineTracker::new(dir.path()).unwrap();
        (dir, tracker)
    }

    fn completed_run(duration_secs: f64, memory_mb: Option<f64>, status: JobStatus) -> RunRecord {
        let spec = JobSpec::new("alpine:3.19", vec![vec!["work".to_string()]]);
        let mut record = RunRecord::new(spec);
        record.started_at = Some(record.created_at);
        record.finished_at =
            Some(record.created_at + chrono::Duration::milliseconds((duration_secs * 1000.0) as i64));
        record.status = status;
        if let Some(mem) = memory_mb {
            record.resource_usage =
                Some(ResourceUsage { memory_peak_mb: Some(mem), ..Default::default() });
        }
        record
    }

    #[test]
    fn first_sample_seeds_ema() {
        let (_dir, tracker) = tracker();
        let record = completed_run(10.0, None, JobStatus::Success);
        tracker.record_run(&record).unwrap();
        let baseline = tracker.get(&record.fingerprint).unwrap();
        assert_eq!(baseline.samples, 1);
        assert!((baseline.duration_ema - 10.0).abs() < 1e-9);
        assert!((baseline.duration_p50 - 10.0).abs() < 1e-9);
    }

    #[test]
    fn ema_blends_with_alpha() {
        let (_dir, tracker) = tracker();
        let first = completed_run(10.0, None, JobStatus::Success);
        tracker.record_run(&first).unwrap();
        let second = completed_run(20.0, None, JobStatus::Success);
        tracker.record_run(&second).unwrap();
        let baseline = tracker.get(&first.fingerprint).unwrap();
        // 0.1 * 20 + 0.9 * 10 = 11
        assert!((baseline.duration_ema - 11.0).abs() < 1e-9);
    }

    #[test]
    fn no_anomalies_before_min_samples() {
        let (_dir, tracker) = tracker();
        for _ in 0..2 {
            let r = completed_run(1.0, None, JobStatus::Success);
            assert!(tracker.record_run(&r).unwrap().is_empty());
        }
        // Third run is wildly slow but only two samples existed before it.
        let slow = completed_run(100.0, None, JobStatus::Success);
        assert!(tracker.record_run(&slow).unwrap().is_empty());
    }

    #[test]
    fn slow_run_flags_duration_anomaly() {
        let (_dir, tracker) = tracker();
        for _ in 0..4 {
            tracker.record_run(&completed_run(1.0, None, JobStatus::Success)).unwrap();
        }
        let slow = completed_run(10.0, None, JobStatus::Success);
        let anomalies = tracker.record_run(&slow).unwrap();
        assert!(anomalies.iter().any(|a| a.kind == AnomalyKind::Duration
            && a.severity == AnomalySeverity::Critical));
    }

    #[test]
    fn memory_spike_flags_anomaly() {
        let (_dir, tracker) = tracker();
        for _ in 0..4 {
            tracker
                .record_run(&completed_run(1.0, Some(100.0), JobStatus::Success))
                .unwrap();
        }
        let spike = completed_run(1.0, Some(170.0), JobStatus::Success);
        let anomalies = tracker.record_run(&spike).unwrap();
        assert!(anomalies
            .iter()
            .any(|a| a.kind == AnomalyKind::Memory && a.severity == AnomalySeverity::Warning));

        let big_spike = completed_run(1.0, Some(400.0), JobStatus::Success);
        let anomalies = tracker.record_run(&big_spike).unwrap();
        assert!(anomalies
            .iter()
            .any(|a| a.kind == AnomalyKind::Memory && a.severity == AnomalySeverity::Critical));
    }

    #[test]
    fn flaky_detection_needs_ten_samples() {
        let (_dir, tracker) = tracker();
        let mut last = Vec::new();
        for i in 0..10 {
            let status = if i % 2 == 0 { JobStatus::Success } else { JobStatus::Failed };
            last = tracker.record_run(&completed_run(1.0, None, status)).unwrap();
        }
        assert!(last.iter().any(|a| a.kind == AnomalyKind::Flaky));
    }

    #[test]
    fn degraded_success_rate_flags_after_five() {
        let (_dir, tracker) = tracker();
        let mut last = Vec::new();
        for _ in 0..5 {
            last = tracker.record_run(&completed_run(1.0, None, JobStatus::Failed)).unwrap();
        }
        assert!(last
            .iter()
            .any(|a| a.kind == AnomalyKind::SuccessRateDegradation));
    }

    #[test]
    fn baselines_survive_reload() {
        let dir = TempDir::new().unwrap();
        let fingerprint;
        {
            let tracker = BaselineTracker::new(dir.path()).unwrap();
            let record = completed_run(5.0, Some(64.0), JobStatus::Success);
            fingerprint = record.fingerprint.clone();
            tracker.record_run(&record).unwrap();
        }
        let tracker = BaselineTracker::new(dir.path()).unwrap();
        let baseline = tracker.get(&fingerprint).unwrap();
        assert_eq!(baseline.samples, 1);
        assert!((baseline.memory_max_mb - 64.0).abs() < 1e-9);
    }

    #[test]
    fn anomalies_stream_to_dated_file() {
        let (dir, tracker) = tracker();
        for _ in 0..4 {
            tracker.record_run(&completed_run(1.0, None, JobStatus::Success)).unwrap();
        }
        tracker.record_run(&completed_run(50.0, None, JobStatus::Success)).unwrap();
        let path = dir
            .path()
            .join("anomalies")
            .join(format!("{}.jsonl", chrono::Local::now().format("%Y-%m-%d")));
        let contents = std::fs::read_to_string(path).unwrap();
        assert!(!contents.trim().is_empty());
    }

    #[test]
    fn recommendations_mention_ttl_headroom() {
        let (_dir, tracker) = tracker();
        let mut fingerprint = String::new();
        for _ in 0..5 {
            let r = completed_run(2.0, None, JobStatus::Success);
            fingerprint = r.fingerprint.clone();
            tracker.record_run(&r).unwrap();
        }
        let recs = tracker.recommendations(&fingerprint, Some(600));
        assert!(recs.iter().any(|r| r.contains("ttl")));
    }
}
