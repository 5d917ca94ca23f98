//! Process-wide per-workspace usage counters.

use crate::workspace::Workspace;
use crate::OrcaError;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Which counter a reservation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    Job,
    Sandbox,
}

#[derive(Debug, Default, Clone)]
struct WorkspaceUsage {
    running_jobs: u32,
    running_sandboxes: u32,
    jobs_today: u32,
    day: Option<NaiveDate>,
}

/// Thread-safe concurrent and daily usage tracking.
///
/// One mutex covers the whole counter map; `check_and_reserve` verifies and
/// increments inside a single critical section so concurrent admissions can
/// never overshoot a limit.
#[derive(Debug, Default)]
pub struct QuotaTracker {
    usage: Mutex<HashMap<String, WorkspaceUsage>>,
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically verifies the workspace limits and reserves one slot.
    /// A `Job` reservation also consumes the daily allowance.
    pub fn check_and_reserve(&self, workspace: &Workspace, kind: QuotaKind) -> Result<(), OrcaError> {
        let today = chrono::Local::now().date_naive();
        let mut usage = self.usage.lock();
        let entry = usage.entry(workspace.id.clone()).or_default();

        if entry.day != Some(today) {
            entry.day = Some(today);
            entry.jobs_today = 0;
        }

        match kind {
            QuotaKind::Job => {
                if entry.running_jobs >= workspace.limits.max_concurrent_jobs {
                    return Err(OrcaError::QuotaExceeded(format!(
                        "workspace '{}' is at its concurrent job limit ({})",
                        workspace.id, workspace.limits.max_concurrent_jobs
                    )));
                }
                if let Some(daily) = workspace.limits.daily_job_limit {
                    if entry.jobs_today >= daily {
                        return Err(OrcaError::QuotaExceeded(format!(
                            "workspace '{}' reached its daily job limit ({daily})",
                            workspace.id
                        )));
                    }
                }
                entry.running_jobs += 1;
                entry.jobs_today += 1;
            }
            QuotaKind::Sandbox => {
                if entry.running_sandboxes >= workspace.limits.max_concurrent_sandboxes {
                    return Err(OrcaError::QuotaExceeded(format!(
                        "workspace '{}' is at its concurrent sandbox limit ({})",
                        workspace.id, workspace.limits.max_concurrent_sandboxes
                    )));
                }
                entry.running_sandboxes += 1;
            }
        }
        Ok(())
    }

    /// Releases one slot, saturating at zero. The daily counter is never
    /// decremented.
    pub fn release(&self, workspace_id: &str, kind: QuotaKind) {
        let mut usage = self.usage.lock();
        let Some(entry) = usage.get_mut(workspace_id) else {
            return;
        };
        match kind {
            QuotaKind::Job => entry.running_jobs = entry.running_jobs.saturating_sub(1),
            QuotaKind::Sandbox => entry.running_sandboxes = entry.running_sandboxes.saturating_sub(1),
        }
    }

    pub fn running_jobs(&self, workspace_id: &str) -> u32 {
        self.usage.lock().get(workspace_id).map(|u| u.running_jobs).unwrap_or(0)
    }

    pub fn jobs_today(&self, workspace_id: &str) -> u32 {
        self.usage.lock().get(workspace_id).map(|u| u.jobs_today).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::Workspace;
    use std::sync::Arc;

    fn workspace(max_jobs: u32) -> Workspace {
        let mut ws = Workspace::new("ws_q", "Quota");
        ws.limits.max_concurrent_jobs = max_jobs;
        ws
    }

    #[test]
    fn reserve_then_release() {
        let tracker = QuotaTracker::new();
        let ws = workspace(2);
        tracker.check_and_reserve(&ws, QuotaKind::Job).unwrap();
        tracker.check_and_reserve(&ws, QuotaKind::Job).unwrap();
        assert!(tracker.check_and_reserve(&ws, QuotaKind::Job).is_err());
        tracker.release(&ws.id, QuotaKind::Job);
        tracker.check_and_reserve(&ws, QuotaKind::Job).unwrap();
        assert_eq!(tracker.running_jobs(&ws.id), 2);
    }

    #[test]
    fn daily_limit_survives_release() {
        let tracker = QuotaTracker::new();
        let mut ws = workspace(10);
        ws.limits.daily_job_limit = Some(2);
        tracker.check_and_reserve(&ws, QuotaKind::Job).unwrap();
        tracker.release(&ws.id, QuotaKind::Job);
        tracker.check_and_reserve(&ws, QuotaKind::Job).unwrap();
        tracker.release(&ws.id, QuotaKind::Job);
        // Concurrency is free again but the daily allowance is spent.
        assert!(matches!(
            tracker.check_and_reserve(&ws, QuotaKind::Job),
            Err(OrcaError::QuotaExceeded(_))
        ));
        assert_eq!(tracker.jobs_today(&ws.id), 2);
    }

    #[test]
    fn sandbox_counter_is_independent() {
        let tracker = QuotaTracker::new();
        let mut ws = workspace(1);
        ws.limits.max_concurrent_sandboxes = 1;
        tracker.check_and_reserve(&ws, QuotaKind::Job).unwrap();
        tracker.check_and_reserve(&ws, QuotaKind::Sandbox).unwrap();
        assert!(tracker.check_and_reserve(&ws, QuotaKind::Sandbox).is_err());
        tracker.release(&ws.id, QuotaKind::Sandbox);
        tracker.check_and_reserve(&ws, QuotaKind::Sandbox).unwrap();
    }

    #[test]
    fn release_unknown_workspace_is_noop() {
        let tracker = QuotaTracker::new();
        tracker.release("ws_ghost", QuotaKind::Job);
        assert_eq!(tracker.running_jobs("ws_ghost"), 0);
    }

    #[test]
    fn concurrent_reservations_never_overshoot() {
        let tracker = Arc::new(QuotaTracker::new());
        let ws = Arc::new(workspace(5));
        let mut handles = Vec::new();
        for _ in 0..32 {
            let tracker = tracker.clone();
            let ws = ws.clone();
            handles.push(std::thread::spawn(move || {
                tracker.check_and_reserve(&ws, QuotaKind::Job).is_ok()
            }));
        }
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|admitted| *admitted)
            .count();
        assert_eq!(admitted, 5);
        assert_eq!(tracker.running_jobs(&ws.id), 5);
    }
}
