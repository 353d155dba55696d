//! Per-worker bookkeeping of the processes this worker itself started.
//!
//! The tracker never reflects a whole-machine view. Entries are added
//! on a confirmed RUN, removed on a confirmed KILL, and pruned lazily
//! right before any listing; there is no background reaping.

use std::collections::BTreeSet;

use crate::protocol::NO_ACTIVE_PROCESSES;
use crate::worker::system::ProcessControl;

#[derive(Debug, Default)]
pub struct ProcessTracker {
    pids: BTreeSet<u32>,
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a PID after a confirmed successful start.
    pub fn record(&mut self, pid: u32) {
        self.pids.insert(pid);
        tracing::info!(pid, "Tracking process");
    }

    /// Drop a PID after a confirmed kill. Returns whether it was tracked.
    pub fn remove(&mut self, pid: u32) -> bool {
        self.pids.remove(&pid)
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.pids.contains(&pid)
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }

    /// Drop entries the OS no longer knows about. Invoked before any
    /// listing, never proactively.
    pub fn prune(&mut self, control: &dyn ProcessControl) {
        self.pids.retain(|&pid| {
            let alive = control.pid_exists(pid);
            if !alive {
                tracing::debug!(pid, "Pruning dead tracked process");
            }
            alive
        });
    }

    /// Post-prune tracked PIDs, for the structured ownership query.
    pub fn pids(&mut self, control: &dyn ProcessControl) -> Vec<u32> {
        self.prune(control);
        self.pids.iter().copied().collect()
    }

    /// Rendered listing of tracked processes. A PID that disappears
    /// between prune and name lookup is reported as terminated rather
    /// than raising an error.
    pub fn render(&mut self, control: &dyn ProcessControl) -> String {
        self.prune(control);
        if self.pids.is_empty() {
            return NO_ACTIVE_PROCESSES.to_string();
        }
        let mut out = String::from("=== Processes started by this worker ===\n");
        for &pid in &self.pids {
            match control.process_name(pid) {
                Some(name) => {
                    let status = control
                        .process_status(pid)
                        .unwrap_or_else(|| "unknown".to_string());
                    out.push_str(&format!(
                        "PID: {:<8} | NAME: {:<24} | STATUS: {}\n",
                        pid, name, status
                    ));
                }
                None => {
                    out.push_str(&format!("PID: {:<8} | [terminated]\n", pid));
                }
            }
        }
        out.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DroverError, Result};
    use crate::protocol::MetricsSnapshot;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// Minimal in-memory process table for tracker tests.
    #[derive(Default)]
    struct TableControl {
        procs: Mutex<HashMap<u32, String>>,
    }

    impl TableControl {
        fn with(pids: &[(u32, &str)]) -> Self {
            Self {
                procs: Mutex::new(
                    pids.iter()
                        .map(|(pid, name)| (*pid, name.to_string()))
                        .collect(),
                ),
            }
        }

        fn terminate(&self, pid: u32) {
            self.procs.lock().unwrap().remove(&pid);
        }
    }

    #[async_trait]
    impl ProcessControl for TableControl {
        async fn metrics(&self) -> MetricsSnapshot {
            MetricsSnapshot::degraded()
        }

        fn pid_exists(&self, pid: u32) -> bool {
            self.procs.lock().unwrap().contains_key(&pid)
        }

        fn process_name(&self, pid: u32) -> Option<String> {
            self.procs.lock().unwrap().get(&pid).cloned()
        }

        fn process_status(&self, pid: u32) -> Option<String> {
            self.pid_exists(pid).then(|| "running".to_string())
        }

        fn priority(&self, _pid: u32) -> Option<i32> {
            Some(0)
        }

        fn kill(&self, pid: u32) -> Result<()> {
            self.procs
                .lock()
                .unwrap()
                .remove(&pid)
                .map(|_| ())
                .ok_or(DroverError::NotFound(pid))
        }

        fn all_pids(&self) -> HashSet<u32> {
            self.procs.lock().unwrap().keys().copied().collect()
        }

        fn list_all(&self) -> String {
            String::new()
        }
    }

    #[test]
    fn record_and_remove() {
        let mut tracker = ProcessTracker::new();
        tracker.record(100);
        assert!(tracker.contains(100));
        assert!(tracker.remove(100));
        assert!(!tracker.remove(100));
        assert!(tracker.is_empty());
    }

    #[test]
    fn prune_drops_dead_pids() {
        let control = TableControl::with(&[(1, "a"), (2, "b")]);
        let mut tracker = ProcessTracker::new();
        tracker.record(1);
        tracker.record(2);
        tracker.record(3); // never existed

        assert_eq!(tracker.pids(&control), vec![1, 2]);

        control.terminate(1);
        assert_eq!(tracker.pids(&control), vec![2]);
    }

    #[test]
    fn render_empty_uses_indicator() {
        let control = TableControl::default();
        let mut tracker = ProcessTracker::new();
        assert_eq!(tracker.render(&control), NO_ACTIVE_PROCESSES);
    }

    #[test]
    fn render_lists_tracked_processes_only() {
        let control = TableControl::with(&[(10, "gedit"), (99, "untracked")]);
        let mut tracker = ProcessTracker::new();
        tracker.record(10);

        let listing = tracker.render(&control);
        assert!(listing.contains("10"));
        assert!(listing.contains("gedit"));
        assert!(!listing.contains("untracked"));
    }
}
