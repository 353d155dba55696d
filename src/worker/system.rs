//! OS process surface behind a trait so the dispatcher and tests can
//! run against a fake.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use sysinfo::{Pid, ProcessesToUpdate, System, MINIMUM_CPU_UPDATE_INTERVAL};

use crate::error::{DroverError, Result};
use crate::protocol::{MetricsSnapshot, METRIC_UNAVAILABLE};

/// Processes that are never terminated, regardless of confirmation.
pub const CRITICAL_PROCESSES: &[&str] = &[
    "systemd",
    "init",
    "kthreadd",
    "launchd",
    "system",
    "explorer.exe",
    "csrss.exe",
    "wininit.exe",
    "services.exe",
    "lsass.exe",
];

pub fn is_critical(name: &str) -> bool {
    CRITICAL_PROCESSES.iter().any(|c| c.eq_ignore_ascii_case(name))
}

/// Everything the dispatcher needs from the operating system.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Current load sample. Sampling failures degrade to the
    /// [`METRIC_UNAVAILABLE`] sentinel instead of erroring.
    async fn metrics(&self) -> MetricsSnapshot;

    fn pid_exists(&self, pid: u32) -> bool;

    fn process_name(&self, pid: u32) -> Option<String>;

    fn process_status(&self, pid: u32) -> Option<String>;

    /// Normalized scheduling priority, higher = more privileged.
    /// `None` when the platform cannot tell.
    fn priority(&self, pid: u32) -> Option<i32>;

    fn kill(&self, pid: u32) -> Result<()>;

    /// PIDs of every process currently alive on this machine.
    fn all_pids(&self) -> HashSet<u32>;

    /// Whole-machine listing backing STATUS ALL. Delegated capability;
    /// the format is not part of the protocol contract.
    fn list_all(&self) -> String;
}

/// `sysinfo`-backed implementation used by the real worker binary.
pub struct SystemControl {
    sys: Mutex<System>,
}

impl SystemControl {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        Self {
            sys: Mutex::new(sys),
        }
    }

    fn refresh_pid(&self, pid: u32) {
        let mut sys = self.sys.lock().expect("sysinfo lock poisoned");
        sys.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    }
}

impl Default for SystemControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessControl for SystemControl {
    async fn metrics(&self) -> MetricsSnapshot {
        // CPU usage needs two samples spaced by the crate minimum.
        {
            let mut sys = self.sys.lock().expect("sysinfo lock poisoned");
            sys.refresh_cpu_usage();
        }
        tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;

        let mut sys = self.sys.lock().expect("sysinfo lock poisoned");
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        sys.refresh_processes(ProcessesToUpdate::All, true);

        let cpu = f64::from(sys.global_cpu_usage());
        let mem = if sys.total_memory() > 0 {
            sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0
        } else {
            METRIC_UNAVAILABLE
        };
        MetricsSnapshot {
            cpu,
            mem,
            procs: sys.processes().len() as u64,
        }
    }

    fn pid_exists(&self, pid: u32) -> bool {
        self.refresh_pid(pid);
        let sys = self.sys.lock().expect("sysinfo lock poisoned");
        sys.process(Pid::from_u32(pid)).is_some()
    }

    fn process_name(&self, pid: u32) -> Option<String> {
        self.refresh_pid(pid);
        let sys = self.sys.lock().expect("sysinfo lock poisoned");
        sys.process(Pid::from_u32(pid))
            .map(|p| p.name().to_string_lossy().into_owned())
    }

    fn process_status(&self, pid: u32) -> Option<String> {
        self.refresh_pid(pid);
        let sys = self.sys.lock().expect("sysinfo lock poisoned");
        sys.process(Pid::from_u32(pid))
            .map(|p| p.status().to_string())
    }

    #[cfg(target_os = "linux")]
    fn priority(&self, pid: u32) -> Option<i32> {
        // Niceness from /proc/<pid>/stat; negative nice means elevated,
        // so the normalized priority is its negation.
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let rest = stat.rsplit_once(')')?.1;
        let nice: i32 = rest.split_whitespace().nth(16)?.parse().ok()?;
        Some(-nice)
    }

    #[cfg(not(target_os = "linux"))]
    fn priority(&self, _pid: u32) -> Option<i32> {
        None
    }

    fn kill(&self, pid: u32) -> Result<()> {
        self.refresh_pid(pid);
        let sys = self.sys.lock().expect("sysinfo lock poisoned");
        match sys.process(Pid::from_u32(pid)) {
            None => Err(DroverError::NotFound(pid)),
            Some(p) => {
                if p.kill() {
                    Ok(())
                } else {
                    Err(DroverError::PermissionDenied(pid))
                }
            }
        }
    }

    fn all_pids(&self) -> HashSet<u32> {
        let mut sys = self.sys.lock().expect("sysinfo lock poisoned");
        sys.refresh_processes(ProcessesToUpdate::All, true);
        sys.processes().keys().map(|p| p.as_u32()).collect()
    }

    fn list_all(&self) -> String {
        let mut sys = self.sys.lock().expect("sysinfo lock poisoned");
        sys.refresh_processes(ProcessesToUpdate::All, true);
        let mut out = format!("=== All processes ({}) ===\n", sys.processes().len());
        let mut entries: Vec<_> = sys.processes().iter().collect();
        entries.sort_by_key(|(pid, _)| pid.as_u32());
        for (pid, process) in entries {
            out.push_str(&format!(
                "PID: {:<8} | NAME: {:<24} | STATUS: {}\n",
                pid.as_u32(),
                process.name().to_string_lossy(),
                process.status()
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_names_match_case_insensitively() {
        assert!(is_critical("systemd"));
        assert!(is_critical("SYSTEMD"));
        assert!(is_critical("Explorer.EXE"));
        assert!(!is_critical("gedit"));
    }
}
