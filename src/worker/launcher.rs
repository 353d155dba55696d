//! The "start" capability.
//!
//! Launch heuristics differ between background commands (the spawned
//! child is the target) and interactive programs (the shell hands off
//! to a reparented process, so the launcher's PID is not the real
//! target). Both paths collapse into one tagged [`StartOutcome`]; the
//! interactive PID hunt is a pluggable [`PidDiscovery`] strategy with a
//! bounded window, never an open-ended block.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::worker::system::ProcessControl;

/// Poll step used by the default discovery strategy.
const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_millis(150);

/// Grace period before declaring a background child alive.
const SPAWN_GRACE: Duration = Duration::from_millis(100);

/// Command substrings classified as interactive launches.
const INTERACTIVE_TOKENS: &[&str] = &[
    "notepad", "calc", "mspaint", "explorer", "wordpad", "gedit", "xterm", "nautilus",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(u32),
    /// The program launched but its PID could not be determined inside
    /// the discovery window (it may also have exited immediately).
    StartedUnknownPid,
    Failed(String),
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn start(&self, command: &str) -> StartOutcome;
}

/// Strategy for locating the real PID of an interactive launch.
#[async_trait]
pub trait PidDiscovery: Send + Sync {
    async fn discover(
        &self,
        exe_name: &str,
        before: &HashSet<u32>,
        window: Duration,
    ) -> Option<u32>;
}

/// Default strategy: poll the process table for a new PID whose name
/// matches the expected executable; the newest candidate wins.
pub struct PollingDiscovery {
    control: Arc<dyn ProcessControl>,
}

impl PollingDiscovery {
    pub fn new(control: Arc<dyn ProcessControl>) -> Self {
        Self { control }
    }
}

#[async_trait]
impl PidDiscovery for PollingDiscovery {
    async fn discover(
        &self,
        exe_name: &str,
        before: &HashSet<u32>,
        window: Duration,
    ) -> Option<u32> {
        let deadline = tokio::time::Instant::now() + window;
        while tokio::time::Instant::now() < deadline {
            let candidates: Vec<u32> = self
                .control
                .all_pids()
                .into_iter()
                .filter(|pid| !before.contains(pid))
                .filter(|&pid| {
                    self.control
                        .process_name(pid)
                        .is_some_and(|name| name_matches(&name, exe_name))
                })
                .collect();
            if let Some(pid) = candidates.into_iter().max() {
                return Some(pid);
            }
            tokio::time::sleep(DISCOVERY_POLL_INTERVAL).await;
        }
        None
    }
}

fn name_matches(name: &str, exe: &str) -> bool {
    name.eq_ignore_ascii_case(exe) || name.eq_ignore_ascii_case(&format!("{exe}.exe"))
}

/// Likely executable name from a command string.
fn guess_exe_name(command: &str) -> String {
    let first = command.split_whitespace().next().unwrap_or(command);
    std::path::Path::new(first)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| first.to_string())
}

fn is_interactive(command: &str) -> bool {
    let lower = command.to_lowercase();
    INTERACTIVE_TOKENS.iter().any(|tok| lower.contains(tok))
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(format!("start \"\" {command}"));
    cmd
}

/// Shell-backed launcher used by the real worker binary.
pub struct ShellLauncher {
    control: Arc<dyn ProcessControl>,
    discovery: Arc<dyn PidDiscovery>,
    discovery_window: Duration,
}

impl ShellLauncher {
    pub fn new(control: Arc<dyn ProcessControl>, discovery_window: Duration) -> Self {
        let discovery = Arc::new(PollingDiscovery::new(control.clone()));
        Self {
            control,
            discovery,
            discovery_window,
        }
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn PidDiscovery>) -> Self {
        self.discovery = discovery;
        self
    }

    async fn start_interactive(&self, command: &str) -> StartOutcome {
        let exe_name = guess_exe_name(command);
        let before = self.control.all_pids();
        if let Err(e) = shell(command).spawn() {
            return StartOutcome::Failed(e.to_string());
        }
        match self
            .discovery
            .discover(&exe_name, &before, self.discovery_window)
            .await
        {
            Some(pid) => {
                tracing::info!(command, pid, "Interactive launch resolved");
                StartOutcome::Started(pid)
            }
            None => {
                tracing::warn!(command, %exe_name, "Interactive launch PID not found");
                StartOutcome::StartedUnknownPid
            }
        }
    }

    async fn start_background(&self, command: &str) -> StartOutcome {
        let child = match shell(command).spawn() {
            Ok(child) => child,
            Err(e) => return StartOutcome::Failed(e.to_string()),
        };
        let Some(pid) = child.id() else {
            return StartOutcome::StartedUnknownPid;
        };
        // Child is deliberately not awaited; it outlives this call.
        tokio::time::sleep(SPAWN_GRACE).await;
        if self.control.pid_exists(pid) {
            tracing::info!(command, pid, "Background launch started");
            StartOutcome::Started(pid)
        } else {
            StartOutcome::Failed(format!("'{command}' exited immediately"))
        }
    }
}

#[async_trait]
impl ProcessLauncher for ShellLauncher {
    async fn start(&self, command: &str) -> StartOutcome {
        if is_interactive(command) {
            self.start_interactive(command).await
        } else {
            self.start_background(command).await
        }
    }
}
