//! Command dispatch state machine.
//!
//! Each incoming line moves the connection Idle -> Dispatching ->
//! Responding; a risky KILL detours through an explicit
//! [`PendingConfirmation`] that the connection loop resolves with at
//! most one further line (or a deadline). Internal errors never escape
//! dispatch: they become an `ERROR:`-prefixed reply and the listener
//! keeps running.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{DroverError, Result};
use crate::protocol::{ParseError, Request, CONFIRM_PREFIX, ERROR_PREFIX};
use crate::worker::launcher::{ProcessLauncher, StartOutcome};
use crate::worker::system::{is_critical, ProcessControl};
use crate::worker::tracker::ProcessTracker;

/// Normalized priority above which a kill needs explicit confirmation.
pub const ELEVATED_PRIORITY_THRESHOLD: i32 = 0;

/// A kill waiting on the operator's reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConfirmation {
    pub pid: u32,
    pub deadline: Instant,
}

/// What the connection loop should do with a dispatched command.
#[derive(Debug)]
pub enum Disposition {
    Reply(String),
    /// Write `prompt`, read exactly one line (bounded by the pending
    /// deadline), then resolve via
    /// [`Dispatcher::resolve_confirmation`].
    Confirm {
        pending: PendingConfirmation,
        prompt: String,
    },
    /// Write the acknowledgement, then the worker process ends.
    Shutdown(String),
}

pub struct Dispatcher {
    control: Arc<dyn ProcessControl>,
    launcher: Arc<dyn ProcessLauncher>,
    confirm_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        control: Arc<dyn ProcessControl>,
        launcher: Arc<dyn ProcessLauncher>,
        confirm_timeout: Duration,
    ) -> Self {
        Self {
            control,
            launcher,
            confirm_timeout,
        }
    }

    pub fn confirm_timeout(&self) -> Duration {
        self.confirm_timeout
    }

    /// Dispatch one command line. Never fails: errors become replies.
    pub async fn dispatch(&self, line: &str, tracker: &mut ProcessTracker) -> Disposition {
        let request = match Request::parse(line) {
            Ok(req) => req,
            Err(e) => {
                if !matches!(e, ParseError::Unrecognized) {
                    tracing::debug!(line, error = %e, "Rejected command");
                }
                return Disposition::Reply(format!("{ERROR_PREFIX} {e}"));
            }
        };
        match self.handle(request, tracker).await {
            Ok(disposition) => disposition,
            Err(e) => {
                tracing::error!(line, error = %e, "Dispatch error");
                Disposition::Reply(format!("{ERROR_PREFIX} {e}"))
            }
        }
    }

    async fn handle(&self, request: Request, tracker: &mut ProcessTracker) -> Result<Disposition> {
        let disposition = match request {
            Request::Run(command) => Disposition::Reply(self.run(&command, tracker).await),
            Request::Status => Disposition::Reply(tracker.render(self.control.as_ref())),
            Request::StatusAll => Disposition::Reply(self.control.list_all()),
            Request::Metrics => {
                let snapshot = self.control.metrics().await;
                let body = serde_json::to_string(&snapshot)
                    .map_err(|e| DroverError::Internal(e.to_string()))?;
                Disposition::Reply(body)
            }
            Request::Name(pid) => match self.control.process_name(pid) {
                Some(name) => Disposition::Reply(name),
                None => Disposition::Reply(format!("{ERROR_PREFIX} {}", DroverError::NotFound(pid))),
            },
            Request::Pids => {
                let pids = tracker.pids(self.control.as_ref());
                let body = serde_json::to_string(&pids)
                    .map_err(|e| DroverError::Internal(e.to_string()))?;
                Disposition::Reply(body)
            }
            Request::Kill(pid) => self.kill(pid, tracker),
            Request::Migrate { pid, target } => {
                Disposition::Reply(self.migrate_local(pid, &target, tracker))
            }
            Request::Exit => Disposition::Shutdown("Worker shutting down.".to_string()),
        };
        Ok(disposition)
    }

    async fn run(&self, command: &str, tracker: &mut ProcessTracker) -> String {
        match self.launcher.start(command).await {
            StartOutcome::Started(pid) => {
                tracker.record(pid);
                format!("Started '{command}' with PID {pid}")
            }
            StartOutcome::StartedUnknownPid => {
                format!("Started '{command}' but its PID was not found (it may have exited immediately)")
            }
            StartOutcome::Failed(reason) => {
                format!("{ERROR_PREFIX} failed to start '{command}': {reason}")
            }
        }
    }

    fn kill(&self, pid: u32, tracker: &mut ProcessTracker) -> Disposition {
        let Some(name) = self.control.process_name(pid) else {
            return Disposition::Reply(format!("{ERROR_PREFIX} {}", DroverError::NotFound(pid)));
        };
        // Denylist refusal is unconditional; no confirmation can
        // override it.
        if is_critical(&name) {
            tracing::warn!(pid, %name, "Refused to kill critical process");
            return Disposition::Reply(format!(
                "{ERROR_PREFIX} {}",
                DroverError::CriticalProcessProtected(name)
            ));
        }
        let elevated = self
            .control
            .priority(pid)
            .is_some_and(|p| p > ELEVATED_PRIORITY_THRESHOLD);
        if elevated {
            let pending = PendingConfirmation {
                pid,
                deadline: Instant::now() + self.confirm_timeout,
            };
            let prompt = format!(
                "{CONFIRM_PREFIX} process {pid} ({name}) runs at elevated priority; kill? [yes/no]"
            );
            return Disposition::Confirm { pending, prompt };
        }
        Disposition::Reply(self.terminate(pid, &name, tracker))
    }

    /// Resolve a pending confirmation with the operator's reply.
    /// `None` means the read timed out or the peer vanished.
    pub fn resolve_confirmation(
        &self,
        pending: &PendingConfirmation,
        reply: Option<&str>,
        tracker: &mut ProcessTracker,
    ) -> String {
        let pid = pending.pid;
        let Some(reply) = reply else {
            tracing::info!(pid, "Kill confirmation timed out");
            return format!("Confirmation timed out; kill of {pid} aborted.");
        };
        if Instant::now() > pending.deadline {
            tracing::info!(pid, "Kill confirmation arrived after deadline");
            return format!("Confirmation timed out; kill of {pid} aborted.");
        }
        if !reply.trim().eq_ignore_ascii_case("yes") {
            tracing::info!(pid, reply, "Kill declined");
            return format!("Kill of {pid} aborted; process left running.");
        }
        match self.control.process_name(pid) {
            Some(name) => self.terminate(pid, &name, tracker),
            None => format!("{ERROR_PREFIX} {}", DroverError::NotFound(pid)),
        }
    }

    fn terminate(&self, pid: u32, name: &str, tracker: &mut ProcessTracker) -> String {
        match self.control.kill(pid) {
            Ok(()) => {
                tracker.remove(pid);
                tracing::info!(pid, name, "Process terminated");
                format!("Terminated process {pid} ({name}).")
            }
            Err(e) => format!("{ERROR_PREFIX} {e}"),
        }
    }

    /// Worker-local half of a migration: release the PID if present.
    /// Cross-node coordination is entirely master-side.
    fn migrate_local(&self, pid: u32, target: &str, tracker: &mut ProcessTracker) -> String {
        if !self.control.pid_exists(pid) {
            return format!("PID {pid} not found locally");
        }
        let name = self
            .control
            .process_name(pid)
            .unwrap_or_else(|| "unknown".to_string());
        if is_critical(&name) {
            return format!(
                "{ERROR_PREFIX} {}",
                DroverError::CriticalProcessProtected(name)
            );
        }
        match self.control.kill(pid) {
            Ok(()) => {
                tracker.remove(pid);
                tracing::info!(pid, %name, target, "Released process for migration");
                format!("Released PID {pid} ({name}) for migration to {target}")
            }
            Err(e) => format!("{ERROR_PREFIX} {e}"),
        }
    }
}
