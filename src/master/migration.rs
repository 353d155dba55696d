//! Cross-node migration: terminate on the current owner, relaunch an
//! equivalent command on the least-loaded worker.
//!
//! Deliberately at-most-once: the kill and the restart are independent
//! calls with no rollback, so a failure between them leaves the
//! workload stopped and not restarted anywhere. The source system
//! offers no recovery and none is invented here.

use crate::client::Client;
use crate::config::{WorkerDescriptor, WorkerRegistry};
use crate::error::{DroverError, Result};
use crate::master::scheduler::Scheduler;
use crate::protocol::ERROR_PREFIX;

/// Outcome of one migration attempt.
#[derive(Debug)]
pub struct MigrationReport {
    pub pid: u32,
    /// Worker that held the PID in its tracked set, if any.
    pub owner: Option<String>,
    /// Live name resolved from the owner; `None` means the fallback
    /// command was used for the restart.
    pub resolved_name: Option<String>,
    pub target: String,
    /// The owner's reply to the local-kill half, when an owner existed
    /// and answered.
    pub source_response: Option<String>,
    /// The target's reply to the restart, verbatim.
    pub restart_response: String,
}

/// Probe every worker's tracked-PID set in registry order; the first
/// set containing `pid` wins. A structured query, not a substring
/// match, so PID 1 cannot falsely match inside PID 21.
pub async fn find_owner<'r>(
    client: &Client,
    registry: &'r WorkerRegistry,
    pid: u32,
) -> Option<&'r WorkerDescriptor> {
    for worker in registry.iter() {
        let body = match client.request(worker, "PIDS").await {
            Ok(body) => body,
            Err(_) => continue,
        };
        match serde_json::from_str::<Vec<u32>>(body.trim()) {
            Ok(pids) if pids.contains(&pid) => {
                tracing::info!(pid, owner = %worker.name, "Owner located");
                return Some(worker);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(worker = %worker.name, error = %e, "Malformed PIDS response");
            }
        }
    }
    None
}

pub struct MigrationCoordinator<'a> {
    client: &'a Client,
    scheduler: &'a Scheduler,
    registry: &'a WorkerRegistry,
    fallback_command: &'a str,
}

impl<'a> MigrationCoordinator<'a> {
    pub fn new(
        client: &'a Client,
        scheduler: &'a Scheduler,
        registry: &'a WorkerRegistry,
        fallback_command: &'a str,
    ) -> Self {
        Self {
            client,
            scheduler,
            registry,
            fallback_command,
        }
    }

    pub async fn migrate(&self, pid: u32) -> Result<MigrationReport> {
        // 1. Ownership discovery.
        let owner = find_owner(self.client, self.registry, pid).await;
        if owner.is_none() {
            tracing::warn!(pid, "No owner found; will broadcast kill");
        }

        // 2. Name resolution from the owner; failure is not fatal.
        let resolved_name = match owner {
            Some(worker) => match self.client.request(worker, &format!("NAME {pid}")).await {
                Ok(body) if !body.starts_with(ERROR_PREFIX) && !body.is_empty() => {
                    Some(body.trim().to_string())
                }
                Ok(body) => {
                    tracing::warn!(pid, owner = %worker.name, response = %body, "Name unavailable");
                    None
                }
                Err(e) => {
                    tracing::warn!(pid, owner = %worker.name, error = %e, "Name probe failed");
                    None
                }
            },
            None => None,
        };

        // 3. Target selection. Nothing has been terminated yet, so a
        // missing target aborts the whole migration.
        let target = self
            .scheduler
            .select(self.registry)
            .await
            .ok_or(DroverError::NoWorkersAvailable)?;

        // 4. Terminate at the source. With an owner, the worker-local
        // migrate half; without one, a best-effort kill broadcast with
        // individual failures ignored.
        let source_response = match owner {
            Some(worker) => {
                let reply = self
                    .client
                    .request(worker, &format!("MIGRATE {pid} --to {}", target.name))
                    .await;
                match &reply {
                    Ok(body) => tracing::info!(pid, owner = %worker.name, response = %body, "Source released"),
                    Err(e) => tracing::warn!(pid, owner = %worker.name, error = %e, "Source kill unconfirmed"),
                }
                reply.ok()
            }
            None => {
                for worker in self.registry.iter() {
                    if let Err(e) = self.client.request(worker, &format!("KILL {pid}")).await {
                        tracing::debug!(worker = %worker.name, error = %e, "Broadcast kill skipped");
                    }
                }
                None
            }
        };

        // 5. Restart on the target and report its reply verbatim.
        let command = resolved_name
            .clone()
            .unwrap_or_else(|| self.fallback_command.to_string());
        tracing::info!(pid, target = %target.name, %command, "Restarting on target");
        let restart_response = self
            .client
            .request(target, &format!("RUN {command}"))
            .await?;

        Ok(MigrationReport {
            pid,
            owner: owner.map(|w| w.name.clone()),
            resolved_name,
            target: target.name.clone(),
            source_response,
            restart_response,
        })
    }
}
