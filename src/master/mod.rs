//! Master node: the coordinating side of the protocol.
//!
//! Fully synchronous in structure: every multi-worker operation is a
//! serial sequence of one-shot round trips, and one worker's failure
//! never aborts the others.

pub mod migration;
pub mod scheduler;

use crate::client::{Client, Exchange};
use crate::config::{MasterConfig, WorkerDescriptor};
use crate::error::{DroverError, Result};
use crate::protocol::{MetricsSnapshot, CONFIRM_PREFIX};

pub use migration::{MigrationCoordinator, MigrationReport};
pub use scheduler::Scheduler;

/// Result of an auto-scheduled RUN.
#[derive(Debug)]
pub struct RunReport {
    pub worker: String,
    /// Worker reply; on success it contains the literal PID.
    pub response: String,
}

pub struct Master {
    config: MasterConfig,
    client: Client,
    scheduler: Scheduler,
}

impl Master {
    pub fn new(config: MasterConfig) -> Self {
        let client = Client::new(config.request_timeout);
        let scheduler = Scheduler::new(client.clone());
        Self {
            config,
            client,
            scheduler,
        }
    }

    fn worker(&self, name: &str) -> Result<&WorkerDescriptor> {
        self.config
            .registry
            .get(name)
            .ok_or_else(|| DroverError::UnknownWorker(name.to_string()))
    }

    /// Schedule onto the least-loaded worker and start `command` there.
    /// No reachable worker is a hard stop; no RUN is attempted.
    pub async fn run_auto(&self, command: &str) -> Result<RunReport> {
        let target = self
            .scheduler
            .select(&self.config.registry)
            .await
            .ok_or(DroverError::NoWorkersAvailable)?;
        tracing::info!(worker = %target.name, command, "Dispatching RUN");
        let response = self.client.request(target, &format!("RUN {command}")).await?;
        Ok(RunReport {
            worker: target.name.clone(),
            response,
        })
    }

    /// Start `command` on a specific worker.
    pub async fn run_on(&self, worker: &str, command: &str) -> Result<String> {
        let target = self.worker(worker)?;
        self.client.request(target, &format!("RUN {command}")).await
    }

    pub async fn status(&self, worker: &str) -> Result<String> {
        let target = self.worker(worker)?;
        self.client.request(target, "STATUS").await
    }

    /// Serial STATUS probe of every worker; unreachable workers are
    /// reported as `None` without aborting the rest.
    pub async fn status_all(&self) -> Vec<(String, Option<String>)> {
        let mut out = Vec::with_capacity(self.config.registry.len());
        for worker in self.config.registry.iter() {
            let status = self.client.request(worker, "STATUS").await.ok();
            out.push((worker.name.clone(), status));
        }
        out
    }

    pub async fn metrics_all(&self) -> Vec<(String, Option<MetricsSnapshot>)> {
        self.scheduler.metrics_all(&self.config.registry).await
    }

    /// Kill `pid` on whichever worker tracks it. A confirmation prompt
    /// from the worker is answered `yes` only under `assume_yes`;
    /// otherwise the kill is declined and reported as cancelled.
    pub async fn kill(&self, pid: u32, assume_yes: bool) -> Result<String> {
        let owner = migration::find_owner(&self.client, &self.config.registry, pid)
            .await
            .ok_or(DroverError::NotFound(pid))?;
        let mut exchange = Exchange::open(owner, self.client.deadline()).await?;
        let first = exchange.send(&format!("KILL {pid}")).await?;
        if !first.starts_with(CONFIRM_PREFIX) {
            return Ok(first);
        }
        tracing::info!(pid, owner = %owner.name, "Worker requested confirmation");
        if assume_yes {
            exchange.send("yes").await
        } else {
            // Decline explicitly so the worker aborts cleanly instead
            // of waiting out its deadline.
            let _ = exchange.send("no").await;
            Err(DroverError::Cancelled)
        }
    }

    pub async fn migrate(&self, pid: u32) -> Result<MigrationReport> {
        let coordinator = MigrationCoordinator::new(
            &self.client,
            &self.scheduler,
            &self.config.registry,
            &self.config.fallback_command,
        );
        coordinator.migrate(pid).await
    }

    /// Send EXIT to a worker, ending that worker process. The only
    /// in-band shutdown path.
    pub async fn shutdown_worker(&self, worker: &str) -> Result<String> {
        let target = self.worker(worker)?;
        self.client.request(target, "EXIT").await
    }
}
