//! Least-loaded worker selection.

use crate::client::Client;
use crate::config::{WorkerDescriptor, WorkerRegistry};
use crate::protocol::MetricsSnapshot;

pub struct Scheduler {
    client: Client,
}

impl Scheduler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Probe METRICS on every registered worker, serially and in
    /// registry order. One worker failing never aborts the others.
    pub async fn metrics_all(
        &self,
        registry: &WorkerRegistry,
    ) -> Vec<(String, Option<MetricsSnapshot>)> {
        let mut out = Vec::with_capacity(registry.len());
        for worker in registry.iter() {
            let snapshot = match self.client.request(worker, "METRICS").await {
                Ok(body) => match serde_json::from_str::<MetricsSnapshot>(body.trim()) {
                    Ok(snap) => Some(snap),
                    Err(e) => {
                        // Unparsable metrics score like unreachable.
                        tracing::warn!(worker = %worker.name, error = %e, "Malformed metrics");
                        None
                    }
                },
                Err(e) => {
                    tracing::debug!(worker = %worker.name, error = %e, "Metrics probe failed");
                    None
                }
            };
            out.push((worker.name.clone(), snapshot));
        }
        out
    }

    /// Select the reachable worker minimizing `0.6*cpu + 0.4*mem`.
    /// Strict-less-than comparison resolves ties to the earliest worker
    /// in registry order. The unavailable sentinel scores a degraded
    /// worker far above any healthy one, so it wins only when nothing
    /// healthier answers. `None` means no reachable worker; every
    /// caller must treat that as a hard stop.
    pub async fn select<'r>(&self, registry: &'r WorkerRegistry) -> Option<&'r WorkerDescriptor> {
        let mut best: Option<(&WorkerDescriptor, f64)> = None;
        for worker in registry.iter() {
            let body = match self.client.request(worker, "METRICS").await {
                Ok(body) => body,
                Err(e) => {
                    tracing::debug!(worker = %worker.name, error = %e, "Excluded: unreachable");
                    continue;
                }
            };
            let snap: MetricsSnapshot = match serde_json::from_str(body.trim()) {
                Ok(snap) => snap,
                Err(e) => {
                    tracing::warn!(worker = %worker.name, error = %e, "Excluded: malformed metrics");
                    continue;
                }
            };
            let score = snap.score();
            tracing::debug!(
                worker = %worker.name,
                cpu = snap.cpu,
                mem = snap.mem,
                score,
                "Worker scored"
            );
            match best {
                Some((_, best_score)) if score >= best_score => {}
                _ => best = Some((worker, score)),
            }
        }
        match best {
            Some((worker, score)) => {
                tracing::info!(worker = %worker.name, score, "Selected least-loaded worker");
                Some(worker)
            }
            None => {
                tracing::warn!("No reachable workers");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::MetricsSnapshot;

    #[test]
    fn score_formula() {
        let w1 = MetricsSnapshot {
            cpu: 5.0,
            mem: 10.0,
            procs: 3,
        };
        let w2 = MetricsSnapshot {
            cpu: 80.0,
            mem: 70.0,
            procs: 120,
        };
        assert!((w1.score() - 7.0).abs() < 1e-9);
        assert!((w2.score() - 76.0).abs() < 1e-9);
        assert!(w1.score() < w2.score());
    }
}
