use std::net::SocketAddr;
use std::time::Duration;

/// A single worker entry in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDescriptor {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl WorkerDescriptor {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Static name -> (host, port) mapping, loaded once at startup and
/// immutable for the session. Iteration order is registration order and
/// is part of the scheduler/migration contract (ties and ownership
/// probes resolve to the earliest worker).
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    workers: Vec<WorkerDescriptor>,
}

impl WorkerRegistry {
    pub fn new(workers: Vec<WorkerDescriptor>) -> Self {
        Self { workers }
    }

    /// Parse a registry from a comma-separated list of `name:host:port`
    /// entries. Invalid entries are logged and skipped.
    pub fn parse(list: &str) -> Self {
        let workers = list
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .filter_map(|entry| {
                let parts: Vec<&str> = entry.trim().split(':').collect();
                if parts.len() == 3 {
                    let port: u16 = parts[2].parse().ok()?;
                    Some(WorkerDescriptor {
                        name: parts[0].to_string(),
                        host: parts[1].to_string(),
                        port,
                    })
                } else {
                    tracing::warn!(entry, "Invalid worker format, expected name:host:port");
                    None
                }
            })
            .collect();
        Self { workers }
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerDescriptor> {
        self.workers.iter()
    }

    pub fn get(&self, name: &str) -> Option<&WorkerDescriptor> {
        self.workers.iter().find(|w| w.name == name)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Master-side configuration.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub registry: WorkerRegistry,
    /// Per-request connect+read deadline on outbound worker calls.
    pub request_timeout: Duration,
    /// Command started on the migration target when the source process
    /// name could not be resolved.
    pub fallback_command: String,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            registry: WorkerRegistry::default(),
            request_timeout: Duration::from_secs(6),
            fallback_command: "sleep 300".to_string(),
        }
    }
}

/// Worker-side configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub listen_addr: SocketAddr,
    /// How long a pending kill confirmation may wait for its reply
    /// before the kill is aborted.
    pub confirm_timeout: Duration,
    /// Window granted to the PID discovery strategy after an
    /// interactive launch.
    pub discovery_window: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5001"
                .parse()
                .expect("default listen address is valid"),
            confirm_timeout: Duration::from_secs(30),
            discovery_window: Duration::from_secs(5),
        }
    }
}
