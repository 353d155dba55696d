use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use drover::config::{MasterConfig, WorkerConfig, WorkerRegistry};
use drover::master::Master;
use drover::worker::{ShellLauncher, SystemControl, Worker};

#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(version)]
#[command(about = "A lightweight cluster controller for OS processes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a worker node
    Worker(WorkerArgs),

    /// Issue a master operation against the cluster
    Master {
        #[command(flatten)]
        cluster: ClusterArgs,

        #[command(subcommand)]
        command: MasterCommands,
    },
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value = "5001")]
    port: u16,

    /// Seconds a pending kill confirmation waits before aborting
    #[arg(long, default_value = "30")]
    confirm_timeout: u64,
}

#[derive(Parser, Debug)]
struct ClusterArgs {
    /// Worker registry (comma-separated, format: "name:host:port")
    /// Example: "Worker-1:127.0.0.1:5001,Worker-2:127.0.0.1:5002"
    #[arg(long, short = 'w')]
    workers: String,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "6")]
    timeout: u64,

    /// Command started on a migration target when the source process
    /// name cannot be resolved
    #[arg(long, default_value = "sleep 300")]
    fallback_command: String,
}

#[derive(clap::Subcommand, Debug)]
enum MasterCommands {
    /// Start a command on a worker
    Run {
        /// The command to execute (e.g., "sleep 300")
        command: String,

        /// Pick the least-loaded worker automatically
        #[arg(long)]
        auto: bool,

        /// Target a specific worker by name
        #[arg(long, conflicts_with = "auto")]
        worker: Option<String>,
    },
    /// Tracked-process status of one worker, or the whole cluster
    Status {
        /// Worker name; omit for all workers
        worker: Option<String>,
    },
    /// Load metrics of every worker
    Metrics,
    /// Terminate a process on whichever worker tracks it
    Kill {
        pid: u32,

        /// Answer a risky-kill confirmation prompt with yes
        #[arg(long)]
        yes: bool,
    },
    /// Move a running process to the least-loaded worker
    Migrate { pid: u32 },
    /// Send EXIT to a worker, ending that worker process
    Shutdown { worker: String },
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let config = WorkerConfig {
        listen_addr,
        confirm_timeout: Duration::from_secs(args.confirm_timeout),
        ..WorkerConfig::default()
    };

    let control = Arc::new(SystemControl::new());
    let launcher = Arc::new(ShellLauncher::new(control.clone(), config.discovery_window));

    tracing::info!(addr = %config.listen_addr, "Starting drover worker");
    let worker = Worker::bind(config, control, launcher).await?;
    worker.serve().await?;

    // serve() only returns after an in-band EXIT.
    tracing::info!("Worker exited");
    Ok(())
}

async fn run_master(
    cluster: ClusterArgs,
    command: MasterCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = WorkerRegistry::parse(&cluster.workers);
    if registry.is_empty() {
        return Err("no valid workers in --workers".into());
    }
    let master = Master::new(MasterConfig {
        registry,
        request_timeout: Duration::from_secs(cluster.timeout),
        fallback_command: cluster.fallback_command,
    });

    match command {
        MasterCommands::Run {
            command,
            auto,
            worker,
        } => {
            if auto {
                let report = master.run_auto(&command).await?;
                println!("Selected {}", report.worker);
                println!("[{}] {}", report.worker, report.response);
            } else if let Some(worker) = worker {
                let response = master.run_on(&worker, &command).await?;
                println!("[{worker}] {response}");
            } else {
                return Err("specify --auto or --worker <name>".into());
            }
        }
        MasterCommands::Status { worker } => match worker {
            Some(worker) => {
                let status = master.status(&worker).await?;
                println!("[{worker}]\n{status}");
            }
            None => {
                println!("=== Cluster Status ===");
                for (name, status) in master.status_all().await {
                    match status {
                        Some(body) => println!("\n[{name}]\n{body}"),
                        None => println!("\n[{name}] Unreachable"),
                    }
                }
            }
        },
        MasterCommands::Metrics => {
            println!("=== Worker Metrics ===");
            for (name, snapshot) in master.metrics_all().await {
                match snapshot {
                    Some(m) => println!(
                        "{name}: CPU={:.1}% MEM={:.1}% PROCS={} (score {:.2})",
                        m.cpu,
                        m.mem,
                        m.procs,
                        m.score()
                    ),
                    None => println!("{name}: Unreachable"),
                }
            }
        }
        MasterCommands::Kill { pid, yes } => {
            let response = master.kill(pid, yes).await?;
            println!("{response}");
        }
        MasterCommands::Migrate { pid } => {
            let report = master.migrate(pid).await?;
            match &report.owner {
                Some(owner) => println!("Owner: {owner}"),
                None => println!("Owner: not found (kill was broadcast best-effort)"),
            }
            if let Some(source) = &report.source_response {
                println!("[source] {source}");
            }
            match &report.resolved_name {
                Some(name) => println!("Restarted '{name}' on {}", report.target),
                None => println!("Name unavailable; ran fallback command on {}", report.target),
            }
            println!("[{}] {}", report.target, report.restart_response);
        }
        MasterCommands::Shutdown { worker } => {
            let response = master.shutdown_worker(&worker).await?;
            println!("[{worker}] {response}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Worker(worker_args) => run_worker(worker_args).await,
        Commands::Master { cluster, command } => run_master(cluster, command).await,
    }
}
