use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use taskmesh::config::{MasterConfig, WorkerConfig};
use taskmesh::gateway::RemoteRegistry;
use taskmesh::master::Master;
use taskmesh::rpc::{login, SessionRole};
use taskmesh::worker::WorkerRuntime;

#[derive(Parser, Debug)]
#[command(name = "taskmesh")]
#[command(version)]
#[command(about = "A master/worker cluster for divisible tasks")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a master node
    Master(MasterArgs),

    /// Start a worker process
    Worker(WorkerArgs),

    /// Task management commands
    Task {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: TaskCommands,
    },
}

#[derive(Parser, Debug)]
struct MasterArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:18800")]
    listen: SocketAddr,

    /// Shared secret workers and clients must present
    #[arg(long, default_value = "")]
    secret: String,

    /// Target size when batching queued work requests
    #[arg(long, default_value = "5")]
    batch_target: u32,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Master address
    #[arg(long, default_value = "127.0.0.1:18800")]
    master: SocketAddr,

    /// Key identifying this worker to the master
    #[arg(long, default_value = "worker-1")]
    key: String,

    /// Shared secret
    #[arg(long, default_value = "")]
    secret: String,
}

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Master address
    #[arg(long, short = 'a', default_value = "127.0.0.1:18800")]
    addr: String,

    /// Shared secret
    #[arg(long, default_value = "")]
    secret: String,
}

#[derive(clap::Subcommand, Debug)]
enum TaskCommands {
    /// Queue a task for execution
    Submit {
        /// Registered task key, e.g. "demo.echo"
        task_key: String,

        /// Task arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },

    /// Show the state of one task instance
    Status {
        task_id: Uuid,
    },

    /// List all task instances
    List,

    /// Show execution-time statistics
    Stats {
        #[arg(long)]
        task: Option<String>,

        #[arg(long)]
        subtask: Option<String>,

        #[arg(long)]
        worker: Option<String>,

        #[arg(long)]
        task_version: Option<String>,
    },
}

/// Token cancelled on SIGTERM or SIGINT. The serve loop and the worker's
/// reconnect loop both watch it and abandon pending timers when it fires.
fn shutdown_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let triggered = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        }
        triggered.cancel();
    });

    token
}

async fn client_call(client: &ClientArgs, method: &str, args: Value) -> Result<(), Box<dyn std::error::Error>> {
    let peer = login(
        &client.addr,
        "cli",
        &client.secret,
        SessionRole::Client,
        Arc::new(RemoteRegistry::new()),
        Duration::from_secs(5),
    )
    .await?;
    let result = peer.call(method, args).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
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
        Commands::Master(master_args) => {
            let config = MasterConfig::new(master_args.listen, master_args.secret)
                .with_batch_target(master_args.batch_target);
            let shutdown = shutdown_on_signal();
            Master::new(config).bind().await?.serve(shutdown).await?;
        }
        Commands::Worker(worker_args) => {
            let config = WorkerConfig::new(
                worker_args.master.to_string(),
                worker_args.key,
                worker_args.secret,
            );
            let shutdown = shutdown_on_signal();
            WorkerRuntime::new(config).run(shutdown).await;
        }
        Commands::Task { client, command } => match command {
            TaskCommands::Submit { task_key, args } => {
                let task_args: Value = serde_json::from_str(&args)?;
                client_call(
                    &client,
                    "submit_task",
                    json!({ "task_key": task_key, "args": task_args }),
                )
                .await?;
            }
            TaskCommands::Status { task_id } => {
                client_call(&client, "task_status", json!({ "task_id": task_id })).await?;
            }
            TaskCommands::List => {
                client_call(&client, "list_tasks", json!({})).await?;
            }
            TaskCommands::Stats {
                task,
                subtask,
                worker,
                task_version,
            } => {
                client_call(
                    &client,
                    "task_statistics",
                    json!({
                        "task_key": task,
                        "subtask_key": subtask,
                        "worker": worker,
                        "version": task_version,
                    }),
                )
                .await?;
            }
        },
    }

    Ok(())
}
