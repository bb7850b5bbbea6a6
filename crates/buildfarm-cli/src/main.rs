//! Build farm operator CLI.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

use commands::ApiClient;

#[derive(Parser)]
#[command(name = "buildfarm")]
#[command(about = "Build farm operator CLI", long_about = None)]
struct Cli {
    /// Manager API URL
    #[arg(long, env = "BUILDFARM_API_URL", default_value = "http://localhost:8080")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and manage workers
    Workers {
        #[command(subcommand)]
        command: WorkerCommands,
    },
    /// Manage queue entries
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Queue, cancel and retry builds
    Builds {
        #[command(subcommand)]
        command: BuildCommands,
    },
    /// Validate a farm configuration
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "buildfarm.kdl")]
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum WorkerCommands {
    /// List all workers
    List,
    /// Take a worker out of service
    Disable {
        /// Worker name
        name: String,
        /// Why the worker is disabled
        #[arg(long)]
        reason: String,
    },
    /// Put a worker back into service
    Enable {
        /// Worker name
        name: String,
    },
}

#[derive(Subcommand)]
enum JobCommands {
    /// Set a job's score by hand
    Rescore {
        /// Job ID
        id: i64,
        /// New score
        score: i32,
    },
}

#[derive(Subcommand)]
enum BuildCommands {
    /// Queue a build from a JSON build spec
    Queue {
        /// Path to the build spec
        spec: PathBuf,
        /// Who asked for the build
        #[arg(long)]
        requested_by: Option<String>,
    },
    /// Cancel a build
    Cancel {
        /// Build ID
        id: i64,
    },
    /// Retry a failed build
    Retry {
        /// Build ID
        id: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let api = ApiClient::new(&cli.api_url);

    match cli.command {
        Commands::Workers { command } => match command {
            WorkerCommands::List => {
                commands::workers::list(&api).await?;
            }
            WorkerCommands::Disable { name, reason } => {
                commands::workers::disable(&api, &name, &reason).await?;
            }
            WorkerCommands::Enable { name } => {
                commands::workers::enable(&api, &name).await?;
            }
        },
        Commands::Jobs { command } => match command {
            JobCommands::Rescore { id, score } => {
                commands::jobs::rescore(&api, id, score).await?;
            }
        },
        Commands::Builds { command } => match command {
            BuildCommands::Queue { spec, requested_by } => {
                commands::builds::queue(&api, &spec, requested_by).await?;
            }
            BuildCommands::Cancel { id } => {
                commands::builds::cancel(&api, id).await?;
            }
            BuildCommands::Retry { id } => {
                commands::builds::retry(&api, id).await?;
            }
        },
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
    }

    Ok(())
}
