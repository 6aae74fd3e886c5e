mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use terraflow_cloud::Handle;

#[derive(Parser)]
#[command(name = "terraflow")]
#[command(about = "Inspect and repair terraflow workspaces", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the workspace handle of a resource
    Handle {
        /// Stable resource identifier, e.g. default/my-vpc
        resource_id: String,
    },
    /// Show the state of a resource's workspace
    Status {
        /// Stable resource identifier
        resource_id: String,
        /// Workspace root (defaults to the configured one)
        #[arg(long, env = "TERRAFLOW_WORKSPACE_ROOT")]
        root: Option<PathBuf>,
    },
    /// Remove an operation lock left behind by a crashed process
    Unlock {
        /// Stable resource identifier
        resource_id: String,
        /// Workspace root (defaults to the configured one)
        #[arg(long, env = "TERRAFLOW_WORKSPACE_ROOT")]
        root: Option<PathBuf>,
        /// Remove the lock even if its owner may still be running
        #[arg(long)]
        force: bool,
    },
    /// Run the configured provider plugin for manual tool invocations
    Provider,
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout is reserved for command output
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Handle { resource_id } => {
            println!("{}", Handle::new(&resource_id));
        }
        Commands::Status { resource_id, root } => {
            commands::status::handle(&resource_id, root)?;
        }
        Commands::Unlock {
            resource_id,
            root,
            force,
        } => {
            commands::unlock::handle(&resource_id, root, force)?;
        }
        Commands::Provider => {
            commands::provider::handle().await?;
        }
        Commands::Version => {
            println!("terraflow {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
