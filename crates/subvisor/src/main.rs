// ABOUTME: subvisor CLI entry point.
// ABOUTME: Provides init, run, and socket client subcommands.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use subvisor::{
    run_control, run_daemon, run_init, run_list, run_watch, ClientOptions, DaemonOptions,
};
use subvisor_core::Action;

#[derive(Parser)]
#[command(name = "subvisor")]
#[command(about = "Supervise worker processes and broadcast their telemetry")]
struct Cli {
    /// Path to the registry config
    #[arg(long, global = true, env = "SUBVISOR_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the control socket
    #[arg(long, global = true, env = "SUBVISOR_SOCKET")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a sample registry config
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
    /// Run the supervisor daemon
    Run,
    /// List subprocesses with status and metrics
    List {
        #[arg(long)]
        json: bool,
    },
    /// Start a subprocess
    Start {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Stop a subprocess
    Stop {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Restart a subprocess
    Restart {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Stream status and metric events
    Watch {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (ignore errors if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    if matches!(cli.command, Commands::Run) {
        subvisor_log::init();
    } else {
        subvisor_log::init_for("subvisor");
    }

    let client = |json: bool| ClientOptions {
        socket_path: cli.socket.clone(),
        json,
    };

    match cli.command {
        Commands::Init { force } => run_init(cli.config.clone(), force).map(|_| ()),
        Commands::Run => {
            run_daemon(DaemonOptions {
                config_path: cli.config.clone(),
                socket_path: cli.socket.clone(),
            })
            .await
        }
        Commands::List { json } => run_list(client(json)).await,
        Commands::Start { id, json } => run_control(client(json), &id, Action::Start).await,
        Commands::Stop { id, json } => run_control(client(json), &id, Action::Stop).await,
        Commands::Restart { id, json } => run_control(client(json), &id, Action::Restart).await,
        Commands::Watch { json } => run_watch(client(json)).await,
    }
}
