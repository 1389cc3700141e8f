// ABOUTME: subvisor daemon and socket client commands.
// ABOUTME: Re-exports for programmatic use of the control socket and daemon loop.

pub mod init;
pub mod render;
pub mod signal;
pub mod socket;

pub use init::run_init;
pub use socket::{EventStream, Request, Response, SocketClient, SocketCommand};
pub use subvisor_core::Config;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use subvisor_core::{Action, ProcessSupervisor};
use tokio::sync::mpsc;

/// Options for running the daemon
pub struct DaemonOptions {
    /// Path to the registry config
    pub config_path: Option<PathBuf>,
    /// Control socket path
    pub socket_path: Option<PathBuf>,
}

/// Options for the socket client commands
pub struct ClientOptions {
    pub socket_path: Option<PathBuf>,
    /// Print raw JSON instead of formatted text
    pub json: bool,
}

impl ClientOptions {
    fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(socket::default_socket_path)
    }
}

/// Resolve the config path from an explicit value or the default location.
pub fn resolve_config_path(config_path: Option<PathBuf>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(path),
        None => Config::default_path(),
    }
}

/// Run the supervisor daemon until SIGINT/SIGTERM.
pub async fn run_daemon(options: DaemonOptions) -> Result<()> {
    let config_path = resolve_config_path(options.config_path)?;
    let config = Config::load(&config_path)?;
    let registry = config.registry()?;
    tracing::info!(
        config = %config_path.display(),
        subprocesses = registry.len(),
        "Loaded registry"
    );

    let supervisor = Arc::new(ProcessSupervisor::new(registry, config.options()));

    let socket_path = options
        .socket_path
        .unwrap_or_else(socket::default_socket_path);
    let listener = socket::bind(&socket_path)?;

    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    tokio::spawn(async move {
        if let Err(e) = socket::run_socket_server(listener, cmd_tx).await {
            tracing::error!(error = %e, "Socket server error");
        }
    });

    let started = supervisor.start_autostart().await;
    if started > 0 {
        tracing::info!(started, "Autostarted subprocesses");
    }

    tokio::select! {
        _ = serve_commands(Arc::clone(&supervisor), cmd_rx) => {
            tracing::warn!("Command channel closed");
        }
        result = signal::wait_for_shutdown_signal() => {
            result.context("Failed to install signal handlers")?;
            tracing::info!("Shutdown signal received");
        }
    }

    supervisor.shutdown().await;
    let _ = std::fs::remove_file(&socket_path);
    tracing::info!("Daemon stopped");
    Ok(())
}

/// Control loop: answers socket commands until every sender is gone.
///
/// Control actions run on their own tasks so a slow `stop` on one id never
/// holds up other ids; the supervisor serializes actions on the same id.
pub async fn serve_commands(
    supervisor: Arc<ProcessSupervisor>,
    mut cmd_rx: mpsc::Receiver<SocketCommand>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            SocketCommand::List { reply } => {
                let _ = reply.send(supervisor.list());
            }
            SocketCommand::Control { id, action, reply } => {
                tracing::info!(id = %id, action = %action, "Control request");
                let supervisor = Arc::clone(&supervisor);
                tokio::spawn(async move {
                    let _ = reply.send(supervisor.control(&id, action).await);
                });
            }
            SocketCommand::Subscribe { reply } => {
                let _ = reply.send(supervisor.subscribe());
            }
        }
    }
}

/// `subvisor list`
pub async fn run_list(options: ClientOptions) -> Result<()> {
    let mut client = SocketClient::connect(&options.socket_path()).await?;
    let subprocesses = client.list().await?;
    if options.json {
        println!("{}", serde_json::to_string_pretty(&subprocesses)?);
    } else {
        print!("{}", render::table(&subprocesses));
    }
    Ok(())
}

/// `subvisor start|stop|restart <id>`
pub async fn run_control(options: ClientOptions, id: &str, action: Action) -> Result<()> {
    let mut client = SocketClient::connect(&options.socket_path()).await?;
    let info = client.control(id, action).await?;
    if options.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("{}", render::summary(&info));
    }
    Ok(())
}

/// `subvisor watch`: print events until the daemon goes away or Ctrl-C.
pub async fn run_watch(options: ClientOptions) -> Result<()> {
    let client = SocketClient::connect(&options.socket_path()).await?;
    let mut events = client.subscribe().await?;

    loop {
        tokio::select! {
            event = events.next_event() => match event? {
                Some(event) if options.json => println!("{}", serde_json::to_string(&event)?),
                Some(event) => println!("{}", render::event(&event)),
                None => {
                    eprintln!("Daemon closed the stream");
                    return Ok(());
                }
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}
