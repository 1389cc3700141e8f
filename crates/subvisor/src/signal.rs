// ABOUTME: Waits for the OS signals that should stop the daemon.
// ABOUTME: SIGINT, SIGTERM and SIGQUIT on unix; Ctrl-C elsewhere.

#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv() => tracing::debug!("SIGINT"),
        _ = sigterm.recv() => tracing::debug!("SIGTERM"),
        _ = sigquit.recv() => tracing::debug!("SIGQUIT"),
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
