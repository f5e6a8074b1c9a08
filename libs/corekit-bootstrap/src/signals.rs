use anyhow::Result;
use tokio::signal;

/// Wait for termination signals (Ctrl+C, SIGTERM)
pub async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    let terminate = async {
        let mut handler = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        handler.recv().await;
        Ok::<(), std::io::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<std::io::Result<()>>();

    let source = tokio::select! {
        result = signal::ctrl_c() => result.map(|_| "Ctrl+C"),
        result = terminate => result.map(|_| "SIGTERM"),
    };

    match source {
        Ok(name) => {
            tracing::info!(signal = name, "Shutdown signal received, initiating graceful shutdown");
            Ok(())
        }
        Err(e) => {
            tracing::error!(%e, "Failed to listen for shutdown signals");
            Err(e.into())
        }
    }
}
