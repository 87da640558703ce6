//! Signal handling for graceful shutdown.

use tokio::sync::broadcast;
use tracing::info;
#[cfg(windows)]
use tracing::warn;

#[cfg(unix)]
#[allow(clippy::expect_used)] // Signal handlers are startup-critical; abort is correct on failure
pub fn install_signal_handlers(
    shutdown_tx: broadcast::Sender<()>,
) -> impl std::future::Future<Output = ()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");

    async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!(target: "strata::shutdown", "SIGTERM received, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                info!(target: "strata::shutdown", "SIGINT received, initiating graceful shutdown");
            }
        }
        let _ = shutdown_tx.send(());
    }
}

#[cfg(windows)]
pub async fn install_signal_handlers(shutdown_tx: broadcast::Sender<()>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(target: "strata::shutdown", error = %e, "Failed to listen for Ctrl+C");
        return;
    }

    info!(target: "strata::shutdown", "Ctrl+C received, initiating graceful shutdown");
    let _ = shutdown_tx.send(());
}
