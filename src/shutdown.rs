use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancels `token` on SIGTERM or SIGINT.
///
/// If a handler cannot be installed the error is logged and only the
/// remaining signal (if any) is watched.
pub fn install_shutdown_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, shutting down");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT, shutting down");
                    }
                }
            }
            (Ok(mut only), Err(e)) | (Err(e), Ok(mut only)) => {
                tracing::warn!(error = %e, "Failed to install a signal handler");
                only.recv().await;
                tracing::info!("Received signal, shutting down");
            }
            (Err(e), Err(_)) => {
                tracing::error!(error = %e, "Failed to install signal handlers");
                return;
            }
        }

        token.cancel();
    });
}
