//! Shutdown signal handling.
//!
//! The workspace denies `unsafe_code`, which rules out a raw `libc`
//! signal handler; this waits on `tokio::signal`'s futures instead and
//! flips a [`CancellationToken`] that the rest of the agent already uses
//! for device shutdown.

use tokio_util::sync::CancellationToken;

/// Waits for SIGINT or SIGTERM and cancels `token` when either arrives.
///
/// Runs until cancellation (from either a caught signal or an external
/// cancel of `token` itself), so it is safe to race against the sync tick
/// in a `tokio::select!`.
pub async fn wait_for_shutdown(token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = token.cancelled() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::warn!(%err, "failed to install Ctrl+C handler");
            }
            tracing::info!("received interrupt signal, shutting down");
            token.cancel();
        }
        () = terminate => {
            tracing::info!("received terminate signal, shutting down");
            token.cancel();
        }
    }
}
