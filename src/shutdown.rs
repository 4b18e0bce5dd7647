use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler for the named daemon, listening for SIGTERM
/// and SIGINT.
///
/// Returns a `CancellationToken` cancelled when either signal arrives. Accept
/// loops, the master link and timers observe the token; running launcher
/// children are deliberately left alone, their rows stay `running` for
/// external reconciliation.
pub fn install_shutdown_handler(daemon: &'static str) -> CancellationToken {
    let token = CancellationToken::new();
    let handler_token = token.clone();

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(daemon, error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(daemon, error = %e, "failed to install SIGINT handler");
                return;
            }
        };

        let received = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(daemon, signal = received, "shutting down");
        handler_token.cancel();
    });

    token
}
