use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Wait for SIGTERM or SIGINT and report which one arrived.
async fn wait_for_signal() -> &'static str {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}

/// Install the process shutdown handler.
///
/// Returns a `CancellationToken` cancelled on the first SIGTERM or SIGINT.
/// The dispatch loop and the monitor sweep watch this token and drain.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let signal_name = wait_for_signal().await;
        tracing::info!(signal = signal_name, "Shutdown signal received");
        token_clone.cancel();
    });

    token
}
