use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on the first SIGTERM or SIGINT.
///
/// Handlers are registered before this returns, so a signal arriving while the
/// agent is still registering is not lost.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let sigterm = signal(SignalKind::terminate())?;
    let sigint = signal(SignalKind::interrupt())?;

    let trigger = token.clone();
    tokio::spawn(async move {
        let name = first_signal(sigterm, sigint).await;
        tracing::info!(signal = name, "Shutting down agent");
        trigger.cancel();
    });

    Ok(token)
}

async fn first_signal(mut sigterm: Signal, mut sigint: Signal) -> &'static str {
    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}
