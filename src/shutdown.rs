use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on SIGTERM or SIGINT.
///
/// Callers watching it should kill their outstanding jobs and shut the batch
/// system down.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, killing outstanding jobs");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, killing outstanding jobs");
            }
        }

        token_clone.cancel();
    });

    Ok(token)
}
