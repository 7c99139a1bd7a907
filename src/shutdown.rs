use tokio::sync::watch;
use tracing::{info, warn};

/// Flip a watch channel to `true` on SIGTERM or SIGINT (Ctrl+C elsewhere).
///
/// The returned sender lets callers trigger the same shutdown themselves.
pub fn on_signal() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    let trigger = tx.clone();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = sigint.recv() => info!("Received SIGINT"),
                    }
                    let _ = trigger.send(true);
                });
            }
            (Err(e), _) | (_, Err(e)) => warn!("Signal handlers unavailable: {}", e),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C");
                let _ = trigger.send(true);
            }
        });
    }

    (tx, rx)
}

/// Resolve once `rx` reads `true` or its sender is gone.
pub async fn wait(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
