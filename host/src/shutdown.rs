use std::io;

use tokio::{
    signal::unix::{signal, SignalKind},
    sync::watch,
};
use tracing::info;

/// Installs SIGINT and SIGTERM handlers and returns a flag that turns `true`
/// on the first of either.
///
/// The handlers only flip the flag; whoever holds the receiver does the
/// actual teardown on its own task.
pub fn listen() -> io::Result<watch::Receiver<bool>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };
        info!(signal = name, "received termination signal, shutting down");
        let _ = tx.send(true);
        // Keep the sender alive so receivers see the flag rather than a
        // closed channel; later signals are absorbed by the handlers.
        tx.closed().await;
    });

    Ok(rx)
}
