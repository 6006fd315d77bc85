//! Cooperative shutdown: a watch channel flipped by the first termination
//! signal. Long-running loops check the flag between cycles, so a worker
//! always finishes supervising its current task before exiting.

use std::io;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;

/// Install SIGTERM/SIGINT/SIGHUP listeners and return the flag they flip.
///
/// Must be called from within a tokio runtime. Child runners never call
/// this; they keep the default signal disposition so the monitor's soft
/// kill terminates them.
pub fn shutdown_channel() -> io::Result<watch::Receiver<bool>> {
    let (tx, rx) = watch::channel(false);
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut hup = signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => info!("received SIGTERM, shutting down"),
            _ = int.recv() => info!("received SIGINT, shutting down"),
            _ = hup.recv() => info!("received SIGHUP, shutting down"),
        }
        let _ = tx.send(true);
    });

    Ok(rx)
}
