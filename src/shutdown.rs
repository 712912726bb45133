//! Coordinated shutdown for the service's long-running halves.
//!
//! The task dispatcher, the pool shrinker, and the web front-end each
//! subscribe for their own token; when SIGTERM or an interrupt arrives,
//! all of them fire and the subsystems drain: the dispatcher stops
//! pulling tasks, the shrinker finishes its sweep, and the web server
//! stops accepting connections. In-flight job drivers are not
//! interrupted; whatever they leave unfinished is redelivered by the
//! task queue on the next run.

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Fans one shutdown signal out to every subscribed subsystem.
pub struct Shutdown {
    root: CancellationToken,
}

impl Shutdown {
    /// Arm the signal watchers. Fails if a SIGTERM handler cannot be
    /// registered.
    pub fn listen() -> std::io::Result<Self> {
        let mut sigterm = signal(SignalKind::terminate())?;

        let root = CancellationToken::new();
        let trigger = root.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("SIGTERM received, draining");
                }
                result = tokio::signal::ctrl_c() => {
                    match result {
                        Ok(()) => tracing::info!("Interrupt received, draining"),
                        Err(err) => {
                            tracing::error!(error = %err, "Interrupt watcher failed, draining")
                        }
                    }
                }
            }
            trigger.cancel();
        });

        Ok(Self { root })
    }

    /// A cancellation token for one subsystem to watch.
    pub fn subscribe(&self) -> CancellationToken {
        self.root.child_token()
    }
}
