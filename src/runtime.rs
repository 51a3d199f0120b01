//! Graceful shutdown coordination for the merge loop and the status server

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal;
use tokio::sync::watch;

/// Lightweight shutdown coordinator shared by the merge loop and the status
/// server. Cloning is cheap; every clone observes the same shutdown flag.
#[derive(Clone)]
pub struct MergerRuntime {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    fatal_error: Arc<AtomicBool>,
}

impl MergerRuntime {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shutdown_tx,
            shutdown_rx,
            fatal_error: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Receiver to watch for shutdown; clone this into background tasks.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Trigger a programmatic shutdown.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Trigger shutdown because of an unrecoverable error, e.g. store retries
    /// exhausted. The process exits non-zero in this case.
    pub fn trigger_fatal_shutdown(&self) {
        self.fatal_error.store(true, Ordering::Relaxed);
        self.trigger_shutdown();
    }

    pub fn is_fatal_shutdown(&self) -> bool {
        self.fatal_error.load(Ordering::Relaxed)
    }

    /// A future resolving on Ctrl+C or programmatic shutdown, suitable for
    /// `axum`'s `with_graceful_shutdown`.
    pub fn create_shutdown_future(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut shutdown_rx = self.shutdown_rx.clone();
        async move {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    log::info!("shutdown signal (Ctrl+C) received");
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        log::info!("shutdown triggered by background task");
                    }
                }
            }
        }
    }
}

impl Default for MergerRuntime {
    fn default() -> Self {
        Self::new()
    }
}
