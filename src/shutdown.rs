//! Graceful shutdown coordination for the feed service.
//!
//! [`ShutdownSignal`] is shared between whoever owns the process lifecycle
//! and [`Engine::serve`](crate::engine::Engine::serve). Triggering it stops
//! the serve loop from accepting submissions; in-flight flows get
//! [`ShutdownSignal::timeout`] to settle.
//!
//! # Example
//!
//! ```rust,ignore
//! use synapse_sync::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! let serve = tokio::spawn(engine.clone().serve(receiver, shutdown.clone()));
//!
//! shutdown.wait().await; // Ctrl+C or SIGTERM
//! serve.await?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Default grace period for in-flight flows, in seconds.
const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

/// A cloneable shutdown flag with broadcast notification.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
    timeout: Duration,
}

impl ShutdownSignal {
    /// Create a signal with the default timeout (30 seconds).
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT))
    }

    /// Create a signal with a custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            triggered: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    /// Grace period for in-flight flows
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for SIGINT or SIGTERM, then trigger shutdown.
    ///
    /// If a handler cannot be installed, that signal source is ignored and
    /// the other one is still awaited.
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
            _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
        }

        self.fire();
    }

    /// Subscribe to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Whether shutdown has been triggered
    pub fn is_shutdown(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Trigger shutdown programmatically.
    pub fn trigger(&self) {
        info!("Shutdown triggered programmatically");
        self.fire();
    }

    /// Resolve once shutdown has been triggered, including before the call.
    pub async fn triggered(&self) {
        let mut receiver = self.sender.subscribe();
        if self.is_shutdown() {
            return;
        }
        let _ = receiver.recv().await;
    }

    fn fire(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        let _ = self.sender.send(());
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
