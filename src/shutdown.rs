//! Termination signalling.
//!
//! A [`ShutdownCoordinator`] is a one-way latch: once tripped it stays
//! tripped, and every waiter wakes. The orchestrator uses one to cut retry
//! pauses short, and the process uses one fed by [`SignalHandler`].

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Maximum time to wait for supervised tasks to unwind before aborting them.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shutdown coordinator shared by everything that must stop together.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    /// Watch channel for checking if shutdown is in progress.
    shutdown_watch: watch::Receiver<bool>,
    /// Internal sender for watch channel.
    shutdown_watch_tx: Arc<watch::Sender<bool>>,
    /// Flag indicating if shutdown has been initiated.
    is_shutting_down: Arc<AtomicBool>,
    /// Shutdown timeout.
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    /// Create a new shutdown coordinator with custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let (shutdown_watch_tx, shutdown_watch) = watch::channel(false);

        Self {
            shutdown_watch,
            shutdown_watch_tx: Arc::new(shutdown_watch_tx),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    /// Check if shutdown is in progress.
    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Initiate shutdown. Returns `false` if it was already initiated.
    pub fn shutdown(&self) -> bool {
        if self
            .is_shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.shutdown_watch_tx.send(true);
            return true;
        }
        false
    }

    /// Wait for shutdown signal (for use in select! macros).
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_watch.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Sleep for `duration` unless shutdown comes first.
    ///
    /// Returns `true` if the sleep was cut short by shutdown.
    pub async fn pause(&self, duration: Duration) -> bool {
        tokio::time::sleep(duration).with_shutdown(self).await.is_none()
    }

    /// Get shutdown timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Process signal listener.
pub struct SignalHandler {
    coordinator: ShutdownCoordinator,
}

impl SignalHandler {
    /// Create a new signal handler.
    pub fn new(coordinator: ShutdownCoordinator) -> Self {
        Self { coordinator }
    }

    /// Install signal handlers and wait for the first termination signal.
    #[cfg(unix)]
    pub async fn run(self) -> io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = sigquit.recv() => {
                info!("Received SIGQUIT");
            }
        }

        self.coordinator.shutdown();
        Ok(())
    }

    /// Install signal handlers (Windows version).
    #[cfg(windows)]
    pub async fn run(self) -> io::Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
        self.coordinator.shutdown();
        Ok(())
    }
}

/// Extension trait for futures to make them shutdown-aware.
pub trait ShutdownAware: Sized {
    /// Run until completion or shutdown signal.
    fn with_shutdown(
        self,
        coordinator: &ShutdownCoordinator,
    ) -> impl Future<Output = Option<Self::Output>> + Send
    where
        Self: Future + Send,
        Self::Output: Send;
}

impl<F> ShutdownAware for F
where
    F: Future + Send,
    F::Output: Send,
{
    async fn with_shutdown(self, coordinator: &ShutdownCoordinator) -> Option<F::Output> {
        tokio::select! {
            result = self => Some(result),
            _ = coordinator.wait_for_shutdown() => None,
        }
    }
}
