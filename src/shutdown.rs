// Graceful shutdown handling for signal trapping

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared shutdown state across the orchestrator
///
/// Workers stop taking new items once shutdown is requested, and in-flight
/// agent runs are cancelled through [`ShutdownState::wait`].
#[derive(Clone)]
pub struct ShutdownState {
    /// Flag indicating shutdown has been requested
    shutdown_requested: Arc<AtomicBool>,
    /// Flag indicating cleanup has completed
    cleanup_complete: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownState {
    /// Create a new shutdown state
    pub fn new() -> Self {
        Self {
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            cleanup_complete: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Request a shutdown
    pub fn request_shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::SeqCst) {
            log::info!("Shutdown requested");
        }
        self.notify.notify_waiters();
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been requested
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_shutdown_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Mark cleanup as complete
    pub fn mark_cleanup_complete(&self) {
        self.cleanup_complete.store(true, Ordering::SeqCst);
        log::info!("Cleanup complete");
    }

    /// Check if cleanup is complete
    pub fn is_cleanup_complete(&self) -> bool {
        self.cleanup_complete.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

/// Register signal handlers for graceful shutdown
/// This sets up handlers for SIGINT (Ctrl+C), SIGTERM, and SIGHUP.
/// A second signal while cleanup is still running exits immediately.
#[cfg(unix)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])
        .map_err(|e| anyhow::anyhow!("Failed to register signal handlers: {}", e))?;

    thread::spawn(move || {
        for signal in signals.forever() {
            let name = match signal {
                SIGINT => "SIGINT (Ctrl+C)",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                _ => continue,
            };

            if state.is_shutdown_requested() && !state.is_cleanup_complete() {
                log::warn!("Received {} during shutdown, exiting immediately", name);
                std::process::exit(130);
            }

            log::info!("Received {}", name);
            state.request_shutdown();
        }
    });

    log::debug!("Signal handlers registered (SIGINT, SIGTERM, SIGHUP)");
    Ok(())
}

/// Register signal handlers for Windows
#[cfg(windows)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    ctrlc::set_handler(move || {
        if state.is_shutdown_requested() && !state.is_cleanup_complete() {
            log::warn!("Received Ctrl+C during shutdown, exiting immediately");
            std::process::exit(130);
        }
        log::info!("Received Ctrl+C");
        state.request_shutdown();
    })
    .map_err(|e| anyhow::anyhow!("Failed to register Ctrl+C handler: {}", e))?;

    log::debug!("Signal handler registered (Ctrl+C)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_shutdown_state_new() {
        let state = ShutdownState::new();
        assert!(!state.is_shutdown_requested());
        assert!(!state.is_cleanup_complete());
    }

    #[test]
    fn test_request_shutdown() {
        let state = ShutdownState::new();
        state.request_shutdown();
        assert!(state.is_shutdown_requested());

        // Requesting twice is harmless
        state.request_shutdown();
        assert!(state.is_shutdown_requested());
    }

    #[test]
    fn test_shutdown_state_clone() {
        let state1 = ShutdownState::new();
        let state2 = state1.clone();

        state1.request_shutdown();
        // Both should reflect the change since they share Arc
        assert!(state2.is_shutdown_requested());
    }

    #[test]
    fn test_mark_cleanup_complete() {
        let state = ShutdownState::new();
        state.mark_cleanup_complete();
        assert!(state.is_cleanup_complete());
    }

    #[tokio::test]
    async fn test_wait_returns_after_request() {
        let state = ShutdownState::new();
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        state.request_shutdown();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_already_requested() {
        let state = ShutdownState::new();
        state.request_shutdown();

        tokio::time::timeout(Duration::from_millis(100), state.wait())
            .await
            .expect("wait should not block");
    }
}
