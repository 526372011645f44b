//! Signal trap and connection drain.
//!
//! - `SIGHUP` → reload: spawn the next generation with the live listeners
//! - `SIGINT` / `SIGTERM` → stop accepting, drain, close listeners, exit
//!
//! Handlers are registered once at startup so no signal arriving between
//! two waits is lost.

use std::time::Duration;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// What a trapped signal asks the server to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapSignal {
    Reload,
    Terminate,
}

/// Registered handlers for the signals the server reacts to.
pub struct Trap {
    hangup: Signal,
    interrupt: Signal,
    terminate: Signal,
}

impl Trap {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next trapped signal.
    pub async fn next(&mut self) -> TrapSignal {
        tokio::select! {
            _ = self.hangup.recv() => {
                info!("Received SIGHUP");
                TrapSignal::Reload
            }
            _ = self.interrupt.recv() => {
                info!("Received SIGINT");
                TrapSignal::Terminate
            }
            _ = self.terminate.recv() => {
                info!("Received SIGTERM");
                TrapSignal::Terminate
            }
        }
    }
}

/// Tracks in-flight connections and tells accept loops when to stop.
#[derive(Clone)]
pub struct Drain {
    stop: CancellationToken,
    tracker: TaskTracker,
    timeout: Duration,
}

impl Drain {
    pub fn new(timeout: Duration) -> Self {
        Self {
            stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
            timeout,
        }
    }

    /// Token cancelled when accept loops must stop.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Run a connection handler as a tracked task.
    pub fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    pub fn active_connections(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting and wait for tracked connections, up to the timeout.
    ///
    /// Returns `true` if everything drained in time.
    pub async fn shutdown(&self) -> bool {
        self.stop.cancel();
        self.tracker.close();

        let active = self.active_connections();
        if active == 0 {
            info!("No active connections, drain complete");
            return true;
        }

        info!(
            active_connections = active,
            timeout_secs = self.timeout.as_secs(),
            "Draining active connections"
        );
        match tokio::time::timeout(self.timeout, self.tracker.wait()).await {
            Ok(()) => {
                info!("All connections drained cleanly");
                true
            }
            Err(_) => {
                warn!(
                    remaining_connections = self.active_connections(),
                    "Drain timeout expired"
                );
                false
            }
        }
    }
}
