//! Supervisor shutdown.
//!
//! Waits for Ctrl-C, SIGTERM (unix) or an internal cancel, then tears down
//! in order: cancel the upstream loops, stop every child, and give the
//! upstream task a bounded drain before aborting it.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use botlink_children::ChildProcessManager;

/// What ended the wait in [`ShutdownCoordinator::wait_for_signal`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Ctrl-C / SIGINT.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// The token was cancelled from inside the process.
    Cancelled,
}

/// Owns the shutdown token and the teardown order.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    /// Coordinator that waits at most `drain_timeout` for the upstream task.
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            drain_timeout,
        }
    }

    /// Clone of the shutdown token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Block until a stop signal arrives or the token is cancelled.
    pub async fn wait_for_signal(&self) -> Result<StopReason> {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("Failed to listen for ctrl-c")?;
                Ok(StopReason::Interrupt)
            }
            res = terminate_signal() => {
                res.context("Failed to listen for SIGTERM")?;
                Ok(StopReason::Terminate)
            }
            () = self.token.cancelled() => Ok(StopReason::Cancelled),
        }
    }

    /// Cancel, stop the children, then drain `upstream`.
    pub async fn stop(&self, children: Option<&ChildProcessManager>, upstream: JoinHandle<()>) {
        self.token.cancel();
        if let Some(children) = children {
            children.stop_all().await;
        }

        let abort = upstream.abort_handle();
        if tokio::time::timeout(self.drain_timeout, upstream).await.is_err() {
            warn!(timeout = ?self.drain_timeout, "upstream did not stop in time, aborting");
            abort.abort();
        } else {
            info!("upstream stopped");
        }
    }
}

#[cfg(unix)]
async fn terminate_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate())?;
    let _ = term.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn terminate_signal() -> std::io::Result<()> {
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use botlink_children::{ManagerOptions, PortAllocator};
    use botlink_settings::{BotSettings, PortSettings};

    #[tokio::test]
    async fn internal_cancel_ends_the_wait() {
        let coord = ShutdownCoordinator::new(Duration::from_secs(1));
        coord.token().cancel();
        assert_eq!(coord.wait_for_signal().await.unwrap(), StopReason::Cancelled);
    }

    #[tokio::test]
    async fn stop_cancels_and_drains_upstream() {
        let coord = ShutdownCoordinator::new(Duration::from_secs(5));
        let token = coord.token();
        let upstream = tokio::spawn(async move { token.cancelled().await });

        coord.stop(None, upstream).await;
        assert!(coord.token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_upstream_is_aborted_after_drain_timeout() {
        let coord = ShutdownCoordinator::new(Duration::from_millis(100));
        let upstream = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(300)).await;
        });
        let started = tokio::time::Instant::now();

        coord.stop(None, upstream).await;
        assert!(coord.token().is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn stop_shuts_down_children_manager() {
        let children = ChildProcessManager::new(
            ManagerOptions::from_settings(&BotSettings::default()),
            Arc::new(PortAllocator::new(&PortSettings::default())),
        );
        let coord = ShutdownCoordinator::new(Duration::from_secs(1));
        let upstream = tokio::spawn(async {});

        coord.stop(Some(&children), upstream).await;
        assert!(children.list().is_empty());
    }
}
