//! Foreground refresh
//!
//! While the app is in the foreground, recovery status and sweep need are
//! refreshed on an interval and whenever the UI asks. Nothing depends on the
//! refresher for correctness: every operation reconciles on its own.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::recovery::RecoveryService;
use crate::sweep::SweepService;

/// Periodic re-poll of recovery and sweep state
pub struct ForegroundRefresher {
    recovery: Arc<RecoveryService>,
    sweep: Option<Arc<SweepService>>,
    interval: Duration,
}

/// Handle to a running refresher
pub struct RefresherHandle {
    cancel: CancelToken,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ForegroundRefresher {
    /// Refresh `recovery` every `interval`
    pub fn new(recovery: Arc<RecoveryService>, interval: Duration) -> Self {
        Self {
            recovery,
            sweep: None,
            interval,
        }
    }

    /// Also re-check sweeps
    pub fn with_sweep(mut self, sweep: Arc<SweepService>) -> Self {
        self.sweep = Some(sweep);
        self
    }

    /// One refresh pass; failures are logged and left for the next pass
    pub async fn refresh_once(&self) {
        match self.recovery.poll().await {
            Ok(status) => debug!(
                "Foreground refresh: recovery {} ({:?})",
                status.state.name(),
                status.event
            ),
            Err(e) => warn!("Foreground recovery poll failed: {}", e),
        }

        if let Some(sweep) = &self.sweep {
            if let Err(e) = sweep.check_for_sweeps().await {
                warn!("Foreground sweep check failed: {}", e);
            }
        }
    }

    /// Run until the handle is stopped
    pub fn spawn(self) -> RefresherHandle {
        let cancel = CancelToken::new();
        let wake = Arc::new(Notify::new());
        let task_cancel = cancel.clone();
        let task_wake = Arc::clone(&wake);

        let task = tokio::spawn(async move {
            loop {
                self.refresh_once().await;
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = task_wake.notified() => {}
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
            debug!("Foreground refresher stopped");
        });

        RefresherHandle { cancel, wake, task }
    }
}

impl RefresherHandle {
    /// Refresh now instead of waiting for the interval
    pub fn refresh_now(&self) {
        self.wake.notify_one();
    }

    /// Stop refreshing and wait for the task to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Foreground refresher task failed: {}", e);
        }
    }
}
