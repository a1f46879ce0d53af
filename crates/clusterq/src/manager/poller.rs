use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::manager::sync::StatusSynchronizer;

/// Background task that periodically refreshes job status until it is stopped.
pub(crate) struct Poller {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Poller {
    /// Must be called within a Tokio runtime.
    pub fn spawn(synchronizer: Arc<StatusSynchronizer>, period: Duration) -> Self {
        let token = CancellationToken::new();
        let handle = tokio::spawn(poll_process(synchronizer, period, token.clone()));
        Self { token, handle }
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_process(
    synchronizer: Arc<StatusSynchronizer>,
    period: Duration,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    log::debug!("Starting status polling every {period:?}");
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                synchronizer.synchronize(&[], true).await;
            }
        }
    }
    log::debug!("Status polling stopped");
}
