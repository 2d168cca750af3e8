//! Periodic eviction of stale guard state

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// State that can be pruned on a timer
pub trait Sweep: Send + Sync {
    /// Short name for log lines
    fn name(&self) -> &'static str;

    /// Evict stale entries, returning how many were removed
    fn sweep(&self) -> usize;
}

/// Owned background task sweeping every registered [`Sweep`] on an interval
///
/// The task runs until [`shutdown`](Self::shutdown) is awaited or the sweeper
/// is dropped.
pub struct Sweeper {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Spawn the sweep task on the current runtime
    ///
    /// The first sweep happens one `interval` after spawning.
    #[must_use]
    pub fn spawn(targets: Vec<Arc<dyn Sweep>>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for target in &targets {
                            let evicted = target.sweep();
                            if evicted > 0 {
                                debug!(target = target.name(), count = evicted, "Swept stale entries");
                            }
                        }
                    }
                    () = token.cancelled() => {
                        debug!("Sweeper shutting down");
                        break;
                    }
                }
            }
        });

        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Stop the task and wait for it to finish
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Sweeper task ended abnormally");
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
