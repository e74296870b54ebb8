use std::time::Duration;

use calcbridge_jobs::PriorityJobQueue;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

/// Periodically drops status-index entries whose job record has expired.
pub struct IndexPruneWorker {
    queue: PriorityJobQueue,
    interval: Duration,
}

impl IndexPruneWorker {
    pub fn new(queue: PriorityJobQueue, interval: Duration) -> Self {
        Self { queue, interval }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting index prune worker");

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.queue.prune_expired().await {
                        warn!(error = %e, "Failed to prune job indexes");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Index prune worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
