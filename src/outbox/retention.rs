use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::Result;
use crate::observability::get_metrics;
use crate::repositories::Store;

/// Background purge of delivered outbox tasks.
///
/// Failed tasks are never purged so they stay available for inspection.
pub struct RetentionJob {
    store: Arc<dyn Store>,
    retention: Duration,
    interval: std::time::Duration,
}

impl RetentionJob {
    pub fn new(store: Arc<dyn Store>, retention: Duration, interval: std::time::Duration) -> Self {
        Self {
            store,
            retention,
            interval,
        }
    }

    /// Deletes tasks that were completed more than `retention` before `now`.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let purged = self.store.purge_done_tasks(now - self.retention).await?;
        get_metrics().record_tasks_purged(purged);
        Ok(purged)
    }

    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match self.run_once_at(Utc::now()).await {
                            Ok(count) if count > 0 => info!("Purged {} delivered outbox tasks", count),
                            Ok(_) => {}
                            Err(e) => error!("Failed to purge delivered outbox tasks: {}", e),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
