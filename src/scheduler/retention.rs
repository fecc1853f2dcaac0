//! Retention manager for pruning old probe history.

use crate::db::Store;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

/// Manager for deleting probe records past the retention horizon.
pub struct RetentionManager {
    store: Arc<Store>,
    retention_days: u32,
    stop: Arc<Mutex<Option<broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, retention_days: u32) -> Self {
        Self {
            store,
            retention_days,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the retention background task. Does nothing when retention is 0.
    pub async fn start(&self) {
        if self.retention_days == 0 {
            tracing::info!("RetentionManager: keeping probe history forever");
            return;
        }

        let (tx, mut rx) = broadcast::channel(1);
        *self.stop.lock().await = Some(tx);

        let store = self.store.clone();
        let days = self.retention_days;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(&store, days);
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// Delete probe records older than `days`. Returns the number removed.
pub fn process_retention(store: &Store, days: u32) -> usize {
    let Some(cutoff) = Utc::now().checked_sub_signed(ChronoDuration::days(i64::from(days))) else {
        tracing::error!("RetentionManager: retention of {} days is out of range, nothing pruned", days);
        return 0;
    };

    match store.delete_probe_records_before(cutoff) {
        Ok(removed) => {
            if removed > 0 {
                tracing::info!("RetentionManager: pruned {} probe records older than {} days", removed, days);
            }
            removed
        }
        Err(e) => {
            tracing::error!("RetentionManager: Failed to prune probe records: {}", e);
            0
        }
    }
}
