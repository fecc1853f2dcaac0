//! Scheduler module for periodic fleet checks and history retention.

mod retention;

pub use retention::*;

use crate::db::{DeviceSelector, Store};
use crate::monitor::Monitor;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

/// Runs fleet checks on a fixed interval.
pub struct Scheduler {
    monitor: Monitor,
    interval: Duration,
    stop: Arc<Mutex<Option<broadcast::Sender<()>>>>,
    retention_manager: Arc<RetentionManager>,
}

impl Scheduler {
    /// Create a scheduler. A zero `interval` disables scheduled checks.
    pub fn new(monitor: Monitor, store: Arc<Store>, interval: Duration, retention_days: u32) -> Self {
        Self {
            monitor,
            interval,
            stop: Arc::new(Mutex::new(None)),
            retention_manager: Arc::new(RetentionManager::new(store, retention_days)),
        }
    }

    /// Start the check loop and the retention manager.
    pub async fn start(&self) {
        self.retention_manager.start().await;

        if self.interval.is_zero() {
            tracing::info!("Scheduler: periodic fleet checks disabled");
            return;
        }

        let (tx, mut rx) = broadcast::channel(1);
        *self.stop.lock().await = Some(tx);

        let monitor = self.monitor.clone();
        let period = self.interval;
        tracing::info!("Scheduler: checking all devices every {:?}", period);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        if let Err(e) = monitor.check_many(&DeviceSelector::All).await {
                            tracing::error!("Scheduled fleet check failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Stop scheduled checks and retention.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop.lock().await.as_ref() {
            let _ = tx.send(());
        }
        self.retention_manager.stop().await;
    }
}
