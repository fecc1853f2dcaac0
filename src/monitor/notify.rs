//! Notification gate and delivery worker.
//!
//! The gate resolves subscribers for a transition and hands requests to a
//! bounded queue with `try_send`, so a slow delivery channel never holds up
//! a health check. Delivery failures are logged by the worker and go no
//! further.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::db::{Device, DeviceStatus, Store};

/// A request to tell one recipient about a status transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationRequest {
    pub recipient: String,
    pub device_id: i64,
    pub device_name: String,
    pub old_status: DeviceStatus,
    pub new_status: DeviceStatus,
    pub detail: String,
    pub time: DateTime<Utc>,
}

/// Delivery error types.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("endpoint rejected notification with status {0}")]
    Rejected(u16),
}

/// Delivers notification requests to their recipients.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, request: &NotificationRequest) -> Result<(), NotifyError>;
}

/// Notifier that only writes to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, request: &NotificationRequest) -> Result<(), NotifyError> {
        tracing::info!(
            recipient = %request.recipient,
            device = %request.device_name,
            "Notification: {} changed from {} to {}: {}",
            request.device_name,
            request.old_status,
            request.new_status,
            request.detail
        );
        Ok(())
    }
}

/// Notifier that POSTs each request as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, request: &NotificationRequest) -> Result<(), NotifyError> {
        let response = self.client.post(&self.url).json(request).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Decides who hears about a transition and enqueues their requests.
#[derive(Clone)]
pub struct NotificationGate {
    tx: mpsc::Sender<NotificationRequest>,
}

impl NotificationGate {
    /// Create a gate and the receiving end of its queue.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<NotificationRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Create a gate with a delivery worker already running.
    pub fn start(notifier: Arc<dyn Notifier>, capacity: usize) -> Self {
        let (gate, rx) = Self::new(capacity);
        tokio::spawn(run_delivery_worker(rx, notifier));
        gate
    }

    /// Enqueue one request per subscriber interested in `new_status`.
    ///
    /// Returns the number of requests queued. Never fails: lookup errors
    /// and a full queue are logged and dropped.
    pub fn emit(
        &self,
        store: &Store,
        device: &Device,
        old_status: DeviceStatus,
        new_status: DeviceStatus,
        detail: &str,
    ) -> usize {
        if new_status == DeviceStatus::Unknown || old_status == new_status {
            return 0;
        }

        let subscriptions = match store.get_subscriptions(device.id, new_status) {
            Ok(subs) => subs,
            Err(e) => {
                tracing::warn!("Failed to load subscriptions for {}: {}", device.name, e);
                return 0;
            }
        };

        let now = Utc::now();
        let mut queued = 0;

        for sub in subscriptions.into_iter().filter(|s| s.wants(new_status)) {
            let request = NotificationRequest {
                recipient: sub.recipient,
                device_id: device.id,
                device_name: device.name.clone(),
                old_status,
                new_status,
                detail: detail.to_string(),
                time: now,
            };

            match self.tx.try_send(request) {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(req)) => {
                    tracing::warn!("Notification queue full, dropping notification for {}", req.recipient);
                }
                Err(TrySendError::Closed(req)) => {
                    tracing::warn!("Notification worker stopped, dropping notification for {}", req.recipient);
                }
            }
        }

        queued
    }
}

/// Deliver queued requests until every gate is dropped.
pub async fn run_delivery_worker(mut rx: mpsc::Receiver<NotificationRequest>, notifier: Arc<dyn Notifier>) {
    while let Some(request) = rx.recv().await {
        if let Err(e) = notifier.deliver(&request).await {
            tracing::error!(
                "Failed to deliver notification for {} to {}: {}",
                request.device_name,
                request.recipient,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Subscription;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    fn setup() -> (NamedTempFile, Store, Device) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let mut device = Device {
            name: "edge-router".to_string(),
            address: "10.0.0.1".to_string(),
            ..Default::default()
        };
        store.add_device(&mut device).unwrap();

        let mut ops = Subscription {
            device_id: device.id,
            recipient: "ops@example.com".to_string(),
            notify_offline: true,
            notify_critical: true,
            ..Default::default()
        };
        let mut noc = Subscription {
            device_id: device.id,
            recipient: "noc@example.com".to_string(),
            notify_offline: true,
            notify_online: true,
            ..Default::default()
        };
        store.add_subscription(&mut ops).unwrap();
        store.add_subscription(&mut noc).unwrap();

        (tmp, store, device)
    }

    #[test]
    fn test_emits_per_interested_subscriber() {
        let (_tmp, store, device) = setup();
        let (gate, mut rx) = NotificationGate::new(16);

        let queued = gate.emit(&store, &device, DeviceStatus::Online, DeviceStatus::Offline, "down");
        assert_eq!(queued, 2);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.recipient, "ops@example.com");
        assert_eq!(first.old_status, DeviceStatus::Online);
        assert_eq!(first.new_status, DeviceStatus::Offline);
        assert_eq!(first.device_name, "edge-router");
        assert_eq!(rx.try_recv().unwrap().recipient, "noc@example.com");
        assert!(rx.try_recv().is_err());

        assert_eq!(gate.emit(&store, &device, DeviceStatus::Offline, DeviceStatus::Critical, "slow"), 1);
        assert_eq!(gate.emit(&store, &device, DeviceStatus::Online, DeviceStatus::Warning, "meh"), 0);
    }

    #[test]
    fn test_never_fires_without_change_or_for_unknown() {
        let (_tmp, store, device) = setup();
        let (gate, mut rx) = NotificationGate::new(16);

        assert_eq!(gate.emit(&store, &device, DeviceStatus::Offline, DeviceStatus::Offline, "still down"), 0);
        assert_eq!(gate.emit(&store, &device, DeviceStatus::Online, DeviceStatus::Unknown, "?"), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (_tmp, store, device) = setup();
        let (gate, _rx) = NotificationGate::new(1);

        let queued = gate.emit(&store, &device, DeviceStatus::Online, DeviceStatus::Offline, "down");
        assert_eq!(queued, 1);
    }

    struct RecordingNotifier {
        delivered: Mutex<Vec<NotificationRequest>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn deliver(&self, request: &NotificationRequest) -> Result<(), NotifyError> {
            self.delivered.lock().unwrap().push(request.clone());
            Err(NotifyError::Rejected(503))
        }
    }

    #[tokio::test]
    async fn test_worker_survives_delivery_failures() {
        let (_tmp, store, device) = setup();
        let notifier = Arc::new(RecordingNotifier {
            delivered: Mutex::new(Vec::new()),
        });
        let (gate, rx) = NotificationGate::new(16);
        let worker = tokio::spawn(run_delivery_worker(rx, notifier.clone()));

        gate.emit(&store, &device, DeviceStatus::Online, DeviceStatus::Offline, "down");
        drop(gate);
        worker.await.unwrap();

        assert_eq!(notifier.delivered.lock().unwrap().len(), 2);
    }
}
