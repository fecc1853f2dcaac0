//! Device health monitoring engine.
//!
//! Drives each selected device through probe, parse, classify, transition
//! logging and notification, then persists its new status. Devices are
//! checked on a bounded worker pool; the status read and write for one
//! device are serialized by a per-device lock.

mod classify;
mod notify;
mod transition;
mod uptime;

pub use classify::*;
pub use notify::*;
pub use transition::*;
pub use uptime::*;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::ServerConfig;
use crate::db::{
    DbError, Device, DeviceSelector, DeviceStatus, DeviceStatusUpdate, ProbeRecord, StatusLogEntry, Store,
};
use crate::probe::{parse_ping_output, ProbeError, ProbeMode, Prober, RawProbe};

const NO_ADDRESS_DETAIL: &str = "No address configured; device not checked.";

/// Monitor error types.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("device {0} not found")]
    DeviceNotFound(i64),
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),
    #[error("probe facility unavailable: {0}")]
    ProbeFacilityUnavailable(String),
    #[error("persistence error: {0}")]
    Persistence(#[from] DbError),
}

/// Tuning for fleet checks.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Maximum probes in flight during a fleet check.
    pub workers: usize,
    /// Hard limit on a single probe, after which it counts as failed.
    pub probe_deadline: Duration,
    /// ICMP packets per device in fleet checks.
    pub bulk_ping_count: u32,
    /// ICMP packets for an ad-hoc single-device check.
    pub manual_ping_count: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            probe_deadline: Duration::from_secs(10),
            bulk_ping_count: 1,
            manual_ping_count: 4,
        }
    }
}

impl From<&ServerConfig> for MonitorConfig {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            workers: cfg.workers,
            probe_deadline: cfg.probe_deadline,
            bulk_ping_count: cfg.bulk_ping_count,
            manual_ping_count: cfg.manual_ping_count,
        }
    }
}

/// Result of checking one device.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub device_id: i64,
    pub device_name: String,
    pub status: DeviceStatus,
    pub previous_status: DeviceStatus,
    pub detail: String,
    pub transitioned: bool,
    pub last_seen: Option<chrono::DateTime<Utc>>,
    pub avg_time: Option<f64>,
    pub ttl: Option<i64>,
    pub raw_output: String,
}

impl CheckReport {
    fn unprobed(device: &Device) -> Self {
        Self {
            device_id: device.id,
            device_name: device.name.clone(),
            status: DeviceStatus::Unknown,
            previous_status: device.status,
            detail: NO_ADDRESS_DETAIL.to_string(),
            transitioned: false,
            last_seen: device.last_seen,
            avg_time: None,
            ttl: None,
            raw_output: String::new(),
        }
    }
}

/// Per-device entry of a fleet check.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum DeviceOutcome {
    Checked(CheckReport),
    Skipped(CheckReport),
    Failed {
        device_id: i64,
        device_name: String,
        error: String,
    },
}

impl DeviceOutcome {
    fn device_id(&self) -> i64 {
        match self {
            DeviceOutcome::Checked(r) | DeviceOutcome::Skipped(r) => r.device_id,
            DeviceOutcome::Failed { device_id, .. } => *device_id,
        }
    }
}

/// Aggregate result of a fleet check.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FleetReport {
    pub checked_count: usize,
    pub transition_count: usize,
    pub failed_count: usize,
    pub results: Vec<DeviceOutcome>,
}

/// Everything derived from one probe before anything is persisted.
struct Observation {
    success: bool,
    classification: Classification,
    packet_loss: f64,
    min_time: f64,
    avg_time: f64,
    max_time: f64,
    ttl: Option<i64>,
    raw_output: String,
}

/// Per-device mutual exclusion for the status read-compare-write.
#[derive(Clone, Default)]
struct DeviceLocks {
    inner: Arc<Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>>,
}

impl DeviceLocks {
    fn get(&self, device_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(device_id).or_default().clone()
    }
}

fn has_address(device: &Device) -> bool {
    !device.address.trim().is_empty()
}

/// The health monitoring engine.
#[derive(Clone)]
pub struct Monitor {
    store: Arc<Store>,
    prober: Arc<dyn Prober>,
    gate: NotificationGate,
    config: MonitorConfig,
    locks: DeviceLocks,
}

impl Monitor {
    pub fn new(store: Arc<Store>, prober: Arc<dyn Prober>, gate: NotificationGate, config: MonitorConfig) -> Self {
        Self {
            store,
            prober,
            gate,
            config,
            locks: DeviceLocks::default(),
        }
    }

    /// All devices with their last persisted status.
    pub fn devices(&self) -> Result<Vec<Device>, MonitorError> {
        Ok(self.store.get_devices()?)
    }

    /// Check a single device with the manual packet count.
    ///
    /// Runs regardless of the device's enabled flag.
    pub async fn check_one(&self, device_id: i64) -> Result<CheckReport, MonitorError> {
        let device = self.load_device(device_id)?;
        if !has_address(&device) {
            return Ok(CheckReport::unprobed(&device));
        }
        self.check_device(&device, self.config.manual_ping_count).await
    }

    /// Check every enabled device matching `selector`.
    ///
    /// One device's failure never affects another's result.
    pub async fn check_many(&self, selector: &DeviceSelector) -> Result<FleetReport, MonitorError> {
        let devices = self.store.select_devices(selector)?;
        tracing::info!("Checking {} devices with {} workers", devices.len(), self.config.workers);

        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks = JoinSet::new();

        for device in devices {
            let monitor = self.clone();
            let semaphore = semaphore.clone();
            let count = self.config.bulk_ping_count;

            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(e) => {
                        return DeviceOutcome::Failed {
                            device_id: device.id,
                            device_name: device.name,
                            error: e.to_string(),
                        }
                    }
                };

                if !has_address(&device) {
                    return DeviceOutcome::Skipped(CheckReport::unprobed(&device));
                }

                match monitor.check_device(&device, count).await {
                    Ok(report) => DeviceOutcome::Checked(report),
                    Err(e) => {
                        tracing::warn!("Check failed for {}: {}", device.name, e);
                        DeviceOutcome::Failed {
                            device_id: device.id,
                            device_name: device.name,
                            error: e.to_string(),
                        }
                    }
                }
            });
        }

        let mut report = FleetReport::default();
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("Device check task aborted: {}", e);
                    report.failed_count += 1;
                    continue;
                }
            };

            match &outcome {
                DeviceOutcome::Checked(r) => {
                    report.checked_count += 1;
                    if r.transitioned {
                        report.transition_count += 1;
                    }
                }
                DeviceOutcome::Skipped(_) => {}
                DeviceOutcome::Failed { .. } => report.failed_count += 1,
            }
            report.results.push(outcome);
        }

        report.results.sort_by_key(DeviceOutcome::device_id);
        tracing::info!(
            "Fleet check complete: {} checked, {} transitions, {} failed",
            report.checked_count,
            report.transition_count,
            report.failed_count
        );
        Ok(report)
    }

    /// Availability of a device over a trailing window.
    pub fn uptime(&self, device_id: i64, window: UptimeWindow) -> Result<UptimeReport, MonitorError> {
        self.load_device(device_id)?;
        Ok(device_uptime(&self.store, device_id, window, Utc::now())?)
    }

    /// Most recent status transitions of a device, newest first.
    pub fn status_log(&self, device_id: i64, limit: i64) -> Result<Vec<StatusLogEntry>, MonitorError> {
        self.load_device(device_id)?;
        Ok(self.store.get_status_log(device_id, limit)?)
    }

    fn load_device(&self, device_id: i64) -> Result<Device, MonitorError> {
        self.store.get_device(device_id).map_err(|e| match e {
            DbError::NotFound => MonitorError::DeviceNotFound(device_id),
            other => MonitorError::Persistence(other),
        })
    }

    async fn check_device(&self, device: &Device, count: u32) -> Result<CheckReport, MonitorError> {
        let observation = self.observe(device, count).await?;
        self.record(device, observation).await
    }

    /// Probe, parse and classify without touching the store.
    async fn observe(&self, device: &Device, count: u32) -> Result<Observation, MonitorError> {
        let deadline = self.config.probe_deadline;
        let attempt = tokio::time::timeout(deadline, self.prober.probe(&device.address, device.probe_mode, count)).await;

        let raw = match attempt {
            Ok(Ok(raw)) => raw,
            Ok(Err(ProbeError::InvalidAddress(address))) => return Err(MonitorError::InvalidAddress(address)),
            Ok(Err(ProbeError::FacilityUnavailable(msg))) => return Err(MonitorError::ProbeFacilityUnavailable(msg)),
            Ok(Err(e)) => RawProbe::failed(e.to_string()),
            Err(_) => RawProbe::failed(format!("probe exceeded deadline of {:?}", deadline)),
        };

        let observation = match device.probe_mode {
            ProbeMode::Icmp => {
                let metrics = parse_ping_output(&raw.output);
                let classification = classify_ping(raw.success, &metrics, &device.thresholds);
                Observation {
                    success: raw.success,
                    classification,
                    packet_loss: metrics.packet_loss,
                    min_time: metrics.min_time,
                    avg_time: metrics.avg_time,
                    max_time: metrics.max_time,
                    ttl: metrics.ttl,
                    raw_output: raw.output,
                }
            }
            ProbeMode::TcpPort(_) => {
                let elapsed = if raw.success { raw.elapsed_ms } else { None };
                let time = elapsed.unwrap_or_default();
                Observation {
                    success: raw.success,
                    classification: classify_port(raw.success, elapsed),
                    packet_loss: if raw.success { 0.0 } else { 100.0 },
                    min_time: time,
                    avg_time: time,
                    max_time: time,
                    ttl: None,
                    raw_output: raw.output,
                }
            }
        };

        Ok(observation)
    }

    /// Persist the probe and the device's new status with its transition,
    /// then notify once that has committed.
    async fn record(&self, device: &Device, obs: Observation) -> Result<CheckReport, MonitorError> {
        let now = Utc::now();

        self.store.add_probe_record(&ProbeRecord {
            id: 0,
            device_id: device.id,
            address: device.address.clone(),
            success: obs.success,
            packet_loss: obs.packet_loss,
            min_time: obs.min_time,
            avg_time: obs.avg_time,
            max_time: obs.max_time,
            raw_output: obs.raw_output.clone(),
            time: now,
        })?;

        let lock = self.locks.get(device.id);
        let _guard = lock.lock().await;

        let current = self.store.get_device(device.id)?;
        let previous = current.status;
        let status = obs.classification.status;

        let update = if status == DeviceStatus::Offline {
            DeviceStatusUpdate {
                status,
                last_seen: current.last_seen,
                last_avg_time: None,
                last_ttl: None,
            }
        } else {
            DeviceStatusUpdate {
                status,
                last_seen: Some(now),
                last_avg_time: Some(obs.avg_time),
                last_ttl: obs.ttl,
            }
        };

        let logged = match log_transition(&self.store, device.id, previous, &obs.classification, &update, now) {
            Ok(logged) => logged,
            Err(e) => {
                tracing::error!("Failed to persist status for {}: {}", device.name, e);
                return Err(e.into());
            }
        };

        let transitioned = logged.is_some();
        if transitioned {
            tracing::info!("{} changed from {} to {}: {}", device.name, previous, status, obs.classification.detail);
            self.gate.emit(&self.store, &current, previous, status, &obs.classification.detail);
        }

        Ok(CheckReport {
            device_id: device.id,
            device_name: device.name.clone(),
            status,
            previous_status: previous,
            detail: obs.classification.detail,
            transitioned,
            last_seen: update.last_seen,
            avg_time: update.last_avg_time,
            ttl: update.last_ttl,
            raw_output: obs.raw_output,
        })
    }
}
