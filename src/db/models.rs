//! Database model types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::probe::ProbeMode;

/// Health status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Not yet probed. Never produced by classification.
    #[default]
    Unknown,
    Online,
    Warning,
    Critical,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Unknown => "unknown",
            DeviceStatus::Online => "online",
            DeviceStatus::Warning => "warning",
            DeviceStatus::Critical => "critical",
            DeviceStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(DeviceStatus::Unknown),
            "online" => Ok(DeviceStatus::Online),
            "warning" => Ok(DeviceStatus::Warning),
            "critical" => Ok(DeviceStatus::Critical),
            "offline" => Ok(DeviceStatus::Offline),
            other => Err(format!("unknown device status: {}", other)),
        }
    }
}

/// Optional per-device ceilings. Zero or negative values count as unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub warning_latency_ms: Option<f64>,
    pub warning_packetloss_pct: Option<f64>,
    pub critical_latency_ms: Option<f64>,
    pub critical_packetloss_pct: Option<f64>,
}

/// A monitored network device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub map_id: Option<i64>,
    pub probe_mode: ProbeMode,
    pub enabled: bool,
    #[serde(flatten)]
    pub thresholds: Thresholds,
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_avg_time: Option<f64>,
    pub last_ttl: Option<i64>,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            address: String::new(),
            map_id: None,
            probe_mode: ProbeMode::Icmp,
            enabled: true,
            thresholds: Thresholds::default(),
            status: DeviceStatus::Unknown,
            last_seen: None,
            last_avg_time: None,
            last_ttl: None,
        }
    }
}

/// The last-observed fields written back after a check.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatusUpdate {
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_avg_time: Option<f64>,
    pub last_ttl: Option<i64>,
}

/// Which devices a fleet check covers.
///
/// Scope is resolved by the caller; the engine never consults session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "lowercase")]
pub enum DeviceSelector {
    All,
    Map { map_id: i64 },
    Device { device_id: i64 },
    Devices { ids: Vec<i64> },
}

/// A single probe measurement.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeRecord {
    pub id: i64,
    pub device_id: i64,
    pub address: String,
    pub success: bool,
    pub packet_loss: f64,
    pub min_time: f64,
    pub avg_time: f64,
    pub max_time: f64,
    pub raw_output: String,
    pub time: DateTime<Utc>,
}

/// A recorded status transition.
#[derive(Debug, Clone, Serialize)]
pub struct StatusLogEntry {
    pub id: i64,
    pub device_id: i64,
    pub status: DeviceStatus,
    pub detail: String,
    pub time: DateTime<Utc>,
}

/// A recipient's interest in a device's status outcomes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub device_id: i64,
    pub recipient: String,
    pub notify_online: bool,
    pub notify_offline: bool,
    pub notify_warning: bool,
    pub notify_critical: bool,
}

impl Subscription {
    /// Whether this subscription asked to hear about `status`.
    pub fn wants(&self, status: DeviceStatus) -> bool {
        match status {
            DeviceStatus::Online => self.notify_online,
            DeviceStatus::Offline => self.notify_offline,
            DeviceStatus::Warning => self.notify_warning,
            DeviceStatus::Critical => self.notify_critical,
            DeviceStatus::Unknown => false,
        }
    }
}

/// Probe counts for a device over a time window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeCounts {
    pub total: i64,
    pub successful: i64,
}
