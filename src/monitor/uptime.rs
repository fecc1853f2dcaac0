//! Rolling-window availability from probe history.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

use crate::db::{DbError, ProbeCounts, Store};

/// A trailing time window such as `24h` or `7d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UptimeWindow {
    seconds: i64,
}

impl UptimeWindow {
    pub const DAY: UptimeWindow = UptimeWindow { seconds: 86_400 };
    pub const WEEK: UptimeWindow = UptimeWindow { seconds: 7 * 86_400 };

    pub fn duration(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.seconds)
    }
}

impl Default for UptimeWindow {
    fn default() -> Self {
        Self::DAY
    }
}

impl fmt::Display for UptimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.seconds % 86_400 == 0 {
            write!(f, "{}d", self.seconds / 86_400)
        } else if self.seconds % 3600 == 0 {
            write!(f, "{}h", self.seconds / 3600)
        } else {
            write!(f, "{}m", self.seconds / 60)
        }
    }
}

impl FromStr for UptimeWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let unit = s.chars().last().ok_or_else(|| "empty window".to_string())?;
        let value: i64 = s[..s.len() - unit.len_utf8()]
            .parse()
            .map_err(|_| format!("invalid window: {:?}", s))?;
        let unit_seconds = match unit {
            'm' => 60,
            'h' => 3600,
            'd' => 86_400,
            _ => return Err(format!("invalid window unit in {:?}, expected m, h or d", s)),
        };
        // Cap at ten years
        if value <= 0 || value > 3650 * 86_400 / unit_seconds {
            return Err(format!("window out of range: {:?}", s));
        }
        Ok(Self {
            seconds: value * unit_seconds,
        })
    }
}

/// Availability over a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UptimeReport {
    /// `None` when the window holds no probes.
    pub uptime_pct: Option<f64>,
    pub outage_count: i64,
    pub successful_samples: i64,
    pub total_samples: i64,
}

impl UptimeReport {
    pub fn from_counts(counts: ProbeCounts) -> Self {
        let total = counts.total.max(0);
        let successful = counts.successful.clamp(0, total);
        let uptime_pct = if total == 0 {
            None
        } else {
            let pct = successful as f64 / total as f64 * 100.0;
            Some((pct * 100.0).round() / 100.0)
        };

        Self {
            uptime_pct,
            outage_count: total - successful,
            successful_samples: successful,
            total_samples: total,
        }
    }
}

/// Compute availability for a device over the window ending at `now`.
pub fn device_uptime(
    store: &Store,
    device_id: i64,
    window: UptimeWindow,
    now: DateTime<Utc>,
) -> Result<UptimeReport, DbError> {
    let counts = store.count_probe_records(device_id, now - window.duration())?;
    Ok(UptimeReport::from_counts(counts))
}
