//! Configuration module for NetWarden.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "netwarden.db")
    pub db_path: String,
    /// Probes in flight during a fleet check (default: 16)
    pub workers: usize,
    /// Seconds between scheduled fleet checks, 0 disables them (default: 60)
    pub check_interval: Duration,
    /// Per-packet ICMP wait and TCP connect timeout (default: 1s)
    pub probe_timeout: Duration,
    /// Hard per-probe deadline (default: 10s)
    pub probe_deadline: Duration,
    /// ICMP packets per device in fleet checks (default: 1)
    pub bulk_ping_count: u32,
    /// ICMP packets for manual checks (default: 4)
    pub manual_ping_count: u32,
    /// Days of probe history to keep, 0 keeps everything (default: 30)
    pub retention_days: u32,
    /// Webhook that receives notifications; unset means log only
    pub webhook_url: Option<String>,
    /// Capacity of the notification delivery queue (default: 1024)
    pub notify_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "netwarden.db".to_string(),
            workers: 16,
            check_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_millis(1000),
            probe_deadline: Duration::from_millis(10_000),
            bulk_ping_count: 1,
            manual_ping_count: 4,
            retention_days: 30,
            webhook_url: None,
            notify_queue: 1024,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `NETWARDEN_HTTP_PORT`: HTTP port (default: 8080)
    /// - `NETWARDEN_DB_PATH`: Database file path (default: "netwarden.db")
    /// - `NETWARDEN_WORKERS`: Fleet check worker pool size, 1-256 (default: 16)
    /// - `NETWARDEN_CHECK_INTERVAL`: Seconds between fleet checks (default: 60)
    /// - `NETWARDEN_PROBE_TIMEOUT_MS`: Per-packet/connect timeout (default: 1000)
    /// - `NETWARDEN_PROBE_DEADLINE_MS`: Hard per-probe deadline (default: 10000)
    /// - `NETWARDEN_BULK_PING_COUNT`: Packets per fleet probe (default: 1)
    /// - `NETWARDEN_MANUAL_PING_COUNT`: Packets per manual probe (default: 4)
    /// - `NETWARDEN_RETENTION_DAYS`: Probe history retention (default: 30)
    /// - `NETWARDEN_WEBHOOK_URL`: Notification webhook (default: unset)
    /// - `NETWARDEN_NOTIFY_QUEUE`: Notification queue capacity (default: 1024)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(port) = parsed(&lookup, "NETWARDEN_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Some(db_path) = lookup("NETWARDEN_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(workers) = parsed::<usize>(&lookup, "NETWARDEN_WORKERS") {
            cfg.workers = workers.clamp(1, 256);
        }

        if let Some(secs) = parsed(&lookup, "NETWARDEN_CHECK_INTERVAL") {
            cfg.check_interval = Duration::from_secs(secs);
        }

        if let Some(ms) = parsed::<u64>(&lookup, "NETWARDEN_PROBE_TIMEOUT_MS") {
            cfg.probe_timeout = Duration::from_millis(ms.max(1));
        }

        if let Some(ms) = parsed::<u64>(&lookup, "NETWARDEN_PROBE_DEADLINE_MS") {
            cfg.probe_deadline = Duration::from_millis(ms.max(1));
        }

        if let Some(count) = parsed::<u32>(&lookup, "NETWARDEN_BULK_PING_COUNT") {
            cfg.bulk_ping_count = count.clamp(1, 20);
        }

        if let Some(count) = parsed::<u32>(&lookup, "NETWARDEN_MANUAL_PING_COUNT") {
            cfg.manual_ping_count = count.clamp(1, 20);
        }

        if let Some(days) = parsed(&lookup, "NETWARDEN_RETENTION_DAYS") {
            cfg.retention_days = days;
        }

        if let Some(url) = lookup("NETWARDEN_WEBHOOK_URL").filter(|u| !u.trim().is_empty()) {
            cfg.webhook_url = Some(url);
        }

        if let Some(capacity) = parsed::<usize>(&lookup, "NETWARDEN_NOTIFY_QUEUE") {
            cfg.notify_queue = capacity.max(1);
        }

        cfg
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let value = lookup(key)?;
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid value for {}: {:?}", key, value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "netwarden.db");
        assert_eq!(cfg.workers, 16);
        assert_eq!(cfg.bulk_ping_count, 1);
        assert!(cfg.webhook_url.is_none());
    }

    #[test]
    fn test_overrides_and_clamping() {
        let vars: HashMap<&str, &str> = [
            ("NETWARDEN_HTTP_PORT", "9090"),
            ("NETWARDEN_WORKERS", "1000"),
            ("NETWARDEN_PROBE_DEADLINE_MS", "2500"),
            ("NETWARDEN_CHECK_INTERVAL", "not-a-number"),
            ("NETWARDEN_WEBHOOK_URL", "http://hooks.local/notify"),
        ]
        .into_iter()
        .collect();

        let cfg = ServerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.workers, 256);
        assert_eq!(cfg.probe_deadline, Duration::from_millis(2500));
        assert_eq!(cfg.check_interval, Duration::from_secs(60));
        assert_eq!(cfg.webhook_url.as_deref(), Some("http://hooks.local/notify"));
    }
}
