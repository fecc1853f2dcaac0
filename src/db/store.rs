//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const DEVICE_COLUMNS: &str = "id, name, address, map_id, probe_mode, enabled, \
     warning_latency_ms, warning_packetloss_pct, critical_latency_ms, critical_packetloss_pct, \
     status, last_seen, last_avg_time, last_ttl";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("database lock poisoned")]
    Poisoned,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Devices ---

    /// Add a new device and return its ID.
    pub fn add_device(&self, device: &mut Device) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO devices (name, address, map_id, probe_mode, enabled, warning_latency_ms, \
             warning_packetloss_pct, critical_latency_ms, critical_packetloss_pct, status, last_seen, \
             last_avg_time, last_ttl) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                device.name,
                device.address,
                device.map_id,
                device.probe_mode.to_string(),
                device.enabled,
                device.thresholds.warning_latency_ms,
                device.thresholds.warning_packetloss_pct,
                device.thresholds.critical_latency_ms,
                device.thresholds.critical_packetloss_pct,
                device.status.as_str(),
                device.last_seen.as_ref().map(format_db_time),
                device.last_avg_time,
                device.last_ttl,
            ],
        )?;
        let id = conn.last_insert_rowid();
        device.id = id;
        Ok(id)
    }

    /// Get a device by ID.
    pub fn get_device(&self, id: i64) -> Result<Device, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM devices WHERE id = ?1", DEVICE_COLUMNS),
            params![id],
            row_to_device,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Get all devices.
    pub fn get_devices(&self) -> Result<Vec<Device>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM devices ORDER BY id", DEVICE_COLUMNS))?;
        let devices = stmt
            .query_map([], row_to_device)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(devices)
    }

    /// Get the enabled devices matching a selector.
    pub fn select_devices(&self, selector: &DeviceSelector) -> Result<Vec<Device>, DbError> {
        let conn = self.conn()?;
        let devices = match selector {
            DeviceSelector::All => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM devices WHERE enabled = 1 ORDER BY id",
                    DEVICE_COLUMNS
                ))?;
                let rows = stmt.query_map([], row_to_device)?;
                rows.collect::<SqlResult<Vec<_>>>()?
            }
            DeviceSelector::Map { map_id } => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM devices WHERE enabled = 1 AND map_id = ?1 ORDER BY id",
                    DEVICE_COLUMNS
                ))?;
                let rows = stmt.query_map(params![map_id], row_to_device)?;
                rows.collect::<SqlResult<Vec<_>>>()?
            }
            DeviceSelector::Device { device_id } => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM devices WHERE enabled = 1 AND id = ?1",
                    DEVICE_COLUMNS
                ))?;
                let rows = stmt.query_map(params![device_id], row_to_device)?;
                rows.collect::<SqlResult<Vec<_>>>()?
            }
            DeviceSelector::Devices { ids } => {
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                let placeholders = vec!["?"; ids.len()].join(", ");
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM devices WHERE enabled = 1 AND id IN ({}) ORDER BY id",
                    DEVICE_COLUMNS, placeholders
                ))?;
                let rows = stmt.query_map(params_from_iter(ids.iter()), row_to_device)?;
                rows.collect::<SqlResult<Vec<_>>>()?
            }
        };
        Ok(devices)
    }

    /// Write back a device's status and, when given, append its transition
    /// log entry in the same transaction. Returns the new log entry's ID.
    pub fn commit_device_status(
        &self,
        id: i64,
        update: &DeviceStatusUpdate,
        transition: Option<&StatusLogEntry>,
    ) -> Result<Option<i64>, DbError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let log_id = match transition {
            Some(entry) => Some(insert_status_log(&tx, entry)?),
            None => None,
        };
        write_device_status(&tx, id, update)?;

        tx.commit()?;
        Ok(log_id)
    }

    // --- Subscriptions ---

    /// Add a subscription and return its ID.
    pub fn add_subscription(&self, sub: &mut Subscription) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO subscriptions (device_id, recipient, notify_online, notify_offline, notify_warning, notify_critical) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                sub.device_id,
                sub.recipient,
                sub.notify_online,
                sub.notify_offline,
                sub.notify_warning,
                sub.notify_critical,
            ],
        )?;
        let id = conn.last_insert_rowid();
        sub.id = id;
        Ok(id)
    }

    /// Get the subscriptions of a device interested in `status`.
    pub fn get_subscriptions(&self, device_id: i64, status: DeviceStatus) -> Result<Vec<Subscription>, DbError> {
        let flag = match status {
            DeviceStatus::Online => "notify_online",
            DeviceStatus::Offline => "notify_offline",
            DeviceStatus::Warning => "notify_warning",
            DeviceStatus::Critical => "notify_critical",
            DeviceStatus::Unknown => return Ok(Vec::new()),
        };

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, device_id, recipient, notify_online, notify_offline, notify_warning, notify_critical \
             FROM subscriptions WHERE device_id = ?1 AND {} = 1 ORDER BY id",
            flag
        ))?;
        let subs = stmt
            .query_map(params![device_id], |row| {
                Ok(Subscription {
                    id: row.get(0)?,
                    device_id: row.get(1)?,
                    recipient: row.get(2)?,
                    notify_online: row.get(3)?,
                    notify_offline: row.get(4)?,
                    notify_warning: row.get(5)?,
                    notify_critical: row.get(6)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(subs)
    }

    // --- Probe Records ---

    /// Append a probe record and return its ID.
    pub fn add_probe_record(&self, record: &ProbeRecord) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO probe_records (device_id, address, success, packet_loss, min_time, avg_time, max_time, raw_output, time) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.device_id,
                record.address,
                record.success,
                record.packet_loss,
                record.min_time,
                record.avg_time,
                record.max_time,
                record.raw_output,
                format_db_time(&record.time),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Count probes (total and successful) for a device since `start`.
    pub fn count_probe_records(&self, device_id: i64, start: DateTime<Utc>) -> Result<ProbeCounts, DbError> {
        let conn = self.conn()?;
        let counts = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(success), 0) FROM probe_records WHERE device_id = ?1 AND time >= ?2",
            params![device_id, format_db_time(&start)],
            |row| {
                Ok(ProbeCounts {
                    total: row.get(0)?,
                    successful: row.get(1)?,
                })
            },
        )?;
        Ok(counts)
    }

    /// Get the most recent probe records for a device.
    pub fn get_probe_records(&self, device_id: i64, limit: i64) -> Result<Vec<ProbeRecord>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, device_id, address, success, packet_loss, min_time, avg_time, max_time, raw_output, time \
             FROM probe_records WHERE device_id = ?1 ORDER BY time DESC, id DESC LIMIT ?2",
        )?;
        let records = stmt
            .query_map(params![device_id, limit], |row| {
                let time_str: String = row.get(9)?;
                Ok(ProbeRecord {
                    id: row.get(0)?,
                    device_id: row.get(1)?,
                    address: row.get(2)?,
                    success: row.get(3)?,
                    packet_loss: row.get(4)?,
                    min_time: row.get(5)?,
                    avg_time: row.get(6)?,
                    max_time: row.get(7)?,
                    raw_output: row.get(8)?,
                    time: parse_db_time(&time_str).unwrap_or_else(Utc::now),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(records)
    }

    /// Delete probe records before a cutoff time. Returns the number removed.
    pub fn delete_probe_records_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM probe_records WHERE time < ?1",
            params![format_db_time(&cutoff)],
        )?;
        Ok(removed)
    }

    // --- Status Log ---

    /// Append a status log entry and return its ID.
    pub fn add_status_log(&self, entry: &StatusLogEntry) -> Result<i64, DbError> {
        let conn = self.conn()?;
        insert_status_log(&conn, entry)
    }

    /// Get the most recent status log entries for a device, newest first.
    pub fn get_status_log(&self, device_id: i64, limit: i64) -> Result<Vec<StatusLogEntry>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, device_id, status, detail, time FROM status_log \
             WHERE device_id = ?1 ORDER BY time DESC, id DESC LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![device_id, limit], |row| {
                let status: String = row.get(2)?;
                let time_str: String = row.get(4)?;
                Ok(StatusLogEntry {
                    id: row.get(0)?,
                    device_id: row.get(1)?,
                    status: status
                        .parse()
                        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?,
                    detail: row.get(3)?,
                    time: parse_db_time(&time_str).unwrap_or_else(Utc::now),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(entries)
    }
}

fn write_device_status(conn: &Connection, id: i64, update: &DeviceStatusUpdate) -> Result<(), DbError> {
    let changed = conn.execute(
        "UPDATE devices SET status=?1, last_seen=?2, last_avg_time=?3, last_ttl=?4 WHERE id=?5",
        params![
            update.status.as_str(),
            update.last_seen.as_ref().map(format_db_time),
            update.last_avg_time,
            update.last_ttl,
            id,
        ],
    )?;
    if changed == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

fn insert_status_log(conn: &Connection, entry: &StatusLogEntry) -> Result<i64, DbError> {
    conn.execute(
        "INSERT INTO status_log (device_id, status, detail, time) VALUES (?1, ?2, ?3, ?4)",
        params![
            entry.device_id,
            entry.status.as_str(),
            entry.detail,
            format_db_time(&entry.time),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn row_to_device(row: &Row<'_>) -> SqlResult<Device> {
    let probe_mode: String = row.get(4)?;
    let status: String = row.get(10)?;
    let last_seen: Option<String> = row.get(11)?;

    Ok(Device {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        map_id: row.get(3)?,
        probe_mode: probe_mode
            .parse()
            .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into()))?,
        enabled: row.get(5)?,
        thresholds: Thresholds {
            warning_latency_ms: row.get(6)?,
            warning_packetloss_pct: row.get(7)?,
            critical_latency_ms: row.get(8)?,
            critical_packetloss_pct: row.get(9)?,
        },
        status: status
            .parse()
            .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, e.into()))?,
        last_seen: last_seen.and_then(|s| parse_db_time(&s)),
        last_avg_time: row.get(12)?,
        last_ttl: row.get(13)?,
    })
}

fn format_db_time(time: &DateTime<Utc>) -> String {
    time.format(DB_TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        DB_TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
