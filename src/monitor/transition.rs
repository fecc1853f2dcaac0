//! Transition-only status history.

use chrono::{DateTime, Utc};

use super::classify::Classification;
use crate::db::{DbError, DeviceStatus, DeviceStatusUpdate, StatusLogEntry, Store};

/// Whether moving from `previous` to `current` is a transition.
pub fn is_transition(previous: DeviceStatus, current: DeviceStatus) -> bool {
    previous != current
}

/// Persist a device's new status, appending a status log entry in the same
/// transaction if it differs from `previous`. Returns the logged entry.
///
/// Nothing is written when the transaction fails, so the next check still
/// sees `previous` and the transition is not lost or duplicated.
pub fn log_transition(
    store: &Store,
    device_id: i64,
    previous: DeviceStatus,
    classification: &Classification,
    update: &DeviceStatusUpdate,
    time: DateTime<Utc>,
) -> Result<Option<StatusLogEntry>, DbError> {
    if !is_transition(previous, classification.status) {
        store.commit_device_status(device_id, update, None)?;
        return Ok(None);
    }

    let mut entry = StatusLogEntry {
        id: 0,
        device_id,
        status: classification.status,
        detail: classification.detail.clone(),
        time,
    };
    if let Some(id) = store.commit_device_status(device_id, update, Some(&entry))? {
        entry.id = id;
    }
    Ok(Some(entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Device;
    use tempfile::NamedTempFile;

    fn classification(status: DeviceStatus) -> Classification {
        Classification {
            status,
            detail: format!("now {}", status),
        }
    }

    fn update(status: DeviceStatus) -> DeviceStatusUpdate {
        DeviceStatusUpdate {
            status,
            last_seen: None,
            last_avg_time: None,
            last_ttl: None,
        }
    }

    #[test]
    fn test_logs_only_on_change() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let mut device = Device {
            name: "edge".into(),
            address: "10.0.0.1".into(),
            ..Default::default()
        };
        let id = store.add_device(&mut device).unwrap();
        let now = Utc::now();

        let same = log_transition(
            &store,
            id,
            DeviceStatus::Unknown,
            &classification(DeviceStatus::Unknown),
            &update(DeviceStatus::Unknown),
            now,
        )
        .unwrap();
        assert!(same.is_none());
        assert!(store.get_status_log(id, 10).unwrap().is_empty());

        let changed = log_transition(
            &store,
            id,
            DeviceStatus::Unknown,
            &classification(DeviceStatus::Offline),
            &update(DeviceStatus::Offline),
            now,
        )
        .unwrap();
        let entry = changed.expect("transition should be logged");
        assert!(entry.id > 0);
        assert_eq!(entry.status, DeviceStatus::Offline);
        assert_eq!(store.get_device(id).unwrap().status, DeviceStatus::Offline);

        let log = store.get_status_log(id, 10).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].detail, "now offline");
    }

    #[test]
    fn test_unknown_device_logs_nothing() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let result = log_transition(
            &store,
            77,
            DeviceStatus::Unknown,
            &classification(DeviceStatus::Online),
            &update(DeviceStatus::Online),
            Utc::now(),
        );
        assert!(matches!(result, Err(DbError::NotFound)));
        assert!(store.get_status_log(77, 10).unwrap().is_empty());
    }

    #[test]
    fn test_first_probe_is_a_transition() {
        assert!(is_transition(DeviceStatus::Unknown, DeviceStatus::Online));
        assert!(!is_transition(DeviceStatus::Warning, DeviceStatus::Warning));
    }
}
