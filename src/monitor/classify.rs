//! Status classification from probe metrics and device thresholds.

use crate::db::{DeviceStatus, Thresholds};
use crate::probe::PingMetrics;

pub const OFFLINE_DETAIL: &str = "Device offline or unreachable.";

/// A classified status with its human-readable detail.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub status: DeviceStatus,
    pub detail: String,
}

impl Classification {
    fn new(status: DeviceStatus, detail: String) -> Self {
        Self { status, detail }
    }

    fn offline() -> Self {
        Self::new(DeviceStatus::Offline, OFFLINE_DETAIL.to_string())
    }
}

/// Classify an ICMP probe.
///
/// Rules are evaluated in a fixed order and the first match wins:
/// critical latency, critical packet loss, warning latency, warning packet
/// loss. A threshold that is unset, zero or negative never matches.
pub fn classify_ping(success: bool, metrics: &PingMetrics, thresholds: &Thresholds) -> Classification {
    if !success {
        return Classification::offline();
    }

    let avg = metrics.avg_time;
    let loss = metrics.packet_loss;

    if let Some(limit) = configured(thresholds.critical_latency_ms) {
        if avg > limit {
            return Classification::new(
                DeviceStatus::Critical,
                format!("Critical: latency {}ms exceeds {}ms threshold.", num(avg), num(limit)),
            );
        }
    }

    if let Some(limit) = configured(thresholds.critical_packetloss_pct) {
        if loss > limit {
            return Classification::new(
                DeviceStatus::Critical,
                format!("Critical: packet loss {}% exceeds {}% threshold.", num(loss), num(limit)),
            );
        }
    }

    if let Some(limit) = configured(thresholds.warning_latency_ms) {
        if avg > limit {
            return Classification::new(
                DeviceStatus::Warning,
                format!("Warning: latency {}ms exceeds {}ms threshold.", num(avg), num(limit)),
            );
        }
    }

    if let Some(limit) = configured(thresholds.warning_packetloss_pct) {
        if loss > limit {
            return Classification::new(
                DeviceStatus::Warning,
                format!("Warning: packet loss {}% exceeds {}% threshold.", num(loss), num(limit)),
            );
        }
    }

    online(avg)
}

/// Classify a TCP port probe. Thresholds never apply.
pub fn classify_port(success: bool, elapsed_ms: Option<f64>) -> Classification {
    if success {
        online(elapsed_ms.unwrap_or_default())
    } else {
        Classification::offline()
    }
}

fn online(latency: f64) -> Classification {
    Classification::new(DeviceStatus::Online, format!("Online with {}ms latency.", num(latency)))
}

fn configured(threshold: Option<f64>) -> Option<f64> {
    threshold.filter(|t| t.is_finite() && *t > 0.0)
}

/// Format a measurement with at most two decimals and no trailing zeros.
fn num(value: f64) -> String {
    let rounded = (value * 100.0).round() / 100.0;
    format!("{}", rounded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn metrics(avg: f64, loss: f64) -> PingMetrics {
        PingMetrics {
            packet_loss: loss,
            min_time: avg,
            avg_time: avg,
            max_time: avg,
            ttl: Some(64),
        }
    }

    fn latency_thresholds() -> Thresholds {
        Thresholds {
            warning_latency_ms: Some(50.0),
            critical_latency_ms: Some(100.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_warning_latency() {
        let c = classify_ping(true, &metrics(75.0, 0.0), &latency_thresholds());
        assert_eq!(c.status, DeviceStatus::Warning);
        assert!(c.detail.contains("75"));
        assert!(c.detail.contains("50"));
    }

    #[test]
    fn test_critical_latency() {
        let c = classify_ping(true, &metrics(150.0, 0.0), &latency_thresholds());
        assert_eq!(c.status, DeviceStatus::Critical);
        assert!(c.detail.contains("150"));
    }

    #[test]
    fn test_failure_is_offline_regardless_of_thresholds() {
        let c = classify_ping(false, &metrics(150.0, 0.0), &latency_thresholds());
        assert_eq!(c.status, DeviceStatus::Offline);
        assert_eq!(c.detail, OFFLINE_DETAIL);
    }

    #[test]
    fn test_online_baseline_detail() {
        let c = classify_ping(true, &metrics(12.3456, 0.0), &Thresholds::default());
        assert_eq!(c.status, DeviceStatus::Online);
        assert_eq!(c.detail, "Online with 12.35ms latency.");
    }

    #[test]
    fn test_critical_latency_shadows_packet_loss() {
        let thresholds = Thresholds {
            critical_latency_ms: Some(100.0),
            critical_packetloss_pct: Some(10.0),
            ..Default::default()
        };
        let c = classify_ping(true, &metrics(200.0, 50.0), &thresholds);
        assert_eq!(c.status, DeviceStatus::Critical);
        assert!(c.detail.contains("latency"));
    }

    #[test]
    fn test_warning_packet_loss() {
        let thresholds = Thresholds {
            warning_packetloss_pct: Some(20.0),
            ..Default::default()
        };
        let c = classify_ping(true, &metrics(5.0, 25.0), &thresholds);
        assert_eq!(c.status, DeviceStatus::Warning);
        assert!(c.detail.contains("packet loss 25%"));
    }

    #[test]
    fn test_zero_threshold_is_unset() {
        let thresholds = Thresholds {
            warning_latency_ms: Some(0.0),
            warning_packetloss_pct: Some(0.0),
            critical_latency_ms: Some(0.0),
            critical_packetloss_pct: Some(0.0),
        };
        let c = classify_ping(true, &metrics(5000.0, 99.0), &thresholds);
        assert_eq!(c.status, DeviceStatus::Online);
    }

    #[test]
    fn test_port_mode() {
        let up = classify_port(true, Some(12.0));
        assert_eq!(up.status, DeviceStatus::Online);
        assert_eq!(up.detail, "Online with 12ms latency.");

        let down = classify_port(false, None);
        assert_eq!(down.status, DeviceStatus::Offline);
    }

    fn arb_threshold() -> impl Strategy<Value = Option<f64>> {
        prop_oneof![
            Just(None),
            Just(Some(0.0)),
            (1.0f64..500.0).prop_map(Some),
        ]
    }

    fn arb_thresholds() -> impl Strategy<Value = Thresholds> {
        (arb_threshold(), arb_threshold(), arb_threshold(), arb_threshold()).prop_map(|(wl, wp, cl, cp)| Thresholds {
            warning_latency_ms: wl,
            warning_packetloss_pct: wp,
            critical_latency_ms: cl,
            critical_packetloss_pct: cp,
        })
    }

    fn exceeds(value: f64, threshold: Option<f64>) -> bool {
        matches!(threshold, Some(t) if t > 0.0 && value > t)
    }

    proptest! {
        #[test]
        fn test_precedence(
            success in any::<bool>(),
            avg in 0.0f64..1000.0,
            loss in 0.0f64..100.0,
            thresholds in arb_thresholds(),
        ) {
            let expected = if !success {
                DeviceStatus::Offline
            } else if exceeds(avg, thresholds.critical_latency_ms) || exceeds(loss, thresholds.critical_packetloss_pct) {
                DeviceStatus::Critical
            } else if exceeds(avg, thresholds.warning_latency_ms) || exceeds(loss, thresholds.warning_packetloss_pct) {
                DeviceStatus::Warning
            } else {
                DeviceStatus::Online
            };

            let c = classify_ping(success, &metrics(avg, loss), &thresholds);
            prop_assert_eq!(c.status, expected);
            prop_assert_ne!(c.status, DeviceStatus::Unknown);
        }

        #[test]
        fn test_unset_thresholds_never_trigger(avg in 0.0f64..1e9, loss in 0.0f64..=100.0) {
            let c = classify_ping(true, &metrics(avg, loss), &Thresholds::default());
            prop_assert_eq!(c.status, DeviceStatus::Online);
        }
    }
}
