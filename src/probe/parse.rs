//! Ping output parsing.
//!
//! Pure text-to-metrics transform. Unrecognised output yields the defaults
//! (100% loss, zero round-trip times, no TTL) instead of an error.

use std::sync::OnceLock;

use regex::Regex;

/// Metrics extracted from ping output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingMetrics {
    pub packet_loss: f64,
    pub min_time: f64,
    pub avg_time: f64,
    pub max_time: f64,
    pub ttl: Option<i64>,
}

impl Default for PingMetrics {
    fn default() -> Self {
        Self {
            packet_loss: 100.0,
            min_time: 0.0,
            avg_time: 0.0,
            max_time: 0.0,
            ttl: None,
        }
    }
}

/// Parse ping output into metrics.
pub fn parse_ping_output(output: &str) -> PingMetrics {
    let mut metrics = PingMetrics::default();

    if let Some(loss) = parse_packet_loss(output) {
        metrics.packet_loss = loss;
    }

    if let Some((min, avg, max)) = parse_round_trip(output) {
        metrics.min_time = min;
        metrics.avg_time = avg;
        metrics.max_time = max;
    }

    static TTL: OnceLock<Regex> = OnceLock::new();
    let ttl = TTL.get_or_init(|| Regex::new(r"(?i)\bttl[=:]\s*(\d+)").unwrap());
    metrics.ttl = ttl
        .captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok());

    metrics
}

/// Extract the packet-loss percentage, if any loss line is present.
pub fn parse_packet_loss(output: &str) -> Option<f64> {
    // Unix: "1 packets transmitted, 1 received, 0% packet loss"
    static UNIX: OnceLock<Regex> = OnceLock::new();
    let unix = UNIX.get_or_init(|| Regex::new(r"([0-9]+(?:\.[0-9]+)?)%\s+packet\s+loss").unwrap());

    // Windows: "Lost = 0 (0% loss)"
    static WINDOWS: OnceLock<Regex> = OnceLock::new();
    let windows = WINDOWS.get_or_init(|| Regex::new(r"\(([0-9]+(?:\.[0-9]+)?)%\s+loss\)").unwrap());

    unix.captures(output)
        .or_else(|| windows.captures(output))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Extract (min, avg, max) round-trip times in milliseconds.
fn parse_round_trip(output: &str) -> Option<(f64, f64, f64)> {
    // Unix summary: "rtt min/avg/max/mdev = 1/2/3/0.5 ms" (Linux)
    // or "round-trip min/avg/max/stddev = 1/2/3/0.5 ms" (BSD, macOS)
    static UNIX: OnceLock<Regex> = OnceLock::new();
    let unix = UNIX.get_or_init(|| {
        Regex::new(
            r"(?:rtt|round-trip)\s+min/avg/max(?:/(?:mdev|stddev))?\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)",
        )
        .unwrap()
    });

    if let Some(caps) = unix.captures(output) {
        let min = caps.get(1)?.as_str().parse().ok()?;
        let avg = caps.get(2)?.as_str().parse().ok()?;
        let max = caps.get(3)?.as_str().parse().ok()?;
        return Some((min, avg, max));
    }

    // Windows summary: "Minimum = 1ms, Maximum = 3ms, Average = 2ms"
    static WINDOWS: OnceLock<Regex> = OnceLock::new();
    let windows = WINDOWS.get_or_init(|| {
        Regex::new(r"Minimum\s*=\s*([0-9.]+)\s*ms,\s*Maximum\s*=\s*([0-9.]+)\s*ms,\s*Average\s*=\s*([0-9.]+)\s*ms")
            .unwrap()
    });

    let caps = windows.captures(output)?;
    let min = caps.get(1)?.as_str().parse().ok()?;
    let max = caps.get(2)?.as_str().parse().ok()?;
    let avg = caps.get(3)?.as_str().parse().ok()?;
    Some((min, avg, max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_linux_output() {
        let output = r#"PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms
64 bytes from 8.8.8.8: icmp_seq=2 ttl=117 time=14.1 ms

--- 8.8.8.8 ping statistics ---
2 packets transmitted, 2 received, 0% packet loss, time 1001ms
rtt min/avg/max/mdev = 12.300/13.200/14.100/0.900 ms"#;
        let m = parse_ping_output(output);
        assert_eq!(m.packet_loss, 0.0);
        assert_eq!(m.min_time, 12.3);
        assert_eq!(m.avg_time, 13.2);
        assert_eq!(m.max_time, 14.1);
        assert_eq!(m.ttl, Some(117));
    }

    #[test]
    fn test_parse_macos_output() {
        let output = r#"PING google.com (142.250.69.174): 56 data bytes
64 bytes from 142.250.69.174: icmp_seq=0 ttl=116 time=17.906 ms

--- google.com ping statistics ---
4 packets transmitted, 3 packets received, 25.0% packet loss
round-trip min/avg/max/stddev = 17.906/18.500/19.094/0.485 ms"#;
        let m = parse_ping_output(output);
        assert_eq!(m.packet_loss, 25.0);
        assert_eq!(m.avg_time, 18.5);
        assert_eq!(m.ttl, Some(116));
    }

    #[test]
    fn test_parse_windows_output() {
        let output = r#"Pinging 10.0.0.1 with 32 bytes of data:
Reply from 10.0.0.1: bytes=32 time=2ms TTL=64
Reply from 10.0.0.1: bytes=32 time=3ms TTL=64

Ping statistics for 10.0.0.1:
    Packets: Sent = 4, Received = 2, Lost = 2 (50% loss),
Approximate round trip times in milli-seconds:
    Minimum = 1ms, Maximum = 3ms, Average = 2ms"#;
        let m = parse_ping_output(output);
        assert_eq!(m.packet_loss, 50.0);
        assert_eq!(m.min_time, 1.0);
        assert_eq!(m.max_time, 3.0);
        assert_eq!(m.avg_time, 2.0);
        assert_eq!(m.ttl, Some(64));
    }

    #[test]
    fn test_parse_total_loss() {
        let output = r#"PING 10.9.9.9 (10.9.9.9) 56(84) bytes of data.

--- 10.9.9.9 ping statistics ---
1 packets transmitted, 0 received, 100% packet loss, time 0ms"#;
        let m = parse_ping_output(output);
        assert_eq!(m.packet_loss, 100.0);
        assert_eq!(m.avg_time, 0.0);
        assert_eq!(m.ttl, None);
    }

    #[test]
    fn test_unrecognised_output_uses_defaults() {
        let m = parse_ping_output("ping: unknown host nowhere.invalid");
        assert_eq!(m, PingMetrics::default());
        assert_eq!(parse_packet_loss(""), None);
    }
}
