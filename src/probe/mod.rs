//! Probe module for device health checks.
//!
//! Supports ICMP echo (native sockets with a `ping` command fallback) and
//! TCP port probes behind a single [`Prober`] interface.

mod parse;
mod ping;
mod tcp;

pub use parse::*;
pub use ping::*;
pub use tcp::*;

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),
    #[error("probe facility unavailable: {0}")]
    FacilityUnavailable(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// How a device is probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ProbeMode {
    /// ICMP echo request/reply.
    Icmp,
    /// A single TCP connect to the given port.
    TcpPort(u16),
}

impl fmt::Display for ProbeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeMode::Icmp => f.write_str("icmp"),
            ProbeMode::TcpPort(port) => write!(f, "tcp-port:{}", port),
        }
    }
}

impl FromStr for ProbeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "icmp" {
            return Ok(ProbeMode::Icmp);
        }
        if let Some(port) = s.strip_prefix("tcp-port:") {
            return match port.parse::<u16>() {
                Ok(p) if p > 0 => Ok(ProbeMode::TcpPort(p)),
                _ => Err(format!("invalid port in probe mode: {}", s)),
            };
        }
        Err(format!("unknown probe mode: {}", s))
    }
}

impl TryFrom<String> for ProbeMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProbeMode> for String {
    fn from(mode: ProbeMode) -> Self {
        mode.to_string()
    }
}

/// Unprocessed result of one probe attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RawProbe {
    pub success: bool,
    /// Connect time for port probes.
    pub elapsed_ms: Option<f64>,
    /// Ping-style text for ICMP, a short status line for TCP.
    pub output: String,
}

impl RawProbe {
    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            elapsed_ms: None,
            output: output.into(),
        }
    }
}

/// Performs exactly one probe attempt against an address.
#[async_trait]
pub trait Prober: Send + Sync {
    /// `count` is the ICMP packet count; port probes ignore it.
    async fn probe(&self, address: &str, mode: ProbeMode, count: u32) -> Result<RawProbe, ProbeError>;
}

/// Prober backed by the host network stack.
#[derive(Debug, Clone)]
pub struct SystemProber {
    /// Per-packet wait for ICMP replies.
    pub packet_timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
}

impl SystemProber {
    pub fn new(packet_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            packet_timeout,
            connect_timeout,
        }
    }
}

impl Default for SystemProber {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(1))
    }
}

#[async_trait]
impl Prober for SystemProber {
    async fn probe(&self, address: &str, mode: ProbeMode, count: u32) -> Result<RawProbe, ProbeError> {
        validate_address(address)?;
        let address = address.trim();

        // Add jitter to avoid thundering herd
        let jitter = rand::random::<u64>() % 50;
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        match mode {
            ProbeMode::Icmp => run_ping_probe(address, count.max(1), self.packet_timeout).await,
            ProbeMode::TcpPort(port) => run_tcp_probe(address, port, self.connect_timeout).await,
        }
    }
}

/// Check that an address is an IP literal or a plain hostname.
///
/// Hostnames may only contain ASCII letters, digits, dots and hyphens and
/// must not start with a hyphen.
pub fn validate_address(address: &str) -> Result<(), ProbeError> {
    static HOSTNAME: OnceLock<Regex> = OnceLock::new();
    let hostname = HOSTNAME.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.\-]*$").unwrap());

    let trimmed = address.trim();
    if trimmed.is_empty() || trimmed.len() > 253 {
        return Err(ProbeError::InvalidAddress(address.to_string()));
    }
    if trimmed.parse::<IpAddr>().is_ok() || hostname.is_match(trimmed) {
        return Ok(());
    }
    Err(ProbeError::InvalidAddress(address.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_mode_text_form() {
        assert_eq!("icmp".parse::<ProbeMode>().unwrap(), ProbeMode::Icmp);
        assert_eq!("tcp-port:443".parse::<ProbeMode>().unwrap(), ProbeMode::TcpPort(443));
        assert_eq!(ProbeMode::TcpPort(22).to_string(), "tcp-port:22");
        assert!("tcp-port:0".parse::<ProbeMode>().is_err());
        assert!("tcp-port:70000".parse::<ProbeMode>().is_err());
        assert!("udp".parse::<ProbeMode>().is_err());
    }

    #[test]
    fn test_probe_mode_json() {
        let mode: ProbeMode = serde_json::from_str(r#""tcp-port:8080""#).unwrap();
        assert_eq!(mode, ProbeMode::TcpPort(8080));
        assert_eq!(serde_json::to_string(&ProbeMode::Icmp).unwrap(), r#""icmp""#);
    }

    #[test]
    fn test_validate_address() {
        assert!(validate_address("192.168.1.1").is_ok());
        assert!(validate_address("fe80::1").is_ok());
        assert!(validate_address("router-01.lan").is_ok());
        assert!(validate_address(" core.example.com ").is_ok());

        assert!(validate_address("").is_err());
        assert!(validate_address("-c 100 host").is_err());
        assert!(validate_address("host;rm -rf /").is_err());
        assert!(validate_address("$(reboot)").is_err());
        assert!(validate_address("under_score.lan").is_err());
    }

    #[tokio::test]
    async fn test_invalid_address_fails_before_probing() {
        let prober = SystemProber::default();
        let result = prober.probe("bad host!", ProbeMode::Icmp, 1).await;
        assert!(matches!(result, Err(ProbeError::InvalidAddress(_))));
    }
}
