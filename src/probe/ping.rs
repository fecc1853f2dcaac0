//! ICMP probe implementation with native sockets and a `ping` command fallback.
//!
//! Native echoes run on blocking sockets inside `spawn_blocking`. Their
//! measurements are rendered as Linux-style ping text so both paths feed the
//! same output parser.

use std::fmt::Write as _;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{parse_packet_loss, ProbeError, RawProbe};

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Ping sequence counter for unique identification
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Detect ICMP capability by attempting to create a socket.
fn detect_icmp_capability() -> IcmpCapability {
    // Try RAW socket first (requires CAP_NET_RAW or root)
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // Try DGRAM (unprivileged on Linux with ping_group_range set, or macOS)
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// Run an ICMP probe sending `count` echo requests.
pub async fn run_ping_probe(address: &str, count: u32, timeout: Duration) -> Result<RawProbe, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        // Resolve address before spawn_blocking (DNS is async)
        let ip = resolve_address(address).await?;

        let result = tokio::task::spawn_blocking(move || run_blocking_ping(ip, count, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        match result {
            Ok(stats) => return Ok(stats.into_raw_probe(address, ip)),
            Err(e) if is_permission_error(&e) => {
                tracing::warn!(
                    "Native ping failed with permission error for {}, falling back to command: {}",
                    address,
                    e
                );
            }
            Err(e) => return Err(e),
        }
    }

    run_ping_command(address, count, timeout).await
}

fn is_permission_error(e: &ProbeError) -> bool {
    let error_str = e.to_string();
    error_str.contains("Permission")
        || error_str.contains("Operation not permitted")
        || error_str.contains("denied")
}

/// Resolve hostname to IP address.
async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let addrs: Vec<_> = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .collect();

    addrs
        .into_iter()
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", address)))
}

/// Outcome of a native echo run.
#[derive(Debug, Default)]
struct EchoStats {
    transmitted: u32,
    replies: Vec<EchoReply>,
}

#[derive(Debug, Clone, Copy)]
struct EchoReply {
    sequence: u16,
    rtt_ms: f64,
    ttl: Option<u8>,
}

impl EchoStats {
    fn into_raw_probe(self, address: &str, ip: IpAddr) -> RawProbe {
        RawProbe {
            success: !self.replies.is_empty(),
            elapsed_ms: None,
            output: render_ping_output(address, ip, self.transmitted, &self.replies),
        }
    }
}

/// Render native results in the Linux iputils dialect.
fn render_ping_output(address: &str, ip: IpAddr, transmitted: u32, replies: &[EchoReply]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "PING {} ({}): {} echo requests", address, ip, transmitted);

    for reply in replies {
        match reply.ttl {
            Some(ttl) => {
                let _ = writeln!(
                    out,
                    "64 bytes from {}: icmp_seq={} ttl={} time={:.3} ms",
                    ip, reply.sequence, ttl, reply.rtt_ms
                );
            }
            None => {
                let _ = writeln!(out, "64 bytes from {}: icmp_seq={} time={:.3} ms", ip, reply.sequence, reply.rtt_ms);
            }
        }
    }

    let received = replies.len() as u32;
    let loss = if transmitted == 0 {
        100.0
    } else {
        f64::from(transmitted - received) * 100.0 / f64::from(transmitted)
    };
    let loss = (loss * 10_000.0).round() / 10_000.0;

    let _ = writeln!(out);
    let _ = writeln!(out, "--- {} ping statistics ---", address);
    let _ = writeln!(
        out,
        "{} packets transmitted, {} received, {}% packet loss",
        transmitted, received, loss
    );

    if !replies.is_empty() {
        let rtts: Vec<f64> = replies.iter().map(|r| r.rtt_ms).collect();
        let min = rtts.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = rtts.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let avg = rtts.iter().sum::<f64>() / rtts.len() as f64;
        let mdev = (rtts.iter().map(|r| (r - avg).powi(2)).sum::<f64>() / rtts.len() as f64).sqrt();
        let _ = writeln!(out, "rtt min/avg/max/mdev = {:.3}/{:.3}/{:.3}/{:.3} ms", min, avg, max, mdev);
    }

    out
}

/// Send `count` echo requests and collect replies.
/// This runs in a dedicated thread via spawn_blocking.
fn run_blocking_ping(ip: IpAddr, count: u32, timeout: Duration) -> Result<EchoStats, ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };

    // Try RAW first (privileged), then DGRAM (unprivileged)
    let (socket, raw) = match Socket::new(domain, Type::RAW, Some(protocol)) {
        Ok(s) => (s, true),
        Err(_) => {
            let s = Socket::new(domain, Type::DGRAM, Some(protocol))
                .map_err(|e| ProbeError::Network(format!("Failed to create ICMP socket: {}", e)))?;
            (s, false)
        }
    };

    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    let identifier: u16 = rand::random();
    let mut stats = EchoStats::default();

    for _ in 0..count {
        let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let packet = match ip {
            IpAddr::V4(_) => build_icmp_echo_request(identifier, sequence),
            IpAddr::V6(_) => build_icmpv6_echo_request(identifier, sequence),
        };

        stats.transmitted += 1;
        if let Some(reply) = echo_once(&socket, ip, raw, &packet, identifier, sequence, timeout)? {
            stats.replies.push(reply);
        }
    }

    Ok(stats)
}

/// Send one echo request and wait for its reply. `Ok(None)` means the
/// packet was lost within `timeout`.
fn echo_once(
    socket: &Socket,
    ip: IpAddr,
    raw: bool,
    packet: &[u8],
    identifier: u16,
    sequence: u16,
    timeout: Duration,
) -> Result<Option<EchoReply>, ProbeError> {
    // Start timing just before send
    let start = Instant::now();

    socket.send(packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("Failed to send: {}", e))
        }
    })?;

    // Receive replies until we get OUR reply or time runs out
    loop {
        let remaining = match timeout.checked_sub(start.elapsed()) {
            Some(r) if !r.is_zero() => r,
            _ => return Ok(None),
        };
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

        let mut buf: [MaybeUninit<u8>; 1500] = unsafe { MaybeUninit::uninit().assume_init() };
        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                return Ok(None);
            }
            Err(e) => return Err(ProbeError::Network(format!("Failed to receive: {}", e))),
        };
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Ok(None);
        }

        if let Some(ttl) = match_echo_reply(buf, ip, raw, identifier, sequence) {
            return Ok(Some(EchoReply {
                sequence,
                rtt_ms: elapsed.as_secs_f64() * 1000.0,
                ttl,
            }));
        }
        // Received something else, keep waiting
    }
}

/// Check whether `buf` is the echo reply we are waiting for. Returns the
/// reply's TTL (when an IPv4 header is present) on a match.
fn match_echo_reply(buf: &[u8], ip: IpAddr, raw: bool, identifier: u16, sequence: u16) -> Option<Option<u8>> {
    let (icmp, ttl, reply_type) = match ip {
        IpAddr::V4(_) => {
            // RAW sockets deliver the IP header, DGRAM sockets do not
            if !buf.is_empty() && buf[0] >> 4 == 4 {
                let header_len = usize::from(buf[0] & 0x0F) * 4;
                if buf.len() < header_len.max(20) {
                    return None;
                }
                (&buf[header_len..], Some(buf[8]), 0u8)
            } else {
                (buf, None, 0u8)
            }
        }
        IpAddr::V6(_) => (buf, None, 129u8),
    };

    if icmp.len() < 8 {
        return None;
    }

    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);

    // The kernel rewrites the identifier on DGRAM sockets
    let id_matches = !raw || reply_id == identifier;
    if icmp[0] == reply_type && id_matches && reply_seq == sequence {
        Some(ttl)
    } else {
        None
    }
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_icmp_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = build_echo_payload(8, identifier, sequence);
    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// Build an ICMPv6 Echo Request packet (type 128, code 0).
///
/// The kernel computes the ICMPv6 checksum, so it stays zero here.
fn build_icmpv6_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    build_echo_payload(128, identifier, sequence)
}

fn build_echo_payload(icmp_type: u8, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = icmp_type;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }

    // Handle odd byte
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Host flavours with different `ping` flag spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Platform {
    Linux,
    MacOs,
    Windows,
}

impl Platform {
    fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd")) {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }
}

/// Program and arguments for a `ping` invocation on `platform`.
pub(crate) fn ping_command(platform: Platform, address: &str, count: u32, timeout: Duration) -> (&'static str, Vec<String>) {
    let ipv6 = matches!(address.parse::<IpAddr>(), Ok(IpAddr::V6(_)));
    let count = count.max(1).to_string();
    let timeout_secs = timeout.as_secs().max(1).to_string();
    let timeout_ms = timeout.as_millis().max(1).to_string();

    match platform {
        Platform::Linux => {
            let mut args = vec!["-n".to_string(), "-c".to_string(), count, "-W".to_string(), timeout_secs];
            if ipv6 {
                args.push("-6".to_string());
            }
            args.push(address.to_string());
            ("ping", args)
        }
        Platform::MacOs if ipv6 => ("ping6", vec!["-n".to_string(), "-c".to_string(), count, address.to_string()]),
        Platform::MacOs => (
            "ping",
            vec!["-n".to_string(), "-c".to_string(), count, "-W".to_string(), timeout_ms, address.to_string()],
        ),
        Platform::Windows => {
            let mut args = vec!["-n".to_string(), count, "-w".to_string(), timeout_ms];
            if ipv6 {
                args.push("-6".to_string());
            }
            args.push(address.to_string());
            ("ping", args)
        }
    }
}

/// Run ping via command execution (fallback).
async fn run_ping_command(address: &str, count: u32, timeout: Duration) -> Result<RawProbe, ProbeError> {
    let (program, args) = ping_command(Platform::current(), address, count, timeout);

    let output = Command::new(program)
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProbeError::FacilityUnavailable(format!("{} command not found and native ICMP unavailable", program))
            } else {
                ProbeError::Command(format!("failed to execute {}: {}", program, e))
            }
        })?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        text.push_str(&stderr);
    }

    // Some platforms exit zero even when every echo went unanswered
    let success = output.status.success() && parse_packet_loss(&text).map_or(true, |loss| loss < 100.0);

    Ok(RawProbe {
        success,
        elapsed_ms: None,
        output: text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::parse_ping_output;
    use std::net::Ipv4Addr;

    #[test]
    fn test_icmp_checksum() {
        let packet = build_icmp_echo_request(0x1234, 0x0001);
        // A packet with its checksum filled in sums to zero
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_build_icmp_packet() {
        let packet = build_icmp_echo_request(0x1234, 0x0001);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8); // Type
        assert_eq!(packet[1], 0); // Code
        assert_eq!(packet[4..6], [0x12, 0x34]); // ID
        assert_eq!(packet[6..8], [0x00, 0x01]); // Sequence

        let v6 = build_icmpv6_echo_request(0x1234, 0x0002);
        assert_eq!(v6[0], 128);
        assert_eq!(v6[2..4], [0, 0]);
    }

    #[test]
    fn test_match_echo_reply_raw_v4() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let mut buf = vec![0u8; 28];
        buf[0] = 0x45; // IPv4, 20 byte header
        buf[8] = 63; // TTL
        buf[20] = 0; // Echo Reply
        buf[24..26].copy_from_slice(&0xBEEFu16.to_be_bytes());
        buf[26..28].copy_from_slice(&7u16.to_be_bytes());

        assert_eq!(match_echo_reply(&buf, ip, true, 0xBEEF, 7), Some(Some(63)));
        assert_eq!(match_echo_reply(&buf, ip, true, 0xBEEF, 8), None);
        assert_eq!(match_echo_reply(&buf, ip, true, 0x1111, 7), None);
    }

    #[test]
    fn test_match_echo_reply_dgram_ignores_identifier() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let mut buf = vec![0u8; 8];
        buf[4..6].copy_from_slice(&0x4242u16.to_be_bytes());
        buf[6..8].copy_from_slice(&3u16.to_be_bytes());

        assert_eq!(match_echo_reply(&buf, ip, false, 0x0001, 3), Some(None));
        buf[0] = 8; // our own request echoed back
        assert_eq!(match_echo_reply(&buf, ip, false, 0x0001, 3), None);
    }

    #[test]
    fn test_rendered_output_parses() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let replies = [
            EchoReply { sequence: 1, rtt_ms: 10.0, ttl: Some(64) },
            EchoReply { sequence: 2, rtt_ms: 20.0, ttl: Some(64) },
            EchoReply { sequence: 4, rtt_ms: 30.0, ttl: Some(64) },
        ];
        let text = render_ping_output("gw.lan", ip, 4, &replies);
        let m = parse_ping_output(&text);
        assert_eq!(m.packet_loss, 25.0);
        assert_eq!(m.min_time, 10.0);
        assert_eq!(m.avg_time, 20.0);
        assert_eq!(m.max_time, 30.0);
        assert_eq!(m.ttl, Some(64));

        let lost = render_ping_output("gw.lan", ip, 1, &[]);
        let m = parse_ping_output(&lost);
        assert_eq!(m.packet_loss, 100.0);
        assert_eq!(m.avg_time, 0.0);
    }

    #[test]
    fn test_ping_command_flags() {
        let timeout = Duration::from_millis(1500);

        let (program, args) = ping_command(Platform::Linux, "10.0.0.1", 1, timeout);
        assert_eq!(program, "ping");
        assert_eq!(args, ["-n", "-c", "1", "-W", "1", "10.0.0.1"]);

        let (_, args) = ping_command(Platform::Linux, "fe80::1", 4, timeout);
        assert!(args.contains(&"-6".to_string()));

        let (program, args) = ping_command(Platform::MacOs, "10.0.0.1", 4, timeout);
        assert_eq!(program, "ping");
        assert_eq!(args, ["-n", "-c", "4", "-W", "1500", "10.0.0.1"]);

        let (program, _) = ping_command(Platform::MacOs, "fe80::1", 4, timeout);
        assert_eq!(program, "ping6");

        let (program, args) = ping_command(Platform::Windows, "10.0.0.1", 4, timeout);
        assert_eq!(program, "ping");
        assert_eq!(args, ["-n", "4", "-w", "1500", "10.0.0.1"]);
    }
}
