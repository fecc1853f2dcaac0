//! TCP port probe implementation.

use std::net::Ipv6Addr;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use super::{ProbeError, RawProbe};

/// Attempt a single TCP connect to `address:port`.
///
/// A refused or timed-out connect is a normal failed probe, not an error.
pub async fn run_tcp_probe(address: &str, port: u16, timeout: Duration) -> Result<RawProbe, ProbeError> {
    let target = if address.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]:{}", address, port)
    } else {
        format!("{}:{}", address, port)
    };

    let start = Instant::now();

    let probe = match tokio::time::timeout(timeout, TcpStream::connect(&target)).await {
        Ok(Ok(_stream)) => {
            let elapsed_ms = (start.elapsed().as_secs_f64() * 100_000.0).round() / 100.0;
            RawProbe {
                success: true,
                elapsed_ms: Some(elapsed_ms),
                output: format!("Connected to {} in {} ms", target, elapsed_ms),
            }
        }
        Ok(Err(e)) => RawProbe::failed(format!("Connection to {} failed: {}", target, e)),
        Err(_) => RawProbe::failed(format!("Connection to {} timed out after {:?}", target, timeout)),
    };

    Ok(probe)
}
