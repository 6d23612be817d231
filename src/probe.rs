//! Single-port TCP connect probing.
//!
//! A port is open iff the handshake completes before the timeout. Refused,
//! unreachable, unresolvable and timed-out attempts are all folded into
//! `open: false` with the cause kept in [`ProbeFailure`].

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};
use tokio::time::{self, Instant};

use crate::types::{ProbeFailure, ProbeResult};

/// Connectivity test used by the scan coordinator.
pub trait Probe: Send + Sync + 'static {
    fn probe(&self, addr: SocketAddr, timeout: Duration) -> impl Future<Output = ProbeResult> + Send;
}

/// Plain TCP connect probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

impl Probe for TcpProbe {
    fn probe(&self, addr: SocketAddr, timeout: Duration) -> impl Future<Output = ProbeResult> + Send {
        probe_addr(addr, timeout)
    }
}

/// Resolve `host` and probe `port`, spending at most `timeout` on both steps.
pub async fn probe(host: &str, port: u16, timeout: Duration) -> ProbeResult {
    let started = Instant::now();
    let ip = match time::timeout(timeout, resolve_host(host)).await {
        Ok(Ok(ip)) => ip,
        Ok(Err(e)) => return ProbeResult::closed(port, ProbeFailure::Resolve(e.to_string())),
        Err(_) => return ProbeResult::closed(port, ProbeFailure::Timeout),
    };
    probe_addr(SocketAddr::new(ip, port), timeout.saturating_sub(started.elapsed())).await
}

/// Probe an already resolved address.
///
/// When the timeout fires the pending connect future is dropped, which closes
/// the half-open socket.
pub async fn probe_addr(addr: SocketAddr, timeout: Duration) -> ProbeResult {
    settle(addr.port(), timeout, TcpStream::connect(addr)).await
}

/// Bound a connect attempt by `timeout` and fold its result into a `ProbeResult`.
async fn settle<T, F>(port: u16, timeout: Duration, connect: F) -> ProbeResult
where
    F: Future<Output = io::Result<T>>,
{
    match time::timeout(timeout, connect).await {
        Ok(Ok(_stream)) => ProbeResult::open(port),
        Ok(Err(e)) => ProbeResult::closed(port, classify(&e)),
        Err(_) => ProbeResult::closed(port, ProbeFailure::Timeout),
    }
}

/// Resolve a host name or literal address, preferring IPv4.
pub async fn resolve_host(host: &str) -> io::Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let addrs: Vec<SocketAddr> = lookup_host((host, 0)).await?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .map(SocketAddr::ip)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {host}")))
}

fn classify(e: &io::Error) -> ProbeFailure {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => ProbeFailure::Refused,
        io::ErrorKind::TimedOut => ProbeFailure::Timeout,
        _ => ProbeFailure::Unreachable(e.to_string()),
    }
}
