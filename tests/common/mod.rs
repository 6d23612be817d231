#![allow(dead_code)]

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use port_bridge::probe::Probe;
use port_bridge::types::{ProbeFailure, ProbeResult};

#[derive(Default)]
pub struct Counters {
    pub in_flight: AtomicUsize,
    pub peak: AtomicUsize,
    pub calls: AtomicUsize,
}

/// Probe double: ports in `open` answer, every other port is refused after `delay(port)`.
pub struct FakeProbe {
    pub open: HashSet<u16>,
    pub delay: fn(u16) -> Duration,
    pub counters: Arc<Counters>,
}

impl FakeProbe {
    pub fn new(open: &[u16], delay: fn(u16) -> Duration) -> (Self, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let probe = Self {
            open: open.iter().copied().collect(),
            delay,
            counters: counters.clone(),
        };
        (probe, counters)
    }
}

impl Probe for FakeProbe {
    fn probe(&self, addr: SocketAddr, _timeout: Duration) -> impl Future<Output = ProbeResult> + Send {
        let port = addr.port();
        let open = self.open.contains(&port);
        let delay = (self.delay)(port);
        let counters = self.counters.clone();
        async move {
            counters.calls.fetch_add(1, Ordering::Relaxed);
            let _in_flight = InFlight::enter(&counters);
            tokio::time::sleep(delay).await;
            if open {
                ProbeResult::open(port)
            } else {
                ProbeResult::closed(port, ProbeFailure::Refused)
            }
        }
    }
}

/// Counts an attempt as in flight until dropped, including when the task is aborted.
struct InFlight<'a>(&'a Counters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn instant(_: u16) -> Duration {
    Duration::ZERO
}

pub fn millis_1(_: u16) -> Duration {
    Duration::from_millis(1)
}
