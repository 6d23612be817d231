use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use ::time::{format_description::well_known, OffsetDateTime};

use crate::error::ScanError;
use crate::probe::{resolve_host, Probe, TcpProbe};
use crate::session::ScanSession;
use crate::types::{ProbeFailure, ProbeResult, ScanOutcome, ScanRequest};

/// Upper bound on simultaneous connection attempts, whatever the caller asks for.
pub const MAX_CONCURRENCY: usize = 4096;
pub const DEFAULT_CONCURRENCY: usize = 500;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(400);
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(600);

/// Tuning for a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    concurrency: usize,
    probe_timeout: Duration,
    deadline: Duration,
}

impl ScanConfig {
    /// Concurrency is clamped to `1..=MAX_CONCURRENCY`; the per-probe timeout
    /// must be non-zero and strictly smaller than the scan deadline.
    pub fn new(concurrency: usize, probe_timeout: Duration, deadline: Duration) -> Result<Self, ScanError> {
        if probe_timeout.is_zero() {
            return Err(ScanError::Config("probe timeout must be greater than zero".into()));
        }
        if probe_timeout >= deadline {
            return Err(ScanError::Config(format!(
                "probe timeout ({} ms) must be shorter than the scan deadline ({} ms)",
                probe_timeout.as_millis(),
                deadline.as_millis()
            )));
        }
        Ok(Self {
            concurrency: concurrency.clamp(1, MAX_CONCURRENCY),
            probe_timeout,
            deadline,
        })
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            deadline: DEFAULT_DEADLINE,
        }
    }
}

/// Live counters readable while a scan runs.
#[derive(Clone, Debug)]
pub struct SharedProgress {
    scanned_done: Arc<AtomicU64>,
    open_count: Arc<AtomicU64>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self {
            scanned_done: Arc::new(AtomicU64::new(0)),
            open_count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn scanned(&self) -> u64 {
        self.scanned_done.load(Ordering::Relaxed)
    }

    pub fn open(&self) -> u64 {
        self.open_count.load(Ordering::Relaxed)
    }

    fn record(&self, res: &ProbeResult) {
        if res.open {
            self.open_count.fetch_add(1, Ordering::Relaxed);
        }
        self.scanned_done.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for SharedProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives scans and publishes their outcomes to a [`ScanSession`].
///
/// All scans started through one coordinator draw from the same permit pool,
/// so a superseded scan still winding down and its replacement together stay
/// within `concurrency` connection attempts.
pub struct ScanCoordinator<P: Probe = TcpProbe> {
    probe: Arc<P>,
    config: ScanConfig,
    permits: Arc<Semaphore>,
    session: ScanSession,
}

impl ScanCoordinator<TcpProbe> {
    pub fn new(config: ScanConfig, session: ScanSession) -> Self {
        Self::with_probe(TcpProbe, config, session)
    }
}

impl<P: Probe> ScanCoordinator<P> {
    pub fn with_probe(probe: P, config: ScanConfig, session: ScanSession) -> Self {
        Self {
            probe: Arc::new(probe),
            permits: Arc::new(Semaphore::new(config.concurrency)),
            config,
            session,
        }
    }

    pub fn session(&self) -> &ScanSession {
        &self.session
    }

    /// Validate raw input, then [`scan`](Self::scan). Nothing is probed and the
    /// session is left untouched when validation fails.
    pub async fn scan_range(&self, host: &str, port_low: i64, port_high: i64) -> Result<ScanOutcome, ScanError> {
        let req = ScanRequest::new(host, port_low, port_high)?;
        self.scan(&req).await
    }

    /// Run a scan and publish its outcome as the current session.
    ///
    /// Starting a scan cancels any scan already in flight; the cancelled one
    /// returns `ScanError::Cancelled` and publishes nothing.
    pub async fn scan(&self, req: &ScanRequest) -> Result<ScanOutcome, ScanError> {
        let ticket = self.session.begin(req.port_count()).await;
        let res = scan_ports(
            self.probe.clone(),
            req,
            &self.config,
            self.permits.clone(),
            ticket.token(),
            ticket.progress(),
        )
        .await;
        match res {
            Ok(outcome) => {
                if self.session.commit(&ticket, outcome.clone()).await {
                    Ok(outcome)
                } else {
                    self.session.abandon(&ticket).await;
                    Err(ScanError::Cancelled)
                }
            }
            Err(e) => {
                self.session.abandon(&ticket).await;
                Err(e)
            }
        }
    }
}

/// Probe every port of `req`, one `permits` permit per attempt in flight.
///
/// - A permit is taken before each task is spawned and released when the
///   task ends, so neither tasks nor sockets grow past the pool size on a
///   full 1-65535 sweep.
/// - `cancel` is checked between dispatches and aborts in-flight probes;
///   the scan then fails with `ScanError::Cancelled`.
/// - When the deadline passes, dispatch stops, in-flight probes are abandoned
///   and the outcome covers what settled, with a diagnostic.
pub async fn scan_ports<P: Probe>(
    probe: Arc<P>,
    req: &ScanRequest,
    config: &ScanConfig,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    progress: SharedProgress,
) -> Result<ScanOutcome, ScanError> {
    let started_at = now_rfc3339();
    let clock = Instant::now();
    let deadline_at = clock + config.deadline;
    let total = req.port_count();
    let mut tally = Tally::default();

    info!(
        host = req.host(),
        low = req.port_low(),
        high = req.port_high(),
        concurrency = config.concurrency,
        "scan started"
    );

    let resolved = tokio::select! {
        _ = cancel.cancelled() => return Err(ScanError::Cancelled),
        r = time::timeout_at(deadline_at, resolve_host(req.host())) => r,
    };
    let ip = match resolved {
        Ok(Ok(ip)) => {
            tally.diagnostics.push(format!("resolved {} to {}", req.host(), ip));
            ip
        }
        Ok(Err(e)) => {
            let cause = ProbeFailure::Resolve(e.to_string());
            tally.diagnostics.push(format!("could not resolve {}: {}", req.host(), cause));
            return Ok(tally.finish(req, started_at, clock, total, config));
        }
        Err(_) => {
            tally.diagnostics.push(format!("could not resolve {} before the scan deadline", req.host()));
            return Ok(tally.finish(req, started_at, clock, total, config));
        }
    };

    let stop = cancel.child_token();
    let mut set: JoinSet<Option<ProbeResult>> = JoinSet::new();

    for port in req.port_low()..=req.port_high() {
        while let Some(joined) = set.try_join_next() {
            tally.absorb(joined);
        }
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = time::sleep_until(deadline_at) => {
                tally.deadline_hit = true;
                break;
            }
            permit = permits.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let probe = probe.clone();
        let stop = stop.clone();
        let progress = progress.clone();
        let timeout = config.probe_timeout;
        set.spawn(async move {
            let _permit = permit;
            let res = tokio::select! {
                biased;
                _ = stop.cancelled() => return None,
                res = probe.probe(SocketAddr::new(ip, port), timeout) => res,
            };
            progress.record(&res);
            Some(res)
        });
    }

    if tally.deadline_hit {
        stop.cancel();
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = time::sleep_until(deadline_at), if !tally.deadline_hit => {
                tally.deadline_hit = true;
                stop.cancel();
            }
            joined = set.join_next() => match joined {
                Some(joined) => tally.absorb(joined),
                None => break,
            },
        }
    }

    if cancel.is_cancelled() {
        set.shutdown().await;
        info!(host = req.host(), "scan cancelled");
        return Err(ScanError::Cancelled);
    }

    let outcome = tally.finish_resolved(req, ip, started_at, clock, total, config);
    info!(
        host = %outcome.host,
        open = outcome.open_ports.len(),
        scanned = outcome.scanned_ports,
        duration_ms = outcome.duration_ms,
        "scan finished"
    );
    Ok(outcome)
}

/// Reduction of probe results, independent of completion order.
#[derive(Default)]
struct Tally {
    open: BTreeSet<u16>,
    settled: u64,
    refused: u64,
    timed_out: u64,
    unreachable: u64,
    abandoned: u64,
    first_unreachable: Option<(u16, String)>,
    deadline_hit: bool,
    diagnostics: Vec<String>,
}

impl Tally {
    fn absorb(&mut self, joined: Result<Option<ProbeResult>, JoinError>) {
        let res = match joined {
            Ok(Some(res)) => res,
            Ok(None) => {
                self.abandoned += 1;
                return;
            }
            Err(e) => {
                self.diagnostics.push(format!("probe task failed: {e}"));
                return;
            }
        };
        self.settled += 1;
        if res.open {
            debug!(port = res.port, "open port");
            self.open.insert(res.port);
            return;
        }
        match res.error {
            Some(ProbeFailure::Refused) => self.refused += 1,
            Some(ProbeFailure::Timeout) => self.timed_out += 1,
            Some(ProbeFailure::Unreachable(cause)) | Some(ProbeFailure::Resolve(cause)) => {
                self.unreachable += 1;
                if self.first_unreachable.is_none() {
                    self.first_unreachable = Some((res.port, cause));
                }
            }
            None => self.unreachable += 1,
        }
    }

    fn finish_resolved(
        mut self,
        req: &ScanRequest,
        ip: IpAddr,
        started_at: String,
        clock: Instant,
        total: u64,
        config: &ScanConfig,
    ) -> ScanOutcome {
        self.diagnostics.push(format!(
            "{} open, {} closed (refused), {} filtered (timed out), {} unreachable",
            self.open.len(),
            self.refused,
            self.timed_out,
            self.unreachable
        ));
        if let Some((port, cause)) = self.first_unreachable.take() {
            self.diagnostics.push(format!("first unreachable port {port} on {ip}: {cause}"));
        }
        if self.deadline_hit {
            self.diagnostics.push(format!(
                "scan deadline of {} s reached: {} ports not probed, {} probes abandoned",
                config.deadline.as_secs(),
                total - self.settled - self.abandoned,
                self.abandoned
            ));
        }
        self.finish(req, started_at, clock, total, config)
    }

    fn finish(
        mut self,
        req: &ScanRequest,
        started_at: String,
        clock: Instant,
        total: u64,
        config: &ScanConfig,
    ) -> ScanOutcome {
        let duration_ms = clock.elapsed().as_millis() as u64;
        self.diagnostics.push(format!(
            "probed {} of {} ports in {} ms (concurrency {}, timeout {} ms)",
            self.settled,
            total,
            duration_ms,
            config.concurrency,
            config.probe_timeout.as_millis()
        ));
        ScanOutcome {
            host: req.host().to_string(),
            open_ports: self.open.into_iter().collect(),
            started_at,
            duration_ms,
            scanned_ports: self.settled,
            diagnostics: self.diagnostics,
        }
    }
}

fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
