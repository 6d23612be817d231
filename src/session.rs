//! The single "current scan" slot shared by the scanner and the file bridge.

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::scanner::SharedProgress;
use crate::types::{ScanOutcome, ScanState, ScanStatus};

/// Most recent scan's outcome plus the handle of any scan in flight.
///
/// Policy for overlapping scans is cancel-and-replace: [`ScanSession::begin`]
/// cancels the running scan, clears the previous outcome and bumps the
/// generation. A commit is accepted only from the current generation, so a
/// superseded scan can never overwrite a newer one.
#[derive(Clone, Default)]
pub struct ScanSession {
    inner: Arc<RwLock<SessionState>>,
}

#[derive(Default)]
struct SessionState {
    generation: u64,
    state: ScanState,
    total: u64,
    outcome: Option<ScanOutcome>,
    cancel: Option<CancellationToken>,
    progress: Option<SharedProgress>,
}

/// Handed to the scan that owns the current generation.
///
/// Dropping the ticket cancels its token, so a scan future that is dropped
/// half-way (client went away) shows up as cancelled.
pub struct ScanTicket {
    generation: u64,
    cancel: CancellationToken,
    progress: SharedProgress,
    _guard: DropGuard,
}

impl ScanTicket {
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn progress(&self) -> SharedProgress {
        self.progress.clone()
    }
}

impl ScanSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new generation for a scan of `total` ports.
    pub async fn begin(&self, total: u64) -> ScanTicket {
        let cancel = CancellationToken::new();
        let progress = SharedProgress::new();
        let mut s = self.inner.write().await;
        if let Some(previous) = s.cancel.take() {
            previous.cancel();
        }
        s.generation += 1;
        s.state = ScanState::Running;
        s.total = total;
        s.outcome = None;
        s.cancel = Some(cancel.clone());
        s.progress = Some(progress.clone());
        ScanTicket {
            generation: s.generation,
            _guard: cancel.clone().drop_guard(),
            cancel,
            progress,
        }
    }

    /// Store `outcome` if `ticket` still owns the slot. Returns whether it was stored.
    pub async fn commit(&self, ticket: &ScanTicket, outcome: ScanOutcome) -> bool {
        let mut s = self.inner.write().await;
        if s.generation != ticket.generation || ticket.cancel.is_cancelled() {
            return false;
        }
        s.state = ScanState::Done;
        s.outcome = Some(outcome);
        s.cancel = None;
        s.progress = None;
        true
    }

    /// Mark the ticket's scan as cancelled if it still owns the slot.
    pub async fn abandon(&self, ticket: &ScanTicket) {
        let mut s = self.inner.write().await;
        if s.generation == ticket.generation {
            s.state = ScanState::Cancelled;
            s.cancel = None;
        }
    }

    /// Cancel the scan in flight, if any.
    pub async fn cancel_current(&self) -> bool {
        let s = self.inner.read().await;
        match s.cancel.as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn current(&self) -> Option<ScanOutcome> {
        self.inner.read().await.outcome.clone()
    }

    /// Whether `port` was found open by the current outcome.
    pub async fn is_port_open(&self, port: u16) -> bool {
        self.inner
            .read()
            .await
            .outcome
            .as_ref()
            .is_some_and(|o| o.is_open(port))
    }

    pub async fn status(&self) -> ScanStatus {
        let s = self.inner.read().await;
        let mut state = s.state;
        if state == ScanState::Running && s.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            state = ScanState::Cancelled;
        }
        let (scanned, open) = match (&s.progress, &s.outcome) {
            (Some(p), _) => (p.scanned(), p.open()),
            (None, Some(o)) => (o.scanned_ports, o.open_ports.len() as u64),
            (None, None) => (0, 0),
        };
        ScanStatus {
            state,
            total: s.total,
            scanned,
            open,
        }
    }
}
