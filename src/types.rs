use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ScanError;
use crate::ports;

/// A validated request to scan `host` over `[port_low, port_high]`.
///
/// Only constructible through [`ScanRequest::new`], so every value in
/// circulation already satisfies `1 <= port_low <= port_high <= 65535`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    host: String,
    port_low: u16,
    port_high: u16,
}

impl ScanRequest {
    /// Validate raw input. Bounds are taken as `i64` so that negative or
    /// oversized values surface as `InvalidRange` instead of a parse failure.
    pub fn new(host: impl Into<String>, port_low: i64, port_high: i64) -> Result<Self, ScanError> {
        let host = host.into().trim().to_string();
        if host.is_empty() {
            return Err(ScanError::EmptyHost);
        }
        let (port_low, port_high) = ports::validate_bounds(port_low, port_high)?;
        Ok(Self {
            host,
            port_low,
            port_high,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port_low(&self) -> u16 {
        self.port_low
    }

    pub fn port_high(&self) -> u16 {
        self.port_high
    }

    /// Number of ports covered by the request.
    pub fn port_count(&self) -> u64 {
        u64::from(self.port_high - self.port_low) + 1
    }
}

/// Why a probe did not find the port open. Never surfaced as a hard error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum ProbeFailure {
    /// Peer answered with RST: the port is closed.
    Refused,
    /// No answer before the probe timeout: likely filtered.
    Timeout,
    /// Network or host unreachable, or any other connect error.
    Unreachable(String),
    /// The host name could not be resolved.
    Resolve(String),
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeFailure::Refused => f.write_str("connection refused"),
            ProbeFailure::Timeout => f.write_str("timed out"),
            ProbeFailure::Unreachable(e) => write!(f, "unreachable: {e}"),
            ProbeFailure::Resolve(e) => write!(f, "resolution failed: {e}"),
        }
    }
}

/// Result of a single probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub port: u16,
    pub open: bool,
    pub error: Option<ProbeFailure>,
}

impl ProbeResult {
    pub fn open(port: u16) -> Self {
        Self {
            port,
            open: true,
            error: None,
        }
    }

    pub fn closed(port: u16, cause: ProbeFailure) -> Self {
        Self {
            port,
            open: false,
            error: Some(cause),
        }
    }
}

/// The settled result of one scan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScanOutcome {
    pub host: String,
    /// Strictly ascending, no duplicates.
    pub open_ports: Vec<u16>,
    /// RFC3339 UTC timestamp.
    pub started_at: String,
    pub duration_ms: u64,
    pub scanned_ports: u64,
    pub diagnostics: Vec<String>,
}

impl ScanOutcome {
    pub fn is_open(&self, port: u16) -> bool {
        self.open_ports.binary_search(&port).is_ok()
    }
}

/// A file available for download from the shared directory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SharedFile {
    pub name: String,
    pub size_bytes: u64,
}

/// A request to download `filename` through a previously discovered `port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeRequest {
    pub port: u16,
    pub filename: Option<String>,
}

impl BridgeRequest {
    pub fn new(port: u16, filename: impl Into<String>) -> Self {
        Self {
            port,
            filename: Some(filename.into()),
        }
    }
}

/// Lifecycle of the current scan slot, reported by `/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    #[default]
    Idle,
    Running,
    Done,
    Cancelled,
}

/// Progress counters for the current scan.
#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ScanStatus {
    pub state: ScanState,
    pub total: u64,
    pub scanned: u64,
    pub open: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_trims_host_and_keeps_bounds() {
        let req = ScanRequest::new("  127.0.0.1 ", 1, 100).unwrap();
        assert_eq!(req.host(), "127.0.0.1");
        assert_eq!((req.port_low(), req.port_high()), (1, 100));
        assert_eq!(req.port_count(), 100);
    }

    #[test]
    fn request_rejects_blank_host() {
        assert!(matches!(ScanRequest::new("   ", 1, 2), Err(ScanError::EmptyHost)));
    }

    #[test]
    fn request_rejects_bad_ranges() {
        for (lo, hi) in [(0, 10), (10, 9), (1, 65536), (-5, 10)] {
            assert!(
                matches!(ScanRequest::new("h", lo, hi), Err(ScanError::InvalidRange { .. })),
                "{lo}-{hi} accepted"
            );
        }
    }

    #[test]
    fn outcome_membership_uses_sorted_ports() {
        let outcome = ScanOutcome {
            host: "h".into(),
            open_ports: vec![22, 80, 443],
            started_at: String::new(),
            duration_ms: 0,
            scanned_ports: 3,
            diagnostics: Vec::new(),
        };
        assert!(outcome.is_open(80));
        assert!(!outcome.is_open(81));
    }

    #[test]
    fn outcome_serializes_camel_case() {
        let outcome = ScanOutcome {
            host: "h".into(),
            open_ports: vec![80],
            started_at: "t".into(),
            duration_ms: 5,
            scanned_ports: 1,
            diagnostics: vec![],
        };
        let v = serde_json::to_value(&outcome).unwrap();
        assert_eq!(v["openPorts"], serde_json::json!([80]));
        assert_eq!(v["durationMs"], 5);
    }
}
