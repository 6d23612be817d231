use thiserror::Error;

/// Request-level scan failures. Individual probe failures never end up here.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid port range {low}-{high} (ports must satisfy 1 <= low <= high <= 65535)")]
    InvalidRange { low: i64, high: i64 },

    #[error("Host must not be empty")]
    EmptyHost,

    #[error("Scan was cancelled before it completed")]
    Cancelled,

    #[error("Invalid scan configuration: {0}")]
    Config(String),
}

/// File bridge failures.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Port {0} was not found open by the current scan")]
    ForbiddenPort(u16),

    #[error("File not found")]
    NotFound,

    #[error("Transfer failed: {0}")]
    Transfer(#[source] std::io::Error),

    #[error("Shared directory error: {0}")]
    Io(#[from] std::io::Error),
}
