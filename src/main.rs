use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use port_bridge::config::PreferenceStore;
use port_bridge::ports;
use port_bridge::scanner::{ScanConfig, ScanCoordinator};
use port_bridge::server::{self, AppState};
use port_bridge::session::ScanSession;
use port_bridge::types::{ScanOutcome, ScanRequest};

/// port-bridge — concurrent TCP port scanner with a file bridge gated on open ports.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "port-bridge",
    version,
    about = "Concurrent TCP port scanner with a file bridge gated on the ports found open.",
    long_about = None
)]
struct Cli {
    /// Address the HTTP server listens on.
    #[arg(long, default_value = "0.0.0.0:3000")]
    bind: String,

    /// Directory whose files are offered for download.
    #[arg(long = "shared-dir", default_value = "shared_files")]
    shared_dir: PathBuf,

    /// Directory with static UI assets.
    #[arg(long = "ui-dir", default_value = "public")]
    ui_dir: PathBuf,

    /// Preferences file (last port range, worker count).
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Max concurrent TCP connect attempts. Defaults to the preferences file value.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Per-port connect timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 400)]
    timeout_ms: u64,

    /// Upper bound on the duration of a whole scan, in seconds.
    #[arg(long = "deadline-secs", default_value_t = 600)]
    deadline_secs: u64,

    /// Run a single scan against this host and exit instead of serving.
    #[arg(long = "scan-host")]
    scan_host: Option<String>,

    /// Port range for --scan-host, e.g. `1-1024`. Defaults to the last range used.
    #[arg(long)]
    ports: Option<String>,

    /// Write the one-shot scan outcome as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("port_bridge=info,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();
    let prefs = PreferenceStore::open(&cli.config);
    let stored = prefs.get().await;

    let concurrency = cli
        .concurrency
        .unwrap_or_else(|| usize::try_from(stored.thread.count).unwrap_or(1));
    let scan_config = ScanConfig::new(
        concurrency,
        Duration::from_millis(cli.timeout_ms),
        Duration::from_secs(cli.deadline_secs),
    )?;

    tracing::info!(
        config = %prefs.path().display(),
        concurrency = scan_config.concurrency(),
        timeout_ms = scan_config.probe_timeout().as_millis() as u64,
        deadline_secs = scan_config.deadline().as_secs(),
        "port-bridge configuration"
    );

    if let Some(host) = cli.scan_host.as_deref() {
        let (low, high) = match cli.ports.as_deref() {
            Some(s) => ports::parse_range_str(s)?,
            None => (
                u16::try_from(stored.range.low).unwrap_or(ports::DEFAULT_RANGE.0),
                u16::try_from(stored.range.high).unwrap_or(ports::DEFAULT_RANGE.1),
            ),
        };
        let req = ScanRequest::new(host, i64::from(low), i64::from(high))?;
        let coordinator = ScanCoordinator::new(scan_config, ScanSession::new());

        let cancel_session = coordinator.session().clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel_session.cancel_current().await;
            }
        });

        let outcome = coordinator.scan(&req).await?;
        prefs.record_range_logged(low, high).await;
        print_outcome(&outcome);
        if let Some(path) = cli.output.as_deref() {
            write_outcome_json(path, &outcome)
                .with_context(|| format!("failed to write JSON to {}", path.display()))?;
            println!("Wrote JSON results to {}", path.display());
        }
        return Ok(());
    }

    let state = AppState::new(&cli.shared_dir, prefs, scan_config);
    tokio::select! {
        res = server::spawn_server(&cli.bind, state, &cli.ui_dir) => res?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    Ok(())
}

fn print_outcome(outcome: &ScanOutcome) {
    println!(
        "\nOpen ports on {}: {} (scanned: {}, {} ms)",
        outcome.host,
        outcome.open_ports.len(),
        outcome.scanned_ports,
        outcome.duration_ms
    );
    let port_w = 5usize.max("port".len());
    println!("{:>port_w$}  state", "port", port_w = port_w);
    println!("{:->port_w$}  -----", "", port_w = port_w);
    for port in &outcome.open_ports {
        println!("{:>port_w$}  open", port, port_w = port_w);
    }
    for line in &outcome.diagnostics {
        println!("  * {line}");
    }
}

fn write_outcome_json(path: &std::path::Path, outcome: &ScanOutcome) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, outcome)?;
    Ok(())
}
