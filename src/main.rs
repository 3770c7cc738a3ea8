use std::path::PathBuf;
use std::sync::Arc;

use net_scan_rs::report::{self, ResultLines};
use net_scan_rs::scanner::{Scanner, DEFAULT_CONCURRENCY};
use net_scan_rs::services::ServiceCatalog;
use net_scan_rs::types::{ScanRequest, ScanStatus};

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// net-scan-rs — Concurrent TCP connect port scanner with live progress.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "net-scan-rs",
    version,
    about = "Concurrent TCP connect port scanner with live progress.",
    long_about = None
)]
struct Cli {
    /// Hostname or IP address to scan.
    target: String,

    /// First port of the inclusive range.
    #[arg(long, default_value_t = 1)]
    start: u16,

    /// Last port of the inclusive range.
    #[arg(long, default_value_t = 1024)]
    end: u16,

    /// Reachability probe and per-port connect timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 100)]
    timeout_ms: u64,

    /// Max concurrent TCP connect attempts.
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Service table file (`<port> <label>` per line) replacing the built-in table.
    #[arg(long)]
    services: Option<PathBuf>,

    /// Write a plain-text report of the result lines to this path.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Write the scan summary as pretty JSON to this path.
    #[arg(long)]
    json: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset (e.g. `info`, `net_scan_rs=debug`).
    #[arg(long = "log-level", default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let request = ScanRequest::new(&cli.target, cli.start, cli.end, cli.timeout_ms)?;
    let mut scanner = Scanner::new(request).with_concurrency(cli.concurrency);
    if let Some(path) = cli.services.as_deref() {
        let catalog = ServiceCatalog::from_path(path);
        info!(entries = catalog.len(), "loaded service table {}", path.display());
        scanner = scanner.with_catalog(Arc::new(catalog));
    }

    println!(
        "Scanning {} ports {}-{} (timeout {} ms, concurrency {})",
        cli.target, cli.start, cli.end, cli.timeout_ms, cli.concurrency
    );

    // Ctrl-C stops scheduling; in-flight attempts still report.
    let cancel = scanner.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}%")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    // Result lines go to stdout whether or not the bar is drawn.
    let lines = Arc::new(ResultLines::new(std::io::stdout()));
    let on_result = {
        let pb = pb.clone();
        let lines = lines.clone();
        move |msg: String| pb.suspend(|| lines.push(msg))
    };
    let on_progress = {
        let pb = pb.clone();
        move |pct: u8| pb.set_position(u64::from(pct))
    };

    let summary = scanner.scan(on_result, on_progress).await;
    pb.finish_and_clear();

    match summary.status {
        ScanStatus::Cancelled => println!("Scan cancelled"),
        ScanStatus::Abandoned => println!(
            "Scan stopped: {} of {} ports finished before the grace period ran out",
            summary.completed, summary.total
        ),
        ScanStatus::Completed => println!(
            "Scan complete: {} open of {} ports",
            summary.open.len(),
            summary.total
        ),
        ScanStatus::Unreachable => {}
    }

    if let Some(path) = cli.report.as_deref() {
        match report::write_text_report(path, &lines.lines()) {
            Ok(()) => println!("Wrote report to {}", path.display()),
            Err(e) => eprintln!("{e:#}"),
        }
    }
    if let Some(path) = cli.json.as_deref() {
        match report::write_summary_json(path, &summary) {
            Ok(()) => println!("Wrote JSON results to {}", path.display()),
            Err(e) => eprintln!("{e:#}"),
        }
    }

    Ok(())
}
