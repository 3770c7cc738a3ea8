use crate::probe::{self, HostProbe, Reachability};
use async_trait::async_trait;
use crate::services::ServiceCatalog;
use crate::types::{
    open_port_message, percent, unreachable_message, OpenPort, ScanOutcome, ScanRequest,
    ScanStatus, ScanSummary,
};
use ::time::{format_description::well_known, OffsetDateTime};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Maximum number of connect attempts in flight at once.
pub const DEFAULT_CONCURRENCY: usize = 50;

/// How long `scan` waits for outstanding attempts once scheduling has stopped.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// TCP connect scanner for one host and one inclusive port range.
///
/// - Gates the scan on a [`Reachability`] probe of the target.
/// - Limits concurrent socket attempts using a `Semaphore`.
/// - Uses `tokio::time::timeout` to bound connect time per socket.
/// - Streams open-port messages and progress percentages through caller callbacks.
/// - Stops scheduling new ports once [`Scanner::cancel`] is called; attempts already
///   in flight finish or time out on their own.
pub struct Scanner {
    request: ScanRequest,
    catalog: Option<Arc<ServiceCatalog>>,
    prober: Arc<dyn Reachability>,
    connector: Arc<dyn PortConnector>,
    concurrency: usize,
    grace: Duration,
    cancel: CancellationToken,
}

impl Scanner {
    pub fn new(request: ScanRequest) -> Self {
        Self {
            request,
            catalog: None,
            prober: Arc::new(HostProbe),
            connector: Arc::new(TcpConnector),
            concurrency: DEFAULT_CONCURRENCY,
            grace: DEFAULT_GRACE_PERIOD,
            cancel: CancellationToken::new(),
        }
    }

    /// Label open ports from `catalog` instead of the process-wide built-in table.
    pub fn with_catalog(mut self, catalog: Arc<ServiceCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_prober(mut self, prober: Arc<dyn Reachability>) -> Self {
        self.prober = prober;
        self
    }

    /// Replace the per-port connect step.
    pub fn with_connector(mut self, connector: Arc<dyn PortConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.clamp(1, 5_000);
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn request(&self) -> &ScanRequest {
        &self.request
    }

    /// Stop scheduling new ports. Safe to call from any thread, any number of times,
    /// before, during or after a scan.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that cancels this scanner; hand it to whatever drives cancellation.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the scan to completion, cancellation or grace-period expiry.
    ///
    /// `on_result` receives one message per open port, or a single unreachable message
    /// when the target fails the reachability gate. `on_progress` receives a
    /// non-decreasing percentage once per finished port. Neither callback is invoked
    /// after this future resolves.
    pub async fn scan<R, P>(&self, on_result: R, on_progress: P) -> ScanSummary
    where
        R: Fn(String) + Send + Sync + 'static,
        P: Fn(u8) + Send + Sync + 'static,
    {
        let started_at = now_iso_like();
        let target = self.request.target().to_string();
        let timeout = self.request.timeout();
        let total = self.request.total();

        let ip = if self.prober.probe(&target, timeout).await {
            probe::resolve(&target, timeout).await
        } else {
            None
        };
        let Some(ip) = ip else {
            info!(host = %target, "target unreachable, skipping scan");
            on_result(unreachable_message(&target));
            return self.summary(ScanStatus::Unreachable, Tally::default(), started_at);
        };

        info!(
            host = %target,
            %ip,
            start = self.request.start_port(),
            end = self.request.end_port(),
            concurrency = self.concurrency,
            "starting scan"
        );

        let shared = Arc::new(Shared {
            target: target.clone(),
            total,
            tally: Mutex::new(Tally::default()),
            on_result,
            on_progress,
        });
        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        let mut cancelled = false;

        for port in self.request.ports() {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            // Waiting on a permit must not hide a cancel issued while the pool is full.
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                permit = sem.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let shared = shared.clone();
            let catalog = self.catalog.clone();
            let connector = self.connector.clone();

            set.spawn(async move {
                let _permit = permit; // keep permit until task completes
                let catalog = match &catalog {
                    Some(c) => c.as_ref(),
                    None => ServiceCatalog::global(),
                };
                let addr = SocketAddr::new(ip, port);
                let outcome = probe_port(connector.as_ref(), addr, timeout, catalog).await;
                shared.record(outcome);
            });
        }

        if cancelled {
            debug!(
                host = %target,
                in_flight = set.len(),
                "cancelled, no further ports scheduled"
            );
        }

        let drained = drain(&mut set, self.grace, &shared.tally).await;
        let status = if !drained {
            ScanStatus::Abandoned
        } else if cancelled {
            ScanStatus::Cancelled
        } else {
            ScanStatus::Completed
        };

        let tally = std::mem::take(&mut *lock(&shared.tally));
        info!(
            host = %target,
            completed = tally.completed,
            total,
            open = tally.open.len(),
            ?status,
            "scan finished"
        );
        self.summary(status, tally, started_at)
    }

    fn summary(&self, status: ScanStatus, tally: Tally, started_at: String) -> ScanSummary {
        let mut open = tally.open;
        open.sort_by_key(|o| o.port);
        ScanSummary {
            target: self.request.target().to_string(),
            start_port: self.request.start_port(),
            end_port: self.request.end_port(),
            total: self.request.total(),
            completed: tally.completed,
            status,
            open,
            started_at,
            finished_at: now_iso_like(),
        }
    }
}

/// One connection attempt against a single port.
#[async_trait]
pub trait PortConnector: Send + Sync {
    /// Whether a connection to `addr` completes within `timeout`.
    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> bool;
}

/// Plain TCP connect. The connection is dropped as soon as it is established.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl PortConnector for TcpConnector {
    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> bool {
        // Closed, filtered, or timed out all read as not open.
        matches!(
            time::timeout(timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

/// Attempt one port and label it from `catalog` when it is open.
pub async fn probe_port(
    connector: &dyn PortConnector,
    addr: SocketAddr,
    timeout: Duration,
    catalog: &ServiceCatalog,
) -> ScanOutcome {
    if connector.connect(addr, timeout).await {
        ScanOutcome::Open {
            port: addr.port(),
            service: catalog.lookup(addr.port()).to_string(),
        }
    } else {
        ScanOutcome::Closed { port: addr.port() }
    }
}

#[derive(Debug, Default)]
struct Tally {
    completed: u64,
    open: Vec<OpenPort>,
    /// Set once the grace period expires; later outcomes are discarded.
    closed: bool,
}

struct Shared<R, P> {
    target: String,
    total: u64,
    tally: Mutex<Tally>,
    on_result: R,
    on_progress: P,
}

impl<R, P> Shared<R, P>
where
    R: Fn(String),
    P: Fn(u8),
{
    /// Count one finished port and notify the observers, all under the tally lock so
    /// progress is delivered in increment order.
    fn record(&self, outcome: ScanOutcome) {
        let mut tally = lock(&self.tally);
        if tally.closed {
            return;
        }
        if let ScanOutcome::Open { port, service } = outcome {
            (self.on_result)(open_port_message(&self.target, port, &service));
            tally.open.push(OpenPort { port, service });
        }
        tally.completed += 1;
        (self.on_progress)(percent(tally.completed, self.total));
    }
}

fn lock(tally: &Mutex<Tally>) -> MutexGuard<'_, Tally> {
    tally.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait up to `grace` for every task to finish. On expiry the tally is closed and the
/// stragglers are aborted. Returns whether the set drained in time.
async fn drain(set: &mut JoinSet<()>, grace: Duration, tally: &Mutex<Tally>) -> bool {
    let drained = time::timeout(grace, async {
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                warn!("scan task failed: {e}");
            }
        }
    })
    .await
    .is_ok();

    if !drained {
        lock(tally).closed = true;
        debug!(outstanding = set.len(), "grace period expired, abandoning tasks");
        set.shutdown().await;
    }
    drained
}

fn now_iso_like() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("request", &self.request)
            .field("concurrency", &self.concurrency)
            .field("grace", &self.grace)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
