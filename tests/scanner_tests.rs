use async_trait::async_trait;
use net_scan_rs::probe::Reachability;
use net_scan_rs::scanner::{PortConnector, Scanner, DEFAULT_CONCURRENCY};
use net_scan_rs::services::ServiceCatalog;
use net_scan_rs::types::{ScanRequest, ScanStatus};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const HOST: &str = "127.0.0.1";

struct FixedProbe(bool);

#[async_trait]
impl Reachability for FixedProbe {
    async fn probe(&self, _target: &str, _timeout: Duration) -> bool {
        self.0
    }
}

/// Connector that never connects, holds each attempt open for a while and records
/// how many attempts overlap and the order they start in.
#[derive(Default)]
struct SlowConnector {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    started: Mutex<Vec<u16>>,
}

#[async_trait]
impl PortConnector for SlowConnector {
    async fn connect(&self, addr: SocketAddr, _timeout: Duration) -> bool {
        self.started.lock().unwrap().push(addr.port());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        false
    }
}

#[derive(Clone, Default)]
struct Recorder {
    results: Arc<Mutex<Vec<String>>>,
    progress: Arc<Mutex<Vec<u8>>>,
}

impl Recorder {
    fn on_result(&self) -> impl Fn(String) + Send + Sync + 'static {
        let results = self.results.clone();
        move |msg| results.lock().unwrap().push(msg)
    }

    fn on_progress(&self) -> impl Fn(u8) + Send + Sync + 'static {
        let progress = self.progress.clone();
        move |pct| progress.lock().unwrap().push(pct)
    }

    fn results(&self) -> Vec<String> {
        let mut r = self.results.lock().unwrap().clone();
        r.sort();
        r
    }

    fn progress(&self) -> Vec<u8> {
        self.progress.lock().unwrap().clone()
    }
}

/// Find `len` consecutive free loopback ports. Ports at the offsets in `open` stay
/// bound (and so accept connections); the rest are released and refuse connections.
fn reserve_block(len: u16, open: &[u16]) -> (u16, Vec<TcpListener>) {
    for _ in 0..100 {
        let probe = TcpListener::bind((HOST, 0)).unwrap();
        let base = probe.local_addr().unwrap().port();
        drop(probe);
        if base.checked_add(len).is_none() {
            continue;
        }
        let mut bound = Vec::new();
        for off in 0..len {
            match TcpListener::bind((HOST, base + off)) {
                Ok(l) => bound.push((off, l)),
                Err(_) => break,
            }
        }
        if bound.len() != usize::from(len) {
            continue;
        }
        let kept = bound
            .into_iter()
            .filter(|(off, _)| open.contains(off))
            .map(|(_, l)| l)
            .collect();
        return (base, kept);
    }
    panic!("could not find {len} consecutive free ports");
}

fn reachable_scanner(start: u16, end: u16, catalog: ServiceCatalog) -> Scanner {
    let request = ScanRequest::new(HOST, start, end, 500).unwrap();
    Scanner::new(request)
        .with_prober(Arc::new(FixedProbe(true)))
        .with_catalog(Arc::new(catalog))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reports_open_ports_with_service_labels() {
    let (base, _listeners) = reserve_block(6, &[2, 5]);
    let catalog = ServiceCatalog::empty()
        .with_entry(base + 2, "SSH")
        .with_entry(base + 5, "SMTP");
    let scanner = reachable_scanner(base, base + 5, catalog);
    let rec = Recorder::default();

    let summary = scanner.scan(rec.on_result(), rec.on_progress()).await;

    let mut expected = vec![
        format!("Open port: {HOST}:{} (SSH)", base + 2),
        format!("Open port: {HOST}:{} (SMTP)", base + 5),
    ];
    expected.sort();
    assert_eq!(rec.results(), expected);

    let progress = rec.progress();
    assert_eq!(progress.len(), 6);
    assert_eq!(progress.last(), Some(&100));
    assert_eq!(summary.status, ScanStatus::Completed);
    assert_eq!(summary.completed, 6);
    assert_eq!(
        summary.open.iter().map(|o| o.port).collect::<Vec<_>>(),
        vec![base + 2, base + 5]
    );
}

#[tokio::test]
async fn unreachable_target_reports_once_without_progress() {
    let request = ScanRequest::new(HOST, 1, 1024, 100).unwrap();
    let scanner = Scanner::new(request).with_prober(Arc::new(FixedProbe(false)));
    let rec = Recorder::default();

    let summary = scanner.scan(rec.on_result(), rec.on_progress()).await;

    assert_eq!(
        rec.results(),
        vec!["Target 127.0.0.1 does not exist or is unreachable.".to_string()]
    );
    assert!(rec.progress().is_empty());
    assert_eq!(summary.status, ScanStatus::Unreachable);
    assert_eq!(summary.completed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn progress_is_non_decreasing_under_concurrency() {
    let (base, _listeners) = reserve_block(120, &[3, 40, 77, 119]);
    let scanner =
        reachable_scanner(base, base + 119, ServiceCatalog::empty()).with_concurrency(50);
    let rec = Recorder::default();

    let summary = scanner.scan(rec.on_result(), rec.on_progress()).await;

    let progress = rec.progress();
    assert_eq!(progress.len(), 120);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(progress.last(), Some(&100));
    assert_eq!(rec.results().len(), 4);
    assert_eq!(summary.completed, 120);
}

#[tokio::test]
async fn cancel_before_scan_schedules_nothing() {
    let (base, _listeners) = reserve_block(4, &[0, 1, 2, 3]);
    let scanner = reachable_scanner(base, base + 3, ServiceCatalog::empty());
    scanner.cancel();
    let rec = Recorder::default();

    let summary = scanner.scan(rec.on_result(), rec.on_progress()).await;

    assert!(rec.results().is_empty());
    assert!(rec.progress().is_empty());
    assert_eq!(summary.status, ScanStatus::Cancelled);
    assert_eq!(summary.completed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_scan_stops_scheduling() {
    let (base, _listeners) = reserve_block(20, &[]);
    let scanner =
        reachable_scanner(base, base + 19, ServiceCatalog::empty()).with_concurrency(1);
    let token = scanner.cancel_token();
    let progress = Arc::new(Mutex::new(Vec::new()));
    let seen = progress.clone();

    let summary = scanner
        .scan(
            |_msg: String| {},
            move |pct: u8| {
                seen.lock().unwrap().push(pct);
                token.cancel();
            },
        )
        .await;

    let progress = progress.lock().unwrap().clone();
    assert!(!progress.is_empty());
    assert!(progress.len() < 20);
    assert_eq!(summary.status, ScanStatus::Cancelled);
    assert_eq!(summary.completed as usize, progress.len());
}

#[test]
fn cancel_from_another_thread() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let request = ScanRequest::new(HOST, 1, 65535, 200).unwrap();
    let scanner = Arc::new(
        Scanner::new(request)
            .with_prober(Arc::new(FixedProbe(true)))
            .with_concurrency(1),
    );

    let remote = scanner.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        remote.cancel();
    });

    let summary = rt.block_on(scanner.scan(|_| {}, |_| {}));
    canceller.join().unwrap();

    assert_eq!(summary.status, ScanStatus::Cancelled);
    assert!(summary.completed < summary.total);
}

#[tokio::test]
async fn cancel_after_finish_is_a_no_op() {
    let (base, _listeners) = reserve_block(2, &[0]);
    let scanner = reachable_scanner(base, base + 1, ServiceCatalog::empty());
    let rec = Recorder::default();

    let summary = scanner.scan(rec.on_result(), rec.on_progress()).await;
    scanner.cancel();

    assert_eq!(summary.status, ScanStatus::Completed);
    assert_eq!(rec.progress(), vec![50, 100]);
    assert!(scanner.is_cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn catalog_entry_changes_only_its_port_label() {
    let (base, _listeners) = reserve_block(2, &[0, 1]);

    let before = Recorder::default();
    reachable_scanner(base, base + 1, ServiceCatalog::empty())
        .scan(before.on_result(), before.on_progress())
        .await;

    let after = Recorder::default();
    let custom = ServiceCatalog::empty().with_entry(base, "Custom");
    reachable_scanner(base, base + 1, custom)
        .scan(after.on_result(), after.on_progress())
        .await;

    let unknown_first = format!("Open port: {HOST}:{base} (Unknown)");
    let custom_first = format!("Open port: {HOST}:{base} (Custom)");
    let second = format!("Open port: {HOST}:{} (Unknown)", base + 1);
    assert!(before.results().contains(&unknown_first));
    assert!(before.results().contains(&second));
    assert!(after.results().contains(&custom_first));
    assert!(after.results().contains(&second));
}

#[tokio::test]
async fn attempts_stay_within_width_and_start_in_ascending_order() {
    let connector = Arc::new(SlowConnector::default());
    let request = ScanRequest::new(HOST, 1000, 1199, 500).unwrap();
    let scanner = Scanner::new(request)
        .with_prober(Arc::new(FixedProbe(true)))
        .with_connector(connector.clone());
    let rec = Recorder::default();

    let summary = scanner.scan(rec.on_result(), rec.on_progress()).await;

    assert_eq!(summary.status, ScanStatus::Completed);
    assert_eq!(summary.completed, 200);
    assert!(rec.results().is_empty());
    assert_eq!(connector.peak.load(Ordering::SeqCst), DEFAULT_CONCURRENCY);
    assert_eq!(connector.in_flight.load(Ordering::SeqCst), 0);

    let started = connector.started.lock().unwrap().clone();
    assert_eq!(started, (1000..=1199).collect::<Vec<u16>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn narrower_width_is_respected() {
    let connector = Arc::new(SlowConnector::default());
    let request = ScanRequest::new(HOST, 1, 60, 500).unwrap();
    let scanner = Scanner::new(request)
        .with_prober(Arc::new(FixedProbe(true)))
        .with_connector(connector.clone())
        .with_concurrency(7);

    let summary = scanner.scan(|_| {}, |_| {}).await;

    assert_eq!(summary.completed, 60);
    let peak = connector.peak.load(Ordering::SeqCst);
    assert!(peak <= 7, "peak {peak} exceeded width");
    assert!(peak > 1);
}
