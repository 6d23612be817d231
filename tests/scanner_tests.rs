mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{instant, millis_1, FakeProbe};
use port_bridge::error::ScanError;
use port_bridge::scanner::{ScanConfig, ScanCoordinator};
use port_bridge::session::ScanSession;
use port_bridge::types::ScanState;
use tokio::net::TcpListener;

fn config(concurrency: usize) -> ScanConfig {
    ScanConfig::new(concurrency, Duration::from_millis(200), Duration::from_secs(30)).unwrap()
}

fn assert_strictly_ascending_within(ports: &[u16], low: u16, high: u16) {
    assert!(ports.windows(2).all(|w| w[0] < w[1]), "not strictly ascending: {ports:?}");
    assert!(ports.iter().all(|p| (low..=high).contains(p)), "out of range: {ports:?}");
}

#[tokio::test]
async fn only_listening_port_is_reported() {
    let (probe, counters) = FakeProbe::new(&[80], instant);
    let coordinator = ScanCoordinator::with_probe(probe, config(16), ScanSession::new());

    let outcome = coordinator.scan_range("127.0.0.1", 1, 100).await.unwrap();
    assert_eq!(outcome.open_ports, vec![80]);
    assert_eq!(outcome.scanned_ports, 100);
    assert_eq!(counters.calls.load(Ordering::Relaxed), 100);
    assert!(coordinator.session().is_port_open(80).await);
}

#[tokio::test]
async fn completion_order_does_not_affect_reported_order() {
    // Higher ports answer first.
    let (probe, _) = FakeProbe::new(&[99, 3, 50, 7], |port| Duration::from_millis(100 - u64::from(port)));
    let coordinator = ScanCoordinator::with_probe(probe, config(100), ScanSession::new());

    let outcome = coordinator.scan_range("127.0.0.1", 1, 99).await.unwrap();
    assert_eq!(outcome.open_ports, vec![3, 7, 50, 99]);
    assert_strictly_ascending_within(&outcome.open_ports, 1, 99);
}

#[tokio::test]
async fn in_flight_probes_never_exceed_cap() {
    let (probe, counters) = FakeProbe::new(&[], |_| Duration::from_millis(5));
    let coordinator = ScanCoordinator::with_probe(probe, config(8), ScanSession::new());

    let outcome = coordinator.scan_range("127.0.0.1", 1, 200).await.unwrap();
    assert!(outcome.open_ports.is_empty());
    let peak = counters.peak.load(Ordering::SeqCst);
    assert!(peak <= 8, "peak {peak} exceeded cap");
    assert!(peak > 1, "probes never overlapped");
}

#[tokio::test]
async fn invalid_requests_never_touch_the_session() {
    let (probe, counters) = FakeProbe::new(&[80], instant);
    let coordinator = ScanCoordinator::with_probe(probe, config(4), ScanSession::new());

    for (low, high) in [(100, 1), (0, 10), (1, 65536), (-1, 5)] {
        let res = coordinator.scan_range("127.0.0.1", low, high).await;
        assert!(matches!(res, Err(ScanError::InvalidRange { .. })), "{low}-{high}");
    }
    assert!(matches!(
        coordinator.scan_range("", 1, 10).await,
        Err(ScanError::EmptyHost)
    ));

    assert_eq!(counters.calls.load(Ordering::Relaxed), 0);
    assert!(coordinator.session().current().await.is_none());
    assert_eq!(coordinator.session().status().await.state, ScanState::Idle);
}

#[tokio::test]
async fn repeated_scans_agree() {
    let (probe, _) = FakeProbe::new(&[22, 443, 8080], millis_1);
    let coordinator = ScanCoordinator::with_probe(probe, config(64), ScanSession::new());

    let first = coordinator.scan_range("127.0.0.1", 1, 9000).await.unwrap();
    let second = coordinator.scan_range("127.0.0.1", 1, 9000).await.unwrap();
    assert_eq!(first.open_ports, vec![22, 443, 8080]);
    assert_eq!(first.open_ports, second.open_ports);
}

#[tokio::test]
async fn new_scan_cancels_the_one_in_flight() {
    // Ports above 10 are slow, so the first scan is still running when the second starts.
    let (probe, _) = FakeProbe::new(&[3, 40], |port| {
        if port > 10 {
            Duration::from_millis(50)
        } else {
            Duration::from_millis(1)
        }
    });
    let coordinator = Arc::new(ScanCoordinator::with_probe(probe, config(1), ScanSession::new()));

    let slow = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.scan_range("127.0.0.1", 1, 100).await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(coordinator.session().status().await.state, ScanState::Running);

    let fast = coordinator.scan_range("127.0.0.1", 1, 5).await.unwrap();
    assert_eq!(fast.open_ports, vec![3]);

    let superseded = slow.await.unwrap();
    assert!(matches!(superseded, Err(ScanError::Cancelled)));
    let current = coordinator.session().current().await.unwrap();
    assert_eq!(current.open_ports, vec![3]);
    assert_eq!(coordinator.session().status().await.state, ScanState::Done);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replacement_scan_shares_the_concurrency_cap() {
    let (probe, counters) = FakeProbe::new(&[2], |port| {
        if port > 100 {
            Duration::from_millis(200)
        } else {
            Duration::from_millis(5)
        }
    });
    let coordinator = Arc::new(ScanCoordinator::with_probe(probe, config(4), ScanSession::new()));

    let slow = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.scan_range("127.0.0.1", 101, 1000).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let busy = counters.in_flight.load(Ordering::SeqCst);
    assert!((1..=4).contains(&busy), "{busy} attempts in flight");

    let fast = coordinator.scan_range("127.0.0.1", 1, 40).await.unwrap();
    assert_eq!(fast.open_ports, vec![2]);
    assert!(matches!(slow.await.unwrap(), Err(ScanError::Cancelled)));

    let peak = counters.peak.load(Ordering::SeqCst);
    assert!(peak <= 4, "superseded and replacement scans reached {peak} attempts");
}

#[tokio::test]
async fn external_cancel_publishes_nothing() {
    let (probe, _) = FakeProbe::new(&[5], |_| Duration::from_millis(20));
    let coordinator = Arc::new(ScanCoordinator::with_probe(probe, config(2), ScanSession::new()));

    let running = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.scan_range("127.0.0.1", 1, 1000).await })
    };
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(coordinator.session().cancel_current().await);

    let res = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("cancelled scan did not stop")
        .unwrap();
    assert!(matches!(res, Err(ScanError::Cancelled)));
    assert!(coordinator.session().current().await.is_none());
    assert_eq!(coordinator.session().status().await.state, ScanState::Cancelled);
}

#[tokio::test]
async fn deadline_yields_partial_outcome() {
    let (probe, _) = FakeProbe::new(&[1], |_| Duration::from_millis(100));
    let cfg = ScanConfig::new(1, Duration::from_millis(50), Duration::from_millis(350)).unwrap();
    let coordinator = ScanCoordinator::with_probe(probe, cfg, ScanSession::new());

    let started = Instant::now();
    let outcome = coordinator.scan_range("127.0.0.1", 1, 100).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(outcome.scanned_ports < 100);
    assert_eq!(outcome.open_ports, vec![1]);
    assert!(outcome.diagnostics.iter().any(|d| d.contains("deadline")));
}

#[tokio::test]
async fn real_listener_is_found_open() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let coordinator = ScanCoordinator::new(config(8), ScanSession::new());

    let outcome = coordinator
        .scan_range("127.0.0.1", i64::from(port), i64::from(port))
        .await
        .unwrap();
    assert_eq!(outcome.open_ports, vec![port]);
}

#[tokio::test]
async fn refused_sweep_is_bounded_by_concurrency() {
    // 1000 ports at cap 100 and 200 ms per probe: at most ~10 rounds of 200 ms,
    // far below the 200 s a sequential sweep could take.
    let cfg = ScanConfig::new(100, Duration::from_millis(200), Duration::from_secs(60)).unwrap();
    let coordinator = ScanCoordinator::new(cfg, ScanSession::new());

    let started = Instant::now();
    let outcome = coordinator.scan_range("127.0.0.1", 1, 1000).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10), "took {:?}", started.elapsed());
    assert_eq!(outcome.scanned_ports, 1000);
    assert_strictly_ascending_within(&outcome.open_ports, 1, 1000);
}

#[tokio::test]
async fn unresolvable_host_is_not_a_hard_error() {
    let cfg = ScanConfig::new(4, Duration::from_millis(200), Duration::from_secs(5)).unwrap();
    let coordinator = ScanCoordinator::new(cfg, ScanSession::new());

    let outcome = coordinator.scan_range("no-such-host.invalid", 1, 10).await.unwrap();
    assert!(outcome.open_ports.is_empty());
    assert!(outcome.diagnostics.iter().any(|d| d.contains("resolve")));
}
