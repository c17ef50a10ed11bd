use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mc_scan_rs::sampler::{AddressFilter, AddressSampler};
use mc_scan_rs::scanner::{ScanError, ScanScheduler, StopReason};
use mc_scan_rs::types::{Candidate, ProbeFailure, ProbeOutcome, ProbeResult};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn public(n: u32) -> Candidate {
    Candidate::new(Ipv4Addr::from(0x0101_0000 + n), 25565)
}

/// Collect every outcome until the scheduler drops the last sender.
fn collector() -> (mpsc::Sender<ProbeOutcome>, JoinHandle<Vec<ProbeOutcome>>) {
    let (tx, mut rx) = mpsc::channel(64);
    let handle = tokio::spawn(async move {
        let mut out = Vec::new();
        while let Some(outcome) = rx.recv().await {
            out.push(outcome);
        }
        out
    });
    (tx, handle)
}

fn refused() -> ProbeResult {
    ProbeResult::Failed(ProbeFailure::Refused)
}

#[tokio::test]
async fn fixed_list_completes_and_every_slot_returns_idle() {
    let width = 16;
    let candidates: Vec<Candidate> = (0..12).map(public).collect();
    let latencies: Vec<u64> = {
        let mut rng = rand::rng();
        (0..12).map(|_| rng.random_range(0..400)).collect()
    };
    let scheduler = ScanScheduler::new(width, Duration::from_millis(500));
    let (tx, results) = collector();

    let mut i = 0;
    let report = scheduler
        .run(
            candidates.clone(),
            move |_c| {
                let delay = Duration::from_millis(latencies[i]);
                i += 1;
                async move {
                    tokio::time::sleep(delay).await;
                    refused()
                }
            },
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let outcomes = results.await.unwrap();
    assert_eq!(report.stop_reason, StopReason::CandidatesExhausted);
    assert_eq!(report.dispatched, 12);
    assert_eq!(report.completed, 12);
    assert_eq!(report.idle_slots, width);
    assert_eq!(outcomes.len(), 12);

    let mut seen: Vec<Candidate> = outcomes.iter().map(|o| o.candidate).collect();
    seen.sort();
    let mut expected = candidates;
    expected.sort();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn reserved_candidate_is_never_dispatched() {
    let private = Candidate::new(Ipv4Addr::new(192, 168, 1, 5), 25565);
    let probed = Arc::new(Mutex::new(Vec::new()));
    let scheduler = ScanScheduler::new(4, Duration::from_millis(200));
    let (tx, results) = collector();

    let log = probed.clone();
    let report = scheduler
        .run(
            vec![private, public(1)],
            move |c| {
                log.lock().unwrap().push(c);
                async { refused() }
            },
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.filtered, 1);
    assert_eq!(report.dispatched, 1);
    assert_eq!(*probed.lock().unwrap(), vec![public(1)]);
    let outcomes = results.await.unwrap();
    assert!(outcomes.iter().all(|o| o.candidate != private));
}

#[tokio::test]
async fn user_exclusions_are_enforced_at_dispatch() {
    let scheduler = ScanScheduler::new(4, Duration::from_millis(200))
        .with_filter(AddressFilter::new(["1.1.0.0/24".parse().unwrap()]));
    let (tx, results) = collector();
    let report = scheduler
        .run(
            (0..5).map(public),
            |_| async { refused() },
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.filtered, 5);
    assert_eq!(report.dispatched, 0);
    assert!(results.await.unwrap().is_empty());
}

#[tokio::test]
async fn hung_probe_is_bounded_by_the_scheduler() {
    let scheduler = ScanScheduler::new(2, Duration::from_millis(200));
    let (tx, results) = collector();
    let started = Instant::now();

    let report = scheduler
        .run(
            vec![public(1)],
            |_| std::future::pending::<ProbeResult>(),
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.idle_slots, 2);
    let outcomes = results.await.unwrap();
    assert!(matches!(
        outcomes[0].result,
        ProbeResult::Failed(ProbeFailure::Timeout)
    ));
}

#[tokio::test]
async fn concurrency_never_exceeds_width() {
    let width = 8;
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let scheduler = ScanScheduler::new(width, Duration::from_millis(500));
    let (tx, results) = collector();

    let (cur, max) = (in_flight.clone(), peak.clone());
    scheduler
        .run(
            (0..64).map(public),
            move |_| {
                let cur = cur.clone();
                let max = max.clone();
                async move {
                    let now = cur.fetch_add(1, Ordering::SeqCst) + 1;
                    max.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    cur.fetch_sub(1, Ordering::SeqCst);
                    refused()
                }
            },
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(results.await.unwrap().len(), 64);
    assert!(peak.load(Ordering::SeqCst) <= width);
    assert_eq!(in_flight.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancellation_stops_dispatch_and_drains() {
    let width = 10;
    let scheduler = ScanScheduler::new(width, Duration::from_millis(1000));
    let (tx, results) = collector();
    let cancel = CancellationToken::new();

    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        stopper.cancel();
    });

    let report = scheduler
        .run(
            AddressSampler::seeded(3, 25565, AddressFilter::default()),
            |_| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                refused()
            },
            tx,
            cancel,
        )
        .await
        .unwrap();

    let outcomes = results.await.unwrap();
    assert_eq!(report.stop_reason, StopReason::Cancelled);
    assert_eq!(report.idle_slots, width);
    assert!(report.dispatched > 0);
    assert_eq!(outcomes.len() as u64, report.dispatched);
}

#[tokio::test]
async fn cancel_while_waiting_for_a_slot_still_drains() {
    let scheduler = ScanScheduler::new(1, Duration::from_millis(1000));
    let (tx, results) = collector();
    let cancel = CancellationToken::new();

    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stopper.cancel();
    });

    // The single slot is busy for 300ms, so cancellation lands during the slot wait.
    let report = scheduler
        .run(
            (0..3).map(public),
            |_| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                refused()
            },
            tx,
            cancel,
        )
        .await
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::Cancelled);
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.completed, 1);
    assert_eq!(report.idle_slots, 1);
    let outcomes = results.await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].candidate, public(0));
}

#[tokio::test]
async fn probe_limit_stops_an_infinite_stream() {
    let scheduler = ScanScheduler::new(32, Duration::from_millis(200)).with_max_probes(50);
    let (tx, results) = collector();
    let report = scheduler
        .run(
            AddressSampler::seeded(9, 25565, AddressFilter::default()),
            |_| async { refused() },
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::ProbeLimit);
    assert_eq!(report.dispatched, 50);
    assert_eq!(results.await.unwrap().len(), 50);
}

#[tokio::test]
async fn time_limit_stops_the_scan() {
    let scheduler =
        ScanScheduler::new(4, Duration::from_millis(200)).with_max_duration(Duration::from_millis(200));
    let (tx, results) = collector();
    let started = Instant::now();
    let report = scheduler
        .run(
            AddressSampler::seeded(11, 25565, AddressFilter::default()),
            |_| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                refused()
            },
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::TimeLimit);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(results.await.unwrap().len() as u64, report.dispatched);
}

#[tokio::test]
async fn pacing_spaces_out_dispatches() {
    let scheduler =
        ScanScheduler::new(8, Duration::from_millis(200)).with_pace(Duration::from_millis(30));
    let (tx, results) = collector();
    let started = Instant::now();
    scheduler
        .run(
            (0..5).map(public),
            |_| async { refused() },
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // The first tick fires immediately, the other four wait one period each.
    assert!(started.elapsed() >= Duration::from_millis(120));
    assert_eq!(results.await.unwrap().len(), 5);
}

#[tokio::test]
async fn resource_exhaustion_is_fatal() {
    let scheduler = ScanScheduler::new(4, Duration::from_millis(200)).with_exhaustion_threshold(10);
    let (tx, results) = collector();
    let err = scheduler
        .run(
            AddressSampler::seeded(5, 25565, AddressFilter::default()),
            |_| async {
                ProbeResult::Failed(ProbeFailure::ResourceExhausted(std::io::Error::from_raw_os_error(24)))
            },
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ScanError::ResourcesExhausted { failures } if failures >= 10));
    // Outcomes of the drained probes still reached the consumer.
    assert!(results.await.unwrap().len() >= 10);
}
