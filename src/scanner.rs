use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{ScanConfig, MAX_WORKERS};
use crate::sampler::AddressFilter;
use crate::types::{Candidate, ProbeFailure, ProbeOutcome, ProbeResult};

/// Slack on top of the probe deadline before the scheduler gives up on a probe future itself.
const PROBE_GRACE: Duration = Duration::from_millis(250);

/// Errors that end a scan early.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("local network resources exhausted: {failures} consecutive probes could not get a socket")]
    ResourcesExhausted { failures: u64 },
}

/// Why the dispatch loop stopped issuing candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    ProbeLimit,
    TimeLimit,
    CandidatesExhausted,
}

/// State of the pool once a run has drained.
#[derive(Debug, Clone)]
pub struct SchedulerReport {
    pub dispatched: u64,
    pub filtered: u64,
    pub completed: u64,
    pub panicked: u64,
    pub width: usize,
    /// Slots back in `Idle` after the drain; equals `width` on a clean stop.
    pub idle_slots: usize,
    pub elapsed: Duration,
    pub stop_reason: StopReason,
}

/// Bounded fan-out of probes over a stream of candidates.
///
/// - Limits concurrent probes using a `Semaphore`; a slot is a permit.
/// - Bounds every probe with `tokio::time::timeout` so slots always return.
/// - Stops on cancellation, probe/time limits, or an exhausted candidate stream,
///   then waits for every in-flight probe before returning.
#[derive(Debug, Clone)]
pub struct ScanScheduler {
    width: usize,
    probe_timeout: Duration,
    pace: Option<Duration>,
    max_probes: Option<u64>,
    max_duration: Option<Duration>,
    filter: AddressFilter,
    exhaustion_threshold: u64,
}

impl ScanScheduler {
    pub fn new(width: usize, probe_timeout: Duration) -> Self {
        Self {
            width: width.clamp(1, MAX_WORKERS),
            probe_timeout,
            pace: None,
            max_probes: None,
            max_duration: None,
            filter: AddressFilter::default(),
            exhaustion_threshold: 512,
        }
    }

    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            width: config.workers(),
            probe_timeout: config.timeout(),
            pace: config.pace(),
            max_probes: config.max_probes,
            max_duration: config.duration(),
            filter: config.address_filter(),
            exhaustion_threshold: config.exhaustion_threshold.max(1),
        }
    }

    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    pub fn with_max_probes(mut self, max: u64) -> Self {
        self.max_probes = Some(max);
        self
    }

    pub fn with_max_duration(mut self, max: Duration) -> Self {
        self.max_duration = Some(max);
        self
    }

    pub fn with_filter(mut self, filter: AddressFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_exhaustion_threshold(mut self, failures: u64) -> Self {
        self.exhaustion_threshold = failures.max(1);
        self
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Dispatch candidates to `probe` until a stop condition, then drain.
    ///
    /// Every outcome is sent on `results`; the sender is dropped once the last
    /// in-flight probe has reported, which closes the queue for the consumer.
    /// Candidates rejected by the address filter are counted and never probed.
    pub async fn run<I, F, Fut>(
        &self,
        candidates: I,
        mut probe: F,
        results: mpsc::Sender<ProbeOutcome>,
        cancel: CancellationToken,
    ) -> Result<SchedulerReport, ScanError>
    where
        I: IntoIterator<Item = Candidate>,
        F: FnMut(Candidate) -> Fut,
        Fut: Future<Output = ProbeResult> + Send + 'static,
    {
        let started = Instant::now();
        let deadline = self.max_duration.map(|d| started + d);
        let sem = Arc::new(Semaphore::new(self.width));
        let exhausted = Arc::new(AtomicU64::new(0));
        let mut set = JoinSet::new();
        let mut pacer = self.pace.map(|p| {
            let mut interval = time::interval(p);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut candidates = candidates.into_iter();
        let mut tally = Tally::default();
        let mut fatal = false;

        info!(
            width = self.width,
            timeout_ms = self.probe_timeout.as_millis() as u64,
            "scan started"
        );

        let stop_reason = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if exhausted.load(Ordering::Relaxed) >= self.exhaustion_threshold {
                fatal = true;
                break StopReason::Cancelled;
            }
            if self.max_probes.is_some_and(|max| tally.dispatched >= max) {
                break StopReason::ProbeLimit;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break StopReason::TimeLimit;
            }
            while let Some(res) = set.try_join_next() {
                tally.record_join(res);
            }

            if let Some(pacer) = pacer.as_mut() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break StopReason::Cancelled,
                    _ = until(deadline) => break StopReason::TimeLimit,
                    _ = pacer.tick() => {}
                }
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break StopReason::Cancelled,
                _ = until(deadline) => break StopReason::TimeLimit,
                // `sem` is never closed; treat a closed pool as a stop so tasks still drain.
                permit = sem.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break StopReason::Cancelled,
                },
            };

            let Some(candidate) = next_allowed(&mut candidates, &self.filter, &mut tally.filtered)
            else {
                break StopReason::CandidatesExhausted;
            };

            let fut = probe(candidate);
            let tx = results.clone();
            let exhausted = exhausted.clone();
            let hard_deadline = self.probe_timeout + PROBE_GRACE;
            tally.dispatched += 1;

            set.spawn(async move {
                let _permit = permit; // slot stays busy until the outcome is handed off

                let result = match time::timeout(hard_deadline, fut).await {
                    Ok(result) => result,
                    Err(_) => ProbeResult::Failed(ProbeFailure::Timeout),
                };
                match &result {
                    ProbeResult::Failed(ProbeFailure::ResourceExhausted(_)) => {
                        exhausted.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => exhausted.store(0, Ordering::Relaxed),
                }
                if let ProbeResult::Failed(failure) = &result {
                    debug!(%candidate, error = %failure, "probe failed");
                }
                if tx.send(ProbeOutcome { candidate, result }).await.is_err() {
                    debug!(%candidate, "result queue closed; outcome dropped");
                }
            });
        };

        drop(results);
        let in_flight = set.len();
        if in_flight > 0 {
            debug!(in_flight, "draining in-flight probes");
        }
        while let Some(res) = set.join_next().await {
            tally.record_join(res);
        }

        let report = SchedulerReport {
            dispatched: tally.dispatched,
            filtered: tally.filtered,
            completed: tally.completed,
            panicked: tally.panicked,
            width: self.width,
            idle_slots: sem.available_permits(),
            elapsed: started.elapsed(),
            stop_reason,
        };

        if fatal {
            let failures = exhausted.load(Ordering::Relaxed);
            error!(failures, "aborting scan: no network resources left");
            return Err(ScanError::ResourcesExhausted { failures });
        }
        info!(
            reason = ?report.stop_reason,
            dispatched = report.dispatched,
            filtered = report.filtered,
            "scan stopped"
        );
        Ok(report)
    }
}

#[derive(Debug, Default)]
struct Tally {
    dispatched: u64,
    filtered: u64,
    completed: u64,
    panicked: u64,
}

impl Tally {
    fn record_join(&mut self, res: Result<(), JoinError>) {
        match res {
            Ok(()) => self.completed += 1,
            Err(e) => {
                self.panicked += 1;
                error!(error = %e, "probe task failed");
            }
        }
    }
}

fn next_allowed<I>(candidates: &mut I, filter: &AddressFilter, filtered: &mut u64) -> Option<Candidate>
where
    I: Iterator<Item = Candidate>,
{
    for candidate in candidates.by_ref() {
        if filter.allows(candidate.ip()) {
            return Some(candidate);
        }
        *filtered += 1;
        debug!(%candidate, "candidate filtered");
    }
    None
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
