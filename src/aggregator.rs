use std::time::Duration;

use ::time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::ScanConfig;
use crate::store::{ServerStore, Upsert};
use crate::types::{FailureKind, ProbeOutcome, ProbeResult, Progress, ServerRecord};

/// Single consumer of probe outcomes.
///
/// Owns the `ServerStore`, so upserts and flushes never interleave. Flushes
/// after `flush_every` changed records or every `flush_interval`, whichever
/// comes first. A failed flush is reported once and retried on the next
/// trigger while results keep accumulating in memory.
#[derive(Debug)]
pub struct ResultAggregator {
    store: ServerStore,
    flush_every: u64,
    flush_interval: Option<Duration>,
    progress_interval: Option<Duration>,
    progress: Progress,
    unsaved: u64,
    since_attempt: u64,
    degraded: bool,
    degraded_episodes: u64,
    started: Instant,
}

/// Final state handed back when the outcome queue closes.
#[derive(Debug)]
pub struct AggregatorReport {
    pub progress: Progress,
    pub store: ServerStore,
    /// Whether the last flush attempt succeeded.
    pub persisted: bool,
    /// Number of times persistence went from healthy to failing.
    pub degraded_episodes: u64,
}

impl ResultAggregator {
    pub fn new(store: ServerStore) -> Self {
        Self {
            store,
            flush_every: 25,
            flush_interval: None,
            progress_interval: None,
            progress: Progress::default(),
            unsaved: 0,
            since_attempt: 0,
            degraded: false,
            degraded_episodes: 0,
            started: Instant::now(),
        }
    }

    pub fn from_config(store: ServerStore, config: &ScanConfig) -> Self {
        let secs = |s: u64| (s > 0).then(|| Duration::from_secs(s));
        Self {
            flush_every: config.flush_every,
            flush_interval: secs(config.flush_interval_secs),
            progress_interval: secs(config.progress_interval_secs),
            ..Self::new(store)
        }
    }

    pub fn with_flush_every(mut self, records: u64) -> Self {
        self.flush_every = records;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    pub fn store(&self) -> &ServerStore {
        &self.store
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Snapshot of the counters.
    pub fn progress(&self) -> Progress {
        Progress {
            store_size: self.store.len(),
            persistence_degraded: self.degraded,
            elapsed: self.started.elapsed(),
            ..self.progress.clone()
        }
    }

    /// Fold one outcome in and flush if enough records changed since the last attempt.
    pub async fn accept(&mut self, outcome: ProbeOutcome) {
        self.handle(outcome);
        if self.flush_due() {
            self.flush().await;
        }
    }

    pub fn flush_due(&self) -> bool {
        self.flush_every > 0 && self.since_attempt >= self.flush_every
    }

    /// Fold one outcome into the store and counters, stamping discoveries with the current time.
    pub fn handle(&mut self, outcome: ProbeOutcome) {
        self.handle_at(outcome, OffsetDateTime::now_utc());
    }

    pub fn handle_at(&mut self, outcome: ProbeOutcome, seen_at: OffsetDateTime) {
        self.progress.attempted += 1;
        let candidate = outcome.candidate;
        match outcome.result {
            ProbeResult::Responded(report) => {
                self.progress.succeeded += 1;
                let record = ServerRecord::from_report(candidate, report, seen_at);
                info!(
                    %candidate,
                    players = %format!("{}/{}", record.player_count, record.player_max),
                    version = %record.version_name,
                    "server responded"
                );
                match self.store.upsert(record) {
                    Upsert::Inserted => self.progress.discovered += 1,
                    Upsert::Updated => self.progress.updated += 1,
                }
                self.unsaved += 1;
                self.since_attempt += 1;
            }
            ProbeResult::Failed(failure) => {
                self.progress.failed += 1;
                match failure.kind() {
                    FailureKind::Connect => self.progress.connect_failures += 1,
                    FailureKind::Protocol => self.progress.protocol_failures += 1,
                }
            }
        }
    }

    /// Persist the store now. Returns whether the snapshot was written.
    ///
    /// The file is written from a copy of the records on the blocking pool,
    /// so a slow disk stalls only this task and not the runtime workers.
    pub async fn flush(&mut self) -> bool {
        self.since_attempt = 0;
        let snapshot = self.store.snapshot();
        let written = match task::spawn_blocking(move || snapshot.write()).await {
            Ok(written) => written.map_err(anyhow::Error::from),
            Err(e) => Err(anyhow::Error::from(e).context("flush task failed")),
        };
        match written {
            Ok(()) => {
                self.progress.flushes += 1;
                self.unsaved = 0;
                if self.degraded {
                    info!(path = %self.store.path().display(), "persistence restored");
                    self.degraded = false;
                }
                true
            }
            Err(e) => {
                if !self.degraded {
                    warn!(
                        error = %format!("{e:#}"),
                        unsaved = self.unsaved,
                        "persistence degraded; keeping results in memory until a flush succeeds"
                    );
                    self.degraded = true;
                    self.degraded_episodes += 1;
                }
                false
            }
        }
    }

    /// Consume outcomes until every sender is gone, then flush one last time.
    ///
    /// `on_progress` receives a snapshot every `progress_interval` and once at the end.
    pub async fn run<P>(mut self, mut rx: mpsc::Receiver<ProbeOutcome>, mut on_progress: P) -> AggregatorReport
    where
        P: FnMut(&Progress),
    {
        self.started = Instant::now();
        let mut flush_tick = self.flush_interval.map(ticker);
        let mut progress_tick = self.progress_interval.map(ticker);

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(outcome) => self.accept(outcome).await,
                    None => break,
                },
                _ = tick(&mut flush_tick) => {
                    if self.unsaved > 0 {
                        self.flush().await;
                    }
                }
                _ = tick(&mut progress_tick) => on_progress(&self.progress()),
            }
        }

        let persisted = if self.unsaved > 0 || self.degraded {
            self.flush().await
        } else {
            true
        };
        let progress = self.progress();
        on_progress(&progress);
        AggregatorReport {
            progress,
            store: self.store,
            persisted,
            degraded_episodes: self.degraded_episodes,
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}
