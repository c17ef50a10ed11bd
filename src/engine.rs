//! Wiring of sampler, scheduler and aggregator into complete runs.

use std::future::Future;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::aggregator::{AggregatorReport, ResultAggregator};
use crate::config::ScanConfig;
use crate::probe;
use crate::sampler::AddressSampler;
use crate::scanner::{ScanScheduler, SchedulerReport};
use crate::store::ServerStore;
use crate::types::{Candidate, ProbeResult, Progress};

/// Everything a finished run reports back to the CLI.
#[derive(Debug)]
pub struct ScanSummary {
    pub scheduler: SchedulerReport,
    pub aggregate: AggregatorReport,
}

impl ScanSummary {
    pub fn progress(&self) -> &Progress {
        &self.aggregate.progress
    }

    pub fn store(&self) -> &ServerStore {
        &self.aggregate.store
    }
}

/// Run one scan over `candidates` with a custom probe function.
///
/// Outcomes flow through a bounded queue into a single `ResultAggregator`
/// task that owns `store`. Returns once the scheduler has drained and the
/// aggregator has made its final flush; a fatal scheduler error is returned
/// only after that, so nothing already discovered is lost.
pub async fn run_scan<I, F, Fut, P>(
    config: &ScanConfig,
    store: ServerStore,
    candidates: I,
    probe: F,
    cancel: CancellationToken,
    on_progress: P,
) -> Result<ScanSummary>
where
    I: IntoIterator<Item = Candidate>,
    F: FnMut(Candidate) -> Fut,
    Fut: Future<Output = ProbeResult> + Send + 'static,
    P: FnMut(&Progress) + Send + 'static,
{
    let scheduler = ScanScheduler::from_config(config);
    let (tx, rx) = mpsc::channel(scheduler.width() * 2);

    let aggregator = ResultAggregator::from_config(store, config);
    let aggregate = tokio::spawn(aggregator.run(rx, on_progress));

    let scheduled = scheduler.run(candidates, probe, tx, cancel).await;
    let aggregate = aggregate.await.context("result aggregator task failed")?;
    let scheduler = scheduled.context("scan aborted")?;

    Ok(ScanSummary {
        scheduler,
        aggregate,
    })
}

/// Probe random public addresses on `config.port` until a stop condition.
pub async fn discover<P>(config: &ScanConfig, cancel: CancellationToken, on_progress: P) -> Result<ScanSummary>
where
    P: FnMut(&Progress) + Send + 'static,
{
    let store = ServerStore::load(&config.output_path)
        .with_context(|| format!("failed to load {}", config.output_path.display()))?;
    info!(known = store.len(), path = %config.output_path.display(), "loaded server store");

    let sampler = AddressSampler::new(config.port, config.address_filter());
    let opts = config.probe_options();
    run_scan(
        config,
        store,
        sampler,
        move |candidate| probe::probe(candidate, opts),
        cancel,
        on_progress,
    )
    .await
}

/// Re-probe every stored server; responders are updated, the rest are left as they were.
pub async fn refresh<P>(config: &ScanConfig, cancel: CancellationToken, on_progress: P) -> Result<ScanSummary>
where
    P: FnMut(&Progress) + Send + 'static,
{
    let store = ServerStore::load(&config.output_path)
        .with_context(|| format!("failed to load {}", config.output_path.display()))?;
    let known: Vec<Candidate> = store.addresses().into_iter().map(Candidate).collect();
    info!(servers = known.len(), "refreshing stored servers");

    let opts = config.probe_options();
    run_scan(
        config,
        store,
        known,
        move |candidate| probe::probe(candidate, opts),
        cancel,
        on_progress,
    )
    .await
}
