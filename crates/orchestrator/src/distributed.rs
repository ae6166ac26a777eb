//! Multi-worker driver.
//!
//! Runs the per-worker pipeline (partition, cluster, merge) on one thread per
//! worker, connected by a [`ThreadWorld`].  Every worker runs the same code
//! path and returns its own view of the catalog.  The pipeline itself only
//! talks to [`Collective`], so an out-of-process transport can replace the
//! thread world without touching it.

use std::sync::Arc;
use std::thread;

use crate::catalog::HaloCatalog;
use crate::comm::{Collective, SoloComm, ThreadWorld};
use crate::config::FinderConfig;
use crate::error::{HaloError, Result};
use crate::finder::cluster_partition;
use crate::merge::merge_groups;
use crate::metrics::RunMetrics;
use crate::source::ParticleSource;

/// What one worker ends a run with.
#[derive(Debug)]
pub struct WorkerResult {
    /// Worker rank
    pub rank: usize,
    /// The worker's view of the merged catalog
    pub catalog: HaloCatalog,
    /// Stage timings and counters
    pub metrics: RunMetrics,
}

/// Find halos on this worker.
///
/// Collective: every worker of `comm` must call this with the same source
/// and configuration.
pub fn find_halos<C: Collective>(
    comm: &C,
    source: &dyn ParticleSource,
    config: &FinderConfig,
    metrics: &mut RunMetrics,
) -> Result<HaloCatalog> {
    tracing::info!(
        "Worker {}/{}: finding halos for '{}' with {:?}",
        comm.rank(),
        comm.size(),
        config.name,
        config.method
    );
    let clustering = cluster_partition(comm, source, config, metrics)?;
    merge_groups(comm, clustering, metrics)
}

/// Run the finder on `workers` threads.
///
/// Results come back in rank order.  If any worker fails, the first error
/// by rank is returned.
pub fn run_distributed(
    config: &FinderConfig,
    source: Arc<dyn ParticleSource>,
    workers: usize,
) -> Result<Vec<WorkerResult>> {
    if workers == 0 {
        return Err(HaloError::Config("at least one worker is required".to_string()));
    }
    tracing::info!("Distributed halo finding: {} workers", workers);

    let handles: Vec<_> = ThreadWorld::create(workers)
        .into_iter()
        .map(|comm| {
            let source = Arc::clone(&source);
            let config = config.clone();
            thread::spawn(move || -> Result<WorkerResult> {
                let mut metrics = RunMetrics::new();
                let catalog = find_halos(&comm, source.as_ref(), &config, &mut metrics)?;
                metrics.log_summary(comm.rank());
                Ok(WorkerResult {
                    rank: comm.rank(),
                    catalog,
                    metrics,
                })
            })
        })
        .collect();

    let mut results = Vec::with_capacity(workers);
    let mut first_error = None;
    for (rank, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(r)) => results.push(r),
            Ok(Err(e)) => {
                tracing::error!("Worker {} failed: {}", rank, e);
                first_error.get_or_insert(e);
            }
            Err(_) => {
                first_error.get_or_insert(HaloError::WorkerPanicked(rank));
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

/// Run the finder on the calling thread as the only worker.
pub fn run_single(config: &FinderConfig, source: &dyn ParticleSource) -> Result<WorkerResult> {
    let mut metrics = RunMetrics::new();
    let catalog = find_halos(&SoloComm, source, config, &mut metrics)?;
    metrics.log_summary(0);
    Ok(WorkerResult {
        rank: 0,
        catalog,
        metrics,
    })
}
