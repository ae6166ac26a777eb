//! Per-worker clustering pass.
//!
//! Each worker reads its padded region, runs the group finder on normalized
//! coordinates and records every group it sees.  A group is kept by the
//! worker holding its anchor particle as a real particle: the density peak
//! for HOP, the smallest-index member for FOF.  Pieces of one halo seen by
//! several workers are joined later by the merge.

use std::collections::HashSet;

use halo_kernel::{
    group_particles, link_length_for, run_finder, ClusterInput, DarkMatterRule, FofFinder, FofParams,
    GroupFinder, HopFinder, HopParams, Periodicity,
};

use crate::comm::Collective;
use crate::config::{FinderConfig, FinderMethod};
use crate::error::{HaloError, Result};
use crate::halo::{FinderKind, PeakRecord, PropertyContext, NOT_VIRIALIZED};
use crate::metrics::RunMetrics;
use crate::partition::{plan_partition, PartitionPlan};
use crate::source::{LocalParticles, ParticleSource};

/// One group found on this worker.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalGroup {
    /// Identity shared by every worker that sees the group
    pub key: i64,
    /// Density peak in domain units, folded into the domain
    pub peak: PeakRecord,
    /// Rows of the local particle set, ghosts included
    pub members: Vec<usize>,
    /// Whether this worker owns the group
    pub kept: bool,
}

/// Output of one worker's clustering pass.
#[derive(Debug, Clone)]
pub struct WorkerClustering {
    /// Particles read for the padded region (domain units)
    pub local: LocalParticles,
    /// Every group seen locally, kept or not, ordered by key
    pub groups: Vec<LocalGroup>,
    /// Partition this worker clustered
    pub plan: PartitionPlan,
    /// Smallest halo kept after the merge (FOF only, 0 otherwise)
    pub min_members: usize,
    /// Property context for the resulting halos
    pub ctx: PropertyContext,
}

/// Fail collectively if any particle index is negative or appears twice.
///
/// Real particles are unique across the whole run, so each index is checked
/// by the worker it hashes to.  Ghost rows are only checked for sign.
pub fn check_particle_indices<C: Collective>(comm: &C, local: &LocalParticles) -> Result<()> {
    let size = comm.size();
    let mut problem = local
        .particles
        .index
        .iter()
        .find(|&&index| index < 0)
        .map(|&index| HaloError::InvalidParticleIndex { index });

    let mut buckets: Vec<Vec<i64>> = vec![Vec::new(); size];
    for (i, &index) in local.particles.index.iter().enumerate() {
        if local.is_real[i] && index >= 0 {
            buckets[(index as u64 % size as u64) as usize].push(index);
        }
    }
    let gathered = comm.all_gather(&buckets)?;
    if problem.is_none() {
        let mut seen = HashSet::new();
        problem = gathered
            .iter()
            .flat_map(|part| part[comm.rank()].iter())
            .find(|&&index| !seen.insert(index))
            .map(|&index| HaloError::DuplicateParticleIndex { index });
    }

    if let Some(e) = &problem {
        tracing::error!("Worker {}: {}", comm.rank(), e);
    }
    if comm.exit_test(problem.is_some())? {
        return Err(problem.unwrap_or_else(|| {
            HaloError::CollectiveAbort("another worker found invalid particle indices".to_string())
        }));
    }
    Ok(())
}

/// Build the configured group finder.
///
/// FOF keeps pairs locally; a piece of a halo cut by a partition face can be
/// smaller than the final halo, so the size cut is applied after the merge.
pub fn build_finder(config: &FinderConfig, threshold: f64, global_count: u64) -> Box<dyn GroupFinder> {
    match config.method {
        FinderMethod::Hop => Box::new(HopFinder::new(HopParams {
            threshold,
            num_neighbors: config.num_neighbors,
            tuning: config.hop,
            premerge: config.premerge,
            merge_ratio: config.merge_ratio,
        })),
        FinderMethod::Fof => Box::new(FofFinder::new(FofParams {
            link_length: link_length_for(config.link, global_count),
            min_members: 2,
        })),
    }
}

/// Partition, read, cluster and pick owned groups on this worker.
///
/// Collective: every worker must call this in step.
pub fn cluster_partition<C: Collective>(
    comm: &C,
    source: &dyn ParticleSource,
    config: &FinderConfig,
    metrics: &mut RunMetrics,
) -> Result<WorkerClustering> {
    config.validate().map_err(HaloError::Config)?;
    let domain = source.domain();
    let period = domain.width();

    let start = std::time::Instant::now();
    let plan = plan_partition(comm, source, config)?;
    metrics.record("partition", start.elapsed());

    let local = metrics.time("read", || {
        source.read_region(&plan.region).filter_dark_matter(config.dm_only)
    });
    if config.dm_only && local.particles.dark_matter_rule() == DarkMatterRule::All {
        tracing::warn!(
            "Worker {}: no creation_time or particle_type field, clustering all particles",
            comm.rank()
        );
    }
    check_particle_indices(comm, &local)?;

    // Masses are normalized by the analysed mass; a subvolume rescales the
    // threshold by how much of the full box that is.
    let real_mass: f64 = (0..local.particles.len())
        .filter(|&i| local.is_real[i])
        .map(|i| local.particles.mass[i])
        .sum();
    let norm_mass = comm.all_sum(real_mass)?;
    let adjustment = if config.subvolume.is_some() && norm_mass > 0.0 {
        source.total_mass(config.dm_only) / norm_mass
    } else {
        1.0
    };
    let threshold = config.threshold * adjustment;

    let n = local.particles.len();
    let norm = |v: &[f64], d: usize| -> Vec<f64> { v.iter().map(|&c| (c - domain.min[d]) / period[d]).collect() };
    let (x, y, z) = (norm(&local.particles.x, 0), norm(&local.particles.y, 1), norm(&local.particles.z, 2));
    let mass: Vec<f64> = local
        .particles
        .mass
        .iter()
        .map(|&m| if norm_mass > 0.0 { m / norm_mass } else { 0.0 })
        .collect();
    let periodicity = Periodicity {
        period: [1.0; 3],
        periodic: plan.wrapped,
    };

    let finder = build_finder(config, threshold, plan.global_count);
    let input = ClusterInput {
        x: &x,
        y: &y,
        z: &z,
        mass: &mass,
        keys: &local.particles.index,
        periodicity,
    };
    let output = metrics.time("cluster", || run_finder(finder.as_ref(), &input, config.rearrange));

    let kind = match config.method {
        FinderMethod::Hop => FinderKind::Hop,
        FinderMethod::Fof => FinderKind::Fof,
    };
    let ctx = PropertyContext {
        domain,
        periodic: source.periodic(),
        cosmology: source.cosmology(),
        kind,
        virial: config.virial,
    };

    let mut groups: Vec<LocalGroup> = group_particles(&output.tags, output.density.as_deref(), &local.particles.index)
        .into_iter()
        .map(|g| {
            let density = match kind {
                FinderKind::Hop => output.density.as_ref().map_or(0.0, |d| d[g.peak]) / adjustment,
                FinderKind::Fof => NOT_VIRIALIZED,
            };
            LocalGroup {
                key: local.particles.index[g.peak],
                peak: PeakRecord {
                    density,
                    position: ctx.wrap(local.particles.position(g.peak)),
                },
                kept: local.is_real[g.peak],
                members: g.members,
            }
        })
        .collect();
    groups.sort_by_key(|g| g.key);
    let kept = groups.iter().filter(|g| g.kept).count();
    metrics.add("local_particles", n as u64);
    metrics.add("local_groups", groups.len() as u64);
    metrics.add("kept_groups", kept as u64);
    tracing::info!(
        "Worker {}: {} particles ({} real), {} {} groups, {} kept",
        comm.rank(),
        n,
        local.real_count(),
        groups.len(),
        finder.name(),
        kept
    );

    let min_members = match kind {
        FinderKind::Hop => 0,
        FinderKind::Fof => config.fof_min_members,
    };
    Ok(WorkerClustering {
        local,
        groups,
        plan,
        min_members,
        ctx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{SoloComm, ThreadWorld};
    use halo_kernel::{Particle, ParticleArrays};

    fn local(indices: &[i64]) -> LocalParticles {
        with_ghosts(indices, &[])
    }

    fn with_ghosts(real: &[i64], ghosts: &[i64]) -> LocalParticles {
        let mut pa = ParticleArrays::new();
        for &i in real.iter().chain(ghosts) {
            pa.push(Particle::new([0.5; 3], [0.0; 3], 1.0, i));
        }
        let mut is_real = vec![true; real.len()];
        is_real.resize(pa.len(), false);
        LocalParticles { particles: pa, is_real }
    }

    fn check_on_two_workers(sets: [(Vec<i64>, Vec<i64>); 2]) -> Vec<Result<()>> {
        let handles: Vec<_> = ThreadWorld::create(2)
            .into_iter()
            .zip(sets)
            .map(|(c, (real, ghosts))| std::thread::spawn(move || check_particle_indices(&c, &with_ghosts(&real, &ghosts))))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn index_checks() {
        assert!(check_particle_indices(&SoloComm, &local(&[0, 1, 2])).is_ok());
        assert!(matches!(
            check_particle_indices(&SoloComm, &local(&[0, 1, 1])),
            Err(HaloError::DuplicateParticleIndex { index: 1 })
        ));
        assert!(matches!(
            check_particle_indices(&SoloComm, &local(&[0, -4])),
            Err(HaloError::InvalidParticleIndex { index: -4 })
        ));
    }

    #[test]
    fn repeated_index_on_different_workers_aborts_all() {
        let results = check_on_two_workers([(vec![1, 2, 7], vec![]), (vec![7, 9], vec![])]);
        assert!(matches!(results[1], Err(HaloError::DuplicateParticleIndex { index: 7 })));
        assert!(matches!(results[0], Err(HaloError::CollectiveAbort(_))));
    }

    #[test]
    fn ghost_copies_are_not_duplicates() {
        let results = check_on_two_workers([(vec![1, 2], vec![3, 4]), (vec![3, 4], vec![1, 2])]);
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(check_particle_indices(&SoloComm, &with_ghosts(&[5], &[5, -1])).is_err());
    }

    #[test]
    fn finder_choice_follows_method() {
        let mut config = FinderConfig::default();
        assert_eq!(build_finder(&config, 160.0, 1000).name(), "HOP");
        config.method = FinderMethod::Fof;
        assert_eq!(build_finder(&config, 160.0, 1000).name(), "FOF");
    }
}
