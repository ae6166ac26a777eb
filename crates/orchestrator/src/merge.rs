//! Reconcile per-worker groups into one globally numbered catalog.
//!
//! A halo wider than the ghost padding is seen as separate pieces on the
//! workers it crosses.  Pieces are joined through the particles they share:
//! each worker publishes the ghost particles that tie its groups to another
//! worker, and the worker holding that particle as real answers with its own
//! group.  A union-find over group keys then yields the global halos.  Each
//! halo takes its key and peak from its canonical piece (densest kept peak
//! for HOP, smallest key for FOF) and is owned by the worker that kept that
//! piece.  Halos are numbered by owner, after an info-dict exchange of owned
//! counts, and summary statistics are reduced in a handful of batched
//! collectives, so every worker ends with the same sorted, renumbered list.

use std::collections::{BTreeMap, HashMap};

use halo_kernel::union_find::UnionFind;
use halo_kernel::ParticleArrays;
use serde::{Deserialize, Serialize};

use crate::catalog::HaloCatalog;
use crate::comm::Collective;
use crate::error::{HaloError, Result};
use crate::finder::WorkerClustering;
use crate::halo::{FinderKind, Halo, HaloSummary, PeakRecord, PropertyContext};
use crate::metrics::RunMetrics;
use crate::properties::{finish_center_of_mass, finish_rms, mass_moments, max_distance, momentum, rms_partial};

/// Global id of this worker's first owned halo, for every worker.
pub fn first_ids<C: Collective>(comm: &C, owned: usize) -> Result<Vec<usize>> {
    let counts = comm.info_dict(&(owned as u64))?;
    Ok(counts
        .values()
        .scan(0usize, |next, &n| {
            let first = *next;
            *next += n as usize;
            Some(first)
        })
        .collect())
}

/// What one worker publishes about one of its groups.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct GroupRecord {
    key: i64,
    peak: PeakRecord,
    kept: bool,
    real_members: u64,
}

/// One global halo before numbering.
#[derive(Debug, Clone, Copy)]
struct Component {
    key: i64,
    peak: PeakRecord,
    owner: usize,
}

/// Ghost particles whose owner decides which group they join.
///
/// FOF groups are connected components, so any shared particle joins two
/// pieces.  A HOP piece only defers to another worker when its own peak is
/// a ghost: its chains climb out of the owned box.
fn ghost_links(clustering: &WorkerClustering) -> Vec<(i64, i64)> {
    let local = &clustering.local;
    let mut links = Vec::new();
    for g in &clustering.groups {
        match clustering.ctx.kind {
            FinderKind::Fof => links.extend(
                g.members
                    .iter()
                    .filter(|&&i| !local.is_real[i])
                    .map(|&i| (local.particles.index[i], g.key)),
            ),
            FinderKind::Hop => {
                if !g.kept {
                    links.push((g.key, g.key));
                }
            }
        }
    }
    links
}

/// Join pieces across workers and pick each halo's key, peak and owner.
///
/// Returns the component of every key and the components in numbering
/// order.  Collective: every worker must call this in step.
fn reconcile<C: Collective>(comm: &C, clustering: &WorkerClustering) -> Result<(HashMap<i64, usize>, Vec<Component>)> {
    let groups = &clustering.groups;
    let local = &clustering.local;
    let kind = clustering.ctx.kind;

    let records: Vec<GroupRecord> = groups
        .iter()
        .map(|g| GroupRecord {
            key: g.key,
            peak: g.peak,
            kept: g.kept,
            real_members: g.members.iter().filter(|&&i| local.is_real[i]).count() as u64,
        })
        .collect();
    let records = comm.all_gather(&records)?;

    // Answer the links that land on this worker's real particles.
    let mut group_of: HashMap<i64, i64> = HashMap::new();
    for g in groups {
        for &i in g.members.iter().filter(|&&i| local.is_real[i]) {
            group_of.insert(local.particles.index[i], g.key);
        }
    }
    let links = comm.all_gather(&ghost_links(clustering))?;
    let joins: Vec<(i64, i64)> = links
        .iter()
        .flatten()
        .filter_map(|&(particle, key)| group_of.get(&particle).map(|&mine| (key, mine)))
        .filter(|&(key, mine)| key != mine)
        .collect();
    let joins = comm.all_gather(&joins)?;

    let mut slots: BTreeMap<i64, usize> = BTreeMap::new();
    for r in records.iter().flatten() {
        let next = slots.len();
        slots.entry(r.key).or_insert(next);
    }
    let mut sets = UnionFind::new(slots.len());
    for &(a, b) in joins.iter().flatten() {
        if let (Some(&a), Some(&b)) = (slots.get(&a), slots.get(&b)) {
            sets.union(a, b);
        }
    }

    // Canonical piece per set.
    let mut best: BTreeMap<usize, (usize, GroupRecord)> = BTreeMap::new();
    for (rank, part) in records.iter().enumerate() {
        for r in part {
            let root = sets.find(slots[&r.key]);
            let better = match best.get(&root) {
                None => true,
                Some((held_rank, held)) => {
                    canonical_order(kind, (rank, r), (*held_rank, held)) == std::cmp::Ordering::Less
                }
            };
            if better {
                best.insert(root, (rank, *r));
            }
        }
    }

    let mut ordered: Vec<(usize, Component)> = best
        .iter()
        .map(|(&root, &(owner, r))| {
            let c = Component {
                key: r.key,
                peak: r.peak,
                owner,
            };
            (root, c)
        })
        .collect();
    ordered.sort_by_key(|(_, c)| (c.owner, c.key));
    let index_of: HashMap<usize, usize> = ordered.iter().enumerate().map(|(i, &(root, _))| (root, i)).collect();
    let component_of: HashMap<i64, usize> = slots
        .iter()
        .map(|(&key, &slot)| (key, index_of[&sets.find(slot)]))
        .collect();
    let components = ordered.into_iter().map(|(_, c)| c).collect();
    Ok((component_of, components))
}

/// Order pieces of one halo; the first becomes canonical.
///
/// Kept pieces come first, then pieces holding real particles.  HOP prefers
/// the densest peak, FOF the smallest key; the worker rank breaks the rest.
fn canonical_order(kind: FinderKind, a: (usize, &GroupRecord), b: (usize, &GroupRecord)) -> std::cmp::Ordering {
    let ((ra, a), (rb, b)) = (a, b);
    let standing = || {
        b.kept
            .cmp(&a.kept)
            .then((b.real_members > 0).cmp(&(a.real_members > 0)))
    };
    let order = match kind {
        FinderKind::Hop => standing()
            .then(b.peak.density.total_cmp(&a.peak.density))
            .then(a.key.cmp(&b.key)),
        FinderKind::Fof => a.key.cmp(&b.key).then_with(standing),
    };
    order.then(ra.cmp(&rb))
}

/// Merge one worker's clustering into the shared catalog.
///
/// Collective: every worker must call this in step.
pub fn merge_groups<C: Collective>(
    comm: &C,
    clustering: WorkerClustering,
    metrics: &mut RunMetrics,
) -> Result<HaloCatalog> {
    let start = std::time::Instant::now();
    let rank = comm.rank();
    let (component_of, components) = reconcile(comm, &clustering)?;

    let owned = components.iter().filter(|c| c.owner == rank).count();
    let firsts = first_ids(comm, owned)?;
    let mut offset = 0;
    for (worker, &first) in firsts.iter().enumerate() {
        if first != offset {
            return Err(HaloError::CollectiveAbort(format!(
                "workers disagree on halo ownership at worker {}",
                worker
            )));
        }
        offset += components.iter().filter(|c| c.owner == worker).count();
    }

    let WorkerClustering {
        local,
        groups,
        ctx,
        min_members,
        ..
    } = clustering;

    // Route real members to their global halo.
    let mut rows: Vec<usize> = Vec::new();
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); components.len()];
    let mut orphaned = 0usize;
    for g in &groups {
        let real = g.members.iter().copied().filter(|&i| local.is_real[i]);
        match component_of.get(&g.key) {
            Some(&id) => {
                for i in real {
                    members[id].push(rows.len());
                    rows.push(i);
                }
            }
            None => orphaned += real.count(),
        }
    }
    if orphaned > 0 {
        tracing::warn!("Worker {}: {} particles in groups missing from the merge", rank, orphaned);
    }
    let particles = local.particles.select(&rows);

    let mut halos: Vec<Halo> = components
        .iter()
        .zip(members)
        .enumerate()
        .map(|(id, (c, m))| Halo::new(id, c.key, m, c.peak, c.owner))
        .collect();

    // Task map.
    let mine: Vec<usize> = halos.iter().filter(|h| h.is_local()).map(|h| h.id).collect();
    for (worker, ids) in comm.all_gather(&mine)?.into_iter().enumerate() {
        for id in ids {
            if let Some(h) = halos.get_mut(id) {
                h.tasks.push(worker);
            }
        }
    }

    precompute_summaries(comm, &mut halos, &particles, &ctx)?;

    let dropped = halos.iter().filter(|h| h.summary.size == Some(0)).count();
    if dropped > 0 {
        tracing::warn!("Dropping {} halos with no particles", dropped);
    }
    let small = halos
        .iter()
        .filter(|h| matches!(h.summary.size, Some(n) if n > 0 && (n as usize) < min_members))
        .count();
    if small > 0 {
        tracing::debug!("Dropping {} groups below {} members", small, min_members);
    }
    halos.retain(|h| matches!(h.summary.size, Some(n) if n > 0 && n as usize >= min_members));

    let mut catalog = HaloCatalog::from_parts(halos, particles, ctx, rank, comm.size());
    catalog.sort_and_renumber();
    metrics.record("merge", start.elapsed());
    metrics.add("halos", catalog.len() as u64);
    tracing::info!(
        "Worker {}: merged {} halos ({} owned here), {} held locally",
        rank,
        catalog.len(),
        owned,
        catalog.local_ids().len()
    );
    Ok(catalog)
}

/// Reduce size, mass, center of mass, bulk and RMS velocity and maximum
/// radius for every halo at once.
///
/// Workers without members of a halo add zeros, or zero distance to the max.
pub fn precompute_summaries<C: Collective>(
    comm: &C,
    halos: &mut [Halo],
    particles: &ParticleArrays,
    ctx: &PropertyContext,
) -> Result<()> {
    let n = halos.len();
    let periodicity = ctx.periodicity();

    let mut sizes: Vec<u64> = halos.iter().map(|h| h.members.len() as u64).collect();
    comm.all_sum_counts(&mut sizes)?;

    let mut moments = vec![0.0; 4 * n];
    let mut momenta = vec![0.0; 3 * n];
    for (i, h) in halos.iter().enumerate() {
        moments[4 * i..4 * i + 4].copy_from_slice(&mass_moments(particles, &h.members, h.peak.position, &periodicity));
        momenta[3 * i..3 * i + 3].copy_from_slice(&momentum(particles, &h.members));
    }
    comm.all_sum_slice(&mut moments)?;
    comm.all_sum_slice(&mut momenta)?;

    let mut summaries = vec![HaloSummary::default(); n];
    for (i, s) in summaries.iter_mut().enumerate() {
        let m = &moments[4 * i..4 * i + 4];
        let mass = m[3];
        s.size = Some(sizes[i]);
        s.total_mass = Some(mass);
        s.center_of_mass = finish_center_of_mass([m[0], m[1], m[2], m[3]], ctx);
        if mass > 0.0 {
            let p = &momenta[3 * i..3 * i + 3];
            s.bulk_velocity = Some([p[0] / mass, p[1] / mass, p[2] / mass]);
        }
    }

    let mut square_sums: Vec<f64> = halos
        .iter()
        .zip(&summaries)
        .map(|(h, s)| match (s.bulk_velocity, s.total_mass) {
            (Some(bulk), Some(mass)) => rms_partial(particles, &h.members, bulk, mass),
            _ => 0.0,
        })
        .collect();
    comm.all_sum_slice(&mut square_sums)?;

    let mut radii: Vec<f64> = halos
        .iter()
        .zip(&summaries)
        .map(|(h, s)| {
            s.center_of_mass
                .map_or(0.0, |c| max_distance(particles, &h.members, c, &periodicity))
        })
        .collect();
    comm.all_max_slice(&mut radii)?;

    for (i, (h, mut s)) in halos.iter_mut().zip(summaries).enumerate() {
        if s.bulk_velocity.is_some() {
            s.rms_velocity = Some(finish_rms(square_sums[i], sizes[i]));
            s.maximum_radius = Some(radii[i]);
        }
        h.summary = s;
    }
    Ok(())
}
