//! Domain decomposition: one owned box per worker plus ghost padding.
//!
//! Boxes come either from an even split of the analysis volume or from a
//! recursive bisection that balances a random sample of particles.  Padding
//! is sized from the particle spacing near each box so that particles close
//! to a face still see `num_neighbors` neighbors.

use halo_kernel::{link_length_for, ParticleArrays};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::comm::Collective;
use crate::config::{FinderConfig, FinderMethod};
use crate::error::{HaloError, Result};
use crate::source::{ParticleSource, Region, AABB};

/// Histogram resolution for bisection and padding.
const NUM_BINS: usize = 1000;

/// How ghost padding widths are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingPolicy {
    /// No ghosts (single worker)
    None,
    /// Same width on every face
    Uniform,
    /// Per-face width from the spacing just inside that face
    Fancy,
}

/// A worker's share of the analysis volume.
#[derive(Debug, Clone, Copy)]
pub struct PartitionPlan {
    /// Owned box and ghost margin
    pub region: Region,
    /// Axes on which the owned box spans the whole periodic domain
    pub wrapped: [bool; 3],
    /// Particles in the analysis volume, summed over workers
    pub global_count: u64,
    /// Padding policy that produced the margin
    pub policy: PaddingPolicy,
}

/// `(dimension, pieces)` pairs whose product of pieces is `workers`.
///
/// Prime factors are used largest first, cycling through x, y, z.
pub fn bisection_cuts(workers: usize) -> Vec<(usize, usize)> {
    let mut factors = Vec::new();
    let mut n = workers.max(1);
    let mut p = 2;
    while p * p <= n {
        while n % p == 0 {
            factors.push(p);
            n /= p;
        }
        p += 1;
    }
    if n > 1 {
        factors.push(n);
    }
    factors.sort_unstable_by(|a, b| b.cmp(a));
    factors.into_iter().enumerate().map(|(i, f)| (i % 3, f)).collect()
}

/// Split `bounds` into equal pieces following `cuts`, depth first.
pub fn even_partition(bounds: &AABB, cuts: &[(usize, usize)]) -> Vec<AABB> {
    let Some(&(dim, pieces)) = cuts.first() else {
        return vec![*bounds];
    };
    let step = (bounds.max[dim] - bounds.min[dim]) / pieces as f64;
    let mut out = Vec::new();
    for k in 0..pieces {
        let mut child = *bounds;
        child.min[dim] = bounds.min[dim] + k as f64 * step;
        child.max[dim] = if k + 1 == pieces {
            bounds.max[dim]
        } else {
            bounds.min[dim] + (k + 1) as f64 * step
        };
        out.extend(even_partition(&child, &cuts[1..]));
    }
    out
}

/// Recursive median cut of `bounds` so every leaf holds an equal share of `points`.
///
/// Cut positions are located on a histogram and refined by linear
/// interpolation inside the bin where the cumulative count crosses the target.
/// With no points to balance, the cut falls back to an even split.
pub fn recursive_divide(points: &[[f64; 3]], bounds: &AABB, cuts: &[(usize, usize)]) -> Vec<AABB> {
    let Some(&(dim, pieces)) = cuts.first() else {
        return vec![*bounds];
    };
    let lo = bounds.min[dim];
    let width = bounds.max[dim] - lo;
    let bin_width = width / NUM_BINS as f64;

    let mut counts = vec![0usize; NUM_BINS];
    for p in points {
        let b = ((p[dim] - lo) / bin_width).floor();
        if b >= 0.0 {
            counts[(b as usize).min(NUM_BINS - 1)] += 1;
        }
    }

    let parts = points.len() as f64;
    let mut edges = vec![lo];
    let (mut sum, mut last_sum, mut bin) = (0usize, 0usize, 0usize);
    for step in 1..pieces {
        let even_cut = lo + width * step as f64 / pieces as f64;
        let target = parts * step as f64 / pieces as f64;
        while (sum as f64) < target && bin < NUM_BINS {
            last_sum = sum;
            sum += counts[bin];
            bin += 1;
        }
        let in_bin = (sum - last_sum) as f64;
        let cut = if points.is_empty() || in_bin == 0.0 || bin == 0 {
            even_cut
        } else {
            let left_edge = lo + (bin - 1) as f64 * bin_width;
            left_edge + (target - last_sum as f64) * bin_width / in_bin
        };
        let prev = edges.last().copied().unwrap_or(lo);
        edges.push(cut.clamp(prev, bounds.max[dim]));
    }
    edges.push(bounds.max[dim]);

    let mut out = Vec::new();
    for k in 0..pieces {
        let (a, b) = (edges[k], edges[k + 1]);
        let last = k + 1 == pieces;
        let sub: Vec<[f64; 3]> = points
            .iter()
            .filter(|p| p[dim] >= a && (p[dim] < b || (last && p[dim] <= b)))
            .copied()
            .collect();
        let mut child = *bounds;
        child.min[dim] = a;
        child.max[dim] = b;
        out.extend(recursive_divide(&sub, &child, &cuts[1..]));
    }
    out
}

/// Random `fraction` of the local particle positions, seeded per worker.
pub fn subsample(particles: &ParticleArrays, fraction: f64, seed: u64, rank: usize) -> Vec<[f64; 3]> {
    let n = particles.len();
    let take = ((fraction * n as f64) as usize).min(n);
    let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(rank as u64));
    let mut rows = rand::seq::index::sample(&mut rng, n, take).into_vec();
    rows.sort_unstable();
    rows.into_iter().map(|i| particles.position(i)).collect()
}

/// Load-balanced boxes, identical on every worker.
///
/// Every worker contributes its sample; rank 0 divides and broadcasts.
pub fn load_balanced_boxes<C: Collective>(
    comm: &C,
    sample: Vec<[f64; 3]>,
    bounds: &AABB,
) -> Result<Vec<AABB>> {
    let points = comm.gather_concat(sample)?;
    let boxes = comm
        .is_root()
        .then(|| recursive_divide(&points, bounds, &bisection_cuts(comm.size())));
    let boxes: Vec<AABB> = comm.broadcast(0, boxes)?;
    tracing::debug!("Bisection over {} sampled points: {:?}", points.len(), boxes);
    Ok(boxes)
}

/// Padding width giving `num_neighbors` neighbors at the given mean spacing.
pub fn padding_for_spacing(num_neighbors: usize, safety: f64, spacing: f64) -> f64 {
    (num_neighbors as f64).cbrt() * safety * spacing
}

/// Mean interparticle spacing of `count` particles in `volume`.
pub fn mean_spacing(volume: f64, count: usize) -> Option<f64> {
    (count > 0 && volume > 0.0).then(|| (volume / count as f64).cbrt())
}

/// Per-face padding from the spacing in slabs just inside each face.
///
/// Along each axis the box is cut into slabs one `base` wide; slabs are added
/// from a face inward until they hold `num_neighbors` particles, and the
/// spacing in that stack sets the padding for the face.  A face whose box
/// holds too few particles keeps `base`.
///
/// # Arguments
/// * `owned` - The owned box
/// * `positions` - Owned particle positions
/// * `num_neighbors` - Neighbors the padding must cover
/// * `safety` - Multiplier on the estimate
/// * `base` - Flat padding for the box's mean spacing
///
/// # Returns
/// `(left, right)` padding per axis.
pub fn fancy_padding(
    owned: &AABB,
    positions: &[[f64; 3]],
    num_neighbors: usize,
    safety: f64,
    base: f64,
) -> ([f64; 3], [f64; 3]) {
    let mut left = [base; 3];
    let mut right = [base; 3];
    if base <= 0.0 {
        return (left, right);
    }
    let width = owned.width();
    for dim in 0..3 {
        let area = width[(dim + 1) % 3] * width[(dim + 2) % 3];
        let num_bins = ((width[dim] / base).ceil() as usize).clamp(1, 64 * NUM_BINS);
        let mut counts = vec![0usize; num_bins];
        for p in positions {
            let b = ((p[dim] - owned.min[dim]) / base).floor();
            if b >= 0.0 && (b as usize) < num_bins {
                counts[b as usize] += 1;
            }
        }

        let face_padding = |order: &mut dyn Iterator<Item = usize>| -> f64 {
            let mut count = 0usize;
            for (depth, b) in order.enumerate() {
                count += counts[b];
                if count >= num_neighbors {
                    let volume = area * (depth + 1) as f64 * base;
                    return mean_spacing(volume, count)
                        .map_or(base, |s| padding_for_spacing(num_neighbors, safety, s));
                }
            }
            base
        };
        left[dim] = face_padding(&mut (0..num_bins));
        right[dim] = face_padding(&mut (0..num_bins).rev());
    }
    (left, right)
}

/// Apply the configured minimum and keep padded boxes within one period.
///
/// Wrapped axes get no padding.
pub fn clamp_padding(
    left: [f64; 3],
    right: [f64; 3],
    floor: f64,
    owned: &AABB,
    domain: &AABB,
    periodic: bool,
    wrapped: [bool; 3],
) -> ([f64; 3], [f64; 3]) {
    let (mut l, mut r) = (left, right);
    let period = domain.width();
    let width = owned.width();
    for d in 0..3 {
        if wrapped[d] {
            l[d] = 0.0;
            r[d] = 0.0;
            continue;
        }
        l[d] = l[d].max(floor);
        r[d] = r[d].max(floor);
        if periodic {
            let cap = 0.5 * (period[d] - width[d]).max(0.0);
            l[d] = l[d].min(cap);
            r[d] = r[d].min(cap);
        }
    }
    (l, r)
}

/// Smallest padding any face may get.
///
/// FOF also needs every friend of an owned particle in view, so its floor is
/// at least one linking length.
pub fn padding_floor(config: &FinderConfig, domain: &AABB, global_count: u64) -> f64 {
    match config.method {
        FinderMethod::Hop => config.padding,
        FinderMethod::Fof => {
            let widest = domain.width().iter().cloned().fold(0.0, f64::max);
            config.padding.max(link_length_for(config.link, global_count) * widest)
        }
    }
}

/// Decide this worker's owned box and ghost padding.
///
/// Collective: every worker must call this in step.
pub fn plan_partition<C: Collective>(
    comm: &C,
    source: &dyn ParticleSource,
    config: &FinderConfig,
) -> Result<PartitionPlan> {
    let domain = source.domain();
    let periodic = source.periodic();
    let top = config
        .subvolume
        .map_or(domain, |b| AABB::new(b.min, b.max));
    let cuts = bisection_cuts(comm.size());

    // Cut up the volume evenly first, with no padding.
    let even = even_partition(&top, &cuts);
    let mut owned = even[comm.rank()];
    let mut local = source
        .read_region(&Region::unpadded(owned, &domain, periodic))
        .filter_dark_matter(config.dm_only);

    let mut counts = [local.particles.len() as u64];
    comm.all_sum_counts(&mut counts)?;
    let global_count = counts[0];
    if global_count < config.num_neighbors as u64 {
        return Err(HaloError::InsufficientParticles {
            found: global_count,
            required: config.num_neighbors,
        });
    }

    if config.resize && comm.size() > 1 && config.subvolume.is_none() {
        let sample = subsample(&local.particles, config.sample, config.seed, comm.rank());
        let boxes = load_balanced_boxes(comm, sample, &top)?;
        owned = boxes[comm.rank()];
        local = source
            .read_region(&Region::unpadded(owned, &domain, periodic))
            .filter_dark_matter(config.dm_only);
    }

    let wrapped = if comm.size() == 1 {
        [periodic && config.subvolume.is_none(); 3]
    } else {
        [0, 1, 2].map(|d| periodic && owned.spans_axis(&domain, d))
    };

    let policy = if comm.size() == 1 {
        PaddingPolicy::None
    } else if !config.fancy_padding || config.subvolume.is_some() {
        PaddingPolicy::Uniform
    } else {
        PaddingPolicy::Fancy
    };

    let global_spacing = mean_spacing(top.volume(), global_count as usize).unwrap_or(0.0);
    let spacing = mean_spacing(owned.volume(), local.particles.len()).unwrap_or(global_spacing);
    let base = padding_for_spacing(config.num_neighbors, config.safety, spacing);
    let (left, right) = match policy {
        PaddingPolicy::None => ([0.0; 3], [0.0; 3]),
        PaddingPolicy::Uniform => ([base; 3], [base; 3]),
        PaddingPolicy::Fancy => {
            let positions: Vec<[f64; 3]> = (0..local.particles.len()).map(|i| local.particles.position(i)).collect();
            fancy_padding(&owned, &positions, config.num_neighbors, config.safety, base)
        }
    };
    let (left, right) = if policy == PaddingPolicy::None {
        (left, right)
    } else {
        clamp_padding(left, right, padding_floor(config, &domain, global_count), &owned, &domain, periodic, wrapped)
    };

    tracing::info!(
        "Worker {}: box {:?}..{:?}, {:?} padding {:?} / {:?}, {} local particles",
        comm.rank(),
        owned.min,
        owned.max,
        policy,
        left,
        right,
        local.particles.len()
    );

    Ok(PartitionPlan {
        region: Region::new(owned, left, right, &domain, periodic),
        wrapped,
        global_count,
        policy,
    })
}
