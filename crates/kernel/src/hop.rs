//! HOP density-linking group finder (Eisenstein & Hut 1998).
//!
//! 1. Estimate a density for every particle ([`crate::density`]).
//! 2. Hop: link each particle to the densest of its `num_hop` nearest
//!    neighbors (itself included).  Following links uphill ends at a local
//!    density maximum; all particles reaching the same maximum form a chain.
//! 3. Boundaries: for every pair of particles above the outer threshold that
//!    are within `num_merge` neighbors of each other but belong to different
//!    chains, the mean pair density is a candidate saddle for that chain pair.
//! 4. Merge chains into groups:
//!    - optional premerge: chains whose saddle clears the saddle threshold and
//!      whose peak densities are within `merge_ratio` of each other join first;
//!    - full merge: chains join when the saddle clears the saddle threshold and
//!      both peaks clear the peak threshold;
//!    - groups whose peak stays below the peak threshold are attached to the
//!      strong neighbor they share the highest saddle with, or dropped.
//!
//! Particles below the outer threshold are never part of a group.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::density::estimate_density;
use crate::neighbor::NeighborGrid;
use crate::union_find::UnionFind;
use crate::{ClusterInput, ClusterOutput, GroupFinder, GRID_OCCUPANCY};

/// Threshold multipliers and neighbor counts of the HOP regrouping step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HopTuning {
    /// Peak threshold as a multiple of the outer threshold
    #[serde(default = "default_peak_factor")]
    pub peak_factor: f64,
    /// Saddle threshold as a multiple of the outer threshold
    #[serde(default = "default_saddle_factor")]
    pub saddle_factor: f64,
    /// Neighbors searched for the densest hop target
    #[serde(default = "default_num_hop")]
    pub num_hop: usize,
    /// Neighbors searched for chain boundaries
    #[serde(default = "default_num_merge")]
    pub num_merge: usize,
}

fn default_peak_factor() -> f64 {
    3.0
}

fn default_saddle_factor() -> f64 {
    2.5
}

fn default_num_hop() -> usize {
    16
}

fn default_num_merge() -> usize {
    4
}

impl Default for HopTuning {
    fn default() -> Self {
        Self {
            peak_factor: default_peak_factor(),
            saddle_factor: default_saddle_factor(),
            num_hop: default_num_hop(),
            num_merge: default_num_merge(),
        }
    }
}

/// Parameters for one HOP pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HopParams {
    /// Outer density threshold, in units of the input's mean density
    pub threshold: f64,
    /// Neighbors used by the density estimate
    pub num_neighbors: usize,
    /// Regrouping thresholds and neighbor counts
    pub tuning: HopTuning,
    /// Run the peak-ratio premerge before the full merge
    pub premerge: bool,
    /// Lower/higher peak density ratio accepted by the premerge
    pub merge_ratio: f64,
}

impl HopParams {
    /// Parameters with the usual defaults around the given outer threshold.
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            num_neighbors: 65,
            tuning: HopTuning::default(),
            premerge: true,
            merge_ratio: 0.5,
        }
    }
}

/// HOP group finder.
#[derive(Debug, Clone)]
pub struct HopFinder {
    params: HopParams,
}

impl HopFinder {
    /// Create a finder with the given parameters.
    pub fn new(params: HopParams) -> Self {
        Self { params }
    }

    /// The parameters this finder runs with.
    pub fn params(&self) -> &HopParams {
        &self.params
    }
}

impl GroupFinder for HopFinder {
    fn name(&self) -> &'static str {
        "HOP"
    }

    fn find_groups(&self, input: &ClusterInput<'_>) -> ClusterOutput {
        let n = input.len();
        if n == 0 {
            return ClusterOutput {
                tags: Vec::new(),
                density: Some(Vec::new()),
            };
        }
        let tuning = self.params.tuning;
        let keep = tuning.num_hop.max(tuning.num_merge + 1);

        let grid = NeighborGrid::for_points(input.x, input.y, input.z, input.periodicity, GRID_OCCUPANCY);
        let field = estimate_density(
            input.x,
            input.y,
            input.z,
            input.mass,
            input.keys,
            &grid,
            self.params.num_neighbors,
            keep,
        );
        let density = field.density;

        let chain_root = hop_chains(&density, &field.neighbors, input.keys, tuning.num_hop);
        let chains = ChainTable::build(&chain_root, &density, input.keys);
        let saddles = boundary_saddles(
            &density,
            &field.neighbors,
            &chains.chain_of,
            self.params.threshold,
            tuning.num_merge,
        );
        let group_of_chain = merge_chains(&chains.peak_density, &saddles, &self.params);

        let tags: Vec<i64> = (0..n)
            .map(|i| {
                if density[i] < self.params.threshold {
                    return -1;
                }
                group_of_chain[chains.chain_of[i]].map_or(-1, |g| g as i64)
            })
            .collect();

        tracing::debug!(
            "HOP: {} particles, {} chains, {} boundaries, {} groups",
            n,
            chains.peak_density.len(),
            saddles.len(),
            group_of_chain.iter().flatten().max().map_or(0, |g| g + 1),
        );

        ClusterOutput {
            tags,
            density: Some(density),
        }
    }
}

/// `true` if particle `a` ranks above `b`: higher density, ties to the lower key.
#[inline]
fn denser(a: usize, b: usize, density: &[f64], keys: &[i64]) -> bool {
    density[a] > density[b] || (density[a] == density[b] && keys[a] < keys[b])
}

/// Follow each particle's uphill link to its local maximum.
///
/// Returns the maximum's row for every particle.
fn hop_chains(density: &[f64], neighbors: &[Vec<usize>], keys: &[i64], num_hop: usize) -> Vec<usize> {
    let n = density.len();
    let link: Vec<usize> = (0..n)
        .map(|i| {
            neighbors[i]
                .iter()
                .take(num_hop)
                .fold(i, |best, &j| if denser(j, best, density, keys) { j } else { best })
        })
        .collect();

    let mut root = vec![usize::MAX; n];
    let mut path = Vec::new();
    for i in 0..n {
        path.clear();
        let mut c = i;
        while root[c] == usize::MAX && link[c] != c {
            path.push(c);
            c = link[c];
        }
        let r = if root[c] == usize::MAX { c } else { root[c] };
        root[c] = r;
        for &p in &path {
            root[p] = r;
        }
    }
    root
}

/// Chains ordered by the key of their peak particle.
struct ChainTable {
    /// Chain number of every particle
    chain_of: Vec<usize>,
    /// Peak density of every chain
    peak_density: Vec<f64>,
}

impl ChainTable {
    fn build(chain_root: &[usize], density: &[f64], keys: &[i64]) -> Self {
        let mut roots: Vec<usize> = chain_root.to_vec();
        roots.sort_unstable_by_key(|&r| keys[r]);
        roots.dedup();
        let number: BTreeMap<usize, usize> = roots.iter().enumerate().map(|(c, &r)| (r, c)).collect();
        Self {
            chain_of: chain_root.iter().map(|r| number[r]).collect(),
            peak_density: roots.iter().map(|&r| density[r]).collect(),
        }
    }
}

/// Highest mean pair density across each chain boundary, keyed by `(low, high)` chain pair.
fn boundary_saddles(
    density: &[f64],
    neighbors: &[Vec<usize>],
    chain_of: &[usize],
    threshold: f64,
    num_merge: usize,
) -> BTreeMap<(usize, usize), f64> {
    let mut saddles: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    for i in 0..density.len() {
        if density[i] < threshold {
            continue;
        }
        for &j in neighbors[i].iter().take(num_merge + 1) {
            if j == i || density[j] < threshold || chain_of[i] == chain_of[j] {
                continue;
            }
            let pair = (chain_of[i].min(chain_of[j]), chain_of[i].max(chain_of[j]));
            let saddle = 0.5 * (density[i] + density[j]);
            let entry = saddles.entry(pair).or_insert(saddle);
            if saddle > *entry {
                *entry = saddle;
            }
        }
    }
    saddles
}

/// Join chains into groups.
///
/// Returns the group number of each chain, or `None` for chains whose group
/// never reaches the peak threshold.  Groups are numbered in ascending order
/// of their representative chain, i.e. of their peak particle's key.
fn merge_chains(
    peaks: &[f64],
    saddles: &BTreeMap<(usize, usize), f64>,
    params: &HopParams,
) -> Vec<Option<usize>> {
    let peak_min = params.tuning.peak_factor * params.threshold;
    let saddle_min = params.tuning.saddle_factor * params.threshold;
    let mut uf = UnionFind::new(peaks.len());

    let stronger = |a: usize, b: usize| peaks[a] > peaks[b] || (peaks[a] == peaks[b] && a < b);
    let join = |uf: &mut UnionFind, a: usize, b: usize| {
        if stronger(a, b) {
            uf.attach(b, a);
        } else {
            uf.attach(a, b);
        }
    };

    if params.premerge {
        for (&(a, b), &saddle) in saddles {
            if saddle < saddle_min {
                continue;
            }
            let (ra, rb) = (uf.find(a), uf.find(b));
            if ra == rb {
                continue;
            }
            let (lo, hi) = (peaks[ra].min(peaks[rb]), peaks[ra].max(peaks[rb]));
            if hi > 0.0 && lo / hi >= params.merge_ratio {
                join(&mut uf, ra, rb);
            }
        }
    }

    for (&(a, b), &saddle) in saddles {
        if saddle < saddle_min {
            continue;
        }
        let (ra, rb) = (uf.find(a), uf.find(b));
        if ra != rb && peaks[ra] >= peak_min && peaks[rb] >= peak_min {
            join(&mut uf, ra, rb);
        }
    }

    // Weak groups go to the strong neighbor behind their highest saddle.
    let mut best: BTreeMap<usize, (f64, usize)> = BTreeMap::new();
    for (&(a, b), &saddle) in saddles {
        let (ra, rb) = (uf.find(a), uf.find(b));
        if ra == rb {
            continue;
        }
        for (weak, strong) in [(ra, rb), (rb, ra)] {
            if peaks[weak] >= peak_min || peaks[strong] < peak_min {
                continue;
            }
            let candidate = (saddle, strong);
            match best.get(&weak) {
                Some(&(s, t)) if s > saddle || (s == saddle && t < strong) => {}
                _ => {
                    best.insert(weak, candidate);
                }
            }
        }
    }
    for (weak, (_, strong)) in best {
        let (rw, rs) = (uf.find(weak), uf.find(strong));
        if rw != rs {
            uf.attach(rw, rs);
        }
    }

    let mut number: BTreeMap<usize, usize> = BTreeMap::new();
    let mut groups = Vec::with_capacity(peaks.len());
    for c in 0..peaks.len() {
        let r = uf.find(c);
        if peaks[r] < peak_min {
            groups.push(None);
            continue;
        }
        groups.push(Some(r));
    }
    for r in groups.iter().flatten() {
        number.entry(*r).or_insert(0);
    }
    for (g, v) in number.values_mut().enumerate() {
        *v = g;
    }
    groups.into_iter().map(|r| r.map(|r| number[&r])).collect()
}
