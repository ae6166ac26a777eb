//! Friends-of-friends group finder.
//!
//! Any two particles closer than the linking length are friends; groups are
//! the connected components of the friendship graph.

use std::collections::BTreeMap;

use crate::neighbor::NeighborGrid;
use crate::union_find::UnionFind;
use crate::{ClusterInput, ClusterOutput, GroupFinder, GRID_OCCUPANCY};

/// Parameters for one friends-of-friends pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FofParams {
    /// Linking length in input coordinates
    pub link_length: f64,
    /// Smallest component reported as a group
    pub min_members: usize,
}

/// Linking length in unit-period coordinates.
///
/// A positive `link` is a fraction of the mean interparticle spacing
/// `(1 / n_total)^(1/3)`; a negative one is an absolute length.
pub fn link_length_for(link: f64, n_total: u64) -> f64 {
    if link > 0.0 {
        link * (1.0 / n_total.max(1) as f64).cbrt()
    } else {
        link.abs()
    }
}

/// Friends-of-friends group finder.
#[derive(Debug, Clone)]
pub struct FofFinder {
    params: FofParams,
}

impl FofFinder {
    /// Create a finder with the given parameters.
    pub fn new(params: FofParams) -> Self {
        Self { params }
    }
}

impl GroupFinder for FofFinder {
    fn name(&self) -> &'static str {
        "FOF"
    }

    fn find_groups(&self, input: &ClusterInput<'_>) -> ClusterOutput {
        let n = input.len();
        let mut uf = UnionFind::new(n);
        if n > 0 {
            let grid = NeighborGrid::for_points(input.x, input.y, input.z, input.periodicity, GRID_OCCUPANCY);
            for i in 0..n {
                grid.for_each_neighbor(i, input.x, input.y, input.z, self.params.link_length, |j, _| {
                    if j > i {
                        uf.union(i, j);
                    }
                });
            }
        }

        let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..n {
            components.entry(uf.find(i)).or_default().push(i);
        }

        // Number surviving components by their smallest particle key.
        let mut kept: Vec<(i64, Vec<usize>)> = components
            .into_values()
            .filter(|members| members.len() >= self.params.min_members.max(1))
            .map(|members| {
                let anchor = members.iter().map(|&i| input.keys[i]).min().unwrap_or(i64::MAX);
                (anchor, members)
            })
            .collect();
        kept.sort_unstable_by_key(|(anchor, _)| *anchor);

        let mut tags = vec![-1i64; n];
        for (g, (_, members)) in kept.iter().enumerate() {
            for &i in members {
                tags[i] = g as i64;
            }
        }
        tracing::debug!(
            "FOF: {} particles, link {:.6}, {} groups",
            n,
            self.params.link_length,
            kept.len()
        );

        ClusterOutput { tags, density: None }
    }
}
