//! Halo Finding Kernel
//!
//! This crate provides the numerical core of the halo finder: particle
//! storage, neighbor search, density estimation and the group finders.  It
//! knows nothing about partitions or workers; it clusters whatever particle
//! set it is handed.
//!
//! # Modules
//! - [`particle`] -- Struct-of-arrays particle storage and dark-matter selection.
//! - [`periodic`] -- Nearest-image displacements and unwrapping in periodic boxes.
//! - [`neighbor`] -- Uniform-grid spatial hash with radius and k-nearest queries.
//! - [`density`] -- Wendland C2 adaptive kernel density estimate.
//! - [`hop`] -- HOP density-linking group finder.
//! - [`fof`] -- Friends-of-friends group finder.
//! - [`groups`] -- Tag arrays to member lists.

#![warn(missing_docs)]

pub mod density;
pub mod fof;
pub mod groups;
pub mod hop;
pub mod neighbor;
pub mod particle;
pub mod periodic;
pub mod union_find;

pub use density::{estimate_density, wendland_c2, DensityField};
pub use fof::{link_length_for, FofFinder, FofParams};
pub use groups::{group_particles, Group};
pub use hop::{HopFinder, HopParams, HopTuning};
pub use neighbor::NeighborGrid;
pub use particle::{DarkMatterRule, Particle, ParticleArrays};
pub use periodic::Periodicity;

/// Target particles per grid cell for the finders' neighbor grids.
pub const GRID_OCCUPANCY: usize = 8;

// ---------------------------------------------------------------------------
// GroupFinder trait
// ---------------------------------------------------------------------------

/// Particle data handed to a group finder.
///
/// Positions are normalized so periodic axes span `[0, period)`; open axes
/// may hold any coordinates (ghost copies shifted past the box edge).
#[derive(Debug, Clone, Copy)]
pub struct ClusterInput<'a> {
    /// X positions
    pub x: &'a [f64],
    /// Y positions
    pub y: &'a [f64],
    /// Z positions
    pub z: &'a [f64],
    /// Masses (normalized by the caller)
    pub mass: &'a [f64],
    /// Stable keys used for every tie-break (global particle indices)
    pub keys: &'a [i64],
    /// Which axes wrap
    pub periodicity: Periodicity,
}

impl<'a> ClusterInput<'a> {
    /// Number of particles.
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Whether there are no particles.
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// Group assignment produced by a finder.
#[derive(Debug, Clone, Default)]
pub struct ClusterOutput {
    /// Group tag per particle, `-1` for unassigned
    pub tags: Vec<i64>,
    /// Density estimate per particle (HOP only)
    pub density: Option<Vec<f64>>,
}

impl ClusterOutput {
    /// Number of distinct groups (tags run `0..count`).
    pub fn group_count(&self) -> usize {
        self.tags.iter().max().map_or(0, |&t| (t + 1).max(0) as usize)
    }
}

/// Trait every clustering algorithm implements.
///
/// A finder turns one particle set into a tag per particle.  Group numbers
/// must depend only on particle keys and positions, never on row order, so
/// that overlapping partitions agree on shared groups.
pub trait GroupFinder {
    /// Short algorithm name written into catalog headers.
    fn name(&self) -> &'static str;

    /// Assign every particle to a group or to `-1`.
    fn find_groups(&self, input: &ClusterInput<'_>) -> ClusterOutput;
}

/// Run `finder`, optionally after permuting particles into neighbor-grid cell order.
///
/// Rearranging trades a copy of the input for cache-friendly neighbor
/// searches; the output is mapped back to the caller's row order.
pub fn run_finder(finder: &dyn GroupFinder, input: &ClusterInput<'_>, rearrange: bool) -> ClusterOutput {
    if !rearrange || input.len() < 2 {
        return finder.find_groups(input);
    }

    let grid = NeighborGrid::for_points(input.x, input.y, input.z, input.periodicity, GRID_OCCUPANCY);
    let order = grid.cell_order();
    let pick_f = |v: &[f64]| order.iter().map(|&i| v[i]).collect::<Vec<f64>>();
    let (x, y, z, mass) = (pick_f(input.x), pick_f(input.y), pick_f(input.z), pick_f(input.mass));
    let keys: Vec<i64> = order.iter().map(|&i| input.keys[i]).collect();
    let permuted = ClusterInput {
        x: &x,
        y: &y,
        z: &z,
        mass: &mass,
        keys: &keys,
        periodicity: input.periodicity,
    };

    let out = finder.find_groups(&permuted);
    let mut tags = vec![-1; input.len()];
    let mut density = out.density.as_ref().map(|_| vec![0.0; input.len()]);
    for (row, &orig) in order.iter().enumerate() {
        tags[orig] = out.tags[row];
        if let (Some(d), Some(src)) = (density.as_mut(), out.density.as_ref()) {
            d[orig] = src[row];
        }
    }
    ClusterOutput { tags, density }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_count_from_tags() {
        let out = ClusterOutput {
            tags: vec![-1, 0, 2, 1],
            density: None,
        };
        assert_eq!(out.group_count(), 3);
        assert_eq!(ClusterOutput::default().group_count(), 0);
    }

    #[test]
    fn rearranged_run_matches_plain_run() {
        let x = [0.9, 0.11, 0.5, 0.1, 0.52];
        let y = [0.5; 5];
        let z = [0.5; 5];
        let mass = [1.0; 5];
        let keys = [4, 3, 2, 1, 0];
        let input = ClusterInput {
            x: &x,
            y: &y,
            z: &z,
            mass: &mass,
            keys: &keys,
            periodicity: Periodicity::periodic([1.0; 3]),
        };
        let finder = FofFinder::new(FofParams {
            link_length: 0.05,
            min_members: 2,
        });
        let plain = run_finder(&finder, &input, false);
        let rearranged = run_finder(&finder, &input, true);
        assert_eq!(plain.tags, rearranged.tags);
        assert_eq!(plain.tags[0], -1);
        assert_eq!(plain.tags[1], plain.tags[3]);
    }
}
