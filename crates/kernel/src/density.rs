//! Adaptive kernel density estimation over the k nearest neighbors.
//!
//! Each particle gets its own smoothing length: half the distance to its
//! `num_neighbors`-th nearest neighbor, so the Wendland C2 support (2h) just
//! reaches that neighbor.  The density is the kernel-weighted mass sum
//!
//! ```text
//! rho_i = sum_j m_j * W(|r_i - r_j|, h_i)
//! ```
//!
//! With masses normalized to a total of one and positions to a unit period,
//! the result is in units of the mean density of the normalizing volume.

use std::f64::consts::PI;

use crate::neighbor::NeighborGrid;

/// Normalization constant for the 3D Wendland C2 kernel: 21 / (16 * pi).
const WENDLAND_C2_NORM_3D: f64 = 21.0 / (16.0 * PI);

/// Smallest smoothing length used when all neighbors coincide.
const MIN_SMOOTHING: f64 = 1.0e-12;

/// Wendland C2 smoothing kernel in 3D.
///
/// ```text
/// W(r, h) = (21 / (16 pi h^3)) * (1 - q/2)^4 * (1 + 2q)   for q = r/h <= 2
/// W(r, h) = 0                                                for q > 2
/// ```
///
/// # Arguments
/// * `r` - Distance between two particles (must be >= 0).
/// * `h` - Smoothing length. The support radius is 2h.
///
/// # Returns
/// Kernel value W(r, h).
pub fn wendland_c2(r: f64, h: f64) -> f64 {
    let q = r / h;
    if q >= 2.0 {
        return 0.0;
    }
    let h3 = h * h * h;
    let one_minus_half_q = 1.0 - 0.5 * q;
    let t = one_minus_half_q * one_minus_half_q;
    let t4 = t * t;
    WENDLAND_C2_NORM_3D / h3 * t4 * (1.0 + 2.0 * q)
}

/// Density estimate plus the nearest-neighbor lists the estimate was built from.
#[derive(Debug, Clone)]
pub struct DensityField {
    /// Density per particle
    pub density: Vec<f64>,
    /// For each particle, its nearest neighbors (itself included) in order of
    /// increasing distance, truncated to the `keep` length requested.
    pub neighbors: Vec<Vec<usize>>,
}

/// Estimate the density of every particle from its `num_neighbors` nearest neighbors.
///
/// `keys` breaks distance ties so the neighbor order does not depend on the
/// local row order.  The returned neighbor lists keep the first `keep`
/// entries of each particle's list.
///
/// # Arguments
/// * `x`, `y`, `z` - Positions (same frame as `grid`)
/// * `mass` - Particle masses
/// * `keys` - Stable per-particle keys (global particle indices)
/// * `grid` - Neighbor grid already filled with these positions
/// * `num_neighbors` - Neighbor count for the smoothing length, self included
/// * `keep` - How many neighbors to retain per particle
#[allow(clippy::too_many_arguments)]
pub fn estimate_density(
    x: &[f64],
    y: &[f64],
    z: &[f64],
    mass: &[f64],
    keys: &[i64],
    grid: &NeighborGrid,
    num_neighbors: usize,
    keep: usize,
) -> DensityField {
    let n = x.len();
    let mut density = vec![0.0; n];
    let mut neighbors = Vec::with_capacity(n);
    let k = num_neighbors.max(1);

    for i in 0..n {
        let mut nn = grid.nearest([x[i], y[i], z[i]], k, None, x, y, z);
        nn.sort_by(|a, b| a.0.total_cmp(&b.0).then(keys[a.1].cmp(&keys[b.1])));

        let r_max = nn.last().map_or(0.0, |&(d, _)| d.sqrt());
        let h = (0.5 * r_max).max(MIN_SMOOTHING);
        density[i] = nn
            .iter()
            .map(|&(d, j)| mass[j] * wendland_c2(d.sqrt(), h))
            .sum();

        neighbors.push(nn.iter().take(keep).map(|&(_, j)| j).collect());
    }

    DensityField { density, neighbors }
}
