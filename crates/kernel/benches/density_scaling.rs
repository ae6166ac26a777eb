//! Density estimate and HOP scaling with particle count.
//!
//! Run with: cargo bench -p halo_kernel --bench density_scaling

use std::time::Instant;

use halo_kernel::{
    estimate_density, run_finder, ClusterInput, HopFinder, HopParams, NeighborGrid, Periodicity,
};

/// Jittered lattice in a unit periodic box.
fn jittered_cube(target_count: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n_per_axis = (target_count as f64).cbrt().ceil() as usize;
    let spacing = 1.0 / n_per_axis as f64;
    let (mut x, mut y, mut z) = (Vec::new(), Vec::new(), Vec::new());
    for ix in 0..n_per_axis {
        for iy in 0..n_per_axis {
            for iz in 0..n_per_axis {
                // Deterministic jitter keeps densities from tying exactly.
                let j = ((ix * 7 + iy * 13 + iz * 29) % 17) as f64 / 17.0 - 0.5;
                x.push((ix as f64 + 0.5 + 0.3 * j) * spacing);
                y.push((iy as f64 + 0.5 - 0.2 * j) * spacing);
                z.push((iz as f64 + 0.5 + 0.1 * j) * spacing);
            }
        }
    }
    (x, y, z)
}

fn main() {
    println!("=== Density / HOP Scaling ===\n");

    let counts = [8_000, 27_000, 64_000, 125_000];

    println!("{:>10} {:>14} {:>14}", "Particles", "density (s)", "HOP (s)");

    for &n in &counts {
        let (x, y, z) = jittered_cube(n);
        let actual_n = x.len();
        let mass = vec![1.0 / actual_n as f64; actual_n];
        let keys: Vec<i64> = (0..actual_n as i64).collect();
        let periodicity = Periodicity::periodic([1.0; 3]);

        let start = Instant::now();
        let grid = NeighborGrid::for_points(&x, &y, &z, periodicity, 8);
        let field = estimate_density(&x, &y, &z, &mass, &keys, &grid, 65, 16);
        let density_time = start.elapsed().as_secs_f64();
        assert_eq!(field.density.len(), actual_n);

        let input = ClusterInput {
            x: &x,
            y: &y,
            z: &z,
            mass: &mass,
            keys: &keys,
            periodicity,
        };
        let finder = HopFinder::new(HopParams::new(160.0));
        let start = Instant::now();
        let out = run_finder(&finder, &input, true);
        let hop_time = start.elapsed().as_secs_f64();

        println!("{:>10} {:>14.3} {:>14.3}   ({} groups)", actual_n, density_time, hop_time, out.group_count());
    }
}
