//! Uniform-grid spatial hash for radius and k-nearest-neighbor search.
//!
//! Uses sorted-index + cell-offset arrays rather than `HashMap`, so the
//! cell-ordered particle list doubles as a cache-friendly particle ordering.
//! Periodic axes wrap cell lookups and use nearest-image distances.

use crate::periodic::Periodicity;

/// Upper bound on cells per axis; keeps the offset tables bounded for tiny cell sizes.
const MAX_CELLS_PER_AXIS: f64 = 128.0;

/// Uniform-grid spatial hash.
///
/// The grid covers a fixed axis-aligned box.  Along periodic axes the box must
/// span exactly one period starting at `domain_min`.  Positions outside the box
/// on open axes are clamped into the edge cells, so queries stay correct.
pub struct NeighborGrid {
    cell_size: [f64; 3],
    grid_min: [f64; 3],
    grid_dims: [u32; 3],
    periodicity: Periodicity,
    /// Cell index for each particle (parallel to particle arrays).
    cell_indices: Vec<u32>,
    /// Particle indices sorted by cell index.
    sorted_indices: Vec<u32>,
    /// Start offset in `sorted_indices` for each cell.
    cell_offsets: Vec<u32>,
    /// Number of particles in each cell.
    cell_counts: Vec<u32>,
}

impl NeighborGrid {
    /// Create a new neighbor grid covering `[domain_min, domain_max]`.
    ///
    /// Periodic axes round the cell size so an integer number of cells tiles
    /// the period exactly.
    pub fn new(
        cell_size: f64,
        domain_min: [f64; 3],
        domain_max: [f64; 3],
        periodicity: Periodicity,
    ) -> Self {
        assert!(cell_size > 0.0, "cell_size must be positive");
        let mut dims = [1u32; 3];
        let mut sizes = [cell_size; 3];
        for axis in 0..3 {
            let extent = (domain_max[axis] - domain_min[axis]).max(0.0);
            if periodicity.periodic[axis] {
                let extent = periodicity.period[axis];
                let n = (extent / cell_size).floor().clamp(1.0, MAX_CELLS_PER_AXIS);
                dims[axis] = n as u32;
                sizes[axis] = extent / n;
            } else {
                let n = (extent / cell_size).ceil().clamp(1.0, MAX_CELLS_PER_AXIS);
                dims[axis] = n as u32;
                sizes[axis] = if extent > 0.0 { (extent / n).max(cell_size) } else { cell_size };
            }
        }
        let total_cells = (dims[0] as usize) * (dims[1] as usize) * (dims[2] as usize);
        Self {
            cell_size: sizes,
            grid_min: domain_min,
            grid_dims: dims,
            periodicity,
            cell_indices: Vec::new(),
            sorted_indices: Vec::new(),
            cell_offsets: vec![0; total_cells],
            cell_counts: vec![0; total_cells],
        }
    }

    /// Build a grid sized for the given particles and fill it.
    ///
    /// Open axes are bounded by the particle extent; periodic axes span
    /// `[0, period)`.  The cell size targets roughly `per_cell` particles per
    /// occupied cell for a uniform distribution.
    pub fn for_points(
        x: &[f64],
        y: &[f64],
        z: &[f64],
        periodicity: Periodicity,
        per_cell: usize,
    ) -> Self {
        let (lo, hi) = point_bounds(x, y, z, periodicity);
        let volume: f64 = (0..3).map(|a| (hi[a] - lo[a]).max(1e-12)).product();
        let n = x.len().max(1) as f64;
        let cell_size = (volume * per_cell.max(1) as f64 / n).cbrt().max(1e-9);
        let mut grid = Self::new(cell_size, lo, hi, periodicity);
        grid.update(x, y, z);
        grid
    }

    /// Total number of cells in the grid.
    fn total_cells(&self) -> usize {
        (self.grid_dims[0] as usize)
            * (self.grid_dims[1] as usize)
            * (self.grid_dims[2] as usize)
    }

    /// Per-axis cell size actually used.
    pub fn cell_size(&self) -> [f64; 3] {
        self.cell_size
    }

    /// The periodicity used for distances.
    pub fn periodicity(&self) -> Periodicity {
        self.periodicity
    }

    /// Map a position to its cell along one axis.
    #[inline]
    fn axis_cell(&self, axis: usize, p: f64) -> u32 {
        let dims = self.grid_dims[axis];
        let mut offset = p - self.grid_min[axis];
        if self.periodicity.periodic[axis] {
            offset = offset.rem_euclid(self.periodicity.period[axis]);
        }
        (offset / self.cell_size[axis])
            .floor()
            .max(0.0)
            .min((dims - 1) as f64) as u32
    }

    /// Map a world-space position to a cell (cx, cy, cz).
    #[inline]
    fn pos_to_cell(&self, p: [f64; 3]) -> [u32; 3] {
        [
            self.axis_cell(0, p[0]),
            self.axis_cell(1, p[1]),
            self.axis_cell(2, p[2]),
        ]
    }

    /// Flat cell index from (cx, cy, cz).
    #[inline]
    fn cell_hash(&self, cx: u32, cy: u32, cz: u32) -> u32 {
        cx + cy * self.grid_dims[0] + cz * self.grid_dims[0] * self.grid_dims[1]
    }

    /// Rebuild the grid from current particle positions.
    ///
    /// The three slices must all have the same length (one entry per particle).
    pub fn update(&mut self, x: &[f64], y: &[f64], z: &[f64]) {
        let n = x.len();
        debug_assert_eq!(n, y.len());
        debug_assert_eq!(n, z.len());

        let total_cells = self.total_cells();

        // --- 1. Compute cell index for each particle ---
        self.cell_indices.resize(n, 0);
        for i in 0..n {
            let [cx, cy, cz] = self.pos_to_cell([x[i], y[i], z[i]]);
            self.cell_indices[i] = self.cell_hash(cx, cy, cz);
        }

        // --- 2. Count particles per cell ---
        self.cell_counts.clear();
        self.cell_counts.resize(total_cells, 0);
        for &ci in &self.cell_indices {
            self.cell_counts[ci as usize] += 1;
        }

        // --- 3. Prefix-sum to get cell offsets ---
        self.cell_offsets.clear();
        self.cell_offsets.resize(total_cells, 0);
        let mut running = 0u32;
        for c in 0..total_cells {
            self.cell_offsets[c] = running;
            running += self.cell_counts[c];
        }

        // --- 4. Scatter particle indices into sorted order ---
        self.sorted_indices.resize(n, 0);
        let mut write_heads: Vec<u32> = self.cell_offsets.clone();
        for i in 0..n {
            let ci = self.cell_indices[i] as usize;
            let pos = write_heads[ci] as usize;
            self.sorted_indices[pos] = i as u32;
            write_heads[ci] += 1;
        }
    }

    /// Particle indices in cell order (spatially coherent).
    pub fn cell_order(&self) -> Vec<usize> {
        self.sorted_indices.iter().map(|&i| i as usize).collect()
    }

    /// Distinct cells to visit along one axis around `centre`.
    fn axis_span(&self, axis: usize, centre: u32, reach: u32, out: &mut Vec<u32>) {
        out.clear();
        let dims = self.grid_dims[axis] as i64;
        let reach = reach as i64;
        if self.periodicity.periodic[axis] {
            if 2 * reach + 1 >= dims {
                out.extend(0..dims as u32);
                return;
            }
            for d in -reach..=reach {
                out.push((centre as i64 + d).rem_euclid(dims) as u32);
            }
        } else {
            let lo = (centre as i64 - reach).max(0);
            let hi = (centre as i64 + reach).min(dims - 1);
            out.extend(lo as u32..=hi as u32);
        }
    }

    /// Visit every particle within `radius` of `point`.
    ///
    /// The closure receives the particle index and its squared distance.
    pub fn for_each_within<F>(
        &self,
        point: [f64; 3],
        radius: f64,
        x: &[f64],
        y: &[f64],
        z: &[f64],
        mut f: F,
    ) where
        F: FnMut(usize, f64),
    {
        let cell = self.pos_to_cell(point);
        let radius_sq = radius * radius;
        let mut spans: [Vec<u32>; 3] = [Vec::new(), Vec::new(), Vec::new()];
        for axis in 0..3 {
            let reach = (radius / self.cell_size[axis]).ceil().max(0.0);
            let reach = reach.min(self.grid_dims[axis] as f64) as u32;
            self.axis_span(axis, cell[axis], reach, &mut spans[axis]);
        }

        for &nz in &spans[2] {
            for &ny in &spans[1] {
                for &nx in &spans[0] {
                    let cell = self.cell_hash(nx, ny, nz) as usize;
                    let start = self.cell_offsets[cell] as usize;
                    let count = self.cell_counts[cell] as usize;
                    for s in start..start + count {
                        let j = self.sorted_indices[s] as usize;
                        let dist_sq = self.periodicity.distance_sq(point, [x[j], y[j], z[j]]);
                        if dist_sq <= radius_sq {
                            f(j, dist_sq);
                        }
                    }
                }
            }
        }
    }

    /// Iterate over all neighbors of `particle_idx` within `radius`, excluding itself.
    pub fn for_each_neighbor<F>(
        &self,
        particle_idx: usize,
        x: &[f64],
        y: &[f64],
        z: &[f64],
        radius: f64,
        mut f: F,
    ) where
        F: FnMut(usize, f64),
    {
        let p = [x[particle_idx], y[particle_idx], z[particle_idx]];
        self.for_each_within(p, radius, x, y, z, |j, d| {
            if j != particle_idx {
                f(j, d);
            }
        });
    }

    /// The `k` nearest particles to `point`, as `(squared distance, index)`
    /// sorted by distance then index.
    ///
    /// With `max_dist_sq` set, only particles within that squared distance are
    /// considered, so fewer than `k` may come back.
    pub fn nearest(
        &self,
        point: [f64; 3],
        k: usize,
        max_dist_sq: Option<f64>,
        x: &[f64],
        y: &[f64],
        z: &[f64],
    ) -> Vec<(f64, usize)> {
        if k == 0 || x.is_empty() {
            return Vec::new();
        }
        let limit = max_dist_sq.map(f64::sqrt);
        let full_extent = (0..3)
            .map(|a| {
                let e = self.cell_size[a] * self.grid_dims[a] as f64;
                e * e
            })
            .sum::<f64>()
            .sqrt();
        let mut radius = self.cell_size.iter().cloned().fold(0.0, f64::max);
        let mut found: Vec<(f64, usize)> = Vec::new();
        loop {
            let r = limit.map_or(radius, |l| radius.min(l));
            found.clear();
            self.for_each_within(point, r, x, y, z, |j, d| found.push((d, j)));
            let exhausted = r >= full_extent || limit.is_some_and(|l| radius >= l);
            if found.len() >= k || exhausted {
                break;
            }
            radius *= 2.0;
        }
        found.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        found.truncate(k);
        found
    }
}

/// Bounding box used for a grid over the given points.
fn point_bounds(x: &[f64], y: &[f64], z: &[f64], periodicity: Periodicity) -> ([f64; 3], [f64; 3]) {
    let mut lo = [0.0; 3];
    let mut hi = [0.0; 3];
    for (axis, coords) in [x, y, z].into_iter().enumerate() {
        if periodicity.periodic[axis] {
            lo[axis] = 0.0;
            hi[axis] = periodicity.period[axis];
        } else if coords.is_empty() {
            lo[axis] = 0.0;
            hi[axis] = 1.0;
        } else {
            let (mn, mx) = coords
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(a, b), &v| (a.min(v), b.max(v)));
            lo[axis] = mn;
            hi[axis] = mx.max(mn + 1e-12);
        }
    }
    (lo, hi)
}
