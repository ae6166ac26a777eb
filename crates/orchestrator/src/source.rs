//! Particle data access: domain geometry, cosmology and region reads.

use halo_kernel::{ParticleArrays, Periodicity};

/// Critical density today for h = 1, in g/cm^3.
pub const RHO_CRIT_G_CM3: f64 = 1.8788e-29;
/// Solar mass in grams.
pub const MSUN_G: f64 = 1.989e33;
/// Offset keeping logarithmic bin edges away from zero.
pub const TINY: f64 = 1.0e-40;

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AABB {
    /// Minimum corner
    pub min: [f64; 3],
    /// Maximum corner
    pub max: [f64; 3],
}

impl AABB {
    /// Create a box from its corners.
    pub fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        Self { min, max }
    }

    /// Edge length along each axis.
    pub fn width(&self) -> [f64; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    /// Box volume.
    pub fn volume(&self) -> f64 {
        self.width().iter().map(|w| w.max(0.0)).product()
    }

    /// Half-open containment `[min, max)` on every axis.
    pub fn contains(&self, p: [f64; 3]) -> bool {
        (0..3).all(|d| p[d] >= self.min[d] && p[d] < self.max[d])
    }

    /// Box center.
    pub fn center(&self) -> [f64; 3] {
        [
            0.5 * (self.min[0] + self.max[0]),
            0.5 * (self.min[1] + self.max[1]),
            0.5 * (self.min[2] + self.max[2]),
        ]
    }

    /// Whether this box spans `other` entirely along `axis`.
    pub fn spans_axis(&self, other: &AABB, axis: usize) -> bool {
        self.min[axis] <= other.min[axis] && self.max[axis] >= other.max[axis]
    }
}

/// Cosmological parameters of the snapshot
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Cosmology {
    /// Dimensionless Hubble constant h
    pub hubble_constant: f64,
    /// Matter density parameter
    pub omega_matter: f64,
    /// Redshift of the snapshot
    pub current_redshift: f64,
    /// Centimeters per domain length unit
    pub length_unit_cm: f64,
}

impl Default for Cosmology {
    fn default() -> Self {
        Self {
            hubble_constant: 0.7,
            omega_matter: 0.3,
            current_redshift: 0.0,
            length_unit_cm: 3.0857e24,
        }
    }
}

impl Cosmology {
    /// Critical density at the snapshot redshift, in g/cm^3.
    pub fn rho_crit(&self) -> f64 {
        let h = self.hubble_constant;
        RHO_CRIT_G_CM3 * h * h * self.omega_matter * (1.0 + self.current_redshift).powi(3)
    }
}

/// One worker's owned box and the ghost margin read around it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    /// Owned box
    pub owned: AABB,
    /// Ghost width below `owned.min`
    pub pad_left: [f64; 3],
    /// Ghost width above `owned.max`
    pub pad_right: [f64; 3],
    /// Axes whose upper face is the closed upper face of an open domain
    pub closed_upper: [bool; 3],
}

impl Region {
    /// Region around `owned` inside `domain`.
    pub fn new(owned: AABB, pad_left: [f64; 3], pad_right: [f64; 3], domain: &AABB, periodic: bool) -> Self {
        let mut closed_upper = [false; 3];
        for d in 0..3 {
            closed_upper[d] = !periodic && owned.max[d] >= domain.max[d];
        }
        Self {
            owned,
            pad_left,
            pad_right,
            closed_upper,
        }
    }

    /// Region with no ghost margin.
    pub fn unpadded(owned: AABB, domain: &AABB, periodic: bool) -> Self {
        Self::new(owned, [0.0; 3], [0.0; 3], domain, periodic)
    }

    /// Owned box grown by the padding.
    pub fn padded(&self) -> AABB {
        let mut b = self.owned;
        for d in 0..3 {
            b.min[d] -= self.pad_left[d];
            b.max[d] += self.pad_right[d];
        }
        b
    }

    /// Whether `p` lies in the owned box.
    ///
    /// Half-open, except on the closed upper face of an open domain, so
    /// neighboring regions never both own a point.
    pub fn owns(&self, p: [f64; 3]) -> bool {
        (0..3).all(|d| {
            p[d] >= self.owned.min[d]
                && (p[d] < self.owned.max[d] || (self.closed_upper[d] && p[d] <= self.owned.max[d]))
        })
    }
}

/// Particles read for one region.
#[derive(Debug, Clone, Default)]
pub struct LocalParticles {
    /// Owned particles and ghost copies; ghosts are shifted by whole periods
    /// so they sit next to the owned box
    pub particles: ParticleArrays,
    /// Whether each row is owned (true) or a ghost copy (false)
    pub is_real: Vec<bool>,
}

impl LocalParticles {
    /// Number of owned rows.
    pub fn real_count(&self) -> usize {
        self.is_real.iter().filter(|&&r| r).count()
    }

    /// Keep only the given rows.
    pub fn select(&self, rows: &[usize]) -> LocalParticles {
        LocalParticles {
            particles: self.particles.select(rows),
            is_real: rows.iter().map(|&i| self.is_real[i]).collect(),
        }
    }

    /// Dark-matter rows only when `dm_only` is set, otherwise everything.
    pub fn filter_dark_matter(self, dm_only: bool) -> LocalParticles {
        if !dm_only {
            return self;
        }
        let rows = self.particles.dark_matter_rows();
        if rows.len() == self.particles.len() {
            self
        } else {
            self.select(&rows)
        }
    }
}

/// Access to the simulation's particles.
///
/// Implementations must be shareable across worker threads; every worker
/// reads only the regions it is assigned.
pub trait ParticleSource: Send + Sync {
    /// Simulation domain.
    fn domain(&self) -> AABB;

    /// Whether the domain wraps on every axis.
    fn periodic(&self) -> bool;

    /// Cosmological parameters.
    fn cosmology(&self) -> Cosmology;

    /// Total particle mass in the domain, dark matter only if `dm_only`.
    fn total_mass(&self, dm_only: bool) -> f64;

    /// Particles in the padded region; those in the owned box are marked real.
    fn read_region(&self, region: &Region) -> LocalParticles;

    /// Periodicity of the domain in domain units.
    fn periodicity(&self) -> Periodicity {
        if self.periodic() {
            Periodicity::periodic(self.domain().width())
        } else {
            Periodicity::open()
        }
    }
}

/// Particle source holding the whole snapshot in memory.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    particles: ParticleArrays,
    domain: AABB,
    periodic: bool,
    cosmology: Cosmology,
}

impl InMemorySource {
    /// Wrap `particles` in a source.  On periodic domains positions are
    /// folded into `[domain.min, domain.max)`.
    pub fn new(mut particles: ParticleArrays, domain: AABB, periodic: bool, cosmology: Cosmology) -> Self {
        if periodic {
            let p = Periodicity::periodic(domain.width());
            for i in 0..particles.len() {
                let w = p.wrap(particles.position(i), domain.min);
                particles.x[i] = w[0];
                particles.y[i] = w[1];
                particles.z[i] = w[2];
            }
        }
        Self {
            particles,
            domain,
            periodic,
            cosmology,
        }
    }

    /// All particles of the snapshot.
    pub fn particles(&self) -> &ParticleArrays {
        &self.particles
    }

    /// Period shifts to try along one axis.
    fn shifts(&self, axis: usize) -> Vec<f64> {
        if self.periodic {
            let p = self.domain.width()[axis];
            vec![0.0, -p, p]
        } else {
            vec![0.0]
        }
    }
}

impl ParticleSource for InMemorySource {
    fn domain(&self) -> AABB {
        self.domain
    }

    fn periodic(&self) -> bool {
        self.periodic
    }

    fn cosmology(&self) -> Cosmology {
        self.cosmology
    }

    fn total_mass(&self, dm_only: bool) -> f64 {
        if dm_only {
            self.particles
                .dark_matter_rows()
                .iter()
                .map(|&i| self.particles.mass[i])
                .sum()
        } else {
            self.particles.total_mass()
        }
    }

    fn read_region(&self, region: &Region) -> LocalParticles {
        let padded = region.padded();
        let (sx, sy, sz) = (self.shifts(0), self.shifts(1), self.shifts(2));
        let mut rows = Vec::new();
        let mut shifted = Vec::new();
        let mut is_real = Vec::new();

        for i in 0..self.particles.len() {
            let p = self.particles.position(i);
            if region.owns(p) {
                rows.push(i);
                shifted.push(p);
                is_real.push(true);
                continue;
            }
            // Each image is taken once; padded widths never exceed one period.
            'images: for &dx in &sx {
                for &dy in &sy {
                    for &dz in &sz {
                        let q = [p[0] + dx, p[1] + dy, p[2] + dz];
                        if region.in_padded(q, &padded) && !region.owns(q) {
                            rows.push(i);
                            shifted.push(q);
                            is_real.push(false);
                            break 'images;
                        }
                    }
                }
            }
        }

        let mut particles = self.particles.select(&rows);
        for (row, q) in shifted.into_iter().enumerate() {
            particles.x[row] = q[0];
            particles.y[row] = q[1];
            particles.z[row] = q[2];
        }
        tracing::debug!(
            "Read region {:?}: {} real, {} ghost particles",
            region.owned,
            is_real.iter().filter(|&&r| r).count(),
            is_real.iter().filter(|&&r| !r).count()
        );
        LocalParticles { particles, is_real }
    }
}

impl Region {
    /// Containment in `padded` with the upper face closed where the domain closes it.
    fn in_padded(&self, q: [f64; 3], padded: &AABB) -> bool {
        (0..3).all(|d| {
            q[d] >= padded.min[d] && (q[d] < padded.max[d] || (self.closed_upper[d] && q[d] <= padded.max[d]))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halo_kernel::Particle;

    fn source(positions: &[[f64; 3]], periodic: bool) -> InMemorySource {
        let mut pa = ParticleArrays::new();
        for (i, &p) in positions.iter().enumerate() {
            pa.push(Particle::new(p, [0.0; 3], 1.0, i as i64));
        }
        InMemorySource::new(pa, AABB::new([0.0; 3], [1.0; 3]), periodic, Cosmology::default())
    }

    #[test]
    fn aabb_half_open() {
        let b = AABB::new([0.0; 3], [0.5, 1.0, 1.0]);
        assert!(b.contains([0.0, 0.2, 0.2]));
        assert!(!b.contains([0.5, 0.2, 0.2]));
        assert!((b.volume() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn periodic_ghosts_are_shifted() {
        let src = source(&[[0.98, 0.5, 0.5], [0.1, 0.5, 0.5], [0.6, 0.5, 0.5]], true);
        let domain = src.domain();
        let region = Region::new(
            AABB::new([0.0; 3], [0.5, 1.0, 1.0]),
            [0.05, 0.0, 0.0],
            [0.05, 0.0, 0.0],
            &domain,
            true,
        );
        let local = src.read_region(&region);
        assert_eq!(local.particles.len(), 2);
        assert_eq!(local.real_count(), 1);
        let ghost = local.is_real.iter().position(|&r| !r).unwrap();
        assert!((local.particles.x[ghost] + 0.02).abs() < 1e-12);
    }

    #[test]
    fn open_domain_closes_upper_face() {
        let src = source(&[[1.0, 1.0, 1.0], [0.0, 0.0, 0.0]], false);
        let domain = src.domain();
        let region = Region::unpadded(domain, &domain, false);
        let local = src.read_region(&region);
        assert_eq!(local.real_count(), 2);
    }

    #[test]
    fn rho_crit_scales_with_redshift() {
        let mut c = Cosmology::default();
        let now = c.rho_crit();
        c.current_redshift = 1.0;
        assert!((c.rho_crit() / now - 8.0).abs() < 1e-12);
    }
}
