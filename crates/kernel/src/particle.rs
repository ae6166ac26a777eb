//! Particle data structures using struct-of-arrays layout.

/// How dark-matter particles are told apart from baryonic ones.
///
/// Chosen from whichever discriminator field the particle data carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DarkMatterRule {
    /// Dark matter has a negative creation time (stars carry their birth time).
    CreationTime,
    /// Dark matter carries particle type 1.
    ParticleType,
    /// No discriminator is present; every particle counts as dark matter.
    All,
}

/// Particle type tag used for dark matter when a type field is present.
pub const DARK_MATTER_TYPE: i32 = 1;

/// A single particle record, used when building or exporting arrays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Particle {
    /// Position in domain units
    pub position: [f64; 3],
    /// Velocity in simulation units
    pub velocity: [f64; 3],
    /// Mass in solar masses
    pub mass: f64,
    /// Globally unique particle index
    pub index: i64,
    /// Creation time, when the data carries one
    pub creation_time: Option<f64>,
    /// Particle type, when the data carries one
    pub particle_type: Option<i32>,
}

impl Particle {
    /// A plain particle with no discriminator fields.
    pub fn new(position: [f64; 3], velocity: [f64; 3], mass: f64, index: i64) -> Self {
        Self {
            position,
            velocity,
            mass,
            index,
            creation_time: None,
            particle_type: None,
        }
    }
}

/// Struct-of-arrays particle storage.
///
/// All arrays are parallel: index `i` across every array refers to the same particle.
/// The optional columns are either present for every particle or absent for all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParticleArrays {
    // ---- Positions ----
    /// X positions
    pub x: Vec<f64>,
    /// Y positions
    pub y: Vec<f64>,
    /// Z positions
    pub z: Vec<f64>,

    // ---- Velocities ----
    /// X velocities
    pub vx: Vec<f64>,
    /// Y velocities
    pub vy: Vec<f64>,
    /// Z velocities
    pub vz: Vec<f64>,

    // ---- Scalar fields ----
    /// Particle mass (Msun)
    pub mass: Vec<f64>,
    /// Unique particle index
    pub index: Vec<i64>,
    /// Creation time column, if the data has one
    pub creation_time: Option<Vec<f64>>,
    /// Particle type column, if the data has one
    pub particle_type: Option<Vec<i32>>,
}

impl ParticleArrays {
    /// Create an empty particle collection without discriminator columns.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty collection carrying the given optional columns.
    pub fn with_columns(creation_time: bool, particle_type: bool) -> Self {
        Self {
            creation_time: creation_time.then(Vec::new),
            particle_type: particle_type.then(Vec::new),
            ..Self::default()
        }
    }

    /// Return the number of particles currently stored.
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Return `true` if there are no particles.
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Append a particle.
    ///
    /// Optional fields are written only when this collection carries the
    /// matching column; a missing value in a present column is stored as the
    /// dark-matter default (creation time -1, type 1).
    pub fn push(&mut self, p: Particle) {
        self.x.push(p.position[0]);
        self.y.push(p.position[1]);
        self.z.push(p.position[2]);
        self.vx.push(p.velocity[0]);
        self.vy.push(p.velocity[1]);
        self.vz.push(p.velocity[2]);
        self.mass.push(p.mass);
        self.index.push(p.index);
        if let Some(ct) = self.creation_time.as_mut() {
            ct.push(p.creation_time.unwrap_or(-1.0));
        }
        if let Some(pt) = self.particle_type.as_mut() {
            pt.push(p.particle_type.unwrap_or(DARK_MATTER_TYPE));
        }
    }

    /// Read back particle `i` as a record.
    pub fn get(&self, i: usize) -> Particle {
        Particle {
            position: self.position(i),
            velocity: self.velocity(i),
            mass: self.mass[i],
            index: self.index[i],
            creation_time: self.creation_time.as_ref().map(|c| c[i]),
            particle_type: self.particle_type.as_ref().map(|t| t[i]),
        }
    }

    /// Position of particle `i`.
    #[inline]
    pub fn position(&self, i: usize) -> [f64; 3] {
        [self.x[i], self.y[i], self.z[i]]
    }

    /// Velocity of particle `i`.
    #[inline]
    pub fn velocity(&self, i: usize) -> [f64; 3] {
        [self.vx[i], self.vy[i], self.vz[i]]
    }

    /// Copy the given rows, in order, into a new collection with the same columns.
    pub fn select(&self, rows: &[usize]) -> ParticleArrays {
        let mut out = ParticleArrays::with_columns(
            self.creation_time.is_some(),
            self.particle_type.is_some(),
        );
        out.reserve(rows.len());
        for &r in rows {
            out.push(self.get(r));
        }
        out
    }

    /// Reserve room for `additional` more particles.
    pub fn reserve(&mut self, additional: usize) {
        self.x.reserve(additional);
        self.y.reserve(additional);
        self.z.reserve(additional);
        self.vx.reserve(additional);
        self.vy.reserve(additional);
        self.vz.reserve(additional);
        self.mass.reserve(additional);
        self.index.reserve(additional);
    }

    /// Sum of all particle masses.
    pub fn total_mass(&self) -> f64 {
        self.mass.iter().sum()
    }

    /// The dark-matter discriminator available in this collection.
    ///
    /// Creation time wins over particle type when both are present.
    pub fn dark_matter_rule(&self) -> DarkMatterRule {
        if self.creation_time.is_some() {
            DarkMatterRule::CreationTime
        } else if self.particle_type.is_some() {
            DarkMatterRule::ParticleType
        } else {
            DarkMatterRule::All
        }
    }

    /// Whether particle `i` is dark matter under [`Self::dark_matter_rule`].
    pub fn is_dark_matter(&self, i: usize) -> bool {
        match (&self.creation_time, &self.particle_type) {
            (Some(ct), _) => ct[i] < 0.0,
            (None, Some(pt)) => pt[i] == DARK_MATTER_TYPE,
            (None, None) => true,
        }
    }

    /// Rows of all dark-matter particles, in ascending order.
    pub fn dark_matter_rows(&self) -> Vec<usize> {
        (0..self.len()).filter(|&i| self.is_dark_matter(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_particle_arrays() {
        let pa = ParticleArrays::new();
        assert_eq!(pa.len(), 0);
        assert!(pa.is_empty());
        assert_eq!(pa.dark_matter_rule(), DarkMatterRule::All);
    }

    #[test]
    fn push_and_read_back() {
        let mut pa = ParticleArrays::new();
        pa.push(Particle::new([1.0, 2.0, 3.0], [0.5, 0.0, -0.5], 2.0, 7));
        assert_eq!(pa.len(), 1);
        assert_eq!(pa.position(0), [1.0, 2.0, 3.0]);
        assert_eq!(pa.velocity(0), [0.5, 0.0, -0.5]);
        assert_eq!(pa.mass[0], 2.0);
        assert_eq!(pa.index[0], 7);
        assert!(pa.creation_time.is_none());
    }

    #[test]
    fn creation_time_selects_dark_matter() {
        let mut pa = ParticleArrays::with_columns(true, false);
        let mut star = Particle::new([0.0; 3], [0.0; 3], 1.0, 0);
        star.creation_time = Some(12.5);
        pa.push(star);
        pa.push(Particle::new([0.0; 3], [0.0; 3], 1.0, 1));
        assert_eq!(pa.dark_matter_rule(), DarkMatterRule::CreationTime);
        assert_eq!(pa.dark_matter_rows(), vec![1]);
    }

    #[test]
    fn particle_type_selects_dark_matter() {
        let mut pa = ParticleArrays::with_columns(false, true);
        let mut gas = Particle::new([0.0; 3], [0.0; 3], 1.0, 0);
        gas.particle_type = Some(0);
        pa.push(gas);
        pa.push(Particle::new([0.0; 3], [0.0; 3], 1.0, 1));
        assert_eq!(pa.dark_matter_rows(), vec![1]);
    }

    #[test]
    fn select_keeps_columns_and_order() {
        let mut pa = ParticleArrays::with_columns(true, false);
        for i in 0..4 {
            pa.push(Particle::new([i as f64, 0.0, 0.0], [0.0; 3], 1.0, i));
        }
        let sub = pa.select(&[3, 1]);
        assert_eq!(sub.index, vec![3, 1]);
        assert_eq!(sub.creation_time.as_ref().map(|c| c.len()), Some(2));
    }
}
