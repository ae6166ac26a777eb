//! Halo records shared by the merger, the property engine and the catalog.

use serde::{Deserialize, Serialize};

use halo_kernel::Periodicity;

use crate::config::VirialConfig;
use crate::source::{Cosmology, AABB};

/// Sentinel for "not virialized" and for quantities a finder does not define.
pub const NOT_VIRIALIZED: f64 = -1.0;

/// Which algorithm produced a catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinderKind {
    /// Density-linking HOP
    Hop,
    /// Friends-of-friends
    Fof,
}

impl FinderKind {
    /// Name written into catalog headers.
    pub fn name(&self) -> &'static str {
        match self {
            FinderKind::Hop => "parallelHOP",
            FinderKind::Fof => "FOF",
        }
    }

    /// Inverse of [`name`](Self::name); also accepts the bare algorithm name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "parallelHOP" | "HOP" => Some(FinderKind::Hop),
            "FOF" => Some(FinderKind::Fof),
            _ => None,
        }
    }
}

/// Density maximum of a group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakRecord {
    /// Peak density, or -1 for FOF
    pub density: f64,
    /// Where the peak sits (FOF: the group's anchor particle)
    pub position: [f64; 3],
}

/// Summary statistics known without touching particle data.
///
/// Filled by the merge step for every halo on every worker, or read back
/// from a dumped catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HaloSummary {
    /// Global particle count
    pub size: Option<u64>,
    /// Total mass
    pub total_mass: Option<f64>,
    /// Periodic center of mass
    pub center_of_mass: Option<[f64; 3]>,
    /// Mass-weighted mean velocity
    pub bulk_velocity: Option<[f64; 3]>,
    /// RMS velocity about the bulk velocity
    pub rms_velocity: Option<f64>,
    /// Largest member distance from the center of mass
    pub maximum_radius: Option<f64>,
}

/// Cumulative radial mass profile of a halo.
#[derive(Debug, Clone, PartialEq)]
pub struct VirialProfile {
    /// Bin count the profile was built with
    pub bins: usize,
    /// Whether the profile was reduced over all workers
    pub global: bool,
    /// `bins + 1` logarithmic radii
    pub radial_bins: Vec<f64>,
    /// Enclosed mass at each radius
    pub mass_bins: Vec<f64>,
    /// Enclosed density over the critical density at each radius
    pub overdensity: Vec<f64>,
}

impl VirialProfile {
    /// Outermost bin whose overdensity exceeds `threshold`.
    pub fn virial_bin(&self, threshold: f64) -> Option<usize> {
        self.overdensity.iter().rposition(|&o| o > threshold)
    }
}

/// Geometry and cosmology needed to evaluate halo properties.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PropertyContext {
    /// Simulation domain
    pub domain: AABB,
    /// Whether the domain wraps
    pub periodic: bool,
    /// Cosmological parameters
    pub cosmology: Cosmology,
    /// Finder that produced the halos
    pub kind: FinderKind,
    /// Overdensity and bin count used when a virial query names neither
    #[serde(default)]
    pub virial: VirialConfig,
}

impl PropertyContext {
    /// Periodicity in domain units.
    pub fn periodicity(&self) -> Periodicity {
        if self.periodic {
            Periodicity::periodic(self.domain.width())
        } else {
            Periodicity::open()
        }
    }

    /// Fold a point back into the domain on periodic axes.
    pub fn wrap(&self, p: [f64; 3]) -> [f64; 3] {
        self.periodicity().wrap(p, self.domain.min)
    }
}

/// One globally numbered halo as seen by one worker.
///
/// `members` is empty on workers that own none of the halo's particles; such
/// entries still take part in every collective property computation.
#[derive(Debug, Clone)]
pub struct Halo {
    /// Global id, `0..N`
    pub id: usize,
    /// Identity independent of worker count (HOP: peak particle index,
    /// FOF: smallest member index)
    pub key: i64,
    /// Rows of this worker's particle arrays belonging to the halo
    pub members: Vec<usize>,
    /// Density peak
    pub peak: PeakRecord,
    /// Worker that kept the halo
    pub owner: usize,
    /// Workers holding at least one member, ascending
    pub tasks: Vec<usize>,
    /// Precomputed statistics
    pub summary: HaloSummary,
    pub(crate) virial: Option<VirialProfile>,
}

impl Halo {
    /// A halo with no precomputed statistics.
    pub fn new(id: usize, key: i64, members: Vec<usize>, peak: PeakRecord, owner: usize) -> Self {
        Self {
            id,
            key,
            members,
            peak,
            owner,
            tasks: Vec::new(),
            summary: HaloSummary::default(),
            virial: None,
        }
    }

    /// Whether this worker holds any of the halo's particles.
    pub fn is_local(&self) -> bool {
        !self.members.is_empty()
    }

    /// Whether members live on more than one worker.
    pub fn is_distributed(&self) -> bool {
        self.tasks.len() > 1
    }

    /// Drop any cached virial profile.
    pub fn clear_virial(&mut self) {
        self.virial = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virial_bin_is_outermost_above_threshold() {
        let profile = VirialProfile {
            bins: 4,
            global: false,
            radial_bins: vec![0.1, 0.2, 0.3, 0.4, 0.5],
            mass_bins: vec![1.0, 2.0, 3.0, 4.0, 4.0],
            overdensity: vec![900.0, 150.0, 250.0, 120.0, 80.0],
        };
        assert_eq!(profile.virial_bin(200.0), Some(2));
        assert_eq!(profile.virial_bin(1000.0), None);
    }

    #[test]
    fn context_wraps_only_periodic_domains() {
        let mut ctx = PropertyContext {
            domain: AABB::new([0.0; 3], [1.0; 3]),
            periodic: true,
            cosmology: Cosmology::default(),
            kind: FinderKind::Hop,
            virial: VirialConfig::default(),
        };
        assert!((ctx.wrap([1.25, -0.25, 0.5])[0] - 0.25).abs() < 1e-12);
        ctx.periodic = false;
        assert_eq!(ctx.wrap([1.25, -0.25, 0.5]), [1.25, -0.25, 0.5]);
    }
}
