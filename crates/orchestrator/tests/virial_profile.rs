//! Property tests for the radial mass profile.

use halo_kernel::{Particle, ParticleArrays};
use halo_orchestrator::properties::{radial_profile, Local};
use halo_orchestrator::{Cosmology, FinderKind, PropertyContext, AABB};
use proptest::prelude::*;

fn ctx(periodic: bool) -> PropertyContext {
    PropertyContext {
        domain: AABB::new([0.0; 3], [1.0; 3]),
        periodic,
        cosmology: Cosmology::default(),
        kind: FinderKind::Hop,
        virial: Default::default(),
    }
}

fn offsets() -> impl Strategy<Value = Vec<([f64; 3], f64)>> {
    prop::collection::vec(
        (
            [-0.2f64..0.2, -0.2f64..0.2, -0.2f64..0.2],
            1.0e8f64..1.0e12,
        ),
        1..80,
    )
}

proptest! {
    #[test]
    fn enclosed_mass_never_decreases(
        members in offsets(),
        center in [0.0f64..1.0, 0.0f64..1.0, 0.0f64..1.0],
        bins in 1usize..120,
        periodic in any::<bool>(),
    ) {
        let mut pa = ParticleArrays::new();
        for (i, (d, m)) in members.iter().enumerate() {
            let p = [center[0] + d[0], center[1] + d[1], center[2] + d[2]];
            pa.push(Particle::new(p, [0.0; 3], *m, i as i64));
        }
        let rows: Vec<usize> = (0..pa.len()).collect();
        let profile = radial_profile(&pa, &rows, center, &ctx(periodic), bins, &Local).unwrap();

        prop_assert_eq!(profile.radial_bins.len(), bins + 1);
        prop_assert_eq!(profile.mass_bins.len(), bins + 1);
        prop_assert!(profile.radial_bins.windows(2).all(|w| w[1] >= w[0]));
        prop_assert!(profile.mass_bins.windows(2).all(|w| w[1] >= w[0]));

        let total: f64 = pa.mass.iter().sum();
        let enclosed = *profile.mass_bins.last().unwrap();
        prop_assert!((enclosed - total).abs() <= 1e-9 * total);
    }
}
