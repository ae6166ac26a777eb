//! Validation: distributed runs against single-worker runs.
//!
//! These tests split fixed synthetic particle sets over 1, 2 and 4 workers
//! and check that:
//! - every worker ends with the same catalog, identical in count, masses and
//!   membership to the single-worker catalog
//! - a worker with an empty partition still takes part in every reduction
//! - properties reduced across workers match the single-worker values
//! - a group straddling the periodic boundary is found whole, with its center
//!   of mass near the boundary
//! - a halo longer than the ghost padding is still one halo
//! - a particle index repeated on two distant workers is fatal

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use approx::assert_relative_eq;
use halo_kernel::{Particle, ParticleArrays};
use halo_orchestrator::{
    aggregate_partials, find_halos, run_distributed, run_single, Collective, Cosmology, FinderConfig, FinderMethod,
    HaloCatalog, HaloError, HaloProperties, InMemorySource, ParticleSource, RunMetrics, ThreadWorld, VirialConfig, AABB,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Compact cubes of particles; the first straddles the x = 0 face and the
/// second the x = 0.5 cut.
const BLOB_CENTERS: [[f64; 3]; 5] = [
    [0.995, 0.30, 0.30],
    [0.49, 0.70, 0.60],
    [0.25, 0.25, 0.80],
    [0.75, 0.20, 0.15],
    [0.70, 0.80, 0.85],
];
const BLOB_SIZES: [usize; 5] = [120, 100, 90, 80, 70];
const BLOB_HALF_WIDTH: f64 = 0.03;

fn blob_particles(centers: &[[f64; 3]], sizes: &[usize], seed: u64) -> ParticleArrays {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut pa = ParticleArrays::new();
    let mut index = 0i64;
    for (b, (center, &n)) in centers.iter().zip(sizes).enumerate() {
        let drift = [10.0 * b as f64, -5.0, 2.0 * b as f64];
        for _ in 0..n {
            let mut p = [0.0; 3];
            let mut v = [0.0; 3];
            for d in 0..3 {
                p[d] = (center[d] + rng.gen_range(-BLOB_HALF_WIDTH..BLOB_HALF_WIDTH)).rem_euclid(1.0);
                v[d] = drift[d] + rng.gen_range(-1.0..1.0);
            }
            let mass = 1.0e10 * rng.gen_range(0.5..1.5);
            pa.push(Particle::new(p, v, mass, index));
            index += 1;
        }
    }
    pa
}

fn unit_box(pa: ParticleArrays) -> InMemorySource {
    InMemorySource::new(pa, AABB::new([0.0; 3], [1.0; 3]), true, Cosmology::default())
}

fn fof_config() -> FinderConfig {
    FinderConfig {
        method: FinderMethod::Fof,
        link: -0.04,
        fof_min_members: 10,
        fancy_padding: false,
        resize: false,
        padding: 0.15,
        ..FinderConfig::default()
    }
}

/// `(size, mass, key)` per halo, plus the particle indices of each halo
/// gathered over every worker.
fn fingerprint(catalogs: &[&HaloCatalog]) -> (Vec<(u64, f64, i64)>, Vec<BTreeSet<i64>>) {
    let first = catalogs[0];
    let rows = first
        .iter()
        .map(|h| (h.summary.size.unwrap(), h.summary.total_mass.unwrap(), h.key))
        .collect();
    let mut members = vec![BTreeSet::new(); first.len()];
    for c in catalogs {
        for h in c.iter() {
            for &row in &h.members {
                assert!(members[h.id].insert(c.particles.index[row]), "particle held twice");
            }
        }
    }
    (rows, members)
}

/// A thin line of particles along x through the middle of the box, spaced
/// `spacing`, over a uniform background.
fn filament_particles(spacing: f64, background: usize, seed: u64) -> (ParticleArrays, usize) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut pa = ParticleArrays::new();
    let mut index = 0i64;
    let mut x = 0.10;
    while x < 0.90 + 1e-9 {
        pa.push(Particle::new([x, 0.5, 0.5], [1.0, 0.0, 0.0], 1.0e10, index));
        index += 1;
        x += spacing;
    }
    let length = pa.len();
    for _ in 0..background {
        let p = [rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0)];
        pa.push(Particle::new(p, [0.0; 3], 1.0e10, index));
        index += 1;
    }
    (pa, length)
}

fn assert_same_as_single(config: &FinderConfig, source: &Arc<dyn ParticleSource>) -> Vec<(u64, f64, i64)> {
    let single = run_single(config, source.as_ref()).unwrap();
    let (reference, reference_members) = fingerprint(&[&single.catalog]);
    for workers in [2, 4] {
        let results = run_distributed(config, Arc::clone(source), workers).unwrap();
        let catalogs: Vec<&HaloCatalog> = results.iter().map(|r| &r.catalog).collect();
        let (rows, members) = fingerprint(&catalogs);
        assert_eq!(rows.len(), reference.len(), "{workers} workers");
        for (a, b) in rows.iter().zip(&reference) {
            assert_eq!((a.0, a.2), (b.0, b.2), "{workers} workers");
        }
        assert_eq!(members, reference_members, "{workers} workers");
    }
    reference
}

#[test]
fn filament_longer_than_padding_is_one_halo() {
    let (pa, length) = filament_particles(0.02, 2000, 17);
    let source: Arc<dyn ParticleSource> = Arc::new(unit_box(pa));
    let config = FinderConfig {
        method: FinderMethod::Fof,
        link: -0.025,
        fof_min_members: 10,
        ..FinderConfig::default()
    };
    assert!(config.fancy_padding);

    let reference = assert_same_as_single(&config, &source);
    let filament = reference.iter().find(|r| r.2 == 0).unwrap();
    assert!(filament.0 >= length as u64);
}

#[test]
fn straddling_blobs_agree_with_fancy_padding() {
    let source: Arc<dyn ParticleSource> = Arc::new(unit_box(blob_particles(&BLOB_CENTERS, &BLOB_SIZES, 3)));
    let config = FinderConfig {
        fancy_padding: true,
        padding: 0.0,
        ..fof_config()
    };
    let reference = assert_same_as_single(&config, &source);
    let sizes: Vec<u64> = reference.iter().map(|r| r.0).collect();
    assert_eq!(sizes, vec![120, 100, 90, 80, 70]);
}

#[test]
fn halo_set_is_independent_of_worker_count() {
    let source: Arc<dyn ParticleSource> = Arc::new(unit_box(blob_particles(&BLOB_CENTERS, &BLOB_SIZES, 3)));
    let config = fof_config();

    let single = run_single(&config, source.as_ref()).unwrap();
    let (reference, reference_members) = fingerprint(&[&single.catalog]);
    assert_eq!(reference.len(), BLOB_CENTERS.len());
    let sizes: Vec<u64> = reference.iter().map(|r| r.0).collect();
    assert_eq!(sizes, vec![120, 100, 90, 80, 70]);

    for workers in [2, 4] {
        let results = run_distributed(&config, Arc::clone(&source), workers).unwrap();
        assert_eq!(results.len(), workers);
        let catalogs: Vec<&HaloCatalog> = results.iter().map(|r| &r.catalog).collect();
        let (rows, members) = fingerprint(&catalogs);
        assert_eq!(rows.len(), reference.len(), "{workers} workers");
        for (a, b) in rows.iter().zip(&reference) {
            assert_eq!(a.0, b.0);
            assert_eq!(a.2, b.2);
            assert_relative_eq!(a.1, b.1, max_relative = 1e-12);
        }
        assert_eq!(members, reference_members);

        // Every worker agrees on the summaries.
        for c in &catalogs[1..] {
            for (h, r) in c.iter().zip(catalogs[0].iter()) {
                assert_eq!(h.summary, r.summary);
                assert_eq!(h.tasks, r.tasks);
            }
        }
        // The straddling blob is spread over more than one worker.
        let straddler = catalogs[0].iter().find(|h| h.summary.size == Some(100)).unwrap();
        assert!(straddler.tasks.len() > 1);
    }
}

#[test]
fn configured_virial_settings_reach_every_halo() {
    let source = unit_box(blob_particles(&BLOB_CENTERS, &BLOB_SIZES, 5));
    let mut config = fof_config();
    config.virial = VirialConfig {
        overdensity: 120.0,
        bins: 40,
    };
    let mut catalog = run_single(&config, &source).unwrap().catalog;
    assert_eq!(catalog.ctx.virial, config.virial);
    let mut h = catalog.local(0).unwrap();
    let mass = h.configured_virial_mass().unwrap();
    assert_eq!(h.virial_info(40).unwrap().bins, 40);
    assert_eq!(mass, h.virial_mass(120.0, 40).unwrap());
}

#[test]
fn boundary_group_center_of_mass_wraps() {
    let source = unit_box(blob_particles(&BLOB_CENTERS, &BLOB_SIZES, 5));
    let result = run_single(&fof_config(), &source).unwrap();
    let h = result
        .catalog
        .iter()
        .find(|h| h.summary.size == Some(120))
        .unwrap();
    let com = h.summary.center_of_mass.unwrap();
    assert!(com[0] > 0.95 || com[0] < 0.05, "center of mass x = {}", com[0]);
    assert!((0.0..1.0).contains(&com[0]));
    assert_relative_eq!(com[1], 0.30, epsilon = 0.01);
}

#[test]
fn empty_partition_contributes_nothing() {
    // Everything sits in the x < 0.5, y < 0.5 quadrant.
    let centers = [[0.20, 0.20, 0.3], [0.35, 0.32, 0.7], [0.12, 0.40, 0.5]];
    let sizes = [60, 50, 40];
    let source: Arc<dyn ParticleSource> = Arc::new(unit_box(blob_particles(&centers, &sizes, 9)));
    let config = fof_config();

    let single = run_single(&config, source.as_ref()).unwrap();
    let results = run_distributed(&config, source, 4).unwrap();

    let empty: Vec<_> = results.iter().filter(|r| r.catalog.particles.is_empty()).collect();
    assert!(!empty.is_empty());
    for r in &empty {
        assert_eq!(r.metrics.counter("kept_groups"), 0);
        assert!(r.catalog.local_ids().is_empty());
    }
    for r in &results {
        assert_eq!(r.catalog.len(), single.catalog.len());
        for (h, s) in r.catalog.iter().zip(single.catalog.iter()) {
            assert_eq!(h.summary.size, s.summary.size);
            assert_relative_eq!(h.summary.total_mass.unwrap(), s.summary.total_mass.unwrap(), max_relative = 1e-12);
        }
    }
}

#[test]
fn reduced_properties_match_single_worker() {
    let pa = blob_particles(&BLOB_CENTERS, &BLOB_SIZES, 21);
    let source: Arc<dyn ParticleSource> = Arc::new(unit_box(pa));
    let config = fof_config();
    let mut single = run_single(&config, source.as_ref()).unwrap().catalog;

    // Recompute properties of halo 1 collectively, with the stored summary
    // cleared so every value is reduced from particles.
    let handles: Vec<_> = ThreadWorld::create(2)
        .into_iter()
        .map(|comm| {
            let source = Arc::clone(&source);
            let config = config.clone();
            thread::spawn(move || {
                let mut metrics = RunMetrics::new();
                let mut catalog = find_halos(&comm, source.as_ref(), &config, &mut metrics).unwrap();
                catalog.halos[1].summary = Default::default();
                let local_momentum = {
                    let h = &catalog.halos[1];
                    let mut p = vec![0.0; 3];
                    for &i in &h.members {
                        for (d, v) in catalog.particles.velocity(i).iter().enumerate() {
                            p[d] += catalog.particles.mass[i] * v;
                        }
                    }
                    p
                };
                let mut h = catalog.distributed(1, &comm).unwrap();
                let out = (
                    h.total_mass().unwrap(),
                    h.bulk_velocity().unwrap(),
                    h.rms_velocity().unwrap(),
                    h.center_of_mass().unwrap(),
                    h.virial_info(50).unwrap().clone(),
                );
                comm.barrier().unwrap();
                (out, local_momentum)
            })
        })
        .collect();
    let outputs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let reference = single.local(1).unwrap();
    let mass = reference.total_mass().unwrap();
    let bulk = reference.bulk_velocity().unwrap();
    let rms = reference.rms_velocity().unwrap();
    let com = reference.center_of_mass().unwrap();

    let ((_, _, _, _, first_profile), _) = &outputs[0];
    for ((m, bv, rv, c, profile), _) in &outputs {
        assert_relative_eq!(*m, mass, max_relative = 1e-12);
        for d in 0..3 {
            assert_relative_eq!(bv[d], bulk[d], max_relative = 1e-9, epsilon = 1e-12);
            assert_relative_eq!(c[d], com[d], epsilon = 1e-12);
        }
        assert_relative_eq!(*rv, rms, max_relative = 1e-9);
        assert!(profile.global);
        assert_relative_eq!(*profile.mass_bins.last().unwrap(), mass, max_relative = 1e-12);
        assert_eq!(profile.radial_bins, first_profile.radial_bins);
    }

    // Mass-weighted velocity summed over workers reproduces the bulk velocity.
    let partials: Vec<Vec<f64>> = outputs.iter().map(|(_, p)| p.clone()).collect();
    let total = aggregate_partials(&partials);
    for d in 0..3 {
        assert_relative_eq!(total[d] / mass, bulk[d], max_relative = 1e-9, epsilon = 1e-12);
    }
}

#[test]
fn too_few_particles_is_fatal_everywhere() {
    let source: Arc<dyn ParticleSource> = Arc::new(unit_box(blob_particles(&[[0.5; 3]], &[20], 1)));
    let config = FinderConfig::default();
    assert!(matches!(
        run_single(&config, source.as_ref()),
        Err(HaloError::InsufficientParticles { found: 20, required: 65 })
    ));
    assert!(matches!(
        run_distributed(&config, source, 2),
        Err(HaloError::InsufficientParticles { found: 20, .. })
    ));
}

#[test]
fn duplicate_indices_abort_every_worker() {
    let mut pa = blob_particles(&BLOB_CENTERS, &BLOB_SIZES, 4);
    let last = pa.len() - 1;
    pa.index[last] = pa.index[0];
    let source: Arc<dyn ParticleSource> = Arc::new(unit_box(pa));
    let err = run_distributed(&fof_config(), source, 2).unwrap_err();
    assert!(matches!(
        err,
        HaloError::DuplicateParticleIndex { .. } | HaloError::CollectiveAbort(_)
    ));
}

#[test]
fn duplicate_indices_far_apart_abort_every_worker() {
    // Blob 2 sits near x = 0.25 and blob 3 near x = 0.75, well outside each
    // other's padding.
    let mut pa = blob_particles(&BLOB_CENTERS, &BLOB_SIZES, 4);
    let in_blob_3: usize = BLOB_SIZES[..3].iter().sum();
    let in_blob_2: usize = BLOB_SIZES[..2].iter().sum();
    pa.index[in_blob_3] = pa.index[in_blob_2];
    let source: Arc<dyn ParticleSource> = Arc::new(unit_box(pa));
    assert!(matches!(
        run_single(&fof_config(), source.as_ref()),
        Err(HaloError::DuplicateParticleIndex { .. })
    ));
    for workers in [2, 4] {
        let err = run_distributed(&fof_config(), Arc::clone(&source), workers).unwrap_err();
        assert!(matches!(
            err,
            HaloError::DuplicateParticleIndex { .. } | HaloError::CollectiveAbort(_)
        ));
    }
}

#[test]
fn hop_finds_each_clump_on_one_and_two_workers() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut pa = ParticleArrays::new();
    let mut index = 0;
    for center in [[0.3, 0.3, 0.3], [0.7, 0.7, 0.7]] {
        let mut placed = 0;
        while placed < 300 {
            let d: [f64; 3] = [rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)];
            if d[0] * d[0] + d[1] * d[1] + d[2] * d[2] > 1.0 {
                continue;
            }
            let p = [center[0] + 0.03 * d[0], center[1] + 0.03 * d[1], center[2] + 0.03 * d[2]];
            pa.push(Particle::new(p, [0.0; 3], 1.0, index));
            index += 1;
            placed += 1;
        }
    }
    for _ in 0..2000 {
        let p = [rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0)];
        pa.push(Particle::new(p, [0.0; 3], 1.0, index));
        index += 1;
    }
    let source: Arc<dyn ParticleSource> = Arc::new(unit_box(pa));
    let config = FinderConfig {
        threshold: 80.0,
        ..FinderConfig::default()
    };

    let single = run_single(&config, source.as_ref()).unwrap().catalog;
    assert_eq!(single.len(), 2);
    assert_eq!(single.name, "parallelHOP");
    for h in single.iter() {
        assert!((280..=450).contains(&h.summary.size.unwrap()));
        assert!(h.peak.density > config.threshold);
    }

    let results = run_distributed(&config, source, 2).unwrap();
    for r in &results {
        assert_eq!(r.catalog.len(), 2);
        for (h, s) in r.catalog.iter().zip(single.iter()) {
            assert_eq!(h.summary.size, s.summary.size);
            assert_eq!(h.key, s.key);
        }
    }
}
