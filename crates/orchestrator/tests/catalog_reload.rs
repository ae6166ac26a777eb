//! Dump a catalog, load it back and compare.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use approx::assert_relative_eq;
use halo_kernel::{Particle, ParticleArrays};
use halo_orchestrator::persist::{FieldData, INDEX_FIELD, MASS_FIELD, POSITION_FIELDS};
use halo_orchestrator::{
    find_halos, run_single, Center, Cosmology, FinderConfig, FinderKind, FinderMethod, HaloProperties,
    InMemorySource, LoadedCatalog, ParticleSource, RunMetrics, SoloComm, ThreadWorld, AABB, NOT_VIRIALIZED,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("halo-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Three dense clumps with creation times, so the dark-matter filter applies.
fn source() -> InMemorySource {
    let mut rng = ChaCha8Rng::seed_from_u64(17);
    let mut pa = ParticleArrays::with_columns(true, false);
    let mut index = 0;
    for (center, n) in [([0.2, 0.5, 0.5], 150), ([0.505, 0.3, 0.7], 120), ([0.8, 0.8, 0.2], 90)] {
        for _ in 0..n {
            let mut p = [0.0; 3];
            for d in 0..3 {
                p[d] = center[d] + rng.gen_range(-0.02..0.02);
            }
            let v = [rng.gen_range(-50.0..50.0), rng.gen_range(-50.0..50.0), 20.0];
            let mut particle = Particle::new(p, v, 2.0e11, index);
            particle.creation_time = Some(-1.0);
            pa.push(particle);
            index += 1;
        }
    }
    // Stars: never clustered, never written.
    for _ in 0..40 {
        let p = [rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0)];
        let mut particle = Particle::new(p, [0.0; 3], 1.0e9, index);
        particle.creation_time = Some(0.5);
        pa.push(particle);
        index += 1;
    }
    InMemorySource::new(pa, AABB::new([0.0; 3], [1.0; 3]), true, Cosmology::default())
}

fn config() -> FinderConfig {
    FinderConfig {
        method: FinderMethod::Fof,
        link: -0.03,
        resize: false,
        ..FinderConfig::default()
    }
}

#[test]
fn single_worker_dump_reloads() {
    let dir = scratch_dir("single");
    let base = dir.join("fof").display().to_string();
    let mut catalog = run_single(&config(), &source()).unwrap().catalog;
    assert_eq!(catalog.len(), 3);
    catalog.dump(&SoloComm, &base).unwrap();

    let header = std::fs::read_to_string(format!("{base}.out")).unwrap();
    assert!(header.starts_with("# HALOS FOUND WITH FOF\n"));
    let index = std::fs::read_to_string(format!("{base}.txt")).unwrap();
    assert_eq!(index.lines().next().unwrap(), "Halo00000000 fof.parts");

    let mut ctx = catalog.ctx;
    ctx.kind = FinderKind::Hop;
    let mut loaded = LoadedCatalog::load(&base, ctx).unwrap();
    assert_eq!(loaded.ctx.kind, FinderKind::Fof);
    assert_eq!(loaded.name, "FOF");
    assert_eq!(loaded.len(), catalog.len());

    for id in 0..catalog.len() {
        let fresh = catalog.local(id).unwrap();
        let halo = loaded.get(id).unwrap();
        assert_eq!(halo.size().unwrap(), fresh.size().unwrap());
        assert_relative_eq!(halo.total_mass().unwrap(), fresh.total_mass().unwrap(), max_relative = 1e-9);
        assert_eq!(halo.maximum_density(), NOT_VIRIALIZED);

        let masses = halo.field(MASS_FIELD).unwrap().and_then(FieldData::as_float).unwrap();
        let recomputed: f64 = masses.iter().sum();
        assert_relative_eq!(recomputed, fresh.total_mass().unwrap(), max_relative = 1e-9);
        let indices = halo.field(INDEX_FIELD).unwrap().and_then(FieldData::as_int).unwrap();
        assert_eq!(indices.len() as u64, fresh.size().unwrap());
        assert!(halo.field("particle_metallicity").unwrap().is_none());

        let com = fresh.center_of_mass().unwrap();
        for (d, c) in halo.center_of_mass().unwrap().iter().enumerate() {
            assert_relative_eq!(*c, com[d], max_relative = 1e-8);
        }
        let r = halo.maximum_radius(Center::MaxDensity).unwrap();
        assert!(r > 0.0 && r < 0.1);
    }

    // Virial quantities from reloaded particles match the live catalog.
    let live = catalog.local(0).unwrap().virial_info(40).unwrap().clone();
    let halo = loaded.get_mut(0).unwrap();
    let reloaded = halo.virial_info(40).unwrap().clone();
    assert_eq!(reloaded.mass_bins.len(), 41);
    assert_relative_eq!(
        *reloaded.mass_bins.last().unwrap(),
        *live.mass_bins.last().unwrap(),
        max_relative = 1e-9
    );
    let n = loaded.nearest_neighbors_3d(0, 3, 0.6).unwrap();
    assert_eq!(n[0], (0.0, 0));

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn distributed_dump_lists_every_contributing_file() {
    let dir = scratch_dir("distributed");
    let base = dir.join("hop").display().to_string();
    let source: Arc<dyn ParticleSource> = Arc::new(source());

    let handles: Vec<_> = ThreadWorld::create(2)
        .into_iter()
        .map(|comm| {
            let source = Arc::clone(&source);
            let base = base.clone();
            thread::spawn(move || {
                let mut metrics = RunMetrics::new();
                let mut catalog = find_halos(&comm, source.as_ref(), &config(), &mut metrics).unwrap();
                catalog.dump(&comm, &base).unwrap();
                catalog
            })
        })
        .collect();
    let catalogs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(dir.join("hop.0000.parts").exists());
    assert!(dir.join("hop.0001.parts").exists());

    let loaded = LoadedCatalog::load(&base, catalogs[0].ctx).unwrap();
    assert_eq!(loaded.len(), 3);
    for (id, h) in catalogs[0].iter().enumerate() {
        let halo = loaded.get(id).unwrap();
        assert_eq!(halo.files().len(), h.tasks.len());
        let x = halo.field(POSITION_FIELDS[0]).unwrap().unwrap();
        assert_eq!(x.len() as u64, h.summary.size.unwrap());
        let particles = halo.particles().unwrap().unwrap();
        assert!(particles.creation_time.is_some());
        assert_relative_eq!(particles.total_mass(), halo.total_mass().unwrap(), max_relative = 1e-9);
    }
    // The clump at x = 0.505 crosses the cut between the two workers.
    assert!(catalogs[0].iter().any(|h| h.tasks == vec![0, 1]));

    std::fs::remove_dir_all(&dir).ok();
}
