//! Reference test framework for halo finder validation
//!
//! Each reference test plants a known set of clumps in a uniform background,
//! runs the finder on one or more workers and checks that the catalog
//! recovers what was planted.

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use halo_kernel::{Particle, ParticleArrays, Periodicity};
use halo_orchestrator::{
    find_halos, run_distributed, run_single, Cosmology, FinderConfig, HaloCatalog, HaloProperties,
    InMemorySource, LoadedCatalog, ParticleSource, RunMetrics, ThreadWorld, AABB,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// A spherical clump of equal-mass particles
#[derive(Debug, Clone)]
pub struct Clump {
    /// Clump center in domain units
    pub center: [f64; 3],
    /// Number of particles
    pub count: usize,
    /// Radius of the uniform ball
    pub radius: f64,
    /// Mass of each particle (Msun)
    pub particle_mass: f64,
}

impl Clump {
    /// Total planted mass
    pub fn mass(&self) -> f64 {
        self.count as f64 * self.particle_mass
    }
}

/// Synthetic snapshot: clumps over a uniform background in the unit box
#[derive(Debug, Clone)]
pub struct Scenario {
    /// Planted clumps
    pub clumps: Vec<Clump>,
    /// Number of uniformly placed background particles
    pub background: usize,
    /// Mass of each background particle (Msun)
    pub background_mass: f64,
    /// Whether the unit box wraps
    pub periodic: bool,
    /// Random seed
    pub seed: u64,
}

impl Scenario {
    /// Unit box domain
    pub fn domain(&self) -> AABB {
        AABB::new([0.0; 3], [1.0; 3])
    }

    /// Generate the particles.  Clump particles come first, then background.
    pub fn particles(&self) -> ParticleArrays {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let total = self.clumps.iter().map(|c| c.count).sum::<usize>() + self.background;
        let mut pa = ParticleArrays::new();
        pa.reserve(total);

        let mut index = 0_i64;
        for clump in &self.clumps {
            let mut placed = 0;
            while placed < clump.count {
                let d: [f64; 3] = [rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)];
                if d[0] * d[0] + d[1] * d[1] + d[2] * d[2] > 1.0 {
                    continue;
                }
                let p = [
                    clump.center[0] + clump.radius * d[0],
                    clump.center[1] + clump.radius * d[1],
                    clump.center[2] + clump.radius * d[2],
                ];
                let v = [rng.gen_range(-10.0..10.0), rng.gen_range(-10.0..10.0), rng.gen_range(-10.0..10.0)];
                pa.push(Particle::new(p, v, clump.particle_mass, index));
                index += 1;
                placed += 1;
            }
        }
        for _ in 0..self.background {
            let p = [rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>()];
            pa.push(Particle::new(p, [0.0; 3], self.background_mass, index));
            index += 1;
        }
        pa
    }

    /// Build an in-memory particle source for the scenario
    pub fn source(&self) -> InMemorySource {
        InMemorySource::new(self.particles(), self.domain(), self.periodic, Cosmology::default())
    }

    fn periodicity(&self) -> Periodicity {
        if self.periodic {
            Periodicity::periodic(self.domain().width())
        } else {
            Periodicity::open()
        }
    }
}

/// Expected result criteria for a reference test
#[derive(Debug, Clone, Default)]
pub struct ExpectedResult {
    /// Exact number of halos
    pub halo_count: Option<usize>,
    /// Every clump matched by a halo of similar mass and position
    pub clump_recovery: Option<ClumpRecoveryCheck>,
    /// Same catalog from a single worker
    pub worker_agreement: bool,
    /// Dumped catalog reloads with the same halos
    pub round_trip: Option<RoundTripCheck>,
}

/// Check that each planted clump is found
#[derive(Debug, Clone)]
pub struct ClumpRecoveryCheck {
    /// Maximum relative mass error (0.0 to 1.0)
    pub max_mass_error: f64,
    /// Maximum center-of-mass offset in domain units
    pub max_center_offset: f64,
}

/// Check that a dump reloads faithfully
#[derive(Debug, Clone)]
pub struct RoundTripCheck {
    /// Maximum relative mass error between live and reloaded halos
    pub max_mass_error: f64,
}

/// Result of running a reference test
#[derive(Debug)]
pub struct TestResult {
    /// Test name
    pub name: String,
    /// Whether test passed
    pub passed: bool,
    /// Individual check results
    pub checks: Vec<CheckResult>,
    /// Number of halos found
    pub halos: usize,
    /// Number of workers used
    pub workers: usize,
    /// Stage timings and counters of worker 0
    pub metrics: RunMetrics,
}

/// Result of an individual validation check
#[derive(Debug)]
pub struct CheckResult {
    /// Check name
    pub name: String,
    /// Whether check passed
    pub passed: bool,
    /// Error message if failed
    pub message: Option<String>,
}

/// A reference test case
pub struct ReferenceTest {
    /// Test name
    pub name: String,
    /// Path to configuration file
    pub config_path: String,
    /// Synthetic input
    pub scenario: Scenario,
    /// Number of workers
    pub workers: usize,
    /// Expected results to validate
    pub expected: ExpectedResult,
}

impl ReferenceTest {
    /// Run the reference test and return results
    pub fn run(&self) -> Result<TestResult, String> {
        tracing::info!("Running reference test: {}", self.name);

        let config = FinderConfig::load(&self.config_path)?;
        let source: Arc<dyn ParticleSource> = Arc::new(self.scenario.source());
        tracing::info!(
            "Initialized: {} clumps, {} background particles, {} workers",
            self.scenario.clumps.len(),
            self.scenario.background,
            self.workers,
        );

        let mut results = run_distributed(&config, Arc::clone(&source), self.workers).map_err(|e| e.to_string())?;
        if results.is_empty() {
            return Err("No worker results".to_string());
        }
        let first = results.swap_remove(0);
        let catalog = first.catalog;

        let mut checks = Vec::new();

        if let Some(expected) = self.expected.halo_count {
            checks.push(validate_halo_count(&catalog, expected));
        }

        if let Some(ref recovery) = self.expected.clump_recovery {
            checks.push(validate_clump_recovery(&catalog, &self.scenario, recovery));
        }

        if self.expected.worker_agreement {
            let single = run_single(&config, source.as_ref()).map_err(|e| e.to_string())?;
            checks.push(validate_worker_agreement(&catalog, &single.catalog));
        }

        if let Some(ref round_trip) = self.expected.round_trip {
            let dir = std::env::temp_dir().join(format!(
                "reference-{}-{}",
                self.name.to_lowercase().replace(' ', "-"),
                std::process::id()
            ));
            checks.push(validate_round_trip(&config, &source, self.workers, &dir, round_trip));
            std::fs::remove_dir_all(&dir).ok();
        }

        let passed = checks.iter().all(|c| c.passed);
        Ok(TestResult {
            name: self.name.clone(),
            passed,
            checks,
            halos: catalog.len(),
            workers: self.workers,
            metrics: first.metrics,
        })
    }
}

/// Validate the number of halos
fn validate_halo_count(catalog: &HaloCatalog, expected: usize) -> CheckResult {
    let found = catalog.len();
    CheckResult {
        name: "Halo Count".to_string(),
        passed: found == expected,
        message: Some(format!("Expected: {}, Found: {}", expected, found)),
    }
}

/// Validate that every clump has a halo nearby with about the planted mass
fn validate_clump_recovery(catalog: &HaloCatalog, scenario: &Scenario, check: &ClumpRecoveryCheck) -> CheckResult {
    let periodicity = scenario.periodicity();
    let mut worst_mass = 0.0_f64;
    let mut worst_offset = 0.0_f64;
    let mut missing = Vec::new();

    for (c, clump) in scenario.clumps.iter().enumerate() {
        let nearest = catalog
            .iter()
            .filter_map(|h| Some((h.summary.center_of_mass?, h.summary.total_mass?)))
            .map(|(com, mass)| (periodicity.distance_sq(com, clump.center).sqrt(), mass))
            .min_by(|a, b| a.0.total_cmp(&b.0));
        let Some((offset, mass)) = nearest else {
            missing.push(c);
            continue;
        };
        if offset > check.max_center_offset {
            missing.push(c);
        }
        worst_offset = worst_offset.max(offset);
        worst_mass = worst_mass.max((mass - clump.mass()).abs() / clump.mass());
    }

    let passed = missing.is_empty() && worst_mass <= check.max_mass_error;
    let message = if passed {
        format!(
            "Max mass error: {:.2}%, Max offset: {:.5}",
            worst_mass * 100.0,
            worst_offset
        )
    } else {
        format!(
            "Unmatched clumps: {:?}, Max mass error: {:.2}% (limit: {:.2}%), Max offset: {:.5} (limit: {:.5})",
            missing,
            worst_mass * 100.0,
            check.max_mass_error * 100.0,
            worst_offset,
            check.max_center_offset
        )
    };
    CheckResult {
        name: "Clump Recovery".to_string(),
        passed,
        message: Some(message),
    }
}

/// Validate that the multi-worker catalog matches a single-worker run
fn validate_worker_agreement(catalog: &HaloCatalog, single: &HaloCatalog) -> CheckResult {
    if catalog.len() != single.len() {
        return CheckResult {
            name: "Worker Agreement".to_string(),
            passed: false,
            message: Some(format!("Halo count: {} vs single worker {}", catalog.len(), single.len())),
        };
    }

    let mut mismatched = Vec::new();
    for (h, s) in catalog.iter().zip(single.iter()) {
        let mass_ok = match (h.summary.total_mass, s.summary.total_mass) {
            (Some(a), Some(b)) => (a - b).abs() <= 1e-9 * b.abs().max(1.0),
            _ => false,
        };
        if h.key != s.key || h.summary.size != s.summary.size || !mass_ok {
            mismatched.push(h.id);
        }
    }

    if mismatched.is_empty() {
        CheckResult {
            name: "Worker Agreement".to_string(),
            passed: true,
            message: Some(format!("{} halos identical", catalog.len())),
        }
    } else {
        CheckResult {
            name: "Worker Agreement".to_string(),
            passed: false,
            message: Some(format!("Halos differ from single worker: {:?}", mismatched)),
        }
    }
}

/// Dump the catalog from every worker, reload it and compare
fn validate_round_trip(
    config: &FinderConfig,
    source: &Arc<dyn ParticleSource>,
    workers: usize,
    dir: &Path,
    check: &RoundTripCheck,
) -> CheckResult {
    let fail = |message: String| CheckResult {
        name: "Round Trip".to_string(),
        passed: false,
        message: Some(message),
    };

    let catalog = match dump_catalog(config, source, workers, dir) {
        Ok(c) => c,
        Err(e) => return fail(e),
    };
    let basename = dir.join(&config.name).display().to_string();
    let loaded = match LoadedCatalog::load(&basename, catalog.ctx) {
        Ok(l) => l,
        Err(e) => return fail(e.to_string()),
    };
    if loaded.len() != catalog.len() {
        return fail(format!("Reloaded {} halos, dumped {}", loaded.len(), catalog.len()));
    }

    let mut worst = 0.0_f64;
    for (id, h) in catalog.iter().enumerate() {
        let Some(halo) = loaded.get(id) else {
            return fail(format!("Halo {} missing after reload", id));
        };
        if halo.files().len() != h.tasks.len() {
            return fail(format!(
                "Halo {} listed in {} files, written by {} workers",
                id,
                halo.files().len(),
                h.tasks.len()
            ));
        }
        let particles = match halo.particles() {
            Ok(Some(p)) => p,
            Ok(None) => return fail(format!("Halo {} has no particle fields", id)),
            Err(e) => return fail(e.to_string()),
        };
        let (Some(size), Ok(mass)) = (h.summary.size, halo.total_mass()) else {
            return fail(format!("Halo {} has no summary", id));
        };
        if particles.len() as u64 != size {
            return fail(format!("Halo {}: {} particles reloaded, size {}", id, particles.len(), size));
        }
        worst = worst.max((particles.total_mass() - mass).abs() / mass);
    }

    CheckResult {
        name: "Round Trip".to_string(),
        passed: worst <= check.max_mass_error,
        message: Some(format!(
            "{} halos reloaded, max mass error: {:.2e} (limit: {:.2e})",
            loaded.len(),
            worst,
            check.max_mass_error
        )),
    }
}

/// Run the finder on `workers` threads and have every worker dump into `dir`.
/// Returns worker 0's catalog.
fn dump_catalog(
    config: &FinderConfig,
    source: &Arc<dyn ParticleSource>,
    workers: usize,
    dir: &Path,
) -> Result<HaloCatalog, String> {
    std::fs::create_dir_all(dir).map_err(|e| format!("Failed to create {}: {}", dir.display(), e))?;
    let basename: PathBuf = dir.join(&config.name);
    let basename = basename.display().to_string();

    let handles: Vec<_> = ThreadWorld::create(workers.max(1))
        .into_iter()
        .map(|comm| {
            let source = Arc::clone(source);
            let config = config.clone();
            let basename = basename.clone();
            thread::spawn(move || -> Result<HaloCatalog, String> {
                let mut metrics = RunMetrics::new();
                let mut catalog =
                    find_halos(&comm, source.as_ref(), &config, &mut metrics).map_err(|e| e.to_string())?;
                catalog.dump(&comm, &basename).map_err(|e| e.to_string())?;
                Ok(catalog)
            })
        })
        .collect();

    let mut catalogs = Vec::new();
    for (rank, handle) in handles.into_iter().enumerate() {
        let catalog = handle.join().map_err(|_| format!("Worker {} panicked", rank))??;
        catalogs.push(catalog);
    }
    catalogs.into_iter().next().ok_or_else(|| "No worker results".to_string())
}

impl TestResult {
    /// Print a summary of the test result
    pub fn print_summary(&self) {
        println!("\n{}", "=".repeat(80));
        println!("Test: {}", self.name);
        println!("{}", "=".repeat(80));
        println!("Status: {}", if self.passed { "PASSED" } else { "FAILED" });
        println!("Workers: {}", self.workers);
        println!("Halos: {}", self.halos);
        println!("\nStage Timings (worker 0):");
        for (stage, elapsed) in &self.metrics.timings {
            println!("  {}: {:.3} ms", stage, elapsed.as_secs_f64() * 1e3);
        }
        println!("\nValidation Checks:");
        for check in &self.checks {
            let status = if check.passed { "PASS" } else { "FAIL" };
            print!("  [{}] {}", status, check.name);
            if let Some(ref msg) = check.message {
                print!(" - {}", msg);
            }
            println!();
        }
        println!("{}", "=".repeat(80));
    }
}

/// Resolve a path relative to the workspace root
pub fn project_path(relative: &str) -> String {
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .parent()
        .unwrap_or(manifest_dir)
        .join(relative)
        .to_string_lossy()
        .to_string()
}

/// Four FOF clumps, one straddling the worker cut and one wrapping the box
pub fn fof_scenario() -> Scenario {
    let clump = |center: [f64; 3], count: usize| Clump {
        center,
        count,
        radius: 0.025,
        particle_mass: 1.0e10,
    };
    Scenario {
        clumps: vec![
            clump([0.25, 0.25, 0.25], 200),
            clump([0.75, 0.3, 0.6], 160),
            clump([0.49, 0.7, 0.4], 140),
            clump([0.99, 0.6, 0.8], 120),
        ],
        background: 300,
        background_mass: 1.0e10,
        periodic: true,
        seed: 2024,
    }
}

/// Two HOP clumps in a dense background
pub fn hop_scenario() -> Scenario {
    let clump = |center: [f64; 3]| Clump {
        center,
        count: 300,
        radius: 0.03,
        particle_mass: 1.0,
    };
    Scenario {
        clumps: vec![clump([0.3, 0.3, 0.3]), clump([0.7, 0.7, 0.7])],
        background: 2000,
        background_mass: 1.0,
        periodic: true,
        seed: 7,
    }
}

/// FOF clump recovery on two workers
pub fn fof_recovery_test() -> ReferenceTest {
    ReferenceTest {
        name: "FOF Clump Recovery".to_string(),
        config_path: project_path("configs/fof-clumps.json"),
        scenario: fof_scenario(),
        workers: 2,
        expected: ExpectedResult {
            halo_count: Some(4),
            clump_recovery: Some(ClumpRecoveryCheck {
                max_mass_error: 0.05,
                max_center_offset: 0.005,
            }),
            worker_agreement: true,
            round_trip: None,
        },
    }
}

/// HOP clump recovery on two workers
pub fn hop_recovery_test() -> ReferenceTest {
    ReferenceTest {
        name: "HOP Clump Recovery".to_string(),
        config_path: project_path("configs/hop-clumps.json"),
        scenario: hop_scenario(),
        workers: 2,
        expected: ExpectedResult {
            halo_count: Some(2),
            // HOP groups pick up background particles above the threshold
            clump_recovery: Some(ClumpRecoveryCheck {
                max_mass_error: 0.5,
                max_center_offset: 0.01,
            }),
            worker_agreement: true,
            round_trip: None,
        },
    }
}

/// Dump and reload of a four-worker FOF catalog
pub fn round_trip_test() -> ReferenceTest {
    ReferenceTest {
        name: "Catalog Round Trip".to_string(),
        config_path: project_path("configs/fof-clumps.json"),
        scenario: fof_scenario(),
        workers: 4,
        expected: ExpectedResult {
            halo_count: Some(4),
            clump_recovery: None,
            worker_agreement: false,
            round_trip: Some(RoundTripCheck { max_mass_error: 1e-9 }),
        },
    }
}

/// Get all reference tests
pub fn all_tests() -> Vec<ReferenceTest> {
    vec![fof_recovery_test(), hop_recovery_test(), round_trip_test()]
}
