//! Globally numbered halo catalog: ordering, queries and export.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use halo_kernel::{NeighborGrid, ParticleArrays, Periodicity};

use crate::comm::Collective;
use crate::error::{HaloError, Result};
use crate::halo::{Halo, PeakRecord, PropertyContext};
use crate::persist::{halo_group_name, halo_records, particle_file_name, ParticleListFile, SummaryRow};
use crate::properties::{DistributedHalo, Global, HaloEngine, Local, LocalHalo};

/// Halos found by one run, as held by one worker.
///
/// Every worker holds an entry for every id in `0..len()`; entries whose
/// particles live elsewhere have empty `members`.
#[derive(Debug, Clone)]
pub struct HaloCatalog {
    /// Finder name written into the summary header
    pub name: String,
    /// Halos, indexed by id
    pub halos: Vec<Halo>,
    /// This worker's member particles; halo `members` index into these rows
    pub particles: ParticleArrays,
    /// Geometry and cosmology for property evaluation
    pub ctx: PropertyContext,
    /// Rank of the holding worker
    pub rank: usize,
    /// Number of workers in the run
    pub workers: usize,
    /// Density peak per halo id
    pub peak_table: Vec<PeakRecord>,
}

impl HaloCatalog {
    /// Assemble a catalog; halos are kept in the given order.
    pub fn from_parts(
        halos: Vec<Halo>,
        particles: ParticleArrays,
        ctx: PropertyContext,
        rank: usize,
        workers: usize,
    ) -> Self {
        let peak_table = halos.iter().map(|h| h.peak).collect();
        Self {
            name: ctx.kind.name().to_string(),
            halos,
            particles,
            ctx,
            rank,
            workers,
            peak_table,
        }
    }

    /// Number of halos.
    pub fn len(&self) -> usize {
        self.halos.len()
    }

    /// Whether no halos were found.
    pub fn is_empty(&self) -> bool {
        self.halos.is_empty()
    }

    /// Halo record by id.
    pub fn get(&self, id: usize) -> Option<&Halo> {
        self.halos.get(id)
    }

    /// Halos in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Halo> {
        self.halos.iter()
    }

    /// Ids of halos with members on this worker.
    pub fn local_ids(&self) -> Vec<usize> {
        self.halos.iter().filter(|h| h.is_local()).map(|h| h.id).collect()
    }

    /// Property view treating this worker's members as the whole halo.
    pub fn local(&mut self, id: usize) -> Result<LocalHalo<'_>> {
        let len = self.halos.len();
        let halo = self.halos.get_mut(id).ok_or(HaloError::UnknownHalo { id, len })?;
        Ok(HaloEngine::new(halo, &self.particles, &self.ctx, Local))
    }

    /// Property view reducing over every worker.
    ///
    /// Every worker must request the same id and call the same operations.
    pub fn distributed<'a, C: Collective>(&'a mut self, id: usize, comm: &'a C) -> Result<DistributedHalo<'a, C>> {
        let len = self.halos.len();
        let halo = self.halos.get_mut(id).ok_or(HaloError::UnknownHalo { id, len })?;
        Ok(HaloEngine::new(halo, &self.particles, &self.ctx, Global(comm)))
    }

    /// Sort by descending mass, then ascending center-of-mass x, then key,
    /// and renumber ids from zero.
    ///
    /// Uses the precomputed summaries, which are identical on every worker,
    /// so every worker arrives at the same order.
    pub fn sort_and_renumber(&mut self) {
        let com_x = |h: &Halo| h.summary.center_of_mass.map_or(f64::INFINITY, |c| c[0]);
        let mass = |h: &Halo| h.summary.total_mass.unwrap_or(0.0);
        self.halos.sort_by(|a, b| {
            mass(b)
                .total_cmp(&mass(a))
                .then_with(|| com_x(a).total_cmp(&com_x(b)))
                .then(a.key.cmp(&b.key))
        });
        for (i, h) in self.halos.iter_mut().enumerate() {
            h.id = i;
            h.clear_virial();
        }
        self.peak_table = self.halos.iter().map(|h| h.peak).collect();
    }

    fn centers(&self) -> Result<Vec<[f64; 3]>> {
        self.halos
            .iter()
            .map(|h| h.summary.center_of_mass.ok_or(HaloError::EmptyHalo(h.id)))
            .collect()
    }

    /// Up to `k` halos nearest to halo `id` by center of mass, the halo itself
    /// included, as `(distance, id)` sorted by distance.
    pub fn nearest_neighbors_3d(&self, id: usize, k: usize, search_radius: f64) -> Result<Vec<(f64, usize)>> {
        let centers = self.centers()?;
        let query = *centers.get(id).ok_or(HaloError::UnknownHalo { id, len: self.len() })?;
        Ok(nearest_centers(&self.ctx, &centers, query, k, search_radius, None))
    }

    /// As [`nearest_neighbors_3d`](Self::nearest_neighbors_3d) with `axis` projected out.
    pub fn nearest_neighbors_2d(
        &self,
        id: usize,
        k: usize,
        search_radius: f64,
        axis: usize,
    ) -> Result<Vec<(f64, usize)>> {
        if axis > 2 {
            return Err(HaloError::Config(format!("projection axis {axis} out of range")));
        }
        let centers = self.centers()?;
        let query = *centers.get(id).ok_or(HaloError::UnknownHalo { id, len: self.len() })?;
        Ok(nearest_centers(&self.ctx, &centers, query, k, search_radius, Some(axis)))
    }

    /// Write the per-halo summary table.
    pub fn write_out(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut rows = Vec::with_capacity(self.len());
        for id in 0..self.len() {
            rows.push(SummaryRow::from_properties(&self.local(id)?)?);
        }
        let file = File::create(path).map_err(|e| HaloError::io(path, e))?;
        let mut w = BufWriter::new(file);
        writeln!(w, "# HALOS FOUND WITH {}", self.name).map_err(|e| HaloError::io(path, e))?;
        for row in &rows {
            writeln!(w, "{}", row.format()).map_err(|e| HaloError::io(path, e))?;
        }
        w.flush().map_err(|e| HaloError::io(path, e))?;
        tracing::info!("Wrote {} halos to {}", rows.len(), path.display());
        Ok(())
    }

    /// Path of this worker's particle file for `prefix`.
    pub fn particle_file(&self, prefix: &str) -> String {
        particle_file_name(prefix, (self.workers > 1).then_some(self.rank))
    }

    /// Write the members held by this worker, one record group per halo.
    pub fn write_particle_lists(&self, prefix: &str) -> Result<()> {
        let mut file = ParticleListFile::default();
        for h in self.halos.iter().filter(|h| h.is_local()) {
            file.halos
                .insert(halo_group_name(h.id), halo_records(&self.particles, &h.members));
        }
        let path = self.particle_file(prefix);
        file.save(&path)?;
        tracing::debug!("Worker {}: wrote {} halo particle lists to {}", self.rank, file.halos.len(), path);
        Ok(())
    }

    /// Write `<prefix>.txt` mapping each halo to the particle files holding it.
    pub fn write_particle_lists_txt(&self, prefix: &str) -> Result<()> {
        let path = format!("{prefix}.txt");
        let file = File::create(&path).map_err(|e| HaloError::io(&path, e))?;
        let mut w = BufWriter::new(file);
        for h in &self.halos {
            let ranks: Vec<Option<usize>> = if self.workers > 1 {
                h.tasks.iter().map(|&t| Some(t)).collect()
            } else {
                vec![None]
            };
            let files: Vec<String> = ranks
                .into_iter()
                .map(|r| index_entry(&particle_file_name(prefix, r)))
                .collect();
            writeln!(w, "{} {}", halo_group_name(h.id), files.join(" ")).map_err(|e| HaloError::io(&path, e))?;
        }
        w.flush().map_err(|e| HaloError::io(&path, e))?;
        Ok(())
    }

    /// Save the catalog as `<basename>.out`, `<basename>.txt` and particle files.
    ///
    /// Collective: the root writes the text files, every worker writes its
    /// own particle file, and a failure anywhere fails the call everywhere.
    pub fn dump<C: Collective>(&mut self, comm: &C, basename: &str) -> Result<()> {
        let mut result = Ok(());
        if comm.is_root() {
            result = self
                .write_out(format!("{basename}.out"))
                .and_then(|_| self.write_particle_lists_txt(basename));
        }
        let result = result.and_then(|_| self.write_particle_lists(basename));
        if let Err(e) = &result {
            tracing::error!("Worker {}: dump failed: {}", comm.rank(), e);
        }
        if comm.exit_test(result.is_err())? {
            return Err(result
                .err()
                .unwrap_or_else(|| HaloError::CollectiveAbort("another worker failed to write its output".to_string())));
        }
        Ok(())
    }
}

/// File name recorded in the index, relative to the index's directory.
fn index_entry(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map_or_else(|| path.to_string(), |n| n.to_string_lossy().into_owned())
}

/// Up to `k` of `centers` nearest `query` within `search_radius`, as
/// `(distance, position in centers)`.
///
/// Distances use the domain's periodic metric; `projection` drops one axis.
pub fn nearest_centers(
    ctx: &PropertyContext,
    centers: &[[f64; 3]],
    query: [f64; 3],
    k: usize,
    search_radius: f64,
    projection: Option<usize>,
) -> Vec<(f64, usize)> {
    let mut periodicity = if ctx.periodic {
        Periodicity::periodic(ctx.domain.width())
    } else {
        Periodicity::open()
    };
    if let Some(axis) = projection {
        periodicity.periodic[axis] = false;
    }
    let place = |c: [f64; 3]| {
        let w = ctx.wrap(c);
        let mut p = [0.0; 3];
        for d in 0..3 {
            p[d] = w[d] - ctx.domain.min[d];
            if periodicity.periodic[d] && p[d] >= periodicity.period[d] {
                p[d] -= periodicity.period[d];
            }
        }
        if let Some(axis) = projection {
            p[axis] = 0.0;
        }
        p
    };

    let placed: Vec<[f64; 3]> = centers.iter().map(|&c| place(c)).collect();
    let x: Vec<f64> = placed.iter().map(|p| p[0]).collect();
    let y: Vec<f64> = placed.iter().map(|p| p[1]).collect();
    let z: Vec<f64> = placed.iter().map(|p| p[2]).collect();
    let grid = NeighborGrid::for_points(&x, &y, &z, periodicity, (2 * k).max(1));
    grid.nearest(place(query), k, Some(search_radius * search_radius), &x, &y, &z)
        .into_iter()
        .map(|(d2, i)| (d2.sqrt(), i))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::halo::{FinderKind, HaloSummary};
    use crate::source::{Cosmology, AABB};

    fn ctx() -> PropertyContext {
        PropertyContext {
            domain: AABB::new([0.0; 3], [1.0; 3]),
            periodic: true,
            cosmology: Cosmology::default(),
            kind: FinderKind::Hop,
            virial: Default::default(),
        }
    }

    fn summarized(key: i64, mass: f64, com: [f64; 3]) -> Halo {
        let mut h = Halo::new(
            0,
            key,
            Vec::new(),
            PeakRecord {
                density: 1.0,
                position: com,
            },
            0,
        );
        h.summary = HaloSummary {
            size: Some(1),
            total_mass: Some(mass),
            center_of_mass: Some(com),
            bulk_velocity: Some([0.0; 3]),
            rms_velocity: Some(0.0),
            maximum_radius: Some(0.0),
        };
        h
    }

    fn catalog() -> HaloCatalog {
        let mut c = HaloCatalog::from_parts(
            vec![
                summarized(7, 1.0, [0.02, 0.5, 0.5]),
                summarized(3, 5.0, [0.5, 0.5, 0.5]),
                summarized(9, 5.0, [0.2, 0.5, 0.5]),
                summarized(1, 2.0, [0.97, 0.5, 0.5]),
            ],
            ParticleArrays::new(),
            ctx(),
            0,
            1,
        );
        c.sort_and_renumber();
        c
    }

    #[test]
    fn ordering_is_mass_then_center_x() {
        let c = catalog();
        let keys: Vec<i64> = c.iter().map(|h| h.key).collect();
        assert_eq!(keys, vec![9, 3, 1, 7]);
        assert!(c.iter().enumerate().all(|(i, h)| h.id == i));
        assert_eq!(c.peak_table[0].position, [0.2, 0.5, 0.5]);
    }

    #[test]
    fn neighbors_wrap_around_the_box() {
        let c = catalog();
        // Halo 3 sits at x = 0.02; halo 2 at x = 0.97 is 0.05 away through the boundary.
        let n = c.nearest_neighbors_3d(3, 3, 0.2).unwrap();
        assert_eq!(n[0].1, 3);
        assert!(n[0].0 < 1e-12);
        assert_eq!(n[1].1, 2);
        assert!((n[1].0 - 0.05).abs() < 1e-9);
        assert_eq!(n[2].1, 0);
    }

    #[test]
    fn projection_ignores_the_dropped_axis() {
        let ctx = ctx();
        let centers = [[0.5, 0.5, 0.1], [0.5, 0.5, 0.9], [0.5, 0.8, 0.1]];
        let n = nearest_centers(&ctx, &centers, centers[0], 3, 0.5, Some(2));
        assert_eq!(n[0].0, 0.0);
        assert_eq!(n[1].0, 0.0);
        assert!((n[2].0 - 0.3).abs() < 1e-9);
    }

    #[test]
    fn unknown_ids_are_reported() {
        let mut c = catalog();
        assert!(matches!(c.local(10), Err(HaloError::UnknownHalo { id: 10, len: 4 })));
        assert!(c.nearest_neighbors_2d(0, 2, 0.1, 3).is_err());
    }
}
