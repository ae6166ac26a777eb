//! On-disk catalog formats and reloading.
//!
//! A dumped catalog is three artifacts:
//! - `<base>.out`: one tab-separated summary row per halo under a single
//!   `# HALOS FOUND WITH <name>` header line.
//! - `<base>.txt`: one `Halo%08d file...` line per halo naming the particle
//!   files that hold its members.
//! - particle files: `bincode`-encoded [`ParticleListFile`]s, one per worker.
//!
//! [`LoadedCatalog`] rebuilds halos from the first two and reads particle
//! fields lazily from the third.

use std::cell::OnceCell;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use halo_kernel::{Particle, ParticleArrays};

use crate::catalog::nearest_centers;
use crate::config::VirialConfig;
use crate::error::{HaloError, Result};
use crate::halo::{FinderKind, HaloSummary, PeakRecord, PropertyContext, VirialProfile};
use crate::properties::{max_distance, radial_profile, Center, HaloProperties, Local};

/// Position field names, x then y then z.
pub const POSITION_FIELDS: [&str; 3] = ["particle_position_x", "particle_position_y", "particle_position_z"];
/// Velocity field names, x then y then z.
pub const VELOCITY_FIELDS: [&str; 3] = ["particle_velocity_x", "particle_velocity_y", "particle_velocity_z"];
/// Particle index field name.
pub const INDEX_FIELD: &str = "particle_index";
/// Particle mass field name.
pub const MASS_FIELD: &str = "ParticleMassMsun";
/// Optional creation time field name.
pub const CREATION_TIME_FIELD: &str = "creation_time";

/// Columns per summary row.
const SUMMARY_COLUMNS: usize = 15;

/// `%0.9e`: nine decimals, signed exponent of at least two digits.
pub fn format_sci(v: f64) -> String {
    let s = format!("{v:.9e}");
    match s.split_once('e') {
        Some((mantissa, exp)) => match exp.parse::<i32>() {
            Ok(e) => format!("{}e{}{:02}", mantissa, if e < 0 { '-' } else { '+' }, e.abs()),
            Err(_) => s,
        },
        None => s,
    }
}

/// Record group name for a halo id.
pub fn halo_group_name(id: usize) -> String {
    format!("Halo{id:08}")
}

/// Particle file path for `prefix`, per worker when `rank` is given.
pub fn particle_file_name(prefix: &str, rank: Option<usize>) -> String {
    match rank {
        Some(r) => format!("{prefix}.{r:04}.parts"),
        None => format!("{prefix}.parts"),
    }
}

// ---------------------------------------------------------------------------
// Summary table
// ---------------------------------------------------------------------------

/// One line of the summary table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummaryRow {
    /// Halo id
    pub id: usize,
    /// Total mass
    pub total_mass: f64,
    /// Particle count
    pub size: u64,
    /// Peak density (-1 for FOF)
    pub max_density: f64,
    /// Peak location
    pub max_density_location: [f64; 3],
    /// Center of mass
    pub center_of_mass: [f64; 3],
    /// Bulk velocity
    pub bulk_velocity: [f64; 3],
    /// Largest member distance from the center of mass
    pub maximum_radius: f64,
    /// RMS velocity
    pub rms_velocity: f64,
}

impl SummaryRow {
    /// Evaluate every column on a halo view.
    pub fn from_properties<H: HaloProperties + ?Sized>(h: &H) -> Result<Self> {
        Ok(Self {
            id: h.id(),
            total_mass: h.total_mass()?,
            size: h.size()?,
            max_density: h.maximum_density(),
            max_density_location: h.maximum_density_location()?,
            center_of_mass: h.center_of_mass()?,
            bulk_velocity: h.bulk_velocity()?,
            maximum_radius: h.maximum_radius(Center::CenterOfMass)?,
            rms_velocity: h.rms_velocity()?,
        })
    }

    /// Tab-separated text form.
    pub fn format(&self) -> String {
        let mut out = format!(
            "{:>10}\t{}\t{:>10}\t{}\t",
            self.id,
            format_sci(self.total_mass),
            self.size,
            format_sci(self.max_density)
        );
        for v in self
            .max_density_location
            .iter()
            .chain(&self.center_of_mass)
            .chain(&self.bulk_velocity)
            .chain([self.maximum_radius, self.rms_velocity].iter())
        {
            out.push_str(&format_sci(*v));
            out.push('\t');
        }
        out
    }

    /// Parse one data line; `line` is one-based for error messages.
    pub fn parse(text: &str, path: &str, line: usize) -> Result<Self> {
        let bad = |message: String| HaloError::Format {
            path: path.to_string(),
            line,
            message,
        };
        let cols: Vec<&str> = text.split_whitespace().collect();
        if cols.len() != SUMMARY_COLUMNS {
            return Err(bad(format!("expected {SUMMARY_COLUMNS} columns, found {}", cols.len())));
        }
        let float = |i: usize| -> Result<f64> {
            cols[i]
                .parse::<f64>()
                .map_err(|e| bad(format!("column {}: {e}", i + 1)))
        };
        let vec3 = |i: usize| -> Result<[f64; 3]> { Ok([float(i)?, float(i + 1)?, float(i + 2)?]) };
        Ok(Self {
            id: cols[0].parse().map_err(|e| bad(format!("halo id: {e}")))?,
            total_mass: float(1)?,
            size: cols[2].parse().map_err(|e| bad(format!("particle count: {e}")))?,
            max_density: float(3)?,
            max_density_location: vec3(4)?,
            center_of_mass: vec3(7)?,
            bulk_velocity: vec3(10)?,
            maximum_radius: float(13)?,
            rms_velocity: float(14)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Particle record files
// ---------------------------------------------------------------------------

/// One named per-particle column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldData {
    /// Floating-point column
    Float(Vec<f64>),
    /// Integer column
    Int(Vec<i64>),
}

impl FieldData {
    /// Number of values.
    pub fn len(&self) -> usize {
        match self {
            FieldData::Float(v) => v.len(),
            FieldData::Int(v) => v.len(),
        }
    }

    /// Whether the column is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Float values, if this is a float column.
    pub fn as_float(&self) -> Option<&[f64]> {
        match self {
            FieldData::Float(v) => Some(v),
            FieldData::Int(_) => None,
        }
    }

    /// Integer values, if this is an integer column.
    pub fn as_int(&self) -> Option<&[i64]> {
        match self {
            FieldData::Int(v) => Some(v),
            FieldData::Float(_) => None,
        }
    }

    /// Append `other`; false if the column kinds differ.
    fn append(&mut self, other: FieldData) -> bool {
        match (self, other) {
            (FieldData::Float(a), FieldData::Float(b)) => a.extend(b),
            (FieldData::Int(a), FieldData::Int(b)) => a.extend(b),
            _ => return false,
        }
        true
    }
}

/// Columns for the given rows.
pub fn halo_records(particles: &ParticleArrays, rows: &[usize]) -> BTreeMap<String, FieldData> {
    let float = |col: &[f64]| FieldData::Float(rows.iter().map(|&i| col[i]).collect());
    let mut fields = BTreeMap::new();
    for (name, col) in POSITION_FIELDS.iter().zip([&particles.x, &particles.y, &particles.z]) {
        fields.insert(name.to_string(), float(col));
    }
    for (name, col) in VELOCITY_FIELDS.iter().zip([&particles.vx, &particles.vy, &particles.vz]) {
        fields.insert(name.to_string(), float(col));
    }
    fields.insert(
        INDEX_FIELD.to_string(),
        FieldData::Int(rows.iter().map(|&i| particles.index[i]).collect()),
    );
    fields.insert(MASS_FIELD.to_string(), float(&particles.mass));
    if let Some(ct) = &particles.creation_time {
        fields.insert(CREATION_TIME_FIELD.to_string(), float(ct));
    }
    fields
}

/// Contents of one particle file: record groups keyed by `Halo%08d`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticleListFile {
    /// Field columns per halo group
    pub halos: BTreeMap<String, BTreeMap<String, FieldData>>,
}

impl ParticleListFile {
    /// Encode to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| HaloError::io(path, e))?;
        let mut w = BufWriter::new(file);
        bincode::serialize_into(&mut w, self).map_err(|e| encode_error(path, e))?;
        w.flush().map_err(|e| HaloError::io(path, e))
    }

    /// Decode from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| HaloError::io(path, e))?;
        bincode::deserialize_from(BufReader::new(file)).map_err(|e| encode_error(path, e))
    }
}

fn encode_error(path: &Path, e: impl std::fmt::Display) -> HaloError {
    HaloError::Encode {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Reloaded catalogs
// ---------------------------------------------------------------------------

/// A halo rebuilt from a dumped catalog.
///
/// Summary statistics come from the table; particle fields are read from
/// the particle files on first use and kept.
#[derive(Debug)]
pub struct LoadedHalo {
    id: usize,
    summary: HaloSummary,
    peak: PeakRecord,
    files: Vec<PathBuf>,
    ctx: PropertyContext,
    fields: OnceCell<BTreeMap<String, FieldData>>,
    virial: Option<VirialProfile>,
}

impl LoadedHalo {
    /// Particle files holding this halo's members.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Stored summary statistics.
    pub fn summary(&self) -> &HaloSummary {
        &self.summary
    }

    /// One particle field, `None` when no file carries it.
    pub fn field(&self, name: &str) -> Result<Option<&FieldData>> {
        let fields = match self.fields.get() {
            Some(f) => f,
            None => {
                let loaded = self.read_fields()?;
                self.fields.get_or_init(|| loaded)
            }
        };
        Ok(fields.get(name))
    }

    fn read_fields(&self) -> Result<BTreeMap<String, FieldData>> {
        let group = halo_group_name(self.id);
        let mut fields: BTreeMap<String, FieldData> = BTreeMap::new();
        for path in &self.files {
            let mut file = ParticleListFile::load(path)?;
            let Some(part) = file.halos.remove(&group) else {
                tracing::debug!("{} has no group {}", path.display(), group);
                continue;
            };
            for (name, data) in part {
                match fields.get_mut(&name) {
                    Some(existing) => {
                        if !existing.append(data) {
                            return Err(encode_error(path, format!("{group}/{name} changes type between files")));
                        }
                    }
                    None => {
                        fields.insert(name, data);
                    }
                }
            }
        }
        tracing::debug!("Loaded {} fields for {}", fields.len(), group);
        Ok(fields)
    }

    fn float_field(&self, name: &str) -> Result<Option<&[f64]>> {
        Ok(self.field(name)?.and_then(FieldData::as_float))
    }

    /// Member particles rebuilt from the fields, `None` if any required field is absent.
    pub fn particles(&self) -> Result<Option<ParticleArrays>> {
        let float = |name: &str| self.float_field(name);
        let (Some(x), Some(y), Some(z)) = (float(POSITION_FIELDS[0])?, float(POSITION_FIELDS[1])?, float(POSITION_FIELDS[2])?)
        else {
            return Ok(None);
        };
        let (Some(vx), Some(vy), Some(vz)) = (float(VELOCITY_FIELDS[0])?, float(VELOCITY_FIELDS[1])?, float(VELOCITY_FIELDS[2])?)
        else {
            return Ok(None);
        };
        let (Some(mass), Some(index)) = (float(MASS_FIELD)?, self.field(INDEX_FIELD)?.and_then(FieldData::as_int)) else {
            return Ok(None);
        };
        let creation_time = float(CREATION_TIME_FIELD)?;

        let mut pa = ParticleArrays::with_columns(creation_time.is_some(), false);
        pa.reserve(x.len());
        for i in 0..x.len() {
            let mut p = Particle::new([x[i], y[i], z[i]], [vx[i], vy[i], vz[i]], mass[i], index[i]);
            p.creation_time = creation_time.map(|ct| ct[i]);
            pa.push(p);
        }
        Ok(Some(pa))
    }

    fn stored<T>(&self, value: Option<T>) -> Result<T> {
        value.ok_or(HaloError::EmptyHalo(self.id))
    }

    fn member_particles(&self) -> Result<ParticleArrays> {
        match self.particles()? {
            Some(pa) if !pa.is_empty() => Ok(pa),
            _ => Err(HaloError::EmptyHalo(self.id)),
        }
    }
}

impl HaloProperties for LoadedHalo {
    fn id(&self) -> usize {
        self.id
    }

    fn size(&self) -> Result<u64> {
        self.stored(self.summary.size)
    }

    fn total_mass(&self) -> Result<f64> {
        self.stored(self.summary.total_mass)
    }

    fn center_of_mass(&self) -> Result<[f64; 3]> {
        self.stored(self.summary.center_of_mass)
    }

    fn maximum_density(&self) -> f64 {
        self.peak.density
    }

    fn maximum_density_location(&self) -> Result<[f64; 3]> {
        Ok(self.peak.position)
    }

    fn bulk_velocity(&self) -> Result<[f64; 3]> {
        self.stored(self.summary.bulk_velocity)
    }

    fn rms_velocity(&self) -> Result<f64> {
        self.stored(self.summary.rms_velocity)
    }

    fn maximum_radius(&self, center: Center) -> Result<f64> {
        match center {
            Center::CenterOfMass => self.stored(self.summary.maximum_radius),
            Center::MaxDensity => {
                let pa = self.member_particles()?;
                let rows: Vec<usize> = (0..pa.len()).collect();
                Ok(max_distance(&pa, &rows, self.peak.position, &self.ctx.periodicity()))
            }
        }
    }

    fn virial_info(&mut self, bins: usize) -> Result<&VirialProfile> {
        if !matches!(&self.virial, Some(p) if p.bins == bins) {
            let pa = self.member_particles()?;
            let rows: Vec<usize> = (0..pa.len()).collect();
            let center = self.center_of_mass()?;
            self.virial = Some(radial_profile(&pa, &rows, center, &self.ctx, bins, &Local)?);
        }
        self.virial.as_ref().ok_or(HaloError::EmptyHalo(self.id))
    }

    fn virial_settings(&self) -> VirialConfig {
        self.ctx.virial
    }
}

/// A catalog rebuilt from `<base>.out` and `<base>.txt`.
#[derive(Debug)]
pub struct LoadedCatalog {
    /// Finder name from the summary header
    pub name: String,
    /// Halos in id order
    pub halos: Vec<LoadedHalo>,
    /// Geometry and cosmology for property evaluation
    pub ctx: PropertyContext,
}

impl LoadedCatalog {
    /// Read a dumped catalog.
    ///
    /// The finder named in the header overrides `ctx.kind`. Halos missing from
    /// the index simply have no particle files.
    pub fn load(basename: &str, mut ctx: PropertyContext) -> Result<Self> {
        let out_path = format!("{basename}.out");
        let (name, rows) = read_summary(&out_path)?;
        if let Some(kind) = FinderKind::from_name(&name) {
            ctx.kind = kind;
        }
        let txt_path = format!("{basename}.txt");
        let dir = Path::new(basename)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let mut index = read_index(&txt_path, &dir)?;

        let halos = rows
            .into_iter()
            .map(|row| LoadedHalo {
                id: row.id,
                summary: HaloSummary {
                    size: Some(row.size),
                    total_mass: Some(row.total_mass),
                    center_of_mass: Some(row.center_of_mass),
                    bulk_velocity: Some(row.bulk_velocity),
                    rms_velocity: Some(row.rms_velocity),
                    maximum_radius: Some(row.maximum_radius),
                },
                peak: PeakRecord {
                    density: row.max_density,
                    position: row.max_density_location,
                },
                files: index.remove(&row.id).unwrap_or_default(),
                ctx,
                fields: OnceCell::new(),
                virial: None,
            })
            .collect::<Vec<_>>();
        tracing::info!("Loaded {} {} halos from {}", halos.len(), name, basename);
        Ok(Self { name, halos, ctx })
    }

    /// Number of halos.
    pub fn len(&self) -> usize {
        self.halos.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.halos.is_empty()
    }

    /// Halo by id.
    pub fn get(&self, id: usize) -> Option<&LoadedHalo> {
        self.halos.get(id)
    }

    /// Mutable halo by id, for cached virial queries.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut LoadedHalo> {
        self.halos.get_mut(id)
    }

    /// Up to `k` halos nearest to halo `id`, itself included, as `(distance, id)`.
    pub fn nearest_neighbors_3d(&self, id: usize, k: usize, search_radius: f64) -> Result<Vec<(f64, usize)>> {
        self.neighbors(id, k, search_radius, None)
    }

    /// As [`nearest_neighbors_3d`](Self::nearest_neighbors_3d) with `axis` projected out.
    pub fn nearest_neighbors_2d(&self, id: usize, k: usize, search_radius: f64, axis: usize) -> Result<Vec<(f64, usize)>> {
        if axis > 2 {
            return Err(HaloError::Config(format!("projection axis {axis} out of range")));
        }
        self.neighbors(id, k, search_radius, Some(axis))
    }

    fn neighbors(&self, id: usize, k: usize, search_radius: f64, projection: Option<usize>) -> Result<Vec<(f64, usize)>> {
        let centers: Vec<[f64; 3]> = self
            .halos
            .iter()
            .map(|h| h.center_of_mass())
            .collect::<Result<_>>()?;
        let query = *centers.get(id).ok_or(HaloError::UnknownHalo { id, len: self.len() })?;
        Ok(nearest_centers(&self.ctx, &centers, query, k, search_radius, projection)
            .into_iter()
            .map(|(d, i)| (d, self.halos[i].id))
            .collect())
    }
}

fn read_lines(path: &str) -> Result<Vec<String>> {
    let file = File::open(path).map_err(|e| HaloError::io(path, e))?;
    BufReader::new(file)
        .lines()
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| HaloError::io(path, e))
}

fn read_summary(path: &str) -> Result<(String, Vec<SummaryRow>)> {
    let mut name = String::new();
    let mut rows: Vec<SummaryRow> = Vec::new();
    for (n, text) in read_lines(path)?.iter().enumerate() {
        let line = n + 1;
        let text = text.trim();
        if let Some(comment) = text.strip_prefix('#') {
            if let Some(found) = comment.trim().strip_prefix("HALOS FOUND WITH") {
                name = found.trim().to_string();
            }
            continue;
        }
        if text.is_empty() {
            continue;
        }
        let row = SummaryRow::parse(text, path, line)?;
        if row.id != rows.len() {
            return Err(HaloError::Format {
                path: path.to_string(),
                line,
                message: format!("expected halo {}, found {}", rows.len(), row.id),
            });
        }
        rows.push(row);
    }
    Ok((name, rows))
}

fn read_index(path: &str, dir: &Path) -> Result<HashMap<usize, Vec<PathBuf>>> {
    let mut index = HashMap::new();
    for (n, text) in read_lines(path)?.iter().enumerate() {
        let mut tokens = text.split_whitespace();
        let Some(group) = tokens.next() else {
            continue;
        };
        let id = group
            .strip_prefix("Halo")
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| HaloError::Format {
                path: path.to_string(),
                line: n + 1,
                message: format!("bad halo group name {group:?}"),
            })?;
        index.insert(id, tokens.map(|f| dir.join(f)).collect());
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scientific_format_matches_printf() {
        assert_eq!(format_sci(12345.678), "1.234567800e+04");
        assert_eq!(format_sci(-1.0), "-1.000000000e+00");
        assert_eq!(format_sci(0.0), "0.000000000e+00");
        assert_eq!(format_sci(2.5e-7), "2.500000000e-07");
        assert_eq!(format_sci(1.0e120), "1.000000000e+120");
    }

    #[test]
    fn summary_row_reads_back() {
        let row = SummaryRow {
            id: 3,
            total_mass: 1.5e12,
            size: 42,
            max_density: -1.0,
            max_density_location: [0.1, 0.2, 0.3],
            center_of_mass: [0.1, 0.2, 0.3],
            bulk_velocity: [10.0, -5.0, 0.5],
            maximum_radius: 0.01,
            rms_velocity: 120.0,
        };
        let text = row.format();
        assert!(text.starts_with("         3\t1.500000000e+12\t        42\t-1.000000000e+00\t"));
        assert_eq!(SummaryRow::parse(&text, "x.out", 2).unwrap(), row);
    }

    #[test]
    fn short_rows_are_rejected() {
        let err = SummaryRow::parse("0 1.0 2", "x.out", 7).unwrap_err();
        assert!(matches!(err, HaloError::Format { line: 7, .. }));
    }

    #[test]
    fn records_follow_row_selection() {
        let mut pa = ParticleArrays::new();
        for i in 0..4 {
            pa.push(Particle::new([i as f64; 3], [0.0; 3], 10.0 + i as f64, 100 + i));
        }
        let rec = halo_records(&pa, &[3, 1]);
        assert_eq!(rec[INDEX_FIELD], FieldData::Int(vec![103, 101]));
        assert_eq!(rec[MASS_FIELD].as_float(), Some(&[13.0, 11.0][..]));
        assert!(!rec.contains_key(CREATION_TIME_FIELD));
        assert_eq!(rec.len(), 8);
    }

    #[test]
    fn columns_of_different_kinds_do_not_append() {
        let mut a = FieldData::Float(vec![1.0]);
        assert!(a.append(FieldData::Float(vec![2.0])));
        assert_eq!(a.len(), 2);
        assert!(!a.append(FieldData::Int(vec![3])));
    }

    #[test]
    fn file_names() {
        assert_eq!(halo_group_name(12), "Halo00000012");
        assert_eq!(particle_file_name("out/hop", Some(3)), "out/hop.0003.parts");
        assert_eq!(particle_file_name("out/hop", None), "out/hop.parts");
    }
}
