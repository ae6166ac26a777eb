//! Per-halo physical properties.
//!
//! [`HaloProperties`] is the operation set every halo view offers.  The
//! engine behind it is generic over a [`Reducer`]: [`Local`] treats this
//! worker's members as the whole halo, [`Global`] combines partial sums over
//! all workers.  A [`DistributedHalo`] must be driven identically on every
//! worker, including workers that hold no members; those contribute neutral
//! values to every reduction.

use std::f64::consts::PI;

use halo_kernel::{ParticleArrays, Periodicity};

use crate::comm::Collective;
use crate::config::VirialConfig;
use crate::error::{HaloError, Result};
use crate::halo::{FinderKind, Halo, PropertyContext, VirialProfile, NOT_VIRIALIZED};
use crate::source::{MSUN_G, TINY};

/// Reference point for [`HaloProperties::maximum_radius`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Center {
    /// Periodic center of mass
    #[default]
    CenterOfMass,
    /// Density maximum location
    MaxDensity,
}

/// Operations available on any halo view.
pub trait HaloProperties {
    /// Global halo id.
    fn id(&self) -> usize;

    /// Number of member particles.
    fn size(&self) -> Result<u64>;

    /// Sum of member masses.
    fn total_mass(&self) -> Result<f64>;

    /// Mass-weighted mean position, unwrapped around the density peak and
    /// folded back into the domain.
    fn center_of_mass(&self) -> Result<[f64; 3]>;

    /// Peak density, or -1 where the finder defines none.
    fn maximum_density(&self) -> f64;

    /// Peak location (FOF: the center of mass).
    fn maximum_density_location(&self) -> Result<[f64; 3]>;

    /// Mass-weighted mean velocity.
    fn bulk_velocity(&self) -> Result<[f64; 3]>;

    /// RMS velocity about the bulk velocity, scaled by the particle count.
    fn rms_velocity(&self) -> Result<f64>;

    /// Largest periodic distance from `center` to a member.
    fn maximum_radius(&self, center: Center) -> Result<f64>;

    /// Radial mass profile with `bins` logarithmic bins, cached per bin count.
    fn virial_info(&mut self, bins: usize) -> Result<&VirialProfile>;

    /// Overdensity and bin count the halos were found with.
    fn virial_settings(&self) -> VirialConfig;

    /// Outermost bin above `overdensity`, if any.
    fn virial_bin(&mut self, overdensity: f64, bins: usize) -> Result<Option<usize>> {
        Ok(self.virial_info(bins)?.virial_bin(overdensity))
    }

    /// Enclosed mass at the virial bin, or -1 if not virialized.
    fn virial_mass(&mut self, overdensity: f64, bins: usize) -> Result<f64> {
        let profile = self.virial_info(bins)?;
        Ok(profile
            .virial_bin(overdensity)
            .map_or(NOT_VIRIALIZED, |b| profile.mass_bins[b]))
    }

    /// Radius of the virial bin, or -1 if not virialized.
    fn virial_radius(&mut self, overdensity: f64, bins: usize) -> Result<f64> {
        let profile = self.virial_info(bins)?;
        Ok(profile
            .virial_bin(overdensity)
            .map_or(NOT_VIRIALIZED, |b| profile.radial_bins[b]))
    }

    /// [`virial_mass`](Self::virial_mass) with the run's settings.
    fn configured_virial_mass(&mut self) -> Result<f64> {
        let v = self.virial_settings();
        self.virial_mass(v.overdensity, v.bins)
    }

    /// [`virial_radius`](Self::virial_radius) with the run's settings.
    fn configured_virial_radius(&mut self) -> Result<f64> {
        let v = self.virial_settings();
        self.virial_radius(v.overdensity, v.bins)
    }
}

// ---------------------------------------------------------------------------
// Reducers
// ---------------------------------------------------------------------------

/// How partial per-worker values become halo values.
pub trait Reducer {
    /// Whether values are combined across workers.
    fn is_global(&self) -> bool;
    /// Sum of a scalar.
    fn sum(&self, value: f64) -> Result<f64>;
    /// Element-wise sum, in place.
    fn sum_slice(&self, values: &mut [f64]) -> Result<()>;
    /// Minimum of a scalar.
    fn min(&self, value: f64) -> Result<f64>;
    /// Maximum of a scalar.
    fn max(&self, value: f64) -> Result<f64>;
}

/// This worker's values are final.
#[derive(Debug, Clone, Copy, Default)]
pub struct Local;

impl Reducer for Local {
    fn is_global(&self) -> bool {
        false
    }

    fn sum(&self, value: f64) -> Result<f64> {
        Ok(value)
    }

    fn sum_slice(&self, _values: &mut [f64]) -> Result<()> {
        Ok(())
    }

    fn min(&self, value: f64) -> Result<f64> {
        Ok(value)
    }

    fn max(&self, value: f64) -> Result<f64> {
        Ok(value)
    }
}

/// Values are reduced over all workers of `C`.
pub struct Global<'c, C>(pub &'c C);

impl<C: Collective> Reducer for Global<'_, C> {
    fn is_global(&self) -> bool {
        true
    }

    fn sum(&self, value: f64) -> Result<f64> {
        Ok(self.0.all_sum(value)?)
    }

    fn sum_slice(&self, values: &mut [f64]) -> Result<()> {
        Ok(self.0.all_sum_slice(values)?)
    }

    fn min(&self, value: f64) -> Result<f64> {
        Ok(self.0.all_min(value)?)
    }

    fn max(&self, value: f64) -> Result<f64> {
        Ok(self.0.all_max(value)?)
    }
}

// ---------------------------------------------------------------------------
// Partial sums over member rows
// ---------------------------------------------------------------------------

/// `[Σ m x, Σ m y, Σ m z, Σ m]` with positions unwrapped around `reference`.
pub fn mass_moments(
    particles: &ParticleArrays,
    rows: &[usize],
    reference: [f64; 3],
    periodicity: &Periodicity,
) -> [f64; 4] {
    let mut acc = [0.0; 4];
    for &i in rows {
        let m = particles.mass[i];
        let p = periodicity.unwrap_near(particles.position(i), reference);
        acc[0] += m * p[0];
        acc[1] += m * p[1];
        acc[2] += m * p[2];
        acc[3] += m;
    }
    acc
}

/// `Σ m v` over `rows`.
pub fn momentum(particles: &ParticleArrays, rows: &[usize]) -> [f64; 3] {
    let mut acc = [0.0; 3];
    for &i in rows {
        let m = particles.mass[i];
        let v = particles.velocity(i);
        for d in 0..3 {
            acc[d] += m * v[d];
        }
    }
    acc
}

/// `Σ |(v - bulk) m / total_mass|²` over `rows`.
pub fn rms_partial(particles: &ParticleArrays, rows: &[usize], bulk: [f64; 3], total_mass: f64) -> f64 {
    rows.iter()
        .map(|&i| {
            let m = particles.mass[i];
            let v = particles.velocity(i);
            (0..3)
                .map(|d| {
                    let w = (v[d] - bulk[d]) * m / total_mass;
                    w * w
                })
                .sum::<f64>()
        })
        .sum()
}

/// Largest periodic distance from `center` to a member, 0 for no members.
pub fn max_distance(particles: &ParticleArrays, rows: &[usize], center: [f64; 3], periodicity: &Periodicity) -> f64 {
    rows.iter()
        .map(|&i| periodicity.distance_sq(particles.position(i), center))
        .fold(0.0, f64::max)
        .sqrt()
}

/// Center of mass from reduced moments, folded into the domain.
pub fn finish_center_of_mass(moments: [f64; 4], ctx: &PropertyContext) -> Option<[f64; 3]> {
    (moments[3] > 0.0).then(|| {
        ctx.wrap([
            moments[0] / moments[3],
            moments[1] / moments[3],
            moments[2] / moments[3],
        ])
    })
}

/// RMS velocity from the reduced square sum and particle count.
pub fn finish_rms(square_sum: f64, count: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    (square_sum / count as f64).sqrt() * count as f64
}

/// Logarithmic radial mass profile around `center`.
///
/// Bin edges come from the reduced distance extrema, so every worker builds
/// the same bins before the per-bin masses are summed.
pub fn radial_profile<R: Reducer>(
    particles: &ParticleArrays,
    rows: &[usize],
    center: [f64; 3],
    ctx: &PropertyContext,
    bins: usize,
    reducer: &R,
) -> Result<VirialProfile> {
    let periodicity = ctx.periodicity();
    let dist: Vec<f64> = rows
        .iter()
        .map(|&i| periodicity.distance_sq(particles.position(i), center).sqrt())
        .collect();
    let (dist_min, dist_max) = if dist.is_empty() {
        (ctx.domain.width().iter().cloned().fold(0.0, f64::max), 0.0)
    } else {
        dist.iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(a, b), &d| (a.min(d), b.max(d)))
    };
    let dist_min = reducer.min(dist_min)?;
    let dist_max = reducer.max(dist_max)?;

    let lo = (dist_min * 0.99 + TINY).log10();
    let hi = (dist_max * 1.01 + 2.0 * TINY).log10();
    let radial_bins: Vec<f64> = (0..=bins)
        .map(|i| 10f64.powf(lo + (hi - lo) * i as f64 / bins as f64))
        .collect();

    let mut mass_bins = vec![0.0; bins + 1];
    for (&i, &d) in rows.iter().zip(&dist) {
        // Left-inclusive digitize, clamped into the table.
        let b = radial_bins.partition_point(|&e| e <= d).saturating_sub(1);
        mass_bins[b.min(bins)] += particles.mass[i];
    }
    for i in 0..bins {
        mass_bins[i + 1] += mass_bins[i];
    }
    reducer.sum_slice(&mut mass_bins)?;

    let rho_crit = ctx.cosmology.rho_crit();
    let cm = ctx.cosmology.length_unit_cm;
    let overdensity = mass_bins
        .iter()
        .zip(&radial_bins)
        .map(|(&m, &r)| m * MSUN_G / (4.0 / 3.0 * PI * rho_crit * (r * cm).powi(3)))
        .collect();

    Ok(VirialProfile {
        bins,
        global: reducer.is_global(),
        radial_bins,
        mass_bins,
        overdensity,
    })
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Property engine over one halo's members on this worker.
pub struct HaloEngine<'a, R: Reducer> {
    halo: &'a mut Halo,
    particles: &'a ParticleArrays,
    ctx: &'a PropertyContext,
    reducer: R,
}

/// Halo whose members on this worker are the whole halo.
pub type LocalHalo<'a> = HaloEngine<'a, Local>;

/// Halo whose properties are reduced over all workers.
pub type DistributedHalo<'a, C> = HaloEngine<'a, Global<'a, C>>;

impl<'a, R: Reducer> HaloEngine<'a, R> {
    /// Wrap a halo with the particle arrays its members index into.
    pub fn new(halo: &'a mut Halo, particles: &'a ParticleArrays, ctx: &'a PropertyContext, reducer: R) -> Self {
        Self {
            halo,
            particles,
            ctx,
            reducer,
        }
    }

    /// The underlying halo record.
    pub fn halo(&self) -> &Halo {
        &*self.halo
    }

    fn mass_checked(&self) -> Result<f64> {
        let m = self.total_mass()?;
        if m > 0.0 {
            Ok(m)
        } else {
            Err(HaloError::EmptyHalo(self.halo.id))
        }
    }
}

impl<R: Reducer> HaloProperties for HaloEngine<'_, R> {
    fn id(&self) -> usize {
        self.halo.id
    }

    fn size(&self) -> Result<u64> {
        if let Some(s) = self.halo.summary.size {
            return Ok(s);
        }
        Ok(self.reducer.sum(self.halo.members.len() as f64)?.round() as u64)
    }

    fn total_mass(&self) -> Result<f64> {
        if let Some(m) = self.halo.summary.total_mass {
            return Ok(m);
        }
        let local: f64 = self.halo.members.iter().map(|&i| self.particles.mass[i]).sum();
        self.reducer.sum(local)
    }

    fn center_of_mass(&self) -> Result<[f64; 3]> {
        if let Some(c) = self.halo.summary.center_of_mass {
            return Ok(c);
        }
        let mut moments = mass_moments(
            self.particles,
            &self.halo.members,
            self.halo.peak.position,
            &self.ctx.periodicity(),
        );
        self.reducer.sum_slice(&mut moments)?;
        finish_center_of_mass(moments, self.ctx).ok_or(HaloError::EmptyHalo(self.halo.id))
    }

    fn maximum_density(&self) -> f64 {
        match self.ctx.kind {
            FinderKind::Hop => self.halo.peak.density,
            FinderKind::Fof => NOT_VIRIALIZED,
        }
    }

    fn maximum_density_location(&self) -> Result<[f64; 3]> {
        match self.ctx.kind {
            FinderKind::Hop => Ok(self.halo.peak.position),
            FinderKind::Fof => self.center_of_mass(),
        }
    }

    fn bulk_velocity(&self) -> Result<[f64; 3]> {
        if let Some(v) = self.halo.summary.bulk_velocity {
            return Ok(v);
        }
        let mut p = momentum(self.particles, &self.halo.members);
        self.reducer.sum_slice(&mut p)?;
        let m = self.mass_checked()?;
        Ok([p[0] / m, p[1] / m, p[2] / m])
    }

    fn rms_velocity(&self) -> Result<f64> {
        if let Some(v) = self.halo.summary.rms_velocity {
            return Ok(v);
        }
        let bulk = self.bulk_velocity()?;
        let m = self.mass_checked()?;
        let mut acc = [
            rms_partial(self.particles, &self.halo.members, bulk, m),
            self.halo.members.len() as f64,
        ];
        self.reducer.sum_slice(&mut acc)?;
        Ok(finish_rms(acc[0], acc[1].round() as u64))
    }

    fn maximum_radius(&self, center: Center) -> Result<f64> {
        let c = match center {
            Center::CenterOfMass => {
                if let Some(r) = self.halo.summary.maximum_radius {
                    return Ok(r);
                }
                self.center_of_mass()?
            }
            Center::MaxDensity => self.maximum_density_location()?,
        };
        let local = max_distance(self.particles, &self.halo.members, c, &self.ctx.periodicity());
        self.reducer.max(local)
    }

    fn virial_info(&mut self, bins: usize) -> Result<&VirialProfile> {
        let global = self.reducer.is_global();
        let cached = matches!(&self.halo.virial, Some(p) if p.bins == bins && p.global == global);
        if !cached {
            let center = self.center_of_mass()?;
            let profile = radial_profile(self.particles, &self.halo.members, center, self.ctx, bins, &self.reducer)?;
            self.halo.virial = Some(profile);
        }
        self.halo
            .virial
            .as_ref()
            .ok_or(HaloError::EmptyHalo(self.halo.id))
    }

    fn virial_settings(&self) -> VirialConfig {
        self.ctx.virial
    }
}
