//! Orchestration Layer
//!
//! This crate turns the kernel's single-partition group finders into a
//! distributed halo finder:
//! - Spatial partitioning with load balancing and density-adapted padding
//! - Per-worker clustering and ownership of groups
//! - Merging of per-worker groups into one globally numbered catalog
//! - Halo properties, local or reduced over all workers
//! - Catalog queries, export and reloading
//!
//! Workers only ever talk to each other through [`Collective`].  The
//! in-process [`ThreadWorld`] runs each worker on its own thread.

#![warn(missing_docs)]

pub mod catalog;
pub mod comm;
pub mod config;
pub mod distributed;
pub mod error;
pub mod finder;
pub mod halo;
pub mod merge;
pub mod metrics;
pub mod partition;
pub mod persist;
pub mod properties;
pub mod source;

pub use catalog::HaloCatalog;
pub use comm::{Collective, SoloComm, ThreadComm, ThreadWorld};
pub use config::{FinderConfig, FinderMethod, VirialConfig};
pub use distributed::{find_halos, run_distributed, run_single, WorkerResult};
pub use error::{CommError, HaloError, Result};
pub use halo::{FinderKind, Halo, HaloSummary, PropertyContext, VirialProfile, NOT_VIRIALIZED};
pub use metrics::RunMetrics;
pub use persist::{FieldData, LoadedCatalog, LoadedHalo};
pub use properties::{Center, DistributedHalo, HaloProperties, LocalHalo};
pub use source::{Cosmology, InMemorySource, ParticleSource, AABB};

/// Sum per-worker partial totals in rank order.
///
/// Handy for checking that a quantity split over workers adds up to what a
/// single worker reports.
pub fn aggregate_partials(partials: &[Vec<f64>]) -> Vec<f64> {
    let len = partials.iter().map(Vec::len).min().unwrap_or(0);
    (0..len).map(|i| partials.iter().map(|p| p[i]).sum()).collect()
}
