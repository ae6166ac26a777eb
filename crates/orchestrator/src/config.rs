//! Configuration parsing and validation for halo finding runs

use serde::{Deserialize, Serialize};
use std::fs;

use halo_kernel::HopTuning;

/// Main halo finder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinderConfig {
    /// Human-readable run name
    #[serde(default = "default_name")]
    pub name: String,
    /// Which clustering algorithm to run
    #[serde(default)]
    pub method: FinderMethod,
    /// HOP density threshold (in units of the mean density)
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// FOF linking length: positive is a fraction of the mean interparticle
    /// spacing, negative is an absolute length in unit-period coordinates
    #[serde(default = "default_link")]
    pub link: f64,
    /// Cluster dark matter only
    #[serde(default = "default_true")]
    pub dm_only: bool,
    /// Minimum ghost padding width (domain units)
    #[serde(default)]
    pub padding: f64,
    /// Neighbors used for the density estimate
    #[serde(default = "default_num_neighbors")]
    pub num_neighbors: usize,
    /// Multiplier on the padding estimate
    #[serde(default = "default_safety")]
    pub safety: f64,
    /// Run the HOP premerge pass
    #[serde(default = "default_true")]
    pub premerge: bool,
    /// Lower/higher peak density ratio a premerge must reach
    #[serde(default = "default_merge_ratio")]
    pub merge_ratio: f64,
    /// Permute particles into grid-cell order before clustering
    #[serde(default = "default_true")]
    pub rearrange: bool,
    /// Fraction of particles sampled for load-balanced bisection
    #[serde(default = "default_sample")]
    pub sample: f64,
    /// Density-adapted per-face padding instead of a flat width
    #[serde(default = "default_true")]
    pub fancy_padding: bool,
    /// Load-balance partitions by particle count (false: even split)
    #[serde(default = "default_true")]
    pub resize: bool,
    /// Restrict the analysis to this box
    #[serde(default)]
    pub subvolume: Option<BoxBounds>,
    /// Base seed for bisection sampling
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// HOP chain-merging parameters
    #[serde(default)]
    pub hop: HopTuning,
    /// Smallest FOF group kept
    #[serde(default = "default_fof_min_members")]
    pub fof_min_members: usize,
    /// Virial analysis settings
    #[serde(default)]
    pub virial: VirialConfig,
}

/// Clustering algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FinderMethod {
    /// Density-linking HOP
    #[default]
    Hop,
    /// Friends-of-friends
    Fof,
}

/// Axis-aligned box bounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxBounds {
    /// Minimum corner [x, y, z]
    pub min: [f64; 3],
    /// Maximum corner [x, y, z]
    pub max: [f64; 3],
}

/// Virial analysis settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VirialConfig {
    /// Overdensity threshold relative to the critical density
    #[serde(default = "default_overdensity")]
    pub overdensity: f64,
    /// Number of logarithmic radial bins
    #[serde(default = "default_bins")]
    pub bins: usize,
}

// Default values
fn default_name() -> String {
    "halos".to_string()
}

fn default_threshold() -> f64 {
    160.0
}

fn default_link() -> f64 {
    0.2
}

fn default_true() -> bool {
    true
}

fn default_num_neighbors() -> usize {
    65
}

fn default_safety() -> f64 {
    1.5
}

fn default_merge_ratio() -> f64 {
    0.5
}

fn default_sample() -> f64 {
    0.03
}

fn default_seed() -> u64 {
    1
}

fn default_fof_min_members() -> usize {
    10
}

fn default_overdensity() -> f64 {
    200.0
}

fn default_bins() -> usize {
    300
}

impl Default for VirialConfig {
    fn default() -> Self {
        Self {
            overdensity: default_overdensity(),
            bins: default_bins(),
        }
    }
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            method: FinderMethod::default(),
            threshold: default_threshold(),
            link: default_link(),
            dm_only: true,
            padding: 0.0,
            num_neighbors: default_num_neighbors(),
            safety: default_safety(),
            premerge: true,
            merge_ratio: default_merge_ratio(),
            rearrange: true,
            sample: default_sample(),
            fancy_padding: true,
            resize: true,
            subvolume: None,
            seed: default_seed(),
            hop: HopTuning::default(),
            fof_min_members: default_fof_min_members(),
            virial: VirialConfig::default(),
        }
    }
}

impl FinderConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &str) -> Result<Self, String> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;

        let config: FinderConfig = serde_json::from_str(&contents)
            .map_err(|e| format!("Failed to parse config JSON: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.method == FinderMethod::Hop && self.threshold <= 0.0 {
            return Err("HOP threshold must be positive".to_string());
        }
        if self.method == FinderMethod::Fof && self.link == 0.0 {
            return Err("FOF link must be non-zero".to_string());
        }
        if self.num_neighbors < 2 {
            return Err("num_neighbors must be at least 2".to_string());
        }
        if self.padding < 0.0 {
            return Err("padding must be non-negative".to_string());
        }
        if self.safety <= 0.0 {
            return Err("safety must be positive".to_string());
        }
        if !(self.sample > 0.0 && self.sample <= 1.0) {
            return Err("sample must be in range (0, 1]".to_string());
        }
        if !(self.merge_ratio > 0.0 && self.merge_ratio <= 1.0) {
            return Err("merge_ratio must be in range (0, 1]".to_string());
        }
        if self.hop.num_hop == 0 || self.hop.num_merge == 0 {
            return Err("num_hop and num_merge must be at least 1".to_string());
        }
        if self.hop.num_hop > self.num_neighbors || self.hop.num_merge > self.num_neighbors {
            return Err("num_hop and num_merge cannot exceed num_neighbors".to_string());
        }
        if self.virial.bins == 0 {
            return Err("virial bins must be at least 1".to_string());
        }
        if let Some(sub) = &self.subvolume {
            for d in 0..3 {
                if sub.min[d] >= sub.max[d] {
                    return Err(format!("Subvolume min must be less than max on axis {}", d));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config: FinderConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.method, FinderMethod::Hop);
        assert_eq!(config.num_neighbors, 65);
        assert!((config.threshold - 160.0).abs() < 1e-12);
        assert!((config.sample - 0.03).abs() < 1e-12);
        assert_eq!(config.hop.num_hop, 16);
        assert_eq!(config.virial.bins, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_overrides() {
        let json = r#"{"method": "Fof", "link": -0.01, "fancy_padding": false,
                       "subvolume": {"min": [0.0, 0.0, 0.0], "max": [0.5, 0.5, 0.5]}}"#;
        let config: FinderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.method, FinderMethod::Fof);
        assert!(!config.fancy_padding);
        assert!(config.subvolume.is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = FinderConfig::default();
        config.sample = 0.0;
        assert!(config.validate().is_err());

        config = FinderConfig::default();
        config.hop.num_hop = 100;
        assert!(config.validate().is_err());

        config = FinderConfig::default();
        config.subvolume = Some(BoxBounds {
            min: [0.5, 0.0, 0.0],
            max: [0.1, 1.0, 1.0],
        });
        assert!(config.validate().is_err());
    }
}
