//! Configuration module for segment vector indexing.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `SEGVEC_` and use double
//! underscores to separate nested levels:
//! - `SEGVEC_QUANTIZATION__MIN_DOCS=5000` sets `quantization.min_docs`
//! - `SEGVEC_SEARCH__PARALLEL_THREADS=8` sets `search.parallel_threads`
//! - `SEGVEC_LOGGING__LEVEL=debug` sets `logging.level`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{SegmentError, SegmentResult};

/// Directory searched for `settings.toml`.
const CONFIG_DIR: &str = ".segvec";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory holding segment files
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,

    /// k-means compaction at flush and merge time
    #[serde(default)]
    pub quantization: QuantizationConfig,

    /// Field-level projection defaults
    #[serde(default)]
    pub projection: ProjectionConfig,

    /// Point tree layout
    #[serde(default)]
    pub points: PointsConfig,

    /// Multi-segment search
    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct QuantizationConfig {
    /// Whether quantized stores are written at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum segment size (maxDoc) before quantization runs
    #[serde(default = "default_min_docs")]
    pub min_docs: u32,

    /// Number of k-means iterations
    #[serde(default = "default_iterations")]
    pub iterations: usize,

    /// Seed of the reservoir sampling that picks initial centroids
    #[serde(default = "default_quantization_seed")]
    pub seed: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ProjectionConfig {
    /// Projections used when a field does not set `projections`
    #[serde(default = "default_projections")]
    pub default_projections: usize,

    /// Hits per projection when a field does not set `top_hits`
    #[serde(default = "default_top_hits")]
    pub default_top_hits: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PointsConfig {
    /// Maximum number of points in one leaf of the point tree
    #[serde(default = "default_max_points_per_leaf")]
    pub max_points_per_leaf: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SearchConfig {
    /// Number of threads searching segments in parallel
    #[serde(default = "default_parallel_threads")]
    pub parallel_threads: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Max level: error, warn, info, debug or trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_index_path() -> PathBuf {
    PathBuf::from(".segvec/index")
}
fn default_true() -> bool {
    true
}
fn default_min_docs() -> u32 {
    1_000_000
}
fn default_iterations() -> usize {
    2
}
fn default_quantization_seed() -> u64 {
    42
}
fn default_projections() -> usize {
    4
}
fn default_top_hits() -> usize {
    10
}
fn default_max_points_per_leaf() -> usize {
    512
}
fn default_parallel_threads() -> usize {
    num_cpus::get()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            index_path: default_index_path(),
            quantization: QuantizationConfig::default(),
            projection: ProjectionConfig::default(),
            points: PointsConfig::default(),
            search: SearchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_docs: default_min_docs(),
            iterations: default_iterations(),
            seed: default_quantization_seed(),
        }
    }
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            default_projections: default_projections(),
            default_top_hits: default_top_hits(),
        }
    }
}

impl Default for PointsConfig {
    fn default() -> Self {
        Self {
            max_points_per_leaf: default_max_points_per_leaf(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            parallel_threads: default_parallel_threads(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> SegmentResult<Self> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join("settings.toml"));
        Self::load_from(config_path)
    }

    /// Load configuration from a specific file, still honoring env overrides
    pub fn load_from(path: impl AsRef<Path>) -> SegmentResult<Self> {
        Figment::new()
            // Start with defaults
            .merge(Serialized::defaults(Settings::default()))
            // Layer in config file if it exists
            .merge(Toml::file(path.as_ref()))
            // Double underscore separates nested levels, single underscore stays
            .merge(Env::prefixed("SEGVEC_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract::<Settings>()
            .map_err(|e| SegmentError::Config {
                reason: e.to_string(),
            })
            .and_then(Settings::validated)
    }

    /// Find `.segvec/settings.toml` from the current directory upwards
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(CONFIG_DIR);
            if config_dir.is_dir() {
                return Some(config_dir.join("settings.toml"));
            }
        }

        None
    }

    fn validated(self) -> SegmentResult<Self> {
        let invalid = |reason: &str| {
            Err(SegmentError::Config {
                reason: reason.to_string(),
            })
        };
        if self.quantization.iterations == 0 {
            return invalid("quantization.iterations must be at least 1");
        }
        if self.projection.default_projections == 0 {
            return invalid("projection.default_projections must be at least 1");
        }
        if self.projection.default_top_hits == 0 {
            return invalid("projection.default_top_hits must be at least 1");
        }
        if self.points.max_points_per_leaf == 0 {
            return invalid("points.max_points_per_leaf must be at least 1");
        }
        if self.search.parallel_threads == 0 {
            return invalid("search.parallel_threads must be at least 1");
        }
        Ok(self)
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> SegmentResult<()> {
        let path = path.as_ref();
        let write_error = |source| SegmentError::FileWrite {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }

        let toml_string = toml::to_string_pretty(self).map_err(|e| SegmentError::Config {
            reason: e.to_string(),
        })?;
        std::fs::write(path, toml_string).map_err(write_error)
    }
}
