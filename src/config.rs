//! Explicit configuration passed into every index and query constructor.

use crate::error::{Result, SearchError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for index construction and top-k search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Directory holding every persisted index file.
    /// Default: "index"
    pub index_dir: PathBuf,

    /// Grid tile side and match threshold in meters.
    /// Default: 15.0 meters
    pub epsilon_meters: f64,

    /// Hard ceiling on expansion rounds (R-tree radii, posting rounds).
    /// Reaching it is logged as an error and the best-so-far result is returned.
    /// Grid ring searches always run until their rings cover the grid.
    /// Default: 64
    pub max_ring_count: u32,

    /// Consecutive points covered by one bounding rectangle.
    /// Default: 10
    pub mbr_points_per_rect: usize,

    /// Margin added around every bounding rectangle, in meters.
    /// Default: 0.5 meters
    pub gps_error_margin_m: f64,

    /// Search radius of the first R-tree round, doubled every round.
    /// Default: 100.0 meters
    pub mbr_initial_radius_m: f64,

    /// Worker threads for index builds (0 = one per core).
    /// Default: 0
    pub build_threads: usize,

    /// Items handed to the worker pool per batch; the producer blocks
    /// until a batch is done.
    /// Default: 100_000
    pub build_queue_capacity: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            index_dir: PathBuf::from("index"),
            epsilon_meters: 15.0,
            max_ring_count: 64,
            mbr_points_per_rect: 10,
            gps_error_margin_m: 0.5,
            mbr_initial_radius_m: 100.0,
            build_threads: 0,
            build_queue_capacity: 100_000,
        }
    }
}

impl SearchConfig {
    /// Configuration rooted at `index_dir` with every other field defaulted.
    pub fn with_index_dir(index_dir: impl Into<PathBuf>) -> Self {
        Self {
            index_dir: index_dir.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SearchConfig =
            serde_json::from_str(json).map_err(|e| SearchError::ConfigError {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the indexes cannot work with.
    pub fn validate(&self) -> Result<()> {
        let fail = |message: &str| {
            Err(SearchError::ConfigError {
                message: message.to_string(),
            })
        };
        if !(self.epsilon_meters.is_finite() && self.epsilon_meters > 0.0) {
            return fail("epsilon_meters must be a positive number");
        }
        if self.mbr_points_per_rect == 0 {
            return fail("mbr_points_per_rect must be at least 1");
        }
        if !(self.gps_error_margin_m.is_finite() && self.gps_error_margin_m >= 0.0) {
            return fail("gps_error_margin_m must be non-negative");
        }
        if !(self.mbr_initial_radius_m.is_finite() && self.mbr_initial_radius_m > 0.0) {
            return fail("mbr_initial_radius_m must be a positive number");
        }
        if self.build_queue_capacity == 0 {
            return fail("build_queue_capacity must be at least 1");
        }
        if self.max_ring_count == 0 {
            return fail("max_ring_count must be at least 1");
        }
        Ok(())
    }
}
