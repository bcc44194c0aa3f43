//! # Trajectory Search
//!
//! Top-k trajectory similarity search over map-matched or raw GPS corpora.
//!
//! This library provides:
//! - A uniform spatial grid with expanding-ring lookup
//! - Node and edge inverted posting stores, plain or varint-compressed
//! - LCSS, EDR, DTW, Hausdorff, Fréchet and LORS scoring with early abandonment
//! - A bound-pruned top-k loop shared by the grid, posting and R-tree backends
//!
//! ## Features
//!
//! - **`parallel`** - Build indexes on a rayon thread pool (default)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use traj_search::{Corpus, Measure, Point, SearchConfig, TopKEngine, Trajectory};
//!
//! let trajectories = vec![
//!     Trajectory::new(1, vec![Point::new(1, 41.15, -8.61), Point::new(2, 41.151, -8.611)]),
//!     Trajectory::new(2, vec![Point::new(3, 41.16, -8.62), Point::new(4, 41.161, -8.621)]),
//! ];
//! let corpus = Corpus::new(trajectories);
//! let config = SearchConfig::with_index_dir("/tmp/traj-index");
//!
//! let engine = TopKEngine::build(config, corpus).unwrap();
//! let query = Trajectory::new(0, vec![Point::new(1, 41.15, -8.61), Point::new(2, 41.151, -8.611)]);
//! let result = engine.top_k(&query, 1, Measure::Dtw).unwrap();
//! println!("best match: {:?}", result.hits.first());
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, SearchError};

// Explicit configuration context
pub mod config;
pub use config::SearchConfig;

// Geographic utilities (distance, meter/degree conversion, rectangle bounds)
pub mod geo_utils;

// Bounded worker pool and sharded build maps
pub mod pool;
pub use pool::{ShardedMap, WorkerPool};

// Point and edge arenas standing in for the road network
pub mod graph;
pub use graph::RoadGraph;

// In-memory trajectory store
pub mod corpus;
pub use corpus::Corpus;

// Line-oriented index file helpers
pub(crate) mod storage;

// Posting list compression
pub mod codec;

// Uniform tile grid
pub mod grid;
pub use grid::{GridGeometry, SpatialGrid, TileId};

// Node and edge inverted indexes
pub mod postings;
pub use postings::{DecodeTimer, PostingKind, PostingStore};

// Scoring primitives
pub mod scoring;

// Bound-pruned top-k protocol and index backends
pub mod search;
pub use search::{
    edge::EdgeIndex, measures::GeometricMeasure, node::NodeIndex, CandidateSource, Direction,
    QueryResult, QueryStats, Round, ScoreFn,
};

// R-tree backend over bounding-rectangle chains
pub mod mbr;
pub use mbr::MbrIndex;

// Engine facade tying the backends together
pub mod engine;
pub use engine::TopKEngine;

// ============================================================================
// Core Types
// ============================================================================

/// Interned point identifier.
pub type PointId = i64;
/// Road edge identifier.
pub type EdgeId = i32;
/// Trajectory identifier.
pub type TrajectoryId = i32;
/// Key of a posting list: a point id, or an edge id widened to 64 bits.
pub type EntityId = i64;

/// A located point of a trajectory.
///
/// Two points are equal when they share coordinates; the id is the interned
/// handle for that coordinate pair.
///
/// # Example
/// ```
/// use traj_search::Point;
/// let a = Point::new(7, 41.15, -8.61);
/// let b = Point::new(9, 41.15, -8.61);
/// assert_eq!(a, b);
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Point {
    pub id: PointId,
    pub lat: f64,
    pub lon: f64,
}

impl Point {
    /// Create a new point.
    pub fn new(id: PointId, lat: f64, lon: f64) -> Self {
        Self { id, lat, lon }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && self.lat >= -90.0
            && self.lat <= 90.0
            && self.lon >= -180.0
            && self.lon <= 180.0
    }

    /// Exact bit-level key of the coordinate pair, with -0.0 folded onto 0.0.
    pub fn location_key(&self) -> (u64, u64) {
        location_key(self.lat, self.lon)
    }
}

pub(crate) fn location_key(lat: f64, lon: f64) -> (u64, u64) {
    let norm = |v: f64| if v == 0.0 { 0.0f64 } else { v };
    (norm(lat).to_bits(), norm(lon).to_bits())
}

impl PartialEq for Point {
    fn eq(&self, other: &Self) -> bool {
        self.location_key() == other.location_key()
    }
}

impl Eq for Point {}

impl std::hash::Hash for Point {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.location_key().hash(state);
    }
}

/// A road edge as traversed by one trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EdgeRef {
    pub id: EdgeId,
    /// Edge length in meters (global to the edge)
    pub length_m: f64,
    /// 1-based index within the owning trajectory (local to the trajectory)
    pub position: u32,
}

impl EdgeRef {
    pub fn new(id: EdgeId, length_m: f64, position: u32) -> Self {
        Self {
            id,
            length_m,
            position,
        }
    }
}

/// A trajectory as raw points, optionally with its calibrated edge sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    pub id: TrajectoryId,
    pub points: Vec<Point>,
    pub edges: Option<Vec<EdgeRef>>,
}

impl Trajectory {
    /// Create a trajectory from raw points.
    pub fn new(id: TrajectoryId, points: Vec<Point>) -> Self {
        Self {
            id,
            points,
            edges: None,
        }
    }

    /// Attach a calibrated edge sequence.
    pub fn with_edges(mut self, edges: Vec<EdgeRef>) -> Self {
        self.edges = Some(edges);
        self
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Calibrated edges, empty when the trajectory was never map matched.
    pub fn edge_slice(&self) -> &[EdgeRef] {
        self.edges.as_deref().unwrap_or(&[])
    }

    /// Bounding box of the points.
    pub fn bounds(&self) -> Option<Bounds> {
        Bounds::from_points(&self.points)
    }
}

/// "Trajectory visits this entity at this 1-based position."
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Posting {
    pub trajectory_id: TrajectoryId,
    pub position: u16,
}

impl Posting {
    pub fn new(trajectory_id: TrajectoryId, position: u16) -> Self {
        Self {
            trajectory_id,
            position,
        }
    }
}

/// Latitude/longitude rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl Bounds {
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Self {
        Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        }
    }

    /// Degenerate rectangle at one coordinate.
    pub fn from_coord(lat: f64, lon: f64) -> Self {
        Self::new(lat, lat, lon, lon)
    }

    /// Create bounds from points.
    pub fn from_points(points: &[Point]) -> Option<Self> {
        let mut iter = points.iter();
        let first = iter.next()?;
        let mut bounds = Self::from_coord(first.lat, first.lon);
        for p in iter {
            bounds.include(p.lat, p.lon);
        }
        Some(bounds)
    }

    /// Grow to cover a coordinate.
    pub fn include(&mut self, lat: f64, lon: f64) {
        self.min_lat = self.min_lat.min(lat);
        self.max_lat = self.max_lat.max(lat);
        self.min_lon = self.min_lon.min(lon);
        self.max_lon = self.max_lon.max(lon);
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }

    pub fn intersects(&self, other: &Bounds) -> bool {
        self.min_lat <= other.max_lat
            && other.min_lat <= self.max_lat
            && self.min_lon <= other.max_lon
            && other.min_lon <= self.max_lon
    }

    /// Rectangle grown by `meters` on every side.
    ///
    /// The longitude step is taken at the highest latitude of the grown
    /// rectangle, so any coordinate outside it is at least `meters` away
    /// from every coordinate inside `self`.
    pub fn expand_meters(&self, meters: f64) -> Bounds {
        let dlat = geo_utils::meters_to_lat_degrees(meters);
        let dlon = geo_utils::meters_to_lon_degrees(meters, (self.max_abs_lat() + dlat).min(89.9));
        Bounds::new(
            self.min_lat - dlat,
            self.max_lat + dlat,
            self.min_lon - dlon,
            self.max_lon + dlon,
        )
    }

    /// Largest absolute latitude inside the rectangle.
    pub fn max_abs_lat(&self) -> f64 {
        self.min_lat.abs().max(self.max_lat.abs())
    }
}

/// Similarity measure selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Measure {
    Lcss,
    Edr,
    Dtw,
    Hausdorff,
    Frechet,
    Lors,
}

impl Measure {
    /// Whether larger scores are better.
    pub fn direction(self) -> Direction {
        match self {
            Measure::Lcss | Measure::Lors => Direction::Maximize,
            _ => Direction::Minimize,
        }
    }
}

impl std::fmt::Display for Measure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Measure::Lcss => "LCSS",
            Measure::Edr => "EDR",
            Measure::Dtw => "DTW",
            Measure::Hausdorff => "Hausdorff",
            Measure::Frechet => "Frechet",
            Measure::Lors => "LORS",
        };
        f.write_str(name)
    }
}

/// One ranked result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub trajectory_id: TrajectoryId,
    pub score: f64,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_point_validation() {
        assert!(Point::new(1, 41.15, -8.61).is_valid());
        assert!(!Point::new(1, 91.0, 0.0).is_valid());
        assert!(!Point::new(1, 0.0, 181.0).is_valid());
        assert!(!Point::new(1, f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_point_identity_by_location() {
        let mut set = HashSet::new();
        set.insert(Point::new(1, 41.15, -8.61));
        set.insert(Point::new(2, 41.15, -8.61));
        set.insert(Point::new(3, 0.0, 0.0));
        set.insert(Point::new(4, -0.0, 0.0));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_bounds_from_points() {
        let points = vec![
            Point::new(1, 41.10, -8.70),
            Point::new(2, 41.20, -8.50),
            Point::new(3, 41.15, -8.60),
        ];
        let b = Bounds::from_points(&points).unwrap();
        assert_eq!(b.min_lat, 41.10);
        assert_eq!(b.max_lon, -8.50);
        assert!(b.contains(41.15, -8.6));
        assert!(!b.contains(41.25, -8.6));
        assert!(Bounds::from_points(&[]).is_none());
    }

    #[test]
    fn test_expand_meters_covers_offsets() {
        let b = Bounds::from_coord(41.15, -8.61).expand_meters(100.0);
        let north = geo_utils::offset_latitude(41.15, 99.0);
        let east = geo_utils::offset_longitude(41.15, -8.61, 99.0);
        assert!(b.contains(north, -8.61));
        assert!(b.contains(41.15, east));
    }

    #[test]
    fn test_measure_direction() {
        assert_eq!(Measure::Lcss.direction(), Direction::Maximize);
        assert_eq!(Measure::Lors.direction(), Direction::Maximize);
        assert_eq!(Measure::Frechet.direction(), Direction::Minimize);
    }
}
