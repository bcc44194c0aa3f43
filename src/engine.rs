//! # Top-k Engine
//!
//! Facade owning the corpus and every index backend:
//! - [`NodeIndex`]: grid + node postings, for LCSS, EDR and grid-ring
//!   DTW / Hausdorff / Fréchet, plus range and window queries
//! - [`EdgeIndex`]: edge postings, for LORS and path queries
//! - [`MbrIndex`]: R-tree over rectangle chains, for the distance measures
//!   and range queries
//!
//! Backends are built together by [`TopKEngine::build`] and persisted under
//! [`SearchConfig::index_dir`]. [`TopKEngine::load`] never builds: a backend
//! whose files are missing stays absent and queries needing it fail with
//! [`SearchError::NotBuilt`].

use std::path::Path;
use std::time::Instant;

use crate::error::{OptionExt, Result, SearchError};
use crate::geo_utils::point_distance;
use crate::mbr::MbrIndex;
use crate::pool::WorkerPool;
use crate::postings::{PostingKind, PostingStore};
use crate::scoring::{edr_dp, lcss_dp, lors, rest_distance};
use crate::search::edge::EdgeIndex;
use crate::search::measures::GeometricMeasure;
use crate::search::node::NodeIndex;
use crate::search::{QueryResult, QueryStats, TopK};
use crate::{Bounds, Corpus, EdgeId, Measure, Point, SearchConfig, Trajectory, TrajectoryId};

impl Measure {
    /// The distance-measure variant, `None` for match and edge measures.
    pub fn geometric(self) -> Option<GeometricMeasure> {
        match self {
            Measure::Dtw => Some(GeometricMeasure::Dtw),
            Measure::Hausdorff => Some(GeometricMeasure::Hausdorff),
            Measure::Frechet => Some(GeometricMeasure::Frechet),
            Measure::Lcss | Measure::Edr | Measure::Lors => None,
        }
    }
}

/// Corpus plus loaded index backends.
pub struct TopKEngine {
    config: SearchConfig,
    corpus: Corpus,
    node: Option<NodeIndex>,
    edge: Option<EdgeIndex>,
    mbr: Option<MbrIndex>,
}

impl TopKEngine {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Build every backend, loading the ones already persisted.
    pub fn build(config: SearchConfig, corpus: Corpus) -> Result<Self> {
        config.validate()?;
        if corpus.point_count() == 0 {
            return Err(SearchError::EmptyCorpus);
        }
        let started = Instant::now();
        let pool = WorkerPool::from_config(&config)?;
        let node = NodeIndex::build(&config, &corpus, &pool)?;
        let edge = EdgeIndex::build(&config, &corpus, &pool)?;
        let mbr = MbrIndex::build(&config, &corpus, &pool)?;
        log::info!(
            "[TopKEngine] Indexed {} trajectories in {:?} under {:?}",
            corpus.len(),
            started.elapsed(),
            config.index_dir
        );
        Ok(Self {
            config,
            corpus,
            node: Some(node),
            edge: Some(edge),
            mbr: Some(mbr),
        })
    }

    /// Open persisted backends with plain postings.
    ///
    /// Returns `Ok(None)` when nothing has been built under the index directory.
    pub fn load(config: SearchConfig, corpus: Corpus) -> Result<Option<Self>> {
        Self::open(config, corpus, false)
    }

    /// Open persisted backends with compressed postings.
    pub fn load_compressed(config: SearchConfig, corpus: Corpus) -> Result<Option<Self>> {
        Self::open(config, corpus, true)
    }

    fn open(config: SearchConfig, corpus: Corpus, compressed: bool) -> Result<Option<Self>> {
        config.validate()?;
        let dir = config.index_dir.as_path();
        let (node, edge) = if compressed {
            (NodeIndex::load_compressed(dir)?, EdgeIndex::load_compressed(dir)?)
        } else {
            (NodeIndex::load(dir)?, EdgeIndex::load(dir)?)
        };
        let mbr = MbrIndex::load(&config)?;
        if node.is_none() && edge.is_none() && mbr.is_none() {
            return Ok(None);
        }
        if let Some(node) = &node {
            if node.epsilon() != config.epsilon_meters {
                log::warn!(
                    "[TopKEngine] Grid was built with epsilon {}m, configuration says {}m; using the grid's",
                    node.epsilon(),
                    config.epsilon_meters
                );
            }
        }
        log::info!(
            "[TopKEngine] Opened {:?} (node: {}, edge: {}, mbr: {}, compressed: {})",
            dir,
            node.is_some(),
            edge.is_some(),
            mbr.is_some(),
            compressed
        );
        Ok(Some(Self {
            config,
            corpus,
            node,
            edge,
            mbr,
        }))
    }

    /// Write compressed posting files next to existing plain ones.
    ///
    /// Returns `false` when a plain store is missing.
    pub fn compress(index_dir: &Path) -> Result<bool> {
        let node = PostingStore::compress(index_dir, PostingKind::Node)?;
        let edge = PostingStore::compress(index_dir, PostingKind::Edge)?;
        log::info!(
            "[TopKEngine] Compressed postings in {:?} (node: {}, edge: {})",
            index_dir,
            node,
            edge
        );
        Ok(node && edge)
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn node_index(&self) -> Result<&NodeIndex> {
        self.node.as_ref().ok_or_not_built("node")
    }

    pub fn edge_index(&self) -> Result<&EdgeIndex> {
        self.edge.as_ref().ok_or_not_built("edge")
    }

    pub fn mbr_index(&self) -> Result<&MbrIndex> {
        self.mbr.as_ref().ok_or_not_built("mbr")
    }

    /// Match threshold in meters: the grid's when loaded.
    pub fn epsilon(&self) -> f64 {
        self.node.as_ref().map_or(self.config.epsilon_meters, |n| n.epsilon())
    }

    // ========================================================================
    // Top-k
    // ========================================================================

    /// The `k` trajectories most similar to `query` under `measure`, best first.
    pub fn top_k(&self, query: &Trajectory, k: usize, measure: Measure) -> Result<QueryResult> {
        validate_query(query, k, measure)?;
        let rounds = self.config.max_ring_count;
        let result = match measure {
            Measure::Lcss => self.node_index()?.top_k_lcss(&self.corpus, &query.points, k, rounds),
            Measure::Edr => self.node_index()?.top_k_edr(&self.corpus, &query.points, k, rounds),
            Measure::Lors => self.edge_index()?.top_k_lors(query.edge_slice(), k, rounds),
            Measure::Dtw | Measure::Hausdorff | Measure::Frechet => {
                let geometric = measure.geometric().ok_or_internal("distance measure")?;
                self.node_index()?
                    .top_k_geometric(&self.corpus, &query.points, k, geometric, rounds)
            }
        };
        log_result("grid", measure, &result);
        Ok(result)
    }

    /// Distance-measure top-k through the R-tree backend.
    pub fn top_k_mbr(&self, query: &Trajectory, k: usize, measure: Measure) -> Result<QueryResult> {
        validate_query(query, k, measure)?;
        let Some(geometric) = measure.geometric() else {
            return Err(SearchError::invalid_query(format!(
                "{} is not served by the R-tree backend",
                measure
            )));
        };
        let result = self.mbr_index()?.top_k(
            &self.corpus,
            &query.points,
            k,
            geometric,
            self.config.max_ring_count,
        );
        log_result("mbr", measure, &result);
        Ok(result)
    }

    /// Score every trajectory exactly, without any index.
    ///
    /// LCSS and EDR use the DP scorers under the same match rule as the
    /// grid: within epsilon meters, for query points inside the corpus
    /// bounding box. As with the indexed search, LCSS and LORS only rank
    /// trajectories with a positive score.
    pub fn scan_top_k(&self, query: &Trajectory, k: usize, measure: Measure) -> Result<QueryResult> {
        validate_query(query, k, measure)?;
        let started = Instant::now();
        let mut top = TopK::new(k, measure.direction());
        for traj in self.corpus.iter() {
            let score = self.exact_score(query, traj, measure);
            let keep = match measure {
                Measure::Lcss | Measure::Lors => score > 0.0,
                _ => true,
            };
            if keep {
                top.push(traj.id, score);
            }
        }
        let stats = QueryStats {
            candidates: self.corpus.len(),
            scanned: self.corpus.len(),
            rounds: 1,
            search_time: started.elapsed(),
            ..QueryStats::default()
        };
        Ok(QueryResult {
            hits: top.into_hits(),
            stats,
        })
    }

    fn exact_score(&self, query: &Trajectory, candidate: &Trajectory, measure: Measure) -> f64 {
        let epsilon = self.epsilon();
        let bounds = self.corpus.bounds();
        let q = &query.points;
        let c = &candidate.points;
        let is_match = |i: usize, j: usize| {
            bounds.is_some_and(|b| b.contains(q[i].lat, q[i].lon)) && point_distance(&q[i], &c[j]) <= epsilon
        };
        match measure {
            Measure::Lcss => lcss_dp(q.len(), c.len(), is_match) as f64,
            Measure::Edr => edr_dp(q.len(), c.len(), is_match) as f64,
            Measure::Lors => {
                let edges = query.edge_slice();
                lors(edges, candidate.edge_slice(), &rest_distance(edges), f64::NEG_INFINITY)
            }
            Measure::Dtw | Measure::Hausdorff | Measure::Frechet => measure
                .geometric()
                .map_or(f64::INFINITY, |g| g.score(q, c, f64::INFINITY)),
        }
    }

    // ========================================================================
    // Filters
    // ========================================================================

    /// Trajectories with a point within `radius_m` meters of the coordinate.
    pub fn range_query(&self, lat: f64, lon: f64, radius_m: f64) -> Result<Vec<TrajectoryId>> {
        validate_range(lat, lon, radius_m)?;
        Ok(self.node_index()?.range_query(&self.corpus, lat, lon, radius_m))
    }

    /// Same as [`range_query`](Self::range_query), answered by the R-tree.
    pub fn range_query_mbr(&self, lat: f64, lon: f64, radius_m: f64) -> Result<Vec<TrajectoryId>> {
        validate_range(lat, lon, radius_m)?;
        Ok(self.mbr_index()?.range_query(&self.corpus, lat, lon, radius_m))
    }

    /// Trajectories with a point inside `window`.
    pub fn window_query(&self, window: &Bounds) -> Result<Vec<TrajectoryId>> {
        if !(window.min_lat <= window.max_lat && window.min_lon <= window.max_lon) {
            return Err(SearchError::invalid_query("window corners are inverted"));
        }
        Ok(self.node_index()?.window_query(&self.corpus, window))
    }

    /// Trajectories traversing any edge of `path`.
    pub fn path_query(&self, path: &[EdgeId]) -> Result<Vec<TrajectoryId>> {
        Ok(self.edge_index()?.path_query(path))
    }

    /// Trajectories traversing all of `path` as consecutive edges.
    pub fn strict_path_query(&self, path: &[EdgeId]) -> Result<Vec<TrajectoryId>> {
        Ok(self.edge_index()?.strict_path_query(path))
    }
}

fn validate_query(query: &Trajectory, k: usize, measure: Measure) -> Result<()> {
    if k == 0 {
        return Err(SearchError::invalid_query("k must be at least 1"));
    }
    if measure == Measure::Lors {
        if query.edge_slice().is_empty() {
            return Err(SearchError::invalid_query(format!(
                "query {} has no calibrated edges for LORS",
                query.id
            )));
        }
        return Ok(());
    }
    if query.points.is_empty() {
        return Err(SearchError::invalid_query(format!("query {} has no points", query.id)));
    }
    if let Some(bad) = query.points.iter().find(|p| !p.is_valid()) {
        return Err(SearchError::invalid_query(format!(
            "query point {} has invalid coordinates ({}, {})",
            bad.id, bad.lat, bad.lon
        )));
    }
    Ok(())
}

fn validate_range(lat: f64, lon: f64, radius_m: f64) -> Result<()> {
    if !Point::new(0, lat, lon).is_valid() {
        return Err(SearchError::invalid_query(format!("invalid coordinate ({}, {})", lat, lon)));
    }
    if !(radius_m.is_finite() && radius_m >= 0.0) {
        return Err(SearchError::invalid_query("radius must be a non-negative number"));
    }
    Ok(())
}

fn log_result(backend: &str, measure: Measure, result: &QueryResult) {
    log::debug!(
        "[TopKEngine] {} {} query: {} hits, {} of {} candidates scanned, lookup {:?}, decode {:?}, search {:?}",
        backend,
        measure,
        result.hits.len(),
        result.stats.scanned,
        result.stats.candidates,
        result.stats.lookup_time,
        result.stats.decode_time,
        result.stats.search_time
    );
}
