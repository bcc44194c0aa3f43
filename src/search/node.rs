//! Grid + node posting backend.
//!
//! LCSS and EDR gather sparse matches in one posting pass: a corpus point
//! matches query point `i` when it lies within `epsilon` meters, and the
//! nine-probe grid insertion guarantees every such point is a member of the
//! query point's own tile. The distance measures expand grid rings through
//! [`RingSource`].

use super::measures::{EdrScore, GeometricMeasure, GeometricScore, LcssScore, MatchEvidence};
use super::ring::RingSource;
use super::{run_top_k, CandidateSource, QueryResult, Round};
use crate::error::{Result, SearchError};
use crate::geo_utils::{haversine_distance, point_distance, BOUND_SLACK};
use crate::grid::SpatialGrid;
use crate::postings::{DecodeTimer, PostingKind, PostingStore};
use crate::pool::WorkerPool;
use crate::{Bounds, Corpus, Point, SearchConfig, TrajectoryId};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

/// Spatial grid plus point posting lists.
#[derive(Debug)]
pub struct NodeIndex {
    grid: SpatialGrid,
    postings: PostingStore,
}

impl NodeIndex {
    /// Build and persist, or load when both parts already exist.
    pub fn build(config: &SearchConfig, corpus: &Corpus, pool: &WorkerPool) -> Result<Self> {
        let dir = config.index_dir.as_path();
        if let Some(index) = Self::load(dir)? {
            log::info!("[NodeIndex] Already built in {:?}", dir);
            return Ok(index);
        }
        let grid = match SpatialGrid::load(dir)? {
            Some(grid) => grid,
            None => {
                let grid = SpatialGrid::build(corpus, config.epsilon_meters, pool)
                    .ok_or(SearchError::EmptyCorpus)?;
                grid.persist(dir)?;
                grid
            }
        };
        let postings = PostingStore::build(dir, PostingKind::Node, corpus, pool)?;
        Ok(Self { grid, postings })
    }

    /// Load the plain form; `Ok(None)` when it has not been built.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        Self::open(dir, PostingStore::load)
    }

    /// Load with compressed postings; `Ok(None)` when they have not been built.
    pub fn load_compressed(dir: &Path) -> Result<Option<Self>> {
        Self::open(dir, PostingStore::load_compressed)
    }

    fn open<F>(dir: &Path, load_postings: F) -> Result<Option<Self>>
    where
        F: FnOnce(&Path, PostingKind) -> Result<Option<PostingStore>>,
    {
        let Some(grid) = SpatialGrid::load(dir)? else {
            return Ok(None);
        };
        let Some(postings) = load_postings(dir, PostingKind::Node)? else {
            return Ok(None);
        };
        Ok(Some(Self { grid, postings }))
    }

    pub fn grid(&self) -> &SpatialGrid {
        &self.grid
    }

    pub fn postings(&self) -> &PostingStore {
        &self.postings
    }

    /// Match threshold the grid was built with.
    pub fn epsilon(&self) -> f64 {
        self.grid.geometry().epsilon
    }

    // ------------------------------------------------------------------------
    // Top-k
    // ------------------------------------------------------------------------

    /// LCSS top-k. Only trajectories sharing at least one match are ranked.
    pub fn top_k_lcss(&self, corpus: &Corpus, query: &[Point], k: usize, max_rounds: u32) -> QueryResult {
        let score = LcssScore {
            query_len: query.len(),
            corpus,
        };
        let mut source = MatchSource::new(self, corpus, query, false);
        run_top_k(&score, &mut source, k, max_rounds)
    }

    /// EDR top-k over the whole corpus.
    pub fn top_k_edr(&self, corpus: &Corpus, query: &[Point], k: usize, max_rounds: u32) -> QueryResult {
        let score = EdrScore {
            query_len: query.len(),
            corpus,
        };
        let mut source = MatchSource::new(self, corpus, query, true);
        run_top_k(&score, &mut source, k, max_rounds)
    }

    /// DTW, Hausdorff or Fréchet top-k through expanding grid rings.
    ///
    /// `max_rounds` is raised to the rings needed to cover the grid from
    /// the query, so a valid query always reaches its exact answer.
    pub fn top_k_geometric(
        &self,
        corpus: &Corpus,
        query: &[Point],
        k: usize,
        measure: GeometricMeasure,
        max_rounds: u32,
    ) -> QueryResult {
        let score = GeometricScore::new(measure, query, corpus);
        let mut source = RingSource::new(measure, query, &self.grid, &self.postings, corpus);
        let covering = source.covering_rounds();
        if covering > max_rounds {
            log::debug!(
                "[NodeIndex] Raising the round ceiling from {} to {} covering rings",
                max_rounds,
                covering
            );
        }
        run_top_k(&score, &mut source, k, max_rounds.max(covering))
    }

    // ------------------------------------------------------------------------
    // Spatial filters
    // ------------------------------------------------------------------------

    /// Trajectories with a point within `radius_m` meters of the coordinate, ascending.
    pub fn range_query(&self, corpus: &Corpus, lat: f64, lon: f64, radius_m: f64) -> Vec<TrajectoryId> {
        let rect = Bounds::from_coord(lat, lon).expand_meters(radius_m / BOUND_SLACK);
        let hits = self.grid.find_range(&rect).into_iter().filter(|id| {
            corpus
                .point(*id)
                .is_some_and(|p| haversine_distance(lat, lon, p.lat, p.lon) <= radius_m)
        });
        self.trajectories_of(hits)
    }

    /// Trajectories with a point inside the rectangle, ascending.
    pub fn window_query(&self, corpus: &Corpus, window: &Bounds) -> Vec<TrajectoryId> {
        let hits = self
            .grid
            .find_range(window)
            .into_iter()
            .filter(|id| corpus.point(*id).is_some_and(|p| window.contains(p.lat, p.lon)));
        self.trajectories_of(hits)
    }

    fn trajectories_of(&self, points: impl Iterator<Item = crate::PointId>) -> Vec<TrajectoryId> {
        let mut out = BTreeSet::new();
        for id in points {
            out.extend(self.postings.find_relevant_trajectories(id));
        }
        out.into_iter().collect()
    }
}

// ============================================================================
// Match source
// ============================================================================

/// One posting pass over the query points. With `include_unmatched`, a
/// second round adds every trajectory without a match.
struct MatchSource<'a> {
    index: &'a NodeIndex,
    corpus: &'a Corpus,
    query: &'a [Point],
    include_unmatched: bool,
    round: u32,
    timer: DecodeTimer,
}

impl<'a> MatchSource<'a> {
    fn new(index: &'a NodeIndex, corpus: &'a Corpus, query: &'a [Point], include_unmatched: bool) -> Self {
        Self {
            index,
            corpus,
            query,
            include_unmatched,
            round: 0,
            timer: DecodeTimer::new(),
        }
    }

    fn collect_matches(&mut self, pool: &mut HashMap<TrajectoryId, MatchEvidence>) {
        let (index, corpus, query) = (self.index, self.corpus, self.query);
        let epsilon = index.epsilon();
        let mut outside = 0usize;
        for (i, q) in query.iter().enumerate() {
            if !index.grid.geometry().contains(q.lat, q.lon) {
                outside += 1;
                continue;
            }
            for &point_id in index.grid.find(q.lat, q.lon) {
                let Some(point) = corpus.point(point_id) else {
                    continue;
                };
                if point_distance(q, point) > epsilon {
                    continue;
                }
                for posting in index.postings.find_timed(point_id, &mut self.timer).iter() {
                    pool.entry(posting.trajectory_id)
                        .or_default()
                        .push(i as u32, posting.position as u32);
                }
            }
        }
        if outside > 0 {
            log::debug!(
                "[NodeIndex] {} of {} query points are outside the grid",
                outside,
                query.len()
            );
        }
    }
}

impl CandidateSource for MatchSource<'_> {
    type Evidence = MatchEvidence;

    fn name(&self) -> &'static str {
        "node posting"
    }

    fn expand(&mut self, pool: &mut HashMap<TrajectoryId, MatchEvidence>) -> Round {
        self.round += 1;
        if self.round == 1 {
            self.collect_matches(pool);
            if self.include_unmatched {
                // Unmatched trajectories score max(n, m) >= n
                return Round::Partial {
                    unseen_bound: self.query.len() as f64,
                };
            }
            return Round::Exhausted;
        }
        for &id in self.corpus.ids() {
            pool.entry(id).or_default();
        }
        Round::Exhausted
    }

    fn decode_time(&self) -> Duration {
        self.timer.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::{offset_latitude, offset_longitude};
    use crate::Trajectory;
    use tempfile::TempDir;

    fn line(id: i32, first_point: i64, east_m: f64, len: usize) -> Trajectory {
        let points = (0..len)
            .map(|i| {
                let lat = offset_latitude(41.15, i as f64 * 40.0);
                Point::new(first_point + i as i64, lat, offset_longitude(lat, -8.61, east_m))
            })
            .collect();
        Trajectory::new(id, points)
    }

    fn corpus() -> Corpus {
        Corpus::new(vec![
            line(1, 0, 0.0, 5),
            line(2, 100, 5.0, 5),
            line(3, 200, 300.0, 5),
            line(4, 300, 2.0, 2),
        ])
    }

    fn build(dir: &TempDir, corpus: &Corpus) -> NodeIndex {
        let config = SearchConfig::with_index_dir(dir.path());
        let pool = WorkerPool::new(2, 8).unwrap();
        NodeIndex::build(&config, corpus, &pool).unwrap()
    }

    #[test]
    fn test_load_before_build_is_not_built() {
        let dir = TempDir::new().unwrap();
        assert!(NodeIndex::load(dir.path()).unwrap().is_none());
        assert!(NodeIndex::load_compressed(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_lcss_ranks_nearby_lines_first() {
        let dir = TempDir::new().unwrap();
        let corpus = corpus();
        let index = build(&dir, &corpus);
        let query = corpus.get(1).unwrap().points.clone();
        let result = index.top_k_lcss(&corpus, &query, 3, 8);
        assert_eq!(result.ids()[..2], [1, 2]);
        assert_eq!(result.scores()[..2], [5.0, 5.0]);
        // Trajectory 3 never matches and is not a result
        assert!(!result.ids().contains(&3));
    }

    #[test]
    fn test_edr_includes_unmatched_when_needed() {
        let dir = TempDir::new().unwrap();
        let corpus = corpus();
        let index = build(&dir, &corpus);
        let query = corpus.get(1).unwrap().points.clone();
        let result = index.top_k_edr(&corpus, &query, 4, 8);
        assert_eq!(result.scores(), vec![0.0, 0.0, 3.0, 5.0]);
        assert_eq!(result.ids()[3], 3);
        assert_eq!(result.stats.rounds, 2);

        let top2 = index.top_k_edr(&corpus, &query, 2, 8);
        assert_eq!(top2.stats.rounds, 1);
    }

    #[test]
    fn test_distant_neighbour_beyond_default_ceiling() {
        let dir = TempDir::new().unwrap();
        let corpus = Corpus::new(vec![line(1, 0, 3000.0, 5), line(2, 100, 0.0, 5)]);
        let index = build(&dir, &corpus);
        let query = corpus.get(2).unwrap().points.clone();
        let ceiling = SearchConfig::default().max_ring_count;
        let result = index.top_k_geometric(&corpus, &query, 2, GeometricMeasure::Hausdorff, ceiling);
        assert_eq!(result.ids(), vec![2, 1]);
        assert!((result.scores()[1] - 3000.0).abs() < 1.0);
        assert!(!result.stats.round_ceiling_hit);
        assert!(result.stats.rounds > ceiling);
    }

    #[test]
    fn test_range_and_window_queries() {
        let dir = TempDir::new().unwrap();
        let corpus = corpus();
        let index = build(&dir, &corpus);
        assert_eq!(index.range_query(&corpus, 41.15, -8.61, 10.0), vec![1, 2, 4]);
        assert_eq!(index.range_query(&corpus, 41.15, -8.61, 1.0), vec![1]);
        let far = offset_longitude(41.15, -8.61, 300.0);
        assert_eq!(index.range_query(&corpus, 41.15, far, 1.0), vec![3]);

        let window = Bounds::new(41.149, 41.1505, -8.6101, far + 1e-6);
        assert_eq!(index.window_query(&corpus, &window), vec![1, 2, 3, 4]);
        let empty = Bounds::new(40.0, 40.1, -8.0, -7.9);
        assert!(index.window_query(&corpus, &empty).is_empty());
    }

    #[test]
    fn test_compressed_answers_match_plain() {
        let dir = TempDir::new().unwrap();
        let corpus = corpus();
        let plain = build(&dir, &corpus);
        let compressed = NodeIndex::load_compressed(dir.path()).unwrap().unwrap();
        assert!(compressed.postings().is_compressed());
        let query = corpus.get(2).unwrap().points.clone();
        let a = plain.top_k_edr(&corpus, &query, 3, 8);
        let b = compressed.top_k_edr(&corpus, &query, 3, 8);
        assert_eq!(a.hits, b.hits);
        assert!(b.stats.decode_time >= a.stats.decode_time);
    }
}
