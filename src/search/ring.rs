//! Expanding-ring candidate source for the distance measures.
//!
//! Round `r` visits ring `r` around the tile of every query point. Once
//! rings `0..=r` have been visited for query point `i`, any corpus point not
//! yet found lies at least `r · min_tile_side` meters from it, because every
//! point is stored in its own tile. Each seen candidate keeps, per query
//! point, the nearest distance found so far; its bound folds
//! `min(nearest_i, unseen_i)` with the measure's aggregate.

use super::measures::{GeometricMeasure, LowerBound};
use super::{CandidateSource, Round};
use crate::geo_utils::point_distance;
use crate::grid::{SpatialGrid, TileId};
use crate::postings::{DecodeTimer, PostingStore};
use crate::{Corpus, Point, PointId, TrajectoryId};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Nearest found distance from each query point, plus the current bound.
#[derive(Debug, Clone)]
pub struct NearestEvidence {
    nearest: Vec<f64>,
    lower_bound: f64,
}

impl NearestEvidence {
    fn new(query_len: usize) -> Self {
        Self {
            nearest: vec![f64::INFINITY; query_len],
            lower_bound: 0.0,
        }
    }

    pub fn nearest(&self) -> &[f64] {
        &self.nearest
    }
}

impl LowerBound for NearestEvidence {
    fn lower_bound(&self) -> f64 {
        self.lower_bound
    }
}

/// Ring state of one query point.
struct Probe {
    /// Tile of the query point, `None` outside the grid
    center: Option<TileId>,
    /// Ring that covers the whole grid from `center`
    last_ring: u32,
    /// Corpus points already measured from this query point
    visited: HashSet<PointId>,
    /// Lower bound on the distance to any point not yet visited
    unseen: f64,
}

pub struct RingSource<'a> {
    measure: GeometricMeasure,
    query: &'a [Point],
    grid: &'a SpatialGrid,
    postings: &'a PostingStore,
    corpus: &'a Corpus,
    probes: Vec<Probe>,
    ring: u32,
    tile_side: f64,
    timer: DecodeTimer,
}

impl<'a> RingSource<'a> {
    pub fn new(
        measure: GeometricMeasure,
        query: &'a [Point],
        grid: &'a SpatialGrid,
        postings: &'a PostingStore,
        corpus: &'a Corpus,
    ) -> Self {
        let geometry = grid.geometry();
        let probes: Vec<Probe> = query
            .iter()
            .map(|q| {
                let center = geometry.tile_of(q.lat, q.lon);
                Probe {
                    center,
                    last_ring: center.map_or(0, |t| geometry.covering_ring(t)),
                    visited: HashSet::new(),
                    unseen: 0.0,
                }
            })
            .collect();
        let outside = probes.iter().filter(|p| p.center.is_none()).count();
        if outside > 0 {
            log::debug!(
                "[TopKEngine] {} of {} query points are outside the grid",
                outside,
                query.len()
            );
        }
        Self {
            measure,
            query,
            grid,
            postings,
            corpus,
            probes,
            ring: 0,
            tile_side: geometry.min_tile_side_m(),
            timer: DecodeTimer::new(),
        }
    }

    /// Rounds after which every query point's rings cover the whole grid.
    pub fn covering_rounds(&self) -> u32 {
        self.probes
            .iter()
            .filter(|p| p.center.is_some())
            .map(|p| p.last_ring + 1)
            .max()
            .unwrap_or(1)
    }

    fn visit_tile(
        &mut self,
        i: usize,
        tile: TileId,
        pool: &mut HashMap<TrajectoryId, NearestEvidence>,
    ) {
        let (grid, postings, corpus) = (self.grid, self.postings, self.corpus);
        let q = self.query[i];
        let query_len = self.query.len();
        for &point_id in grid.tile_members(tile) {
            if !self.probes[i].visited.insert(point_id) {
                continue;
            }
            let Some(point) = corpus.point(point_id) else {
                continue;
            };
            let d = point_distance(&q, point);
            for posting in postings.find_timed(point_id, &mut self.timer).iter() {
                let evidence = pool
                    .entry(posting.trajectory_id)
                    .or_insert_with(|| NearestEvidence::new(query_len));
                if d < evidence.nearest[i] {
                    evidence.nearest[i] = d;
                }
            }
        }
    }

    fn unseen_bound(&self) -> f64 {
        self.measure.aggregate(self.probes.iter().map(|p| p.unseen))
    }
}

impl CandidateSource for RingSource<'_> {
    type Evidence = NearestEvidence;

    fn name(&self) -> &'static str {
        "grid ring"
    }

    fn expand(&mut self, pool: &mut HashMap<TrajectoryId, NearestEvidence>) -> Round {
        let ring = self.ring;
        for i in 0..self.probes.len() {
            let Some(center) = self.probes[i].center else {
                continue;
            };
            if ring > self.probes[i].last_ring {
                continue;
            }
            let grid = self.grid;
            for tile in grid.find_ring(center, ring) {
                self.visit_tile(i, tile, pool);
            }
            let probe = &mut self.probes[i];
            probe.unseen = if ring >= probe.last_ring {
                f64::INFINITY
            } else {
                ring as f64 * self.tile_side
            };
        }
        self.ring += 1;

        for evidence in pool.values_mut() {
            let per_point = evidence
                .nearest
                .iter()
                .zip(&self.probes)
                .map(|(nearest, probe)| nearest.min(probe.unseen));
            evidence.lower_bound = self.measure.aggregate(per_point);
        }

        let done = self
            .probes
            .iter()
            .all(|p| p.center.is_none() || ring >= p.last_ring);
        if done {
            Round::Exhausted
        } else {
            Round::Partial {
                unseen_bound: self.unseen_bound(),
            }
        }
    }

    fn decode_time(&self) -> Duration {
        self.timer.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::{offset_latitude, offset_longitude};
    use crate::postings::PostingKind;
    use crate::{Trajectory, WorkerPool};

    /// Three short trajectories at increasing distance east of the query.
    fn fixture() -> (Corpus, SpatialGrid, PostingStore) {
        let mut trajectories = Vec::new();
        let mut next_id = 0i64;
        for (traj_id, east_m) in [(1, 0.0), (2, 120.0), (3, 400.0)] {
            let points = (0..4)
                .map(|i| {
                    next_id += 1;
                    let lat = offset_latitude(41.15, i as f64 * 20.0);
                    Point::new(next_id, lat, offset_longitude(lat, -8.61, east_m))
                })
                .collect();
            trajectories.push(Trajectory::new(traj_id, points));
        }
        let corpus = Corpus::new(trajectories);
        let pool = WorkerPool::new(1, 16).unwrap();
        let grid = SpatialGrid::build(&corpus, 15.0, &pool).unwrap();
        let postings = PostingStore::from_corpus(PostingKind::Node, &corpus, &pool);
        (corpus, grid, postings)
    }

    #[test]
    fn test_bounds_stay_below_exact_scores() {
        let (corpus, grid, postings) = fixture();
        let query = corpus.get(1).unwrap().points.clone();
        for measure in [GeometricMeasure::Dtw, GeometricMeasure::Hausdorff, GeometricMeasure::Frechet] {
            let mut source = RingSource::new(measure, &query, &grid, &postings, &corpus);
            let mut pool = HashMap::new();
            let mut previous_unseen = 0.0;
            loop {
                let round = source.expand(&mut pool);
                for (id, evidence) in &pool {
                    let exact = measure.score(&query, &corpus.get(*id).unwrap().points, f64::INFINITY);
                    assert!(
                        evidence.lower_bound() <= exact + 1e-9,
                        "{:?} bound {} exceeds exact {} for {}",
                        measure,
                        evidence.lower_bound(),
                        exact,
                        id
                    );
                }
                match round {
                    Round::Exhausted => break,
                    Round::Partial { unseen_bound } => {
                        assert!(unseen_bound >= previous_unseen);
                        for id in [1, 2, 3] {
                            if !pool.contains_key(&id) {
                                let exact =
                                    measure.score(&query, &corpus.get(id).unwrap().points, f64::INFINITY);
                                assert!(unseen_bound <= exact + 1e-9);
                            }
                        }
                        previous_unseen = unseen_bound;
                    }
                }
            }
            assert_eq!(pool.len(), 3);
        }
    }

    #[test]
    fn test_exhausted_bounds_are_nearest_distances() {
        let (corpus, grid, postings) = fixture();
        let query = corpus.get(1).unwrap().points.clone();
        let mut source = RingSource::new(GeometricMeasure::Hausdorff, &query, &grid, &postings, &corpus);
        let mut pool = HashMap::new();
        while source.expand(&mut pool) != Round::Exhausted {}
        let own = &pool[&1];
        assert!(own.nearest().iter().all(|&d| d == 0.0));
        assert!(pool[&3].lower_bound() > 390.0);
    }

    #[test]
    fn test_covering_rounds_reach_the_far_edge() {
        let (corpus, grid, postings) = fixture();
        let query = corpus.get(1).unwrap().points.clone();
        let source = RingSource::new(GeometricMeasure::Dtw, &query, &grid, &postings, &corpus);
        let g = grid.geometry();
        let expected = query
            .iter()
            .filter_map(|q| g.tile_of(q.lat, q.lon))
            .map(|t| g.covering_ring(t) + 1)
            .max()
            .unwrap();
        assert_eq!(source.covering_rounds(), expected);

        let mut source = RingSource::new(GeometricMeasure::Dtw, &query, &grid, &postings, &corpus);
        let mut pool = HashMap::new();
        let mut rounds = 0;
        loop {
            rounds += 1;
            if source.expand(&mut pool) == Round::Exhausted {
                break;
            }
        }
        assert_eq!(rounds, expected);
    }

    #[test]
    fn test_query_outside_grid_finds_nothing() {
        let (corpus, grid, postings) = fixture();
        let query = vec![Point::new(-1, 10.0, 10.0)];
        let mut source = RingSource::new(GeometricMeasure::Dtw, &query, &grid, &postings, &corpus);
        let mut pool = HashMap::new();
        assert_eq!(source.expand(&mut pool), Round::Exhausted);
        assert!(pool.is_empty());
    }
}
