//! R-tree backend over per-trajectory chains of bounding rectangles.
//!
//! Each trajectory is cut into runs of `mbr_points_per_rect` consecutive
//! points; each run's bounding rectangle, inflated by the GPS error margin,
//! is one R-tree entry keyed by `(trajectory id, ordinal)`.
//!
//! No query point can be closer to a candidate point than their rectangles
//! are to each other, which gives the distance measures an admissible bound
//! computed from the chains alone. Top-k search grows a radius around the
//! query rectangles, doubling every round.
//!
//! Persisted as `mbr.chains`, one rectangle per line:
//! `trajId;ordinal;minLat;minLon;maxLat;maxLon;count`.

use crate::error::{Result, SearchError};
use crate::geo_utils::{haversine_distance, point_rect_lower_bound, rect_distance_lower_bound, BOUND_SLACK};
use crate::pool::WorkerPool;
use crate::search::measures::{GeometricMeasure, GeometricScore, LowerBound};
use crate::search::{run_top_k, CandidateSource, QueryResult, Round};
use crate::storage;
use crate::{Bounds, Corpus, Point, SearchConfig, TrajectoryId};
use rstar::{RTree, RTreeObject, AABB};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

const CHAINS_FILE: &str = "mbr.chains";

/// One rectangle of a trajectory's chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainRect {
    pub ordinal: u32,
    pub bounds: Bounds,
    /// Points covered
    pub count: usize,
}

#[derive(Debug, Clone)]
struct RectEntry {
    trajectory_id: TrajectoryId,
    ordinal: u32,
    bounds: Bounds,
}

impl RTreeObject for RectEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        to_aabb(&self.bounds)
    }
}

fn to_aabb(b: &Bounds) -> AABB<[f64; 2]> {
    AABB::from_corners([b.min_lon, b.min_lat], [b.max_lon, b.max_lat])
}

/// Rectangles over runs of `per_rect` points, grown by `margin_m`.
pub fn build_chain(points: &[Point], per_rect: usize, margin_m: f64) -> Vec<ChainRect> {
    points
        .chunks(per_rect.max(1))
        .enumerate()
        .filter_map(|(ordinal, run)| {
            let bounds = Bounds::from_points(run)?;
            Some(ChainRect {
                ordinal: ordinal as u32,
                bounds: if margin_m > 0.0 { bounds.expand_meters(margin_m) } else { bounds },
                count: run.len(),
            })
        })
        .collect()
}

/// Admissible lower bound between a query chain and a candidate chain.
///
/// Every query point is paired with at least one candidate point, which
/// lies in one of the candidate's rectangles.
pub fn chain_bound(measure: GeometricMeasure, query: &[ChainRect], candidate: &[ChainRect]) -> f64 {
    let nearest = query.iter().map(|q| {
        let d = candidate
            .iter()
            .map(|c| rect_distance_lower_bound(&q.bounds, &c.bounds))
            .fold(f64::INFINITY, f64::min);
        if measure.sums_bounds() {
            d * q.count as f64
        } else {
            d
        }
    });
    measure.aggregate(nearest)
}

/// R-tree over the rectangle chains of a corpus.
pub struct MbrIndex {
    tree: RTree<RectEntry>,
    chains: HashMap<TrajectoryId, Vec<ChainRect>>,
    points_per_rect: usize,
    initial_radius_m: f64,
}

impl std::fmt::Debug for MbrIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MbrIndex")
            .field("trajectories", &self.chains.len())
            .field("rects", &self.tree.size())
            .field("points_per_rect", &self.points_per_rect)
            .finish()
    }
}

impl MbrIndex {
    /// Chain every trajectory in memory without touching disk.
    pub fn from_corpus(config: &SearchConfig, corpus: &Corpus, pool: &WorkerPool) -> Self {
        let per_rect = config.mbr_points_per_rect;
        let margin = config.gps_error_margin_m;
        let chains: HashMap<TrajectoryId, Vec<ChainRect>> = pool
            .map_bounded(corpus.iter(), |traj| (traj.id, build_chain(&traj.points, per_rect, margin)))
            .into_iter()
            .filter(|(_, chain)| !chain.is_empty())
            .collect();
        let index = Self::from_chains(chains, config);
        log::info!(
            "[MbrIndex] Built {} rectangles over {} trajectories",
            index.tree.size(),
            index.chains.len()
        );
        index
    }

    fn from_chains(chains: HashMap<TrajectoryId, Vec<ChainRect>>, config: &SearchConfig) -> Self {
        let entries: Vec<RectEntry> = chains
            .iter()
            .flat_map(|(&trajectory_id, chain)| {
                chain.iter().map(move |r| RectEntry {
                    trajectory_id,
                    ordinal: r.ordinal,
                    bounds: r.bounds,
                })
            })
            .collect();
        Self {
            tree: RTree::bulk_load(entries),
            chains,
            points_per_rect: config.mbr_points_per_rect,
            initial_radius_m: config.mbr_initial_radius_m,
        }
    }

    /// Build and persist, or load when already built.
    pub fn build(config: &SearchConfig, corpus: &Corpus, pool: &WorkerPool) -> Result<Self> {
        if let Some(index) = Self::load(config)? {
            log::info!("[MbrIndex] Already built in {:?}", config.index_dir);
            return Ok(index);
        }
        let index = Self::from_corpus(config, corpus, pool);
        index.persist(&config.index_dir)?;
        Ok(index)
    }

    fn path(dir: &Path) -> PathBuf {
        dir.join(CHAINS_FILE)
    }

    /// Write every chain, ordered by trajectory id and ordinal.
    pub fn persist(&self, dir: &Path) -> Result<()> {
        storage::ensure_dir(dir)?;
        let mut ordered: Vec<(&TrajectoryId, &Vec<ChainRect>)> = self.chains.iter().collect();
        ordered.sort_unstable_by_key(|(id, _)| **id);
        let lines = ordered.iter().flat_map(|(id, chain)| {
            chain.iter().map(move |r| {
                let b = &r.bounds;
                format!(
                    "{};{};{};{};{};{};{}",
                    id, r.ordinal, b.min_lat, b.min_lon, b.max_lat, b.max_lon, r.count
                )
            })
        });
        storage::write_lines(&Self::path(dir), lines)?;
        log::info!("[MbrIndex] Persisted {} chains to {:?}", ordered.len(), dir);
        Ok(())
    }

    /// Load persisted chains; `Ok(None)` when they have not been built.
    pub fn load(config: &SearchConfig) -> Result<Option<Self>> {
        let path = Self::path(&config.index_dir);
        if !storage::all_exist(&[&path]) {
            return Ok(None);
        }
        let mut chains: HashMap<TrajectoryId, Vec<ChainRect>> = HashMap::new();
        for (i, line) in storage::read_lines(&path)?.iter().enumerate() {
            let line_no = i + 1;
            let fields: Vec<&str> = line.split(storage::LIST_SEPARATOR).collect();
            if fields.len() != 7 {
                return Err(SearchError::malformed(
                    &path,
                    line_no,
                    format!("{} fields, expected 7", fields.len()),
                ));
            }
            let f = |k: usize| storage::parse_value::<f64>(fields[k], &path, line_no);
            let id: TrajectoryId = storage::parse_value(fields[0], &path, line_no)?;
            let rect = ChainRect {
                ordinal: storage::parse_value(fields[1], &path, line_no)?,
                bounds: Bounds::new(f(2)?, f(4)?, f(3)?, f(5)?),
                count: storage::parse_value(fields[6], &path, line_no)?,
            };
            chains.entry(id).or_default().push(rect);
        }
        for (id, chain) in chains.iter_mut() {
            chain.sort_by_key(|r| r.ordinal);
            check_chain(*id, chain, config.mbr_points_per_rect, &path)?;
        }
        let index = Self::from_chains(chains, config);
        log::info!(
            "[MbrIndex] Loaded {} rectangles over {} trajectories",
            index.tree.size(),
            index.chains.len()
        );
        Ok(Some(index))
    }

    pub fn trajectory_count(&self) -> usize {
        self.chains.len()
    }

    pub fn rect_count(&self) -> usize {
        self.tree.size()
    }

    pub fn chain(&self, id: TrajectoryId) -> Option<&[ChainRect]> {
        self.chains.get(&id).map(|c| c.as_slice())
    }

    /// Distance-measure top-k with doubling search radii.
    pub fn top_k(
        &self,
        corpus: &Corpus,
        query: &[Point],
        k: usize,
        measure: GeometricMeasure,
        max_rounds: u32,
    ) -> QueryResult {
        let score = GeometricScore::new(measure, query, corpus);
        let mut source = RadiusSource {
            index: self,
            measure,
            query_chain: build_chain(query, self.points_per_rect, 0.0),
            query_len: query.len(),
            radius: self.initial_radius_m,
        };
        run_top_k(&score, &mut source, k, max_rounds)
    }

    /// DTW top-k.
    pub fn top_k_dtw(&self, corpus: &Corpus, query: &[Point], k: usize, max_rounds: u32) -> QueryResult {
        self.top_k(corpus, query, k, GeometricMeasure::Dtw, max_rounds)
    }

    /// Trajectories with a point within `radius_m` meters of the coordinate, ascending.
    pub fn range_query(&self, corpus: &Corpus, lat: f64, lon: f64, radius_m: f64) -> Vec<TrajectoryId> {
        let search = to_aabb(&Bounds::from_coord(lat, lon).expand_meters(radius_m));
        let mut out = BTreeSet::new();
        for entry in self.tree.locate_in_envelope_intersecting(&search) {
            if out.contains(&entry.trajectory_id)
                || point_rect_lower_bound(lat, lon, &entry.bounds) > radius_m
            {
                continue;
            }
            let Some(traj) = corpus.get(entry.trajectory_id) else {
                continue;
            };
            let start = entry.ordinal as usize * self.points_per_rect;
            let end = (start + self.points_per_rect).min(traj.points.len());
            let hit = traj
                .points
                .get(start..end)
                .unwrap_or(&[])
                .iter()
                .any(|p| haversine_distance(lat, lon, p.lat, p.lon) <= radius_m);
            if hit {
                out.insert(entry.trajectory_id);
            }
        }
        out.into_iter().collect()
    }
}

/// Every rectangle but the last must cover exactly `per_rect` points.
fn check_chain(id: TrajectoryId, chain: &[ChainRect], per_rect: usize, path: &Path) -> Result<()> {
    let last = chain.len().saturating_sub(1);
    for (i, rect) in chain.iter().enumerate() {
        let full = i < last && rect.count != per_rect;
        if full || rect.count == 0 || rect.count > per_rect || rect.ordinal as usize != i {
            return Err(SearchError::malformed(
                path,
                0,
                format!(
                    "chain of trajectory {} does not match mbr_points_per_rect = {}",
                    id, per_rect
                ),
            ));
        }
    }
    Ok(())
}

// ============================================================================
// Radius source
// ============================================================================

/// Chain bound of a seen candidate.
#[derive(Debug, Clone, Copy)]
pub struct ChainEvidence {
    lower_bound: f64,
}

impl LowerBound for ChainEvidence {
    fn lower_bound(&self) -> f64 {
        self.lower_bound
    }
}

struct RadiusSource<'a> {
    index: &'a MbrIndex,
    measure: GeometricMeasure,
    query_chain: Vec<ChainRect>,
    query_len: usize,
    radius: f64,
}

impl CandidateSource for RadiusSource<'_> {
    type Evidence = ChainEvidence;

    fn name(&self) -> &'static str {
        "R-tree radius"
    }

    fn expand(&mut self, pool: &mut HashMap<TrajectoryId, ChainEvidence>) -> Round {
        let index = self.index;
        for q in &self.query_chain {
            let search = to_aabb(&q.bounds.expand_meters(self.radius));
            for entry in index.tree.locate_in_envelope_intersecting(&search) {
                if pool.contains_key(&entry.trajectory_id) {
                    continue;
                }
                let Some(chain) = index.chains.get(&entry.trajectory_id) else {
                    continue;
                };
                let lower_bound = chain_bound(self.measure, &self.query_chain, chain);
                pool.insert(entry.trajectory_id, ChainEvidence { lower_bound });
            }
        }
        log::debug!(
            "[MbrIndex] Radius {:.0}m reached {} of {} trajectories",
            self.radius,
            pool.len(),
            index.chains.len()
        );

        // Unseen rectangles lie beyond the radius from every query rectangle
        let per_point = self.radius * BOUND_SLACK;
        self.radius *= 2.0;
        if pool.len() >= index.chains.len() {
            Round::Exhausted
        } else if self.measure.sums_bounds() {
            Round::Partial {
                unseen_bound: per_point * self.query_len as f64,
            }
        } else {
            Round::Partial {
                unseen_bound: per_point,
            }
        }
    }
}
