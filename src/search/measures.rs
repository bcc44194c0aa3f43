//! One [`ScoreFn`] per similarity measure.
//!
//! Match-based measures (LCSS, EDR) score from the sparse matches gathered
//! by a posting pass. Distance measures read the candidate's points from the
//! corpus and take their bound from whatever evidence the backend keeps.
//! LORS scores from edge postings alone.

use super::{Direction, ScoreFn};
use crate::scoring::{dtw, frechet, hausdorff, lors, rest_distance, EdrMatches, LcssMatches};
use crate::{Corpus, EdgeRef, Point, TrajectoryId};

// ============================================================================
// Match evidence (LCSS, EDR)
// ============================================================================

/// `(query index, 1-based candidate position)` pairs found so far,
/// grouped by ascending query index.
#[derive(Debug, Clone, Default)]
pub struct MatchEvidence {
    pairs: Vec<(u32, u32)>,
    matched_rows: usize,
}

impl MatchEvidence {
    /// Record a match. Query indices must arrive in non-decreasing order.
    pub fn push(&mut self, query_index: u32, position: u32) {
        match self.pairs.last() {
            Some(&(last, _)) if last == query_index => {}
            _ => self.matched_rows += 1,
        }
        self.pairs.push((query_index, position));
    }

    /// Query indices with at least one match.
    pub fn matched_rows(&self) -> usize {
        self.matched_rows
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Matched positions per query index, `query_len` rows.
    pub fn rows(&self, query_len: usize) -> Vec<Vec<u32>> {
        let mut rows = vec![Vec::new(); query_len];
        for &(i, k) in &self.pairs {
            if let Some(row) = rows.get_mut(i as usize) {
                row.push(k);
            }
        }
        rows
    }
}

/// Longest common subsequence under the epsilon match predicate. Higher is better.
pub struct LcssScore<'a> {
    pub query_len: usize,
    pub corpus: &'a Corpus,
}

impl ScoreFn for LcssScore<'_> {
    type Evidence = MatchEvidence;

    fn direction(&self) -> Direction {
        Direction::Maximize
    }

    fn bound(&self, candidate: TrajectoryId, evidence: &MatchEvidence) -> f64 {
        let m = self.corpus.trajectory_len(candidate);
        self.query_len.min(m).min(evidence.matched_rows()) as f64
    }

    fn exact(&self, candidate: TrajectoryId, evidence: &MatchEvidence, _best_so_far: f64) -> f64 {
        let m = self.corpus.trajectory_len(candidate);
        let mut state = LcssMatches::new(self.query_len, m);
        for row in evidence.rows(self.query_len) {
            state.fold(&row);
        }
        state.score() as f64
    }
}

/// Edit distance on real sequences. Lower is better.
pub struct EdrScore<'a> {
    pub query_len: usize,
    pub corpus: &'a Corpus,
}

impl ScoreFn for EdrScore<'_> {
    type Evidence = MatchEvidence;

    fn direction(&self) -> Direction {
        Direction::Minimize
    }

    /// Every alignment pays at least one edit per query or candidate point
    /// beyond the matched ones.
    fn bound(&self, candidate: TrajectoryId, evidence: &MatchEvidence) -> f64 {
        let n = self.query_len;
        let m = self.corpus.trajectory_len(candidate);
        let matched = evidence.matched_rows().min(n).min(m);
        (n.max(m) - matched) as f64
    }

    fn exact(&self, candidate: TrajectoryId, evidence: &MatchEvidence, _best_so_far: f64) -> f64 {
        let m = self.corpus.trajectory_len(candidate);
        if evidence.is_empty() {
            return self.query_len.max(m) as f64;
        }
        let mut state = EdrMatches::new(self.query_len, m);
        for row in evidence.rows(self.query_len) {
            state.fold(&row);
        }
        state.distance() as f64
    }
}

// ============================================================================
// Distance measures (DTW, Hausdorff, Frechet)
// ============================================================================

/// Distance measures scored over full point sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometricMeasure {
    Dtw,
    Hausdorff,
    Frechet,
}

impl GeometricMeasure {
    /// Whether per-query-point bounds add up (DTW) or take the maximum.
    pub fn sums_bounds(self) -> bool {
        matches!(self, GeometricMeasure::Dtw)
    }

    /// Fold per-query-point lower bounds into a trajectory bound.
    pub fn aggregate(self, bounds: impl IntoIterator<Item = f64>) -> f64 {
        if self.sums_bounds() {
            bounds.into_iter().sum()
        } else {
            bounds.into_iter().fold(0.0, f64::max)
        }
    }

    pub fn score(self, query: &[Point], candidate: &[Point], best_so_far: f64) -> f64 {
        match self {
            GeometricMeasure::Dtw => dtw(query, candidate, best_so_far),
            GeometricMeasure::Hausdorff => hausdorff(query, candidate, best_so_far),
            GeometricMeasure::Frechet => frechet(query, candidate, best_so_far),
        }
    }
}

/// Evidence that already carries an admissible lower bound.
pub trait LowerBound {
    fn lower_bound(&self) -> f64;
}

/// Distance measure with the bound kept by the candidate source.
pub struct GeometricScore<'a, E> {
    pub measure: GeometricMeasure,
    pub query: &'a [Point],
    pub corpus: &'a Corpus,
    _evidence: std::marker::PhantomData<fn(&E)>,
}

impl<'a, E> GeometricScore<'a, E> {
    pub fn new(measure: GeometricMeasure, query: &'a [Point], corpus: &'a Corpus) -> Self {
        Self {
            measure,
            query,
            corpus,
            _evidence: std::marker::PhantomData,
        }
    }
}

impl<E: LowerBound> ScoreFn for GeometricScore<'_, E> {
    type Evidence = E;

    fn direction(&self) -> Direction {
        Direction::Minimize
    }

    fn bound(&self, _candidate: TrajectoryId, evidence: &E) -> f64 {
        evidence.lower_bound()
    }

    fn exact(&self, candidate: TrajectoryId, _evidence: &E, best_so_far: f64) -> f64 {
        match self.corpus.get(candidate) {
            Some(traj) => self.measure.score(self.query, &traj.points, best_so_far),
            None => f64::INFINITY,
        }
    }
}

// ============================================================================
// LORS
// ============================================================================

/// Candidate edges shared with the query, gathered from edge postings.
#[derive(Debug, Clone, Default)]
pub struct EdgeEvidence {
    /// Shared edges at their candidate positions, in arrival order
    edges: Vec<EdgeRef>,
    /// Summed length of the query edges with at least one posting
    overlap: f64,
    last_query_index: Option<usize>,
}

impl EdgeEvidence {
    /// Record that query edge `query_index` occurs at `position` in the
    /// candidate. Query indices must arrive in non-decreasing order.
    pub fn push(&mut self, query_index: usize, edge: &EdgeRef, position: u32) {
        if self.last_query_index != Some(query_index) {
            self.overlap += edge.length_m;
            self.last_query_index = Some(query_index);
        }
        self.edges.push(EdgeRef::new(edge.id, edge.length_m, position));
    }

    pub fn overlap(&self) -> f64 {
        self.overlap
    }

    /// The candidate's shared edges in traversal order.
    fn candidate_sequence(&self) -> Vec<EdgeRef> {
        let mut edges = self.edges.clone();
        edges.sort_by_key(|e| (e.position, e.id));
        edges.dedup_by_key(|e| (e.position, e.id));
        edges
    }
}

/// Longest overlapping road segments in meters. Higher is better.
pub struct LorsScore<'a> {
    query: &'a [EdgeRef],
    rest: Vec<f64>,
    total: f64,
}

impl<'a> LorsScore<'a> {
    pub fn new(query: &'a [EdgeRef]) -> Self {
        Self {
            query,
            rest: rest_distance(query),
            total: crate::scoring::lors::total_length(query),
        }
    }
}

impl ScoreFn for LorsScore<'_> {
    type Evidence = EdgeEvidence;

    fn direction(&self) -> Direction {
        Direction::Maximize
    }

    fn bound(&self, _candidate: TrajectoryId, evidence: &EdgeEvidence) -> f64 {
        evidence.overlap().min(self.total)
    }

    /// Edges the candidate does not share with the query never pair up, so
    /// the shared subsequence scores the same as the full one.
    fn exact(&self, _candidate: TrajectoryId, evidence: &EdgeEvidence, best_so_far: f64) -> f64 {
        let candidate = evidence.candidate_sequence();
        lors(self.query, &candidate, &self.rest, best_so_far)
    }
}
