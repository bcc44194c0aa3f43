//! Bound-pruned top-k search protocol shared by every backend.
//!
//! A query pairs one [`ScoreFn`] (what is measured) with one
//! [`CandidateSource`] (where evidence comes from) and runs:
//!
//! 1. **COLLECT**: the source merges one round of evidence into the candidate
//!    pool (one posting pass, one grid ring, one R-tree radius) and reports a
//!    bound covering every candidate it has not produced yet.
//! 2. **RANK**: unrefined candidates are ordered by [`ScoreFn::bound`], most
//!    promising first.
//! 3. **REFINE**: candidates are scored exactly, in rank order, with the
//!    current k-th best passed in for early abandonment.
//!
//! The loop stops once k results are held and neither the next ranked bound
//! nor the unseen bound can beat the k-th best. Every bound must be
//! admissible (never worse than the exact score it stands for), otherwise
//! results are silently wrong.

pub mod edge;
pub mod measures;
pub mod node;
pub mod ring;

use crate::{Hit, TrajectoryId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::{Duration, Instant};

/// Whether higher or lower scores are better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Maximize,
    Minimize,
}

impl Direction {
    /// `a` strictly beats `b`.
    #[inline]
    pub fn better(self, a: f64, b: f64) -> bool {
        match self {
            Direction::Maximize => a > b,
            Direction::Minimize => a < b,
        }
    }

    /// Score no candidate can be worse than.
    #[inline]
    pub fn worst(self) -> f64 {
        match self {
            Direction::Maximize => f64::NEG_INFINITY,
            Direction::Minimize => f64::INFINITY,
        }
    }

    /// Order with the best score first.
    fn rank(self, a: f64, b: f64) -> Ordering {
        match self {
            Direction::Maximize => b.total_cmp(&a),
            Direction::Minimize => a.total_cmp(&b),
        }
    }
}

/// One similarity measure, seen by the top-k loop.
pub trait ScoreFn {
    /// Per-candidate evidence accumulated by a [`CandidateSource`].
    type Evidence;

    fn direction(&self) -> Direction;

    /// Admissible bound on the exact score given the evidence so far: an
    /// upper bound when maximizing, a lower bound when minimizing.
    fn bound(&self, candidate: TrajectoryId, evidence: &Self::Evidence) -> f64;

    /// Exact score. May return early with a proven bound that is worse than
    /// `best_so_far`.
    fn exact(&self, candidate: TrajectoryId, evidence: &Self::Evidence, best_so_far: f64) -> f64;

    /// Heap comparator: `a` strictly beats `b`.
    fn better(&self, a: f64, b: f64) -> bool {
        self.direction().better(a, b)
    }
}

/// Outcome of one COLLECT round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Round {
    /// More rounds may produce candidates; none of them can score better
    /// than `unseen_bound`.
    Partial { unseen_bound: f64 },
    /// Every candidate has been produced.
    Exhausted,
}

/// Evidence producer for one backend.
pub trait CandidateSource {
    type Evidence;

    /// Label used in logs.
    fn name(&self) -> &'static str;

    /// Merge one round of evidence into `pool`.
    fn expand(&mut self, pool: &mut HashMap<TrajectoryId, Self::Evidence>) -> Round;

    /// Posting decode time charged so far.
    fn decode_time(&self) -> Duration {
        Duration::ZERO
    }
}

// ============================================================================
// Results
// ============================================================================

/// Diagnostics of one query. Collecting them never changes the result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryStats {
    /// Candidates that received evidence
    pub candidates: usize,
    /// Candidates scored exactly
    pub scanned: usize,
    /// COLLECT rounds run
    pub rounds: u32,
    /// Whether the round ceiling stopped the search
    pub round_ceiling_hit: bool,
    /// Time spent producing evidence, posting decode included
    pub lookup_time: Duration,
    /// Time spent decoding compressed postings
    pub decode_time: Duration,
    /// Time spent ranking and refining
    pub search_time: Duration,
}

/// Ranked hits, best first, with diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub hits: Vec<Hit>,
    pub stats: QueryStats,
}

impl QueryResult {
    /// Hit trajectory ids in rank order.
    pub fn ids(&self) -> Vec<TrajectoryId> {
        self.hits.iter().map(|h| h.trajectory_id).collect()
    }

    /// Hit scores in rank order.
    pub fn scores(&self) -> Vec<f64> {
        self.hits.iter().map(|h| h.score).collect()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

// ============================================================================
// Fixed-capacity heap
// ============================================================================

struct HeapEntry {
    score: f64,
    id: TrajectoryId,
    direction: Direction,
}

impl HeapEntry {
    /// `Greater` means worse; ties go against the larger id.
    fn worse_cmp(&self, other: &Self) -> Ordering {
        self.direction
            .rank(self.score, other.score)
            .then(self.id.cmp(&other.id))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.worse_cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.worse_cmp(other)
    }
}

/// The k best exact scores, worst on top.
pub(crate) struct TopK {
    k: usize,
    direction: Direction,
    heap: BinaryHeap<HeapEntry>,
}

impl TopK {
    pub(crate) fn new(k: usize, direction: Direction) -> Self {
        Self {
            k,
            direction,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.heap.len() >= self.k
    }

    /// k-th best score, or the worst possible score while not full.
    pub(crate) fn threshold(&self) -> f64 {
        match self.heap.peek() {
            Some(entry) if self.is_full() => entry.score,
            _ => self.direction.worst(),
        }
    }

    /// No candidate bounded by `bound` can enter the result.
    pub(crate) fn can_stop(&self, bound: f64) -> bool {
        self.is_full() && !self.direction.better(bound, self.threshold())
    }

    pub(crate) fn push(&mut self, id: TrajectoryId, score: f64) {
        self.heap.push(HeapEntry {
            score,
            id,
            direction: self.direction,
        });
        if self.heap.len() > self.k {
            self.heap.pop();
        }
    }

    pub(crate) fn into_hits(self) -> Vec<Hit> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|e| Hit {
                trajectory_id: e.id,
                score: e.score,
            })
            .collect()
    }
}

// ============================================================================
// Loop
// ============================================================================

/// Run COLLECT → RANK → REFINE until the k-th best cannot be beaten, the
/// source is exhausted, or `max_rounds` rounds ran.
pub fn run_top_k<S, C>(score_fn: &S, source: &mut C, k: usize, max_rounds: u32) -> QueryResult
where
    S: ScoreFn,
    C: CandidateSource<Evidence = S::Evidence>,
{
    let direction = score_fn.direction();
    let mut top = TopK::new(k, direction);
    let mut pool: HashMap<TrajectoryId, S::Evidence> = HashMap::new();
    let mut refined: HashSet<TrajectoryId> = HashSet::new();
    let mut stats = QueryStats::default();

    if k == 0 {
        return QueryResult {
            hits: Vec::new(),
            stats,
        };
    }

    loop {
        let started = Instant::now();
        let round = source.expand(&mut pool);
        stats.lookup_time += started.elapsed();
        stats.rounds += 1;

        let started = Instant::now();
        let mut ranked: Vec<(f64, TrajectoryId)> = pool
            .iter()
            .filter(|(id, _)| !refined.contains(*id))
            .map(|(id, evidence)| (score_fn.bound(*id, evidence), *id))
            .collect();
        ranked.sort_unstable_by(|a, b| direction.rank(a.0, b.0).then(a.1.cmp(&b.1)));

        for (bound, id) in ranked {
            if top.can_stop(bound) {
                break;
            }
            let Some(evidence) = pool.get(&id) else {
                continue;
            };
            let score = score_fn.exact(id, evidence, top.threshold());
            stats.scanned += 1;
            refined.insert(id);
            top.push(id, score);
        }
        stats.search_time += started.elapsed();

        match round {
            Round::Exhausted => break,
            Round::Partial { unseen_bound } if top.can_stop(unseen_bound) => break,
            Round::Partial { .. } => {}
        }
        if stats.rounds >= max_rounds {
            stats.round_ceiling_hit = true;
            log::error!(
                "[TopKEngine] {} search stopped at the {}-round ceiling with {} candidates, returning best so far",
                source.name(),
                max_rounds,
                pool.len()
            );
            break;
        }
    }

    stats.candidates = pool.len();
    stats.decode_time = source.decode_time();
    log::debug!(
        "[TopKEngine] {} search: {} rounds, {} candidates, {} scanned",
        source.name(),
        stats.rounds,
        stats.candidates,
        stats.scanned
    );
    QueryResult {
        hits: top.into_hits(),
        stats,
    }
}
