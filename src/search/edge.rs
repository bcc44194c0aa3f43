//! Edge posting backend: LORS top-k and path queries over calibrated
//! trajectories.

use super::measures::{EdgeEvidence, LorsScore};
use super::{run_top_k, CandidateSource, QueryResult, Round};
use crate::error::Result;
use crate::pool::WorkerPool;
use crate::postings::{DecodeTimer, PostingKind, PostingStore};
use crate::{Corpus, EdgeId, EdgeRef, EntityId, Posting, SearchConfig, TrajectoryId};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

/// Edge id → trajectories traversing it, with their edge positions.
#[derive(Debug)]
pub struct EdgeIndex {
    postings: PostingStore,
}

impl EdgeIndex {
    /// Build and persist, or load when already built.
    pub fn build(config: &SearchConfig, corpus: &Corpus, pool: &WorkerPool) -> Result<Self> {
        let postings = PostingStore::build(&config.index_dir, PostingKind::Edge, corpus, pool)?;
        Ok(Self { postings })
    }

    /// Load the plain form; `Ok(None)` when it has not been built.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        Ok(PostingStore::load(dir, PostingKind::Edge)?.map(|postings| Self { postings }))
    }

    /// Load the compressed form; `Ok(None)` when it has not been built.
    pub fn load_compressed(dir: &Path) -> Result<Option<Self>> {
        Ok(PostingStore::load_compressed(dir, PostingKind::Edge)?.map(|postings| Self { postings }))
    }

    pub fn postings(&self) -> &PostingStore {
        &self.postings
    }

    /// LORS top-k. Only trajectories sharing at least one edge are ranked.
    pub fn top_k_lors(&self, query: &[EdgeRef], k: usize, max_rounds: u32) -> QueryResult {
        let score = LorsScore::new(query);
        let mut source = EdgeSource {
            postings: &self.postings,
            query,
            done: false,
            timer: DecodeTimer::new(),
        };
        run_top_k(&score, &mut source, k, max_rounds)
    }

    /// Distinct trajectories traversing the edge, ascending.
    pub fn relevant_trajectories(&self, edge: EdgeId) -> Vec<TrajectoryId> {
        self.postings.find_relevant_trajectories(edge as EntityId)
    }

    /// Trajectories traversing any edge of the path, ascending.
    pub fn path_query(&self, path: &[EdgeId]) -> Vec<TrajectoryId> {
        let mut out = BTreeSet::new();
        for &edge in path {
            out.extend(self.relevant_trajectories(edge));
        }
        out.into_iter().collect()
    }

    /// Trajectories traversing the whole path as consecutive edges, ascending.
    pub fn strict_path_query(&self, path: &[EdgeId]) -> Vec<TrajectoryId> {
        let Some((&first, rest)) = path.split_first() else {
            return Vec::new();
        };
        let following: Vec<Vec<Posting>> = rest
            .iter()
            .map(|&edge| self.postings.find(edge as EntityId))
            .collect();
        if following.iter().any(|list| list.is_empty()) {
            return Vec::new();
        }

        let mut out = BTreeSet::new();
        for start in self.postings.find(first as EntityId) {
            let continues = following.iter().enumerate().all(|(offset, list)| {
                u16::try_from(offset + 1)
                    .ok()
                    .and_then(|step| start.position.checked_add(step))
                    .is_some_and(|position| {
                        list.binary_search(&Posting::new(start.trajectory_id, position)).is_ok()
                    })
            });
            if continues {
                out.insert(start.trajectory_id);
            }
        }
        out.into_iter().collect()
    }
}

/// One posting pass over the query edges.
struct EdgeSource<'a> {
    postings: &'a PostingStore,
    query: &'a [EdgeRef],
    done: bool,
    timer: DecodeTimer,
}

impl CandidateSource for EdgeSource<'_> {
    type Evidence = EdgeEvidence;

    fn name(&self) -> &'static str {
        "edge posting"
    }

    fn expand(&mut self, pool: &mut HashMap<TrajectoryId, EdgeEvidence>) -> Round {
        if !self.done {
            let postings = self.postings;
            for (i, edge) in self.query.iter().enumerate() {
                for posting in postings.find_timed(edge.id as EntityId, &mut self.timer).iter() {
                    pool.entry(posting.trajectory_id)
                        .or_default()
                        .push(i, edge, posting.position as u32);
                }
            }
            self.done = true;
        }
        Round::Exhausted
    }

    fn decode_time(&self) -> Duration {
        self.timer.elapsed()
    }
}
