//! Inverted posting stores.
//!
//! A store maps an entity (a point for [`PostingKind::Node`], a road edge for
//! [`PostingKind::Edge`]) to every `(trajectory, position)` visiting it,
//! sorted by trajectory id and then position.
//!
//! Persisted files under the index directory, for `<kind>` = `node` | `edge`:
//! - `<kind>.ids`: entity ids, ascending, one per line
//! - `<kind>.traj`: trajectory ids per entity, `;`-delimited, same line order
//! - `<kind>.pos`: positions per entity, `;`-delimited, same line order
//! - `<kind>.counts`: posting count per entity, same line order
//! - `<kind>.bin`: compressed blocks, sentinel terminated, same order
//!
//! The compressed form decodes blocks on demand; the time spent decoding is
//! reported through [`DecodeTimer`], separately from search time.

use crate::codec::{self, BlockIndex};
use crate::error::{Result, SearchError};
use crate::pool::{ShardedMap, WorkerPool};
use crate::storage;
use crate::{Corpus, EntityId, Posting, Trajectory, TrajectoryId};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Which entity sequence of a trajectory is indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PostingKind {
    /// Point ids, positions index `Trajectory::points`
    Node,
    /// Edge ids, positions are `EdgeRef::position`
    Edge,
}

impl PostingKind {
    pub fn file_prefix(self) -> &'static str {
        match self {
            PostingKind::Node => "node",
            PostingKind::Edge => "edge",
        }
    }

    /// `(entity, 1-based position)` pairs of a trajectory.
    fn entities(self, traj: &Trajectory) -> Vec<(EntityId, u32)> {
        match self {
            PostingKind::Node => traj
                .points
                .iter()
                .enumerate()
                .map(|(i, p)| (p.id, i as u32 + 1))
                .collect(),
            PostingKind::Edge => traj
                .edge_slice()
                .iter()
                .map(|e| (e.id as EntityId, e.position))
                .collect(),
        }
    }
}

impl std::fmt::Display for PostingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_prefix())
    }
}

/// Paths of one store's files.
#[derive(Debug, Clone)]
pub struct PostingFiles {
    pub ids: PathBuf,
    pub trajectories: PathBuf,
    pub positions: PathBuf,
    pub counts: PathBuf,
    pub blob: PathBuf,
}

impl PostingFiles {
    pub fn new(dir: &Path, kind: PostingKind) -> Self {
        let prefix = kind.file_prefix();
        Self {
            ids: dir.join(format!("{}.ids", prefix)),
            trajectories: dir.join(format!("{}.traj", prefix)),
            positions: dir.join(format!("{}.pos", prefix)),
            counts: dir.join(format!("{}.counts", prefix)),
            blob: dir.join(format!("{}.bin", prefix)),
        }
    }

    pub fn plain_exists(&self) -> bool {
        storage::all_exist(&[&self.ids, &self.trajectories, &self.positions])
    }

    pub fn compressed_exists(&self) -> bool {
        storage::all_exist(&[&self.ids, &self.counts, &self.blob])
    }
}

/// Decode time charged to one query.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecodeTimer {
    elapsed: Duration,
    blocks: usize,
}

impl DecodeTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Number of blocks decoded.
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    fn record(&mut self, elapsed: Duration) {
        self.elapsed += elapsed;
        self.blocks += 1;
    }
}

enum Backing {
    Plain(HashMap<EntityId, Vec<Posting>>),
    Compressed { blob: Vec<u8>, index: BlockIndex },
}

/// Entity id → postings sorted by trajectory id.
pub struct PostingStore {
    kind: PostingKind,
    /// Entity ids, ascending
    ids: Vec<EntityId>,
    backing: Backing,
}

impl std::fmt::Debug for PostingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostingStore")
            .field("kind", &self.kind)
            .field("entities", &self.ids.len())
            .field("compressed", &self.is_compressed())
            .finish()
    }
}

impl PostingStore {
    /// Index a corpus in memory without touching disk.
    pub fn from_corpus(kind: PostingKind, corpus: &Corpus, pool: &WorkerPool) -> Self {
        let shared: ShardedMap<EntityId, Vec<Posting>> = ShardedMap::default();

        pool.for_each_bounded(corpus.iter(), |traj| {
            for (entity, position) in kind.entities(traj) {
                let Ok(position) = u16::try_from(position) else {
                    log::warn!(
                        "[PostingStore] Trajectory {} is longer than {} {}s, truncating",
                        traj.id,
                        u16::MAX,
                        kind
                    );
                    break;
                };
                shared.update(entity, |list| list.push(Posting::new(traj.id, position)));
            }
        });

        let mut lists = shared.into_inner();
        for list in lists.values_mut() {
            list.sort_unstable();
        }
        let mut ids: Vec<EntityId> = lists.keys().copied().collect();
        ids.sort_unstable();

        log::info!(
            "[PostingStore] Indexed {} {} entities from {} trajectories",
            ids.len(),
            kind,
            corpus.len()
        );
        Self {
            kind,
            ids,
            backing: Backing::Plain(lists),
        }
    }

    /// Build and persist, or load the plain store when it already exists.
    pub fn build(dir: &Path, kind: PostingKind, corpus: &Corpus, pool: &WorkerPool) -> Result<Self> {
        if let Some(store) = Self::load(dir, kind)? {
            log::info!("[PostingStore] {} index already built in {:?}", kind, dir);
            return Ok(store);
        }
        let store = Self::from_corpus(kind, corpus, pool);
        store.persist(dir)?;
        Ok(store)
    }

    pub fn kind(&self) -> PostingKind {
        self.kind
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self.backing, Backing::Compressed { .. })
    }

    pub fn entity_count(&self) -> usize {
        self.ids.len()
    }

    /// Indexed entity ids, ascending.
    pub fn entity_ids(&self) -> &[EntityId] {
        &self.ids
    }

    /// Postings of an entity, empty when it has none.
    pub fn find(&self, id: EntityId) -> Vec<Posting> {
        let mut timer = DecodeTimer::new();
        self.find_timed(id, &mut timer).into_owned()
    }

    /// Postings of an entity, charging decode time to `timer`.
    pub fn find_timed(&self, id: EntityId, timer: &mut DecodeTimer) -> Cow<'_, [Posting]> {
        match &self.backing {
            Backing::Plain(lists) => Cow::Borrowed(lists.get(&id).map_or(&[][..], |l| l.as_slice())),
            Backing::Compressed { blob, index } => {
                let Some(range) = index.get(id) else {
                    return Cow::Borrowed(&[]);
                };
                let start = Instant::now();
                let decoded = codec::decode_block(&blob[range.start..range.end], range.count as usize);
                timer.record(start.elapsed());
                match decoded {
                    Ok(postings) => Cow::Owned(postings),
                    Err(e) => {
                        log::warn!(
                            "[PostingStore] Corrupt {} block for entity {}: {}",
                            self.kind,
                            id,
                            e
                        );
                        Cow::Borrowed(&[])
                    }
                }
            }
        }
    }

    /// Distinct trajectories visiting an entity, ascending.
    pub fn find_relevant_trajectories(&self, id: EntityId) -> Vec<TrajectoryId> {
        let mut ids: Vec<TrajectoryId> = self.find(id).iter().map(|p| p.trajectory_id).collect();
        ids.dedup();
        ids
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Write the plain and compressed files. Only a plain store can persist.
    pub fn persist(&self, dir: &Path) -> Result<()> {
        let Backing::Plain(lists) = &self.backing else {
            return Err(SearchError::Internal {
                message: format!("{} store is compressed and read-only", self.kind),
            });
        };
        storage::ensure_dir(dir)?;
        let files = PostingFiles::new(dir, self.kind);
        let ordered: Vec<&[Posting]> = self
            .ids
            .iter()
            .map(|id| lists.get(id).map_or(&[][..], |l| l.as_slice()))
            .collect();

        storage::write_lines(&files.ids, self.ids.iter().map(|id| id.to_string()))?;
        storage::write_lines(
            &files.trajectories,
            ordered.iter().map(|l| storage::join_list(l.iter().map(|p| p.trajectory_id))),
        )?;
        storage::write_lines(
            &files.positions,
            ordered.iter().map(|l| storage::join_list(l.iter().map(|p| p.position))),
        )?;
        write_compressed(&files, &ordered)?;

        log::info!(
            "[PostingStore] Persisted {} {} entities to {:?}",
            self.ids.len(),
            self.kind,
            dir
        );
        Ok(())
    }

    /// Load the plain form; `Ok(None)` when it has not been built.
    pub fn load(dir: &Path, kind: PostingKind) -> Result<Option<Self>> {
        let files = PostingFiles::new(dir, kind);
        if !files.plain_exists() {
            return Ok(None);
        }
        let ids = read_ids(&files.ids)?;
        let traj_lines = storage::read_lines(&files.trajectories)?;
        let pos_lines = storage::read_lines(&files.positions)?;
        if traj_lines.len() != ids.len() || pos_lines.len() != ids.len() {
            return Err(SearchError::malformed(
                &files.trajectories,
                traj_lines.len().min(pos_lines.len()),
                format!(
                    "{} ids, {} trajectory lines, {} position lines",
                    ids.len(),
                    traj_lines.len(),
                    pos_lines.len()
                ),
            ));
        }

        let mut lists = HashMap::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            let line = i + 1;
            let trajs: Vec<TrajectoryId> = storage::parse_list(&traj_lines[i], &files.trajectories, line)?;
            let positions: Vec<u16> = storage::parse_list(&pos_lines[i], &files.positions, line)?;
            if trajs.len() != positions.len() {
                return Err(SearchError::malformed(
                    &files.positions,
                    line,
                    format!("{} trajectory ids but {} positions", trajs.len(), positions.len()),
                ));
            }
            let list = trajs
                .into_iter()
                .zip(positions)
                .map(|(t, p)| Posting::new(t, p))
                .collect();
            lists.insert(*id, list);
        }

        log::info!("[PostingStore] Loaded {} {} entities from {:?}", ids.len(), kind, dir);
        Ok(Some(Self {
            kind,
            ids,
            backing: Backing::Plain(lists),
        }))
    }

    /// Load the compressed form; `Ok(None)` when it has not been built.
    pub fn load_compressed(dir: &Path, kind: PostingKind) -> Result<Option<Self>> {
        let files = PostingFiles::new(dir, kind);
        if !files.compressed_exists() {
            return Ok(None);
        }
        let ids = read_ids(&files.ids)?;
        let counts: Vec<u32> = storage::read_lines(&files.counts)?
            .iter()
            .enumerate()
            .map(|(i, line)| storage::parse_value(line, &files.counts, i + 1))
            .collect::<Result<_>>()?;
        let blob = storage::read_bytes(&files.blob)?;
        let index = BlockIndex::build(&blob, &ids, &counts);

        log::info!(
            "[PostingStore] Opened compressed {} store: {} blocks, {} bytes",
            kind,
            index.len(),
            blob.len()
        );
        Ok(Some(Self {
            kind,
            ids,
            backing: Backing::Compressed { blob, index },
        }))
    }

    /// Write the compressed files from an existing plain store.
    ///
    /// Returns `false` when the plain store has not been built.
    pub fn compress(dir: &Path, kind: PostingKind) -> Result<bool> {
        let Some(store) = Self::load(dir, kind)? else {
            return Ok(false);
        };
        let Backing::Plain(lists) = &store.backing else {
            return Ok(false);
        };
        let ordered: Vec<&[Posting]> = store
            .ids
            .iter()
            .map(|id| lists.get(id).map_or(&[][..], |l| l.as_slice()))
            .collect();
        write_compressed(&PostingFiles::new(dir, kind), &ordered)?;
        Ok(true)
    }
}

fn write_compressed(files: &PostingFiles, ordered: &[&[Posting]]) -> Result<()> {
    storage::write_lines(&files.counts, ordered.iter().map(|l| l.len().to_string()))?;
    let blob = codec::encode_blob(ordered.iter().copied());
    storage::write_bytes(&files.blob, &blob)
}

fn read_ids(path: &Path) -> Result<Vec<EntityId>> {
    storage::read_lines(path)?
        .iter()
        .enumerate()
        .map(|(i, line)| storage::parse_value(line, path, i + 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EdgeRef, Point};
    use tempfile::TempDir;

    fn sample_corpus() -> Corpus {
        let p = |id: i64| Point::new(id, 41.15 + id as f64 * 1e-4, -8.61);
        Corpus::new(vec![
            Trajectory::new(7, vec![p(1), p(2), p(3), p(1)])
                .with_edges(vec![EdgeRef::new(10, 50.0, 1), EdgeRef::new(11, 60.0, 2)]),
            Trajectory::new(2, vec![p(3), p(4)]).with_edges(vec![EdgeRef::new(11, 60.0, 1)]),
            Trajectory::new(5, vec![p(1), p(4)]),
        ])
    }

    fn pool() -> WorkerPool {
        WorkerPool::new(2, 2).unwrap()
    }

    #[test]
    fn test_node_postings_sorted_by_trajectory() {
        let store = PostingStore::from_corpus(PostingKind::Node, &sample_corpus(), &pool());
        assert_eq!(
            store.find(1),
            vec![Posting::new(5, 1), Posting::new(7, 1), Posting::new(7, 4)]
        );
        assert_eq!(store.find(3), vec![Posting::new(2, 1), Posting::new(7, 3)]);
        assert!(store.find(99).is_empty());
        assert_eq!(store.entity_ids(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_edge_postings_and_relevant_trajectories() {
        let store = PostingStore::from_corpus(PostingKind::Edge, &sample_corpus(), &pool());
        assert_eq!(store.find(11), vec![Posting::new(2, 1), Posting::new(7, 2)]);
        assert_eq!(store.find_relevant_trajectories(11), vec![2, 7]);
        assert_eq!(store.entity_count(), 2);
    }

    #[test]
    fn test_load_reports_not_built() {
        let dir = TempDir::new().unwrap();
        assert!(PostingStore::load(dir.path(), PostingKind::Node).unwrap().is_none());
        assert!(PostingStore::load_compressed(dir.path(), PostingKind::Node)
            .unwrap()
            .is_none());
        assert!(!PostingStore::compress(dir.path(), PostingKind::Node).unwrap());
    }

    #[test]
    fn test_plain_and_compressed_agree() {
        let dir = TempDir::new().unwrap();
        let corpus = sample_corpus();
        let built = PostingStore::build(dir.path(), PostingKind::Node, &corpus, &pool()).unwrap();
        let plain = PostingStore::load(dir.path(), PostingKind::Node).unwrap().unwrap();
        let compressed = PostingStore::load_compressed(dir.path(), PostingKind::Node)
            .unwrap()
            .unwrap();
        assert!(compressed.is_compressed());

        let mut timer = DecodeTimer::new();
        for &id in built.entity_ids() {
            assert_eq!(plain.find(id), built.find(id));
            assert_eq!(compressed.find_timed(id, &mut timer).as_ref(), built.find(id).as_slice());
        }
        assert_eq!(timer.blocks(), built.entity_count());
    }

    #[test]
    fn test_corrupt_block_degrades_to_empty() {
        let dir = TempDir::new().unwrap();
        let corpus = sample_corpus();
        PostingStore::build(dir.path(), PostingKind::Node, &corpus, &pool()).unwrap();
        let files = PostingFiles::new(dir.path(), PostingKind::Node);
        // Claim one more posting than entity 1 holds
        storage::write_lines(&files.counts, ["4", "1", "2", "2"]).unwrap();

        let store = PostingStore::load_compressed(dir.path(), PostingKind::Node)
            .unwrap()
            .unwrap();
        assert!(store.find(1).is_empty());
        assert_eq!(store.find(3), vec![Posting::new(2, 1), Posting::new(7, 3)]);
    }

    #[test]
    fn test_compress_existing_plain_store() {
        let dir = TempDir::new().unwrap();
        let corpus = sample_corpus();
        PostingStore::build(dir.path(), PostingKind::Edge, &corpus, &pool()).unwrap();
        let files = PostingFiles::new(dir.path(), PostingKind::Edge);
        std::fs::remove_file(&files.blob).unwrap();
        assert!(PostingStore::load_compressed(dir.path(), PostingKind::Edge)
            .unwrap()
            .is_none());

        assert!(PostingStore::compress(dir.path(), PostingKind::Edge).unwrap());
        let store = PostingStore::load_compressed(dir.path(), PostingKind::Edge)
            .unwrap()
            .unwrap();
        assert_eq!(store.find(10), vec![Posting::new(7, 1)]);
    }
}
