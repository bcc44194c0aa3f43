//! In-memory trajectory store shared by every backend.

use crate::{Bounds, Point, PointId, Trajectory, TrajectoryId};
use std::collections::HashMap;

/// Trajectories keyed by id, with the distinct point set they visit.
///
/// A point is identified by its coordinate. Points sharing a coordinate are
/// interned to the id first seen in ascending trajectory order, so every
/// backend indexes one entity per location.
#[derive(Debug, Default)]
pub struct Corpus {
    trajectories: HashMap<TrajectoryId, Trajectory>,
    points: HashMap<PointId, Point>,
    /// Trajectory ids in ascending id order
    order: Vec<TrajectoryId>,
    bounds: Option<Bounds>,
}

impl Corpus {
    /// Build the store. Later duplicates of a trajectory id replace earlier
    /// ones; points with invalid coordinates are dropped.
    pub fn new(trajectories: Vec<Trajectory>) -> Self {
        let mut map: HashMap<TrajectoryId, Trajectory> = HashMap::with_capacity(trajectories.len());
        for traj in trajectories {
            if map.contains_key(&traj.id) {
                log::warn!("[Corpus] Duplicate trajectory id {}, keeping the last", traj.id);
            }
            map.insert(traj.id, traj);
        }

        let mut order: Vec<TrajectoryId> = map.keys().copied().collect();
        order.sort_unstable();

        let mut points: HashMap<PointId, Point> = HashMap::new();
        let mut by_location: HashMap<(u64, u64), PointId> = HashMap::new();
        let mut bounds: Option<Bounds> = None;
        let mut invalid = 0usize;
        let mut interned = 0usize;
        let mut clashes = 0usize;
        for id in &order {
            let Some(traj) = map.get_mut(id) else {
                continue;
            };
            let before = traj.points.len();
            traj.points.retain(|p| p.is_valid());
            invalid += before - traj.points.len();
            for p in traj.points.iter_mut() {
                let canonical = *by_location.entry(p.location_key()).or_insert(p.id);
                if canonical != p.id {
                    p.id = canonical;
                    interned += 1;
                }
                let stored = points.entry(p.id).or_insert(*p);
                if *stored != *p {
                    clashes += 1;
                }
                match bounds.as_mut() {
                    Some(b) => b.include(p.lat, p.lon),
                    None => bounds = Some(Bounds::from_coord(p.lat, p.lon)),
                }
            }
        }
        if invalid > 0 {
            log::warn!("[Corpus] Skipped {} points with invalid coordinates", invalid);
        }
        if interned > 0 {
            log::debug!("[Corpus] Interned {} points onto an earlier id at the same coordinate", interned);
        }
        if clashes > 0 {
            log::warn!(
                "[Corpus] {} points reuse an id already bound to another coordinate",
                clashes
            );
        }

        log::info!(
            "[Corpus] Loaded {} trajectories over {} distinct points",
            map.len(),
            points.len()
        );

        Self {
            trajectories: map,
            points,
            order,
            bounds,
        }
    }

    pub fn len(&self) -> usize {
        self.trajectories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }

    pub fn get(&self, id: TrajectoryId) -> Option<&Trajectory> {
        self.trajectories.get(&id)
    }

    /// Point count of a trajectory (0 when unknown).
    pub fn trajectory_len(&self, id: TrajectoryId) -> usize {
        self.trajectories.get(&id).map_or(0, |t| t.len())
    }

    pub fn point(&self, id: PointId) -> Option<&Point> {
        self.points.get(&id)
    }

    /// Distinct valid points in the corpus.
    pub fn points(&self) -> impl Iterator<Item = &Point> {
        self.points.values()
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// Trajectories in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Trajectory> {
        self.order.iter().filter_map(|id| self.trajectories.get(id))
    }

    pub fn ids(&self) -> &[TrajectoryId] {
        &self.order
    }

    /// Bounding box of every valid point.
    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }
}
