//! Shared fixtures: seeded random walks on a 5 m lattice around Porto.
//!
//! Every walk is routed through one [`RoadGraph`], so trajectories share
//! interned points and edges wherever they cross.

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use traj_search::geo_utils::{offset_latitude, offset_longitude};
use traj_search::{RoadGraph, SearchConfig, Trajectory, TrajectoryId};

pub const ORIGIN_LAT: f64 = 41.15;
pub const ORIGIN_LON: f64 = -8.61;
/// Side of the square study area in meters.
pub const AREA_M: f64 = 600.0;
const LATTICE_M: f64 = 5.0;
const CELLS: i32 = (AREA_M / LATTICE_M) as i32;

/// Coordinate of a lattice cell, counted in cells north and east of the origin.
pub fn lattice(north: i32, east: i32) -> (f64, f64) {
    (
        offset_latitude(ORIGIN_LAT, north as f64 * LATTICE_M),
        offset_longitude(ORIGIN_LAT, ORIGIN_LON, east as f64 * LATTICE_M),
    )
}

/// Random walk of `len` distinct consecutive cells kept within `[lo, hi]`.
pub fn walk(rng: &mut StdRng, len: usize, lo: i32, hi: i32) -> Vec<(f64, f64)> {
    let mut cell = (rng.gen_range(lo..=hi), rng.gen_range(lo..=hi));
    let mut coords = vec![lattice(cell.0, cell.1)];
    while coords.len() < len {
        let next = (
            (cell.0 + rng.gen_range(-3..=3)).clamp(lo, hi),
            (cell.1 + rng.gen_range(-3..=3)).clamp(lo, hi),
        );
        if next == cell {
            continue;
        }
        cell = next;
        coords.push(lattice(cell.0, cell.1));
    }
    coords
}

/// Seeded corpus plus the graph its trajectories were routed through.
///
/// Trajectory 0 joins two opposite corners so the corpus bounding box is
/// the whole study area.
pub struct Fixture {
    pub graph: RoadGraph,
    pub trajectories: Vec<Trajectory>,
    rng: StdRng,
}

impl Fixture {
    pub fn new(seed: u64, count: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut graph = RoadGraph::new();
        let mut trajectories = Vec::with_capacity(count + 1);

        let frame = [lattice(0, 0), lattice(CELLS, CELLS)];
        trajectories.push(graph.trajectory_from_path(0, &frame).expect("frame trajectory"));
        for id in 1..=count {
            let len = rng.gen_range(5..=20);
            let coords = walk(&mut rng, len, 0, CELLS);
            let traj = graph
                .trajectory_from_path(id as TrajectoryId, &coords)
                .expect("corpus trajectory");
            trajectories.push(traj);
        }
        Self {
            graph,
            trajectories,
            rng,
        }
    }

    /// Fresh walk through the same graph, well inside the study area.
    pub fn query(&mut self, id: TrajectoryId) -> Trajectory {
        let len = self.rng.gen_range(4..=12);
        let coords = walk(&mut self.rng, len, 10, CELLS - 10);
        self.graph
            .trajectory_from_path(id, &coords)
            .expect("query trajectory")
    }

    pub fn corpus(&self) -> traj_search::Corpus {
        traj_search::Corpus::new(self.trajectories.clone())
    }
}

/// Configuration with enough rounds for any ring or radius to cover the area.
pub fn config(dir: &std::path::Path) -> SearchConfig {
    SearchConfig {
        max_ring_count: 256,
        build_threads: 2,
        build_queue_capacity: 64,
        ..SearchConfig::with_index_dir(dir)
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Assert two best-first score lists agree within floating tolerance.
pub fn assert_scores_eq(actual: &[f64], expected: &[f64], context: &str) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "{}: {:?} vs {:?}",
        context,
        actual,
        expected
    );
    for (a, e) in actual.iter().zip(expected) {
        assert!(
            (a - e).abs() <= 1e-6 * e.abs().max(1.0),
            "{}: {:?} vs {:?}",
            context,
            actual,
            expected
        );
    }
}
