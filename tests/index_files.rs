//! Persisted index files and the filter queries answered from them.
//!
//! Run with: `cargo test --test index_files`

mod common;

use common::{config, init_logging, lattice, Fixture};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use traj_search::geo_utils::haversine_distance;
use traj_search::{Bounds, EdgeId, EdgeRef, Measure, SearchError, TopKEngine, Trajectory, TrajectoryId};

/// Helper: every file under `dir`, by name.
fn snapshot(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    fs::read_dir(dir)
        .expect("failed to list index dir")
        .map(|entry| {
            let entry = entry.expect("failed to read entry");
            let name = entry.file_name().to_string_lossy().into_owned();
            (name, fs::read(entry.path()).expect("failed to read file"))
        })
        .collect()
}

fn build(dir: &TempDir, fixture: &Fixture) -> TopKEngine {
    TopKEngine::build(config(dir.path()), fixture.corpus()).expect("failed to build engine")
}

fn brute_range(trajectories: &[Trajectory], lat: f64, lon: f64, radius_m: f64) -> Vec<TrajectoryId> {
    let mut out: Vec<TrajectoryId> = trajectories
        .iter()
        .filter(|t| {
            t.points
                .iter()
                .any(|p| haversine_distance(lat, lon, p.lat, p.lon) <= radius_m)
        })
        .map(|t| t.id)
        .collect();
    out.sort_unstable();
    out
}

fn edge_ids(traj: &Trajectory) -> Vec<EdgeId> {
    traj.edge_slice().iter().map(|e| e.id).collect()
}

// ============================================================================
// Test: Build Idempotence
// ============================================================================

#[test]
fn test_builds_are_byte_identical() {
    init_logging();
    let fixture = Fixture::new(41, 70);
    let first = TempDir::new().expect("failed to create temp dir");
    let second = TempDir::new().expect("failed to create temp dir");
    drop(build(&first, &fixture));
    drop(build(&second, &fixture));

    let a = snapshot(first.path());
    let b = snapshot(second.path());
    assert!(a.contains_key("grid.ids"));
    assert!(a.contains_key("node.bin"));
    assert!(a.contains_key("edge.traj"));
    assert!(a.contains_key("mbr.chains"));
    assert_eq!(a, b);
}

#[test]
fn test_rebuild_leaves_files_untouched() {
    init_logging();
    let fixture = Fixture::new(43, 30);
    let dir = TempDir::new().expect("failed to create temp dir");
    drop(build(&dir, &fixture));
    let before = snapshot(dir.path());
    let engine = build(&dir, &fixture);
    assert_eq!(snapshot(dir.path()), before);

    let query = fixture.trajectories[5].clone();
    assert_eq!(engine.top_k(&query, 1, Measure::Dtw).expect("top-k failed").ids(), vec![5]);
}

#[test]
fn test_load_after_build() {
    init_logging();
    let fixture = Fixture::new(47, 30);
    let dir = TempDir::new().expect("failed to create temp dir");
    let built = build(&dir, &fixture);
    let loaded = TopKEngine::load(config(dir.path()), fixture.corpus())
        .expect("failed to load")
        .expect("index should be built");

    let query = fixture.trajectories[9].clone();
    for measure in [Measure::Lcss, Measure::Edr, Measure::Hausdorff, Measure::Lors] {
        let a = built.top_k(&query, 4, measure).expect("top-k failed");
        let b = loaded.top_k(&query, 4, measure).expect("top-k failed");
        assert_eq!(a.hits, b.hits, "{}", measure);
    }
    let a = built.top_k_mbr(&query, 4, Measure::Frechet).expect("top-k failed");
    let b = loaded.top_k_mbr(&query, 4, Measure::Frechet).expect("top-k failed");
    assert_eq!(a.hits, b.hits);
}

#[test]
fn test_posting_lists_sorted_by_trajectory() {
    init_logging();
    let fixture = Fixture::new(31, 90);
    let dir = TempDir::new().expect("failed to create temp dir");
    drop(build(&dir, &fixture));

    for name in ["node.traj", "edge.traj"] {
        let text = fs::read_to_string(dir.path().join(name)).expect("failed to read postings");
        let mut lists = 0;
        for (line_no, line) in text.lines().enumerate() {
            let ids: Vec<TrajectoryId> = line
                .split(';')
                .filter(|field| !field.is_empty())
                .map(|field| field.parse().expect("trajectory id"))
                .collect();
            assert!(!ids.is_empty(), "{} line {} is empty", name, line_no + 1);
            assert!(
                ids.windows(2).all(|w| w[0] <= w[1]),
                "{} line {}: {:?}",
                name,
                line_no + 1,
                ids
            );
            lists += 1;
        }
        assert!(lists > 0, "{} has no lists", name);
    }
}

// ============================================================================
// Test: Not Built and Compression
// ============================================================================

#[test]
fn test_empty_dir_is_not_built() {
    init_logging();
    let fixture = Fixture::new(53, 5);
    let dir = TempDir::new().expect("failed to create temp dir");
    assert!(TopKEngine::load(config(dir.path()), fixture.corpus())
        .expect("failed to load")
        .is_none());
    assert!(TopKEngine::load_compressed(config(dir.path()), fixture.corpus())
        .expect("failed to load")
        .is_none());
    assert!(!TopKEngine::compress(dir.path()).expect("compress failed"));
}

#[test]
fn test_compress_restores_compressed_files() {
    init_logging();
    let fixture = Fixture::new(59, 40);
    let dir = TempDir::new().expect("failed to create temp dir");
    let plain = build(&dir, &fixture);
    let packed_before = snapshot(dir.path());
    for name in ["node.counts", "node.bin", "edge.counts", "edge.bin"] {
        fs::remove_file(dir.path().join(name)).expect("failed to remove file");
    }

    // Only the R-tree backend can open without compressed postings
    let partial = TopKEngine::load_compressed(config(dir.path()), fixture.corpus())
        .expect("failed to load")
        .expect("mbr chains are still on disk");
    let query = fixture.trajectories[3].clone();
    assert!(matches!(
        partial.top_k(&query, 1, Measure::Edr),
        Err(SearchError::NotBuilt { .. })
    ));
    assert!(partial.top_k_mbr(&query, 1, Measure::Dtw).is_ok());

    assert!(TopKEngine::compress(dir.path()).expect("compress failed"));
    assert_eq!(snapshot(dir.path()), packed_before);

    let compressed = TopKEngine::load_compressed(config(dir.path()), fixture.corpus())
        .expect("failed to load")
        .expect("index should be built");
    for measure in [Measure::Edr, Measure::Dtw, Measure::Lors] {
        let a = plain.top_k(&query, 3, measure).expect("top-k failed");
        let b = compressed.top_k(&query, 3, measure).expect("top-k failed");
        assert_eq!(a.hits, b.hits, "{}", measure);
    }
}

#[test]
fn test_corrupt_chain_file_is_malformed() {
    init_logging();
    let fixture = Fixture::new(61, 10);
    let dir = TempDir::new().expect("failed to create temp dir");
    drop(build(&dir, &fixture));
    fs::write(dir.path().join("mbr.chains"), "1;0;not-a-number\n").expect("failed to write");
    let result = TopKEngine::load(config(dir.path()), fixture.corpus());
    assert!(matches!(result, Err(SearchError::MalformedIndex { .. })));
}

// ============================================================================
// Test: Spatial Filters
// ============================================================================

#[test]
fn test_range_queries_match_brute_force() {
    init_logging();
    let fixture = Fixture::new(67, 80);
    let dir = TempDir::new().expect("failed to create temp dir");
    let engine = build(&dir, &fixture);
    for (north, east) in [(10, 10), (60, 60), (100, 30), (119, 119)] {
        let (lat, lon) = lattice(north, east);
        for radius in [3.0, 27.5, 73.0, 240.0] {
            let expected = brute_range(&fixture.trajectories, lat, lon, radius);
            let grid = engine.range_query(lat, lon, radius).expect("range query failed");
            let mbr = engine.range_query_mbr(lat, lon, radius).expect("range query failed");
            assert_eq!(grid, expected, "grid ({}, {}) r={}", north, east, radius);
            assert_eq!(mbr, expected, "mbr ({}, {}) r={}", north, east, radius);
        }
    }
}

#[test]
fn test_window_queries_match_brute_force() {
    init_logging();
    let fixture = Fixture::new(71, 80);
    let dir = TempDir::new().expect("failed to create temp dir");
    let engine = build(&dir, &fixture);
    let windows = [
        ((5, 5), (20, 40)),
        ((50, 50), (52, 52)),
        ((0, 90), (119, 120)),
    ];
    for ((n0, e0), (n1, e1)) in windows {
        let (min_lat, min_lon) = lattice(n0, e0);
        let (max_lat, max_lon) = lattice(n1, e1);
        // Shrunk inwards so no lattice point sits on the border
        let window = Bounds::new(min_lat + 2e-5, max_lat - 2e-5, min_lon + 2e-5, max_lon - 2e-5);
        let expected: Vec<TrajectoryId> = fixture
            .trajectories
            .iter()
            .filter(|t| t.points.iter().any(|p| window.contains(p.lat, p.lon)))
            .map(|t| t.id)
            .collect();
        let actual = engine.window_query(&window).expect("window query failed");
        assert_eq!(actual, expected, "window {:?}", window);
    }

    let inverted = Bounds::new(41.2, 41.1, -8.6, -8.7);
    assert!(matches!(
        engine.window_query(&inverted),
        Err(SearchError::InvalidQuery { .. })
    ));
}

// ============================================================================
// Test: Path Queries
// ============================================================================

#[test]
fn test_path_queries_match_brute_force() {
    init_logging();
    let fixture = Fixture::new(73, 80);
    let dir = TempDir::new().expect("failed to create temp dir");
    let engine = build(&dir, &fixture);

    for source in [4usize, 20, 55] {
        let edges = edge_ids(&fixture.trajectories[source]);
        for path in [&edges[..1], &edges[1..3], &edges[..]] {
            let strict: Vec<TrajectoryId> = fixture
                .trajectories
                .iter()
                .filter(|t| edge_ids(t).windows(path.len()).any(|w| w == path))
                .map(|t| t.id)
                .collect();
            let loose: Vec<TrajectoryId> = fixture
                .trajectories
                .iter()
                .filter(|t| edge_ids(t).iter().any(|e| path.contains(e)))
                .map(|t| t.id)
                .collect();
            let source_id = fixture.trajectories[source].id;
            assert!(strict.contains(&source_id));
            assert_eq!(engine.strict_path_query(path).expect("strict path failed"), strict);
            assert_eq!(engine.path_query(path).expect("path failed"), loose);
        }
    }
}

#[test]
fn test_single_edge_lors() {
    init_logging();
    let fixture = Fixture::new(79, 30);
    let dir = TempDir::new().expect("failed to create temp dir");
    let engine = build(&dir, &fixture);

    let target = &fixture.trajectories[12];
    let edge = target.edge_slice()[0];
    let query = Trajectory::new(-1, target.points[..2].to_vec())
        .with_edges(vec![EdgeRef::new(edge.id, edge.length_m, 1)]);
    let result = engine.top_k(&query, 1, Measure::Lors).expect("top-k failed");
    assert_eq!(result.hits.len(), 1);
    assert!((result.hits[0].score - edge.length_m).abs() < 1e-9);
    let traversing = engine.path_query(&[edge.id]).expect("path failed");
    assert!(traversing.contains(&result.hits[0].trajectory_id));
}
