//! Uniform tile grid over the corpus bounding box.
//!
//! Tiles are about `epsilon` meters on a side. A point is stored in its own
//! tile and in the tiles reached by moving `±epsilon` in latitude and
//! longitude (nine probes, deduplicated), so a lookup in one tile also
//! returns points lying just across its borders.
//!
//! Coordinates outside the bounding box have no tile: they are skipped when
//! indexing and yield empty lookups.

use crate::error::{Result, SearchError};
use crate::geo_utils::{
    haversine_distance, meters_to_lat_degrees, meters_to_lon_degrees, offset_latitude,
    offset_longitude, BOUND_SLACK, METERS_PER_DEGREE,
};
use crate::pool::{ShardedMap, WorkerPool};
use crate::storage;
use crate::{Bounds, Corpus, Point, PointId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Row-major tile address: `row * horizontal_tiles + col`.
pub type TileId = u32;

/// Largest tile count per axis, keeping `TileId` within 32 bits.
const MAX_TILES_PER_AXIS: u32 = 65_535;

const IDS_FILE: &str = "grid.ids";
const MEMBERS_FILE: &str = "grid.members";

// ============================================================================
// Geometry
// ============================================================================

/// Bounding box and tile layout of a grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
    pub delta_lat: f64,
    pub delta_lon: f64,
    pub horizontal_tiles: u32,
    pub vertical_tiles: u32,
    pub epsilon: f64,
}

impl GridGeometry {
    /// Tile layout with sides of at least `epsilon` meters.
    ///
    /// Columns are counted on the edge farther from the equator, where the
    /// box is narrowest, so no tile is narrower than `epsilon` in either
    /// hemisphere.
    pub fn from_bounds(bounds: &Bounds, epsilon: f64) -> Self {
        let north_edge = haversine_distance(bounds.max_lat, bounds.min_lon, bounds.max_lat, bounds.max_lon);
        let south_edge = haversine_distance(bounds.min_lat, bounds.min_lon, bounds.min_lat, bounds.max_lon);
        let width = north_edge.min(south_edge);
        let height = haversine_distance(bounds.max_lat, bounds.min_lon, bounds.min_lat, bounds.min_lon);
        let tiles = |span_m: f64| ((span_m / epsilon).floor() as u64).clamp(1, MAX_TILES_PER_AXIS as u64) as u32;
        let horizontal_tiles = tiles(width);
        let vertical_tiles = tiles(height);

        let lat_span = bounds.max_lat - bounds.min_lat;
        let lon_span = bounds.max_lon - bounds.min_lon;
        let delta_lat = if lat_span > 0.0 {
            lat_span / vertical_tiles as f64
        } else {
            meters_to_lat_degrees(epsilon)
        };
        let delta_lon = if lon_span > 0.0 {
            lon_span / horizontal_tiles as f64
        } else {
            meters_to_lon_degrees(epsilon, bounds.max_abs_lat().min(89.9))
        };

        Self {
            min_lat: bounds.min_lat,
            min_lon: bounds.min_lon,
            max_lat: bounds.max_lat,
            max_lon: bounds.max_lon,
            delta_lat,
            delta_lon,
            horizontal_tiles,
            vertical_tiles,
            epsilon,
        }
    }

    pub fn bounds(&self) -> Bounds {
        Bounds::new(self.min_lat, self.max_lat, self.min_lon, self.max_lon)
    }

    pub fn tile_count(&self) -> u64 {
        self.horizontal_tiles as u64 * self.vertical_tiles as u64
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }

    /// Tile holding the coordinate, `None` outside the bounding box.
    pub fn tile_of(&self, lat: f64, lon: f64) -> Option<TileId> {
        if !self.contains(lat, lon) {
            return None;
        }
        let row = (((self.max_lat - lat) / self.delta_lat) as u32).min(self.vertical_tiles - 1);
        let col = (((lon - self.min_lon) / self.delta_lon) as u32).min(self.horizontal_tiles - 1);
        Some(self.tile_id(row, col))
    }

    #[inline]
    pub fn tile_id(&self, row: u32, col: u32) -> TileId {
        row * self.horizontal_tiles + col
    }

    #[inline]
    pub fn row_col(&self, tile: TileId) -> (u32, u32) {
        (tile / self.horizontal_tiles, tile % self.horizontal_tiles)
    }

    /// Lower estimate of the shortest tile side in meters.
    pub fn min_tile_side_m(&self) -> f64 {
        let height = self.delta_lat * METERS_PER_DEGREE;
        let max_abs_lat = self.min_lat.abs().max(self.max_lat.abs()).min(90.0);
        let width = self.delta_lon * METERS_PER_DEGREE * max_abs_lat.to_radians().cos();
        height.min(width) * BOUND_SLACK
    }

    /// Smallest ring radius around `tile` whose rings cover the whole grid.
    pub fn covering_ring(&self, tile: TileId) -> u32 {
        let (row, col) = self.row_col(tile);
        row.max(self.vertical_tiles - 1 - row)
            .max(col)
            .max(self.horizontal_tiles - 1 - col)
    }

    /// `minLat;minLon;maxLat;maxLon;deltaLat;deltaLon;h;v;epsilon`
    pub fn header_line(&self) -> String {
        format!(
            "{};{};{};{};{};{};{};{};{}",
            self.min_lat,
            self.min_lon,
            self.max_lat,
            self.max_lon,
            self.delta_lat,
            self.delta_lon,
            self.horizontal_tiles,
            self.vertical_tiles,
            self.epsilon
        )
    }

    pub fn parse_header(line: &str, path: &Path) -> Result<Self> {
        let fields: Vec<&str> = line.trim().split(storage::LIST_SEPARATOR).collect();
        if fields.len() != 9 {
            return Err(SearchError::malformed(
                path,
                1,
                format!("grid header has {} fields, expected 9", fields.len()),
            ));
        }
        let f = |i: usize| storage::parse_value::<f64>(fields[i], path, 1);
        let geometry = Self {
            min_lat: f(0)?,
            min_lon: f(1)?,
            max_lat: f(2)?,
            max_lon: f(3)?,
            delta_lat: f(4)?,
            delta_lon: f(5)?,
            horizontal_tiles: storage::parse_value(fields[6], path, 1)?,
            vertical_tiles: storage::parse_value(fields[7], path, 1)?,
            epsilon: f(8)?,
        };
        if geometry.horizontal_tiles == 0
            || geometry.vertical_tiles == 0
            || !(geometry.delta_lat > 0.0 && geometry.delta_lon > 0.0)
        {
            return Err(SearchError::malformed(path, 1, "degenerate grid geometry"));
        }
        Ok(geometry)
    }
}

// ============================================================================
// Grid
// ============================================================================

/// Tile id → ids of the points stored in that tile.
#[derive(Debug, Clone)]
pub struct SpatialGrid {
    geometry: GridGeometry,
    tiles: HashMap<TileId, Vec<PointId>>,
}

impl SpatialGrid {
    /// Empty grid over `geometry`.
    pub fn new(geometry: GridGeometry) -> Self {
        Self {
            geometry,
            tiles: HashMap::new(),
        }
    }

    /// Grid over the corpus bounding box with every distinct point inserted.
    ///
    /// Returns `None` for a corpus without valid points.
    pub fn build(corpus: &Corpus, epsilon: f64, pool: &WorkerPool) -> Option<Self> {
        let bounds = corpus.bounds()?;
        let geometry = GridGeometry::from_bounds(&bounds, epsilon);
        let shared: ShardedMap<TileId, Vec<PointId>> = ShardedMap::default();

        pool.for_each_bounded(corpus.points(), |point| {
            for tile in probe_tiles(&geometry, point.lat, point.lon) {
                shared.update(tile, |members| members.push(point.id));
            }
        });

        let mut tiles = shared.into_inner();
        for members in tiles.values_mut() {
            members.sort_unstable();
            members.dedup();
        }
        log::info!(
            "[SpatialGrid] Built {}x{} grid (epsilon {}m), {} occupied tiles for {} points",
            geometry.horizontal_tiles,
            geometry.vertical_tiles,
            epsilon,
            tiles.len(),
            corpus.point_count()
        );
        Some(Self { geometry, tiles })
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn occupied_tiles(&self) -> usize {
        self.tiles.len()
    }

    /// Insert a point into its own tile and the neighbors reached by the
    /// `±epsilon` probes. Returns the distinct tiles it now belongs to.
    pub fn insert(&mut self, point: &Point) -> Vec<TileId> {
        let tiles = probe_tiles(&self.geometry, point.lat, point.lon);
        if tiles.is_empty() {
            log::debug!(
                "[SpatialGrid] Point {} ({}, {}) is outside the grid",
                point.id,
                point.lat,
                point.lon
            );
        }
        for &tile in &tiles {
            let members = self.tiles.entry(tile).or_default();
            if !members.contains(&point.id) {
                members.push(point.id);
            }
        }
        tiles
    }

    /// Members of the tile holding the coordinate.
    pub fn find(&self, lat: f64, lon: f64) -> &[PointId] {
        match self.geometry.tile_of(lat, lon) {
            Some(tile) => self.tile_members(tile),
            None => {
                log::debug!("[SpatialGrid] Lookup ({}, {}) is outside the grid", lat, lon);
                &[]
            }
        }
    }

    pub fn tile_members(&self, tile: TileId) -> &[PointId] {
        self.tiles.get(&tile).map_or(&[], |m| m.as_slice())
    }

    /// Tiles at Chebyshev distance exactly `ring` from `center`, clipped to
    /// the grid. Ring 0 is the center tile.
    pub fn find_ring(&self, center: TileId, ring: u32) -> Vec<TileId> {
        let g = &self.geometry;
        let (row, col) = g.row_col(center);
        if ring == 0 {
            return vec![center];
        }
        let (row, col, ring) = (row as i64, col as i64, ring as i64);
        let rows = g.vertical_tiles as i64;
        let cols = g.horizontal_tiles as i64;
        let in_grid = |r: i64, c: i64| r >= 0 && r < rows && c >= 0 && c < cols;

        let mut out = Vec::new();
        for r in (row - ring)..=(row + ring) {
            if r < 0 || r >= rows {
                continue;
            }
            if r == row - ring || r == row + ring {
                for c in (col - ring).max(0)..=(col + ring).min(cols - 1) {
                    out.push(g.tile_id(r as u32, c as u32));
                }
            } else {
                for c in [col - ring, col + ring] {
                    if in_grid(r, c) {
                        out.push(g.tile_id(r as u32, c as u32));
                    }
                }
            }
        }
        out
    }

    /// Distinct members of every tile intersecting `rect`, ascending.
    pub fn find_range(&self, rect: &Bounds) -> Vec<PointId> {
        let g = &self.geometry;
        if !rect.intersects(&g.bounds()) {
            return Vec::new();
        }
        let top = rect.max_lat.min(g.max_lat);
        let bottom = rect.min_lat.max(g.min_lat);
        let left = rect.min_lon.max(g.min_lon);
        let right = rect.max_lon.min(g.max_lon);
        let (Some(top_left), Some(bottom_right)) = (g.tile_of(top, left), g.tile_of(bottom, right))
        else {
            return Vec::new();
        };
        let (r0, c0) = g.row_col(top_left);
        let (r1, c1) = g.row_col(bottom_right);

        let mut out = Vec::new();
        for r in r0..=r1 {
            for c in c0..=c1 {
                out.extend_from_slice(self.tile_members(g.tile_id(r, c)));
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    fn paths(dir: &Path) -> (PathBuf, PathBuf) {
        (dir.join(IDS_FILE), dir.join(MEMBERS_FILE))
    }

    pub fn is_persisted(dir: &Path) -> bool {
        let (ids, members) = Self::paths(dir);
        storage::all_exist(&[&ids, &members])
    }

    /// Write the header and tiles in ascending tile order.
    pub fn persist(&self, dir: &Path) -> Result<()> {
        storage::ensure_dir(dir)?;
        let (ids_path, members_path) = Self::paths(dir);
        let ordered: BTreeMap<TileId, &Vec<PointId>> = self.tiles.iter().map(|(k, v)| (*k, v)).collect();

        let header = std::iter::once(self.geometry.header_line());
        storage::write_lines(&ids_path, header.chain(ordered.keys().map(|t| t.to_string())))?;
        storage::write_lines(&members_path, ordered.values().map(|m| storage::join_list(m.iter())))?;
        log::info!("[SpatialGrid] Persisted {} tiles to {:?}", ordered.len(), dir);
        Ok(())
    }

    /// Load a persisted grid; `Ok(None)` when it has not been built.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        if !Self::is_persisted(dir) {
            return Ok(None);
        }
        let (ids_path, members_path) = Self::paths(dir);
        let id_lines = storage::read_lines(&ids_path)?;
        let member_lines = storage::read_lines(&members_path)?;

        let header = id_lines
            .first()
            .ok_or_else(|| SearchError::malformed(&ids_path, 1, "missing grid header"))?;
        let geometry = GridGeometry::parse_header(header, &ids_path)?;
        if id_lines.len() - 1 != member_lines.len() {
            return Err(SearchError::malformed(
                &members_path,
                member_lines.len(),
                format!("{} tiles but {} member lines", id_lines.len() - 1, member_lines.len()),
            ));
        }

        let mut tiles = HashMap::with_capacity(member_lines.len());
        for (i, (id_line, member_line)) in id_lines[1..].iter().zip(&member_lines).enumerate() {
            let tile: TileId = storage::parse_value(id_line, &ids_path, i + 2)?;
            let members: Vec<PointId> = storage::parse_list(member_line, &members_path, i + 1)?;
            tiles.insert(tile, members);
        }
        log::info!("[SpatialGrid] Loaded {} tiles from {:?}", tiles.len(), dir);
        Ok(Some(Self { geometry, tiles }))
    }
}

/// Distinct tiles reached from the coordinate by the nine `±epsilon` probes.
fn probe_tiles(geometry: &GridGeometry, lat: f64, lon: f64) -> Vec<TileId> {
    if !geometry.contains(lat, lon) {
        return Vec::new();
    }
    let eps = geometry.epsilon;
    let mut tiles = Vec::with_capacity(9);
    for dlat in [-eps, 0.0, eps] {
        let probe_lat = offset_latitude(lat, dlat);
        for dlon in [-eps, 0.0, eps] {
            let probe_lon = offset_longitude(lat, lon, dlon);
            if let Some(tile) = geometry.tile_of(probe_lat, probe_lon) {
                tiles.push(tile);
            }
        }
    }
    tiles.sort_unstable();
    tiles.dedup();
    tiles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Trajectory;
    use tempfile::TempDir;

    fn porto_geometry() -> GridGeometry {
        let bounds = Bounds::new(41.1089, 41.2227, -8.7049, -8.4893);
        GridGeometry::from_bounds(&bounds, 15.0)
    }

    fn small_corpus() -> Corpus {
        let trajectories = (0..5)
            .map(|t| {
                let points = (0..6)
                    .map(|i| {
                        let id = (t * 6 + i) as i64;
                        Point::new(id, 41.15 + t as f64 * 0.001, -8.61 + i as f64 * 0.0005)
                    })
                    .collect();
                Trajectory::new(t, points)
            })
            .collect();
        Corpus::new(trajectories)
    }

    #[test]
    fn test_geometry_tile_counts() {
        let g = porto_geometry();
        assert_eq!(g.horizontal_tiles, 1202);
        assert_eq!(g.vertical_tiles, 843);
        assert!((g.delta_lat - 0.1138 / 843.0).abs() < 1e-12);
        assert!(g.min_tile_side_m() <= 15.1);
    }

    #[test]
    fn test_southern_tiles_are_at_least_epsilon_wide() {
        let g = GridGeometry::from_bounds(&Bounds::new(-35.0, -33.0, 150.0, 150.2), 15.0);
        let narrowest = haversine_distance(-35.0, 150.0, -35.0, 150.0 + g.delta_lon);
        assert!(narrowest >= 15.0, "tile width {}m at the southern edge", narrowest);
        let mirrored = GridGeometry::from_bounds(&Bounds::new(33.0, 35.0, 150.0, 150.2), 15.0);
        assert_eq!(g.horizontal_tiles, mirrored.horizontal_tiles);
    }

    #[test]
    fn test_tile_of_corners_and_outside() {
        let g = porto_geometry();
        assert_eq!(g.tile_of(41.2227, -8.7049), Some(0));
        let last = g.tile_id(g.vertical_tiles - 1, g.horizontal_tiles - 1);
        assert_eq!(g.tile_of(41.1089, -8.4893), Some(last));
        assert_eq!(g.tile_of(41.3, -8.6), None);
        assert_eq!(g.tile_of(41.15, -8.8), None);
    }

    #[test]
    fn test_midpoint_insert_scenario() {
        let mut grid = SpatialGrid::new(porto_geometry());
        let corners = [
            Point::new(1, 41.1089, -8.7049),
            Point::new(2, 41.1089, -8.4893),
            Point::new(3, 41.2227, -8.7049),
            Point::new(4, 41.2227, -8.4893),
        ];
        for p in &corners {
            assert!(!grid.insert(p).is_empty());
        }
        let mid = Point::new(5, (41.1089 + 41.2227) / 2.0, (-8.7049 + -8.4893) / 2.0);
        let tiles = grid.insert(&mid);

        // Tiles are slightly wider than 15m and the midpoint sits on a column
        // border, so the nine probes fold onto three rows of two columns
        let g = *grid.geometry();
        let expected: Vec<TileId> = (420..=422)
            .flat_map(|row| [g.tile_id(row, 600), g.tile_id(row, 601)])
            .collect();
        assert_eq!(tiles, expected);
        for tile in &tiles {
            assert!(grid.tile_members(*tile).contains(&5));
        }
        assert!(grid.find(mid.lat, mid.lon).contains(&5));

        // Idempotent per (point, tile)
        grid.insert(&mid);
        for tile in &tiles {
            assert_eq!(grid.tile_members(*tile).iter().filter(|&&id| id == 5).count(), 1);
        }
    }

    #[test]
    fn test_interior_point_reaches_nine_tiles() {
        let g = porto_geometry();
        let mut grid = SpatialGrid::new(g);
        // Center of tile (400, 600)
        let lat = g.max_lat - 400.5 * g.delta_lat;
        let lon = g.min_lon + 600.5 * g.delta_lon;
        let tiles = grid.insert(&Point::new(9, lat, lon));
        assert_eq!(tiles.len(), 9);
        let center = g.tile_id(400, 600);
        let mut expected: Vec<TileId> = grid.find_ring(center, 1);
        expected.push(center);
        expected.sort_unstable();
        assert_eq!(tiles, expected);
    }

    #[test]
    fn test_out_of_bbox_point_is_skipped() {
        let mut grid = SpatialGrid::new(porto_geometry());
        assert!(grid.insert(&Point::new(1, 40.0, -8.6)).is_empty());
        assert_eq!(grid.occupied_tiles(), 0);
        assert!(grid.find(40.0, -8.6).is_empty());
    }

    #[test]
    fn test_find_ring_shapes() {
        let g = GridGeometry::from_bounds(&Bounds::new(41.0, 41.01, -8.61, -8.60), 100.0);
        let grid = SpatialGrid::new(g);
        let center = g.tile_id(5, 4);
        assert_eq!(grid.find_ring(center, 0), vec![center]);
        assert_eq!(grid.find_ring(center, 1).len(), 8);
        assert_eq!(grid.find_ring(center, 2).len(), 16);
        // Corner tile: only one quadrant of each ring exists
        assert_eq!(grid.find_ring(0, 1).len(), 3);
        assert_eq!(grid.find_ring(0, 2).len(), 5);
        let far = g.covering_ring(center) + 1;
        assert!(grid.find_ring(center, far).is_empty());
    }

    #[test]
    fn test_rings_partition_the_grid() {
        let g = GridGeometry::from_bounds(&Bounds::new(41.0, 41.005, -8.61, -8.603), 100.0);
        let grid = SpatialGrid::new(g);
        let center = g.tile_id(2, 3);
        let mut seen: Vec<TileId> = (0..=g.covering_ring(center))
            .flat_map(|r| grid.find_ring(center, r))
            .collect();
        seen.sort_unstable();
        let before = seen.len();
        seen.dedup();
        assert_eq!(before, seen.len());
        assert_eq!(seen.len() as u64, g.tile_count());
    }

    #[test]
    fn test_build_and_find_range() {
        let corpus = small_corpus();
        let pool = WorkerPool::new(2, 8).unwrap();
        let grid = SpatialGrid::build(&corpus, 15.0, &pool).unwrap();
        let rect = Bounds::new(41.1495, 41.1505, -8.6105, -8.6095);
        let found = grid.find_range(&rect);
        assert!(found.contains(&0));
        assert!(!found.contains(&29));
        let all = grid.find_range(&corpus.bounds().unwrap());
        assert_eq!(all.len(), corpus.point_count());
        assert!(grid.find_range(&Bounds::new(10.0, 11.0, 10.0, 11.0)).is_empty());
    }

    #[test]
    fn test_persist_and_load() {
        let dir = TempDir::new().unwrap();
        assert!(SpatialGrid::load(dir.path()).unwrap().is_none());

        let corpus = small_corpus();
        let pool = WorkerPool::new(2, 8).unwrap();
        let grid = SpatialGrid::build(&corpus, 15.0, &pool).unwrap();
        grid.persist(dir.path()).unwrap();

        let loaded = SpatialGrid::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.geometry(), grid.geometry());
        assert_eq!(loaded.occupied_tiles(), grid.occupied_tiles());
        for p in corpus.points() {
            assert_eq!(loaded.find(p.lat, p.lon), grid.find(p.lat, p.lon));
        }
    }
}
