//! Point and edge arenas.
//!
//! Points are interned once by exact coordinate and addressed by [`PointId`];
//! edges hold the ids of their endpoints and every point records the first
//! edge leaving it. Calibrated trajectories switch between the point and edge
//! representation through these arenas.

use crate::error::{Result, SearchError};
use crate::geo_utils::haversine_distance;
use crate::{location_key, EdgeId, EdgeRef, Point, PointId, Trajectory, TrajectoryId};
use std::collections::HashMap;

/// An interned point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphPoint {
    pub id: PointId,
    pub lat: f64,
    pub lon: f64,
    /// First edge leaving this point
    pub edge: Option<EdgeId>,
}

/// A directed road edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphEdge {
    pub id: EdgeId,
    pub from: PointId,
    pub to: PointId,
    pub length_m: f64,
}

/// Road network arenas.
#[derive(Debug, Default)]
pub struct RoadGraph {
    points: Vec<GraphPoint>,
    edges: Vec<GraphEdge>,
    by_location: HashMap<(u64, u64), PointId>,
    by_endpoints: HashMap<(PointId, PointId), EdgeId>,
}

impl RoadGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Id for the coordinate, allocating one on first sight.
    pub fn intern_point(&mut self, lat: f64, lon: f64) -> PointId {
        let key = location_key(lat, lon);
        if let Some(&id) = self.by_location.get(&key) {
            return id;
        }
        let id = self.points.len() as PointId;
        self.points.push(GraphPoint {
            id,
            lat,
            lon,
            edge: None,
        });
        self.by_location.insert(key, id);
        id
    }

    pub fn point(&self, id: PointId) -> Option<Point> {
        let p = self.points.get(usize::try_from(id).ok()?)?;
        Some(Point::new(p.id, p.lat, p.lon))
    }

    pub fn graph_point(&self, id: PointId) -> Option<&GraphPoint> {
        self.points.get(usize::try_from(id).ok()?)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&GraphEdge> {
        self.edges.get(usize::try_from(id).ok()?)
    }

    /// Edge between two interned points, reusing an existing one.
    pub fn add_edge(&mut self, from: PointId, to: PointId) -> Result<EdgeId> {
        if let Some(&id) = self.by_endpoints.get(&(from, to)) {
            return Ok(id);
        }
        let (a, b) = match (self.graph_point(from), self.graph_point(to)) {
            (Some(a), Some(b)) => (*a, *b),
            _ => {
                return Err(SearchError::Internal {
                    message: format!("edge endpoints {} -> {} are not interned", from, to),
                })
            }
        };
        let id = EdgeId::try_from(self.edges.len()).map_err(|_| SearchError::Internal {
            message: "edge arena is full".to_string(),
        })?;
        self.edges.push(GraphEdge {
            id,
            from,
            to,
            length_m: haversine_distance(a.lat, a.lon, b.lat, b.lon),
        });
        self.by_endpoints.insert((from, to), id);
        let owner = &mut self.points[from as usize];
        if owner.edge.is_none() {
            owner.edge = Some(id);
        }
        Ok(id)
    }

    /// Edge sequence traversed by consecutive points.
    ///
    /// Repeated consecutive points are collapsed. Returns `None` when some
    /// consecutive pair has no edge.
    pub fn edges_for_points(&self, points: &[Point]) -> Option<Vec<EdgeRef>> {
        let mut edges = Vec::new();
        for pair in points.windows(2) {
            if pair[0].id == pair[1].id {
                continue;
            }
            let id = *self.by_endpoints.get(&(pair[0].id, pair[1].id))?;
            let length_m = self.edges[id as usize].length_m;
            edges.push(EdgeRef::new(id, length_m, edges.len() as u32 + 1));
        }
        Some(edges)
    }

    /// Point sequence visited by an edge sequence.
    pub fn points_for_edges(&self, edges: &[EdgeRef]) -> Vec<Point> {
        let mut points: Vec<Point> = Vec::with_capacity(edges.len() + 1);
        for edge in edges.iter().filter_map(|e| self.edge(e.id)) {
            if points.last().map(|p| p.id) != Some(edge.from) {
                points.extend(self.point(edge.from));
            }
            points.extend(self.point(edge.to));
        }
        points
    }

    /// Calibrated trajectory following `coords`, interning points and edges.
    pub fn trajectory_from_path(&mut self, id: TrajectoryId, coords: &[(f64, f64)]) -> Result<Trajectory> {
        let mut points = Vec::with_capacity(coords.len());
        for &(lat, lon) in coords {
            let pid = self.intern_point(lat, lon);
            points.push(Point::new(pid, lat, lon));
        }
        for pair in points.windows(2) {
            if pair[0].id != pair[1].id {
                self.add_edge(pair[0].id, pair[1].id)?;
            }
        }
        let edges = self
            .edges_for_points(&points)
            .ok_or_else(|| SearchError::Internal {
                message: format!("trajectory {} has an unlinked point pair", id),
            })?;
        Ok(Trajectory::new(id, points).with_edges(edges))
    }
}
