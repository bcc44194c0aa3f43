//! Geographic utilities: great-circle distance, meter/degree conversion and
//! conservative rectangle separation used by the pruning bounds.

use crate::{Bounds, Point};
use geo::{Distance, Haversine};

/// Mean earth radius used by `geo`'s haversine, in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Meters spanned by one degree of latitude (and of longitude at the equator).
pub const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

/// Scale applied to flat-earth separations so they stay below the
/// great-circle distance over city-scale spans.
pub const BOUND_SLACK: f64 = 0.999;

/// Haversine distance between two coordinates in meters.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let a = geo::Point::new(lon1, lat1);
    let b = geo::Point::new(lon2, lat2);
    Haversine::distance(a, b)
}

/// Haversine distance between two points in meters.
#[inline]
pub fn point_distance(a: &Point, b: &Point) -> f64 {
    haversine_distance(a.lat, a.lon, b.lat, b.lon)
}

/// Degrees of latitude covering `meters`.
#[inline]
pub fn meters_to_lat_degrees(meters: f64) -> f64 {
    meters / METERS_PER_DEGREE
}

/// Degrees of longitude covering `meters` at latitude `lat`.
pub fn meters_to_lon_degrees(meters: f64, lat: f64) -> f64 {
    let cos = lat.to_radians().cos().max(1e-9);
    meters / (METERS_PER_DEGREE * cos)
}

/// Latitude `meters` north of `lat` (negative meters go south).
#[inline]
pub fn offset_latitude(lat: f64, meters: f64) -> f64 {
    lat + meters_to_lat_degrees(meters)
}

/// Longitude `meters` east of `lon` along the parallel at `lat`.
#[inline]
pub fn offset_longitude(lat: f64, lon: f64, meters: f64) -> f64 {
    lon + meters_to_lon_degrees(meters, lat)
}

/// Lower estimate of the distance between any point of `a` and any point of `b`.
///
/// Uses the equirectangular projection at the largest absolute latitude
/// touched by either rectangle, so longitude gaps are never overstated.
pub fn rect_distance_lower_bound(a: &Bounds, b: &Bounds) -> f64 {
    let lat_gap = (b.min_lat - a.max_lat).max(a.min_lat - b.max_lat).max(0.0);
    let lon_gap = (b.min_lon - a.max_lon).max(a.min_lon - b.max_lon).max(0.0);
    if lat_gap == 0.0 && lon_gap == 0.0 {
        return 0.0;
    }
    let max_abs_lat = a.max_abs_lat().max(b.max_abs_lat()).min(90.0);
    let dy = lat_gap * METERS_PER_DEGREE;
    let dx = lon_gap * METERS_PER_DEGREE * max_abs_lat.to_radians().cos();
    (dx * dx + dy * dy).sqrt() * BOUND_SLACK
}

/// Lower estimate of the distance from a coordinate to a rectangle.
pub fn point_rect_lower_bound(lat: f64, lon: f64, rect: &Bounds) -> f64 {
    rect_distance_lower_bound(&Bounds::from_coord(lat, lon), rect)
}
