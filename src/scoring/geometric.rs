//! Distance-based scorers over haversine meters.
//!
//! Each takes `best_so_far` and stops as soon as the partial computation
//! proves the final value exceeds it, returning that proven lower bound.
//! Pass `f64::INFINITY` for an exact value.

use crate::geo_utils::point_distance;
use crate::Point;

/// Dynamic time warping: minimal summed pair distance over a monotone
/// alignment covering both sequences.
///
/// Every warping path crosses each query row, and costs are non-negative,
/// so the row minimum bounds the final value from below.
pub fn dtw(query: &[Point], candidate: &[Point], best_so_far: f64) -> f64 {
    if query.is_empty() || candidate.is_empty() {
        return empty_score(query, candidate);
    }
    let m = candidate.len();
    let mut prev = vec![f64::INFINITY; m + 1];
    let mut cur = vec![f64::INFINITY; m + 1];
    prev[0] = 0.0;

    for q in query {
        cur[0] = f64::INFINITY;
        let mut row_min = f64::INFINITY;
        for (j, c) in candidate.iter().enumerate() {
            let step = prev[j].min(prev[j + 1]).min(cur[j]);
            cur[j + 1] = point_distance(q, c) + step;
            row_min = row_min.min(cur[j + 1]);
        }
        if row_min > best_so_far {
            return row_min;
        }
        std::mem::swap(&mut prev, &mut cur);
        prev[0] = f64::INFINITY;
    }
    prev[m]
}

/// Symmetric Hausdorff distance.
pub fn hausdorff(query: &[Point], candidate: &[Point], best_so_far: f64) -> f64 {
    if query.is_empty() || candidate.is_empty() {
        return empty_score(query, candidate);
    }
    let forward = directed_hausdorff(query, candidate, 0.0, best_so_far);
    if forward > best_so_far {
        return forward;
    }
    directed_hausdorff(candidate, query, forward, best_so_far)
}

/// Largest nearest-neighbor distance from `from` into `to`, starting at
/// `floor`.
fn directed_hausdorff(from: &[Point], to: &[Point], floor: f64, best_so_far: f64) -> f64 {
    let mut worst = floor;
    for a in from {
        let mut nearest = f64::INFINITY;
        for b in to {
            let d = point_distance(a, b);
            nearest = nearest.min(d);
            if nearest <= worst {
                // `a` cannot raise the maximum
                break;
            }
        }
        worst = worst.max(nearest);
        if worst > best_so_far {
            return worst;
        }
    }
    worst
}

/// Discrete Fréchet distance.
///
/// Coupling values never decrease along a coupling, which visits every
/// query row, so the row minimum is a lower bound.
pub fn frechet(query: &[Point], candidate: &[Point], best_so_far: f64) -> f64 {
    if query.is_empty() || candidate.is_empty() {
        return empty_score(query, candidate);
    }
    let endpoints = point_distance(&query[0], &candidate[0])
        .max(point_distance(&query[query.len() - 1], &candidate[candidate.len() - 1]));
    if endpoints > best_so_far {
        return endpoints;
    }

    let m = candidate.len();
    let mut prev = vec![f64::INFINITY; m];
    let mut cur = vec![f64::INFINITY; m];
    for (i, q) in query.iter().enumerate() {
        let mut row_min = f64::INFINITY;
        for (j, c) in candidate.iter().enumerate() {
            let d = point_distance(q, c);
            let reach = match (i, j) {
                (0, 0) => 0.0,
                (0, _) => cur[j - 1],
                (_, 0) => prev[0],
                _ => prev[j].min(prev[j - 1]).min(cur[j - 1]),
            };
            cur[j] = d.max(reach);
            row_min = row_min.min(cur[j]);
        }
        if row_min > best_so_far {
            return row_min;
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[m - 1]
}

fn empty_score(query: &[Point], candidate: &[Point]) -> f64 {
    if query.is_empty() && candidate.is_empty() {
        0.0
    } else {
        f64::INFINITY
    }
}
