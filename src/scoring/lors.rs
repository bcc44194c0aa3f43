//! Longest overlapping road segments: length-weighted LCS over edge ids.

use crate::EdgeRef;

/// `rest[i]` = total length of the query edges after index `i`.
pub fn rest_distance(query: &[EdgeRef]) -> Vec<f64> {
    let mut rest = vec![0.0; query.len()];
    let mut acc = 0.0;
    for i in (0..query.len()).rev() {
        rest[i] = acc;
        acc += query[i].length_m;
    }
    rest
}

/// Total length of a query edge sequence.
pub fn total_length(query: &[EdgeRef]) -> f64 {
    query.iter().map(|e| e.length_m).sum()
}

/// Overlap length between two edge sequences.
///
/// After each query row, the row's best value plus `rest[i]` bounds the
/// final overlap from above; once that falls below `best_so_far` the bound
/// is returned. Pass `f64::NEG_INFINITY` for an exact value. `rest` must
/// come from [`rest_distance`] on the same query.
pub fn lors(query: &[EdgeRef], candidate: &[EdgeRef], rest: &[f64], best_so_far: f64) -> f64 {
    if query.is_empty() || candidate.is_empty() {
        return 0.0;
    }
    let m = candidate.len();
    let mut prev = vec![0.0f64; m + 1];
    let mut cur = vec![0.0f64; m + 1];

    for (i, q) in query.iter().enumerate() {
        for (j, c) in candidate.iter().enumerate() {
            let mut best = prev[j + 1].max(cur[j]);
            if q.id == c.id {
                best = best.max(prev[j] + q.length_m);
            }
            cur[j + 1] = best;
        }
        let upper = cur[m] + rest.get(i).copied().unwrap_or(0.0);
        if upper < best_so_far {
            return upper;
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[m]
}
