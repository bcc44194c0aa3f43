//! Matches-array scorers for LCSS and EDR over sparse matches.
//!
//! Inputs are, for each query index in order, the 1-based candidate
//! positions that matched it. Both scorers are incremental: a query row is
//! folded into the running state without revisiting earlier rows.

/// Patience-sorting LCSS over sparse matches.
///
/// `matches[c]` is the smallest candidate position ending a common
/// subsequence of length `c`; unreached slots hold `m + 1`.
#[derive(Debug, Clone)]
pub struct LcssMatches {
    matches: Vec<u32>,
    unreached: u32,
    best: usize,
}

impl LcssMatches {
    pub fn new(query_len: usize, candidate_len: usize) -> Self {
        let unreached = candidate_len as u32 + 1;
        let mut matches = vec![unreached; query_len.min(candidate_len) + 1];
        matches[0] = 0;
        Self {
            matches,
            unreached,
            best: 0,
        }
    }

    /// Fold the matched candidate positions of the next query index.
    pub fn fold(&mut self, positions: &[u32]) {
        let mut row: Vec<u32> = positions
            .iter()
            .copied()
            .filter(|&k| k >= 1 && k < self.unreached)
            .collect();
        row.sort_unstable_by(|a, b| b.cmp(a));
        row.dedup();

        // Descending order keeps two positions of one row off the same chain
        for k in row {
            let c = self.matches.partition_point(|&v| v < k);
            if c == self.matches.len() {
                continue;
            }
            self.matches[c] = k;
            self.best = self.best.max(c);
        }
    }

    /// LCSS length of the rows folded so far.
    pub fn score(&self) -> usize {
        self.best
    }
}

/// LCSS from all rows at once.
pub fn lcss_from_matches(query_len: usize, candidate_len: usize, rows: &[Vec<u32>]) -> usize {
    let mut state = LcssMatches::new(query_len, candidate_len);
    for row in rows {
        state.fold(row);
    }
    state.score()
}

/// Sparse EDR.
///
/// An alignment scores 2 per matched pair and 1 per substituted pair, so
/// `EDR = n + m − max score`. `best[v]` is the shortest candidate prefix
/// reaching score `v` over the rows folded so far (`m + 1` when unreached).
/// Every query row must be folded, including rows without matches.
#[derive(Debug, Clone)]
pub struct EdrMatches {
    best: Vec<u32>,
    next: Vec<u32>,
    candidate_len: u32,
    rows: usize,
    top: usize,
}

impl EdrMatches {
    pub fn new(query_len: usize, candidate_len: usize) -> Self {
        let unreached = candidate_len as u32 + 1;
        let slots = 2 * query_len.min(candidate_len) + 1;
        let mut best = vec![unreached; slots];
        best[0] = 0;
        Self {
            next: best.clone(),
            best,
            candidate_len: candidate_len as u32,
            rows: 0,
            top: 0,
        }
    }

    /// Fold the matched candidate positions of the next query index.
    pub fn fold(&mut self, positions: &[u32]) {
        let m = self.candidate_len;
        let mut row: Vec<u32> = positions.iter().copied().filter(|&k| k >= 1 && k <= m).collect();
        row.sort_unstable();
        row.dedup();

        let limit = (self.top + 2).min(self.best.len() - 1);
        self.next.copy_from_slice(&self.best);
        for v in 1..=limit {
            // Substitute the query point with the next candidate point
            if self.best[v - 1] < m {
                self.next[v] = self.next[v].min(self.best[v - 1] + 1);
            }
            // Match it with the first matching position past the prefix
            if v >= 2 && self.best[v - 2] < m {
                let after = self.best[v - 2];
                let i = row.partition_point(|&k| k <= after);
                if let Some(&k) = row.get(i) {
                    self.next[v] = self.next[v].min(k);
                }
            }
        }
        std::mem::swap(&mut self.best, &mut self.next);
        // Reached scores stay contiguous from 0
        while self.top < limit && self.best[self.top + 1] <= m {
            self.top += 1;
        }
        self.rows += 1;
    }

    /// Edit distance over the rows folded so far.
    pub fn distance(&self) -> usize {
        self.rows + self.candidate_len as usize - self.top
    }
}

/// EDR from all rows at once; `rows.len()` is the query length.
pub fn edr_from_matches(candidate_len: usize, rows: &[Vec<u32>]) -> usize {
    let mut state = EdrMatches::new(rows.len(), candidate_len);
    for row in rows {
        state.fold(row);
    }
    state.distance()
}

// ============================================================================
// DP fallbacks
// ============================================================================

/// Classical LCS over a 0-based match predicate.
pub fn lcss_dp<F: Fn(usize, usize) -> bool>(n: usize, m: usize, is_match: F) -> usize {
    let mut prev = vec![0usize; m + 1];
    let mut cur = vec![0usize; m + 1];
    for i in 1..=n {
        for j in 1..=m {
            cur[j] = if is_match(i - 1, j - 1) {
                prev[j - 1] + 1
            } else {
                prev[j].max(cur[j - 1])
            };
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[m]
}

/// Classical edit distance: substitution costs 0 on a match, 1 otherwise.
pub fn edr_dp<F: Fn(usize, usize) -> bool>(n: usize, m: usize, is_match: F) -> usize {
    let mut prev: Vec<usize> = (0..=m).collect();
    let mut cur = vec![0usize; m + 1];
    for i in 1..=n {
        cur[0] = i;
        for j in 1..=m {
            let sub = prev[j - 1] + usize::from(!is_match(i - 1, j - 1));
            cur[j] = sub.min(prev[j] + 1).min(cur[j - 1] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[m]
}
