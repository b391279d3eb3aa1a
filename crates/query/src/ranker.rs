//! Plan ranking
//!
//! Candidates run in lock-step under a shared work budget; this module
//! scores the collected per-candidate counters. Productivity is
//! `advances / works`; ties break in a fixed order: reached EOF within the
//! budget, avoids a blocking sort, better packed bounds score, fewer
//! documents fetched.

use std::cmp::Ordering;
use tracing::debug;

/// Counters one candidate accumulated during the trial.
#[derive(Debug, Clone, Copy, Default)]
pub struct CandidatePerf {
    /// Work units consumed.
    pub works: u64,
    /// Results produced.
    pub advances: u64,
    /// Finished its result set within the budget.
    pub reached_eof: bool,
    /// Contains a blocking sort stage.
    pub has_blocking_sort: bool,
    /// Packed index-bounds score (zero for collection scans).
    pub bounds_score: u64,
    /// Documents fetched from the record store.
    pub docs_fetched: u64,
}

impl CandidatePerf {
    /// Results per unit of work.
    pub fn productivity(&self) -> f64 {
        if self.works == 0 {
            return 0.0;
        }
        self.advances as f64 / self.works as f64
    }
}

fn better(a: &CandidatePerf, b: &CandidatePerf) -> Ordering {
    a.productivity()
        .partial_cmp(&b.productivity())
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.reached_eof.cmp(&b.reached_eof))
        .then_with(|| b.has_blocking_sort.cmp(&a.has_blocking_sort))
        .then_with(|| a.bounds_score.cmp(&b.bounds_score))
        .then_with(|| b.docs_fetched.cmp(&a.docs_fetched))
}

/// Index of the winning candidate. Earlier candidates win full ties.
pub fn pick_winner(candidates: &[CandidatePerf]) -> usize {
    debug_assert!(!candidates.is_empty());
    let mut winner = 0usize;
    for (i, c) in candidates.iter().enumerate().skip(1) {
        if better(c, &candidates[winner]) == Ordering::Greater {
            winner = i;
        }
    }
    debug!(
        target: "rook::query",
        winner,
        productivity = candidates[winner].productivity(),
        advances = candidates[winner].advances,
        works = candidates[winner].works,
        "plan ranking complete"
    );
    winner
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perf(works: u64, advances: u64) -> CandidatePerf {
        CandidatePerf {
            works,
            advances,
            ..Default::default()
        }
    }

    #[test]
    fn productivity_dominates() {
        let a = perf(100, 10);
        let b = perf(100, 90);
        assert_eq!(pick_winner(&[a, b]), 1);
    }

    #[test]
    fn eof_breaks_productivity_ties() {
        let mut a = perf(50, 25);
        let b = perf(100, 50);
        assert_eq!(pick_winner(&[a, b]), 0); // tie, first wins
        a.reached_eof = true;
        assert_eq!(pick_winner(&[b, a]), 1);
    }

    #[test]
    fn blocking_sort_loses_ties() {
        let mut a = perf(10, 5);
        let b = perf(10, 5);
        a.has_blocking_sort = true;
        assert_eq!(pick_winner(&[a, b]), 1);
    }

    #[test]
    fn bounds_score_then_fetches() {
        let mut a = perf(10, 5);
        let mut b = perf(10, 5);
        a.bounds_score = 7;
        b.bounds_score = 9;
        assert_eq!(pick_winner(&[a, b]), 1);

        let mut c = perf(10, 5);
        let mut d = perf(10, 5);
        c.docs_fetched = 100;
        d.docs_fetched = 3;
        assert_eq!(pick_winner(&[c, d]), 1);
    }

    #[test]
    fn zero_work_candidates_do_not_divide_by_zero() {
        let a = CandidatePerf::default();
        let b = perf(10, 1);
        assert_eq!(pick_winner(&[a, b]), 1);
    }
}
