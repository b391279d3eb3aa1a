//! Yield policies
//!
//! Each operation declares how it interacts with suspension points. The
//! elapsed-work tracker decides when a check is due (iteration count or
//! wall-clock period, whichever fires first); the executor then saves all
//! stages, releases its snapshot, and restores.
//!
//! The two `Always*` policies exist for tests only: they force the failure
//! paths (`ExceededTimeLimit`, `QueryPlanKilled`) at the first suspension
//! point.

use rook_core::YieldKnobs;
use std::time::{Duration, Instant};

/// Per-operation yield policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldPolicy {
    /// May release locks and snapshot at any suspension point; must
    /// tolerate catalog changes on resume.
    YieldAuto,
    /// Keeps locks, but abandons the snapshot on write conflict so the
    /// retry loop can reopen it.
    WriteConflictRetryOnly,
    /// Caller guarantees short-lived locks; interrupts still observed.
    NoYield,
    /// Checks cancellation but never yields.
    InterruptOnly,
    /// Test-only: the first yield point fails with `ExceededTimeLimit`.
    AlwaysTimeOut,
    /// Test-only: the first yield point fails with `QueryPlanKilled`.
    AlwaysMarkKilled,
}

impl YieldPolicy {
    /// Does this policy ever release locks/snapshot?
    pub fn can_release(&self) -> bool {
        matches!(
            self,
            YieldPolicy::YieldAuto | YieldPolicy::AlwaysTimeOut | YieldPolicy::AlwaysMarkKilled
        )
    }

    /// Wire/debug spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            YieldPolicy::YieldAuto => "YIELD_AUTO",
            YieldPolicy::WriteConflictRetryOnly => "WRITE_CONFLICT_RETRY_ONLY",
            YieldPolicy::NoYield => "NO_YIELD",
            YieldPolicy::InterruptOnly => "INTERRUPT_ONLY",
            YieldPolicy::AlwaysTimeOut => "ALWAYS_TIME_OUT",
            YieldPolicy::AlwaysMarkKilled => "ALWAYS_MARK_KILLED",
        }
    }
}

/// Decides when the next yield check is due.
pub struct ElapsedTracker {
    yield_iterations: u32,
    yield_period: Duration,
    iterations_since: u32,
    last_reset: Instant,
}

impl ElapsedTracker {
    /// Build from the configured knobs.
    pub fn new(knobs: &YieldKnobs) -> Self {
        Self {
            yield_iterations: knobs.yield_iterations,
            yield_period: Duration::from_millis(knobs.yield_period_ms),
            iterations_since: 0,
            last_reset: Instant::now(),
        }
    }

    /// Count one unit of work; true when a check is due.
    pub fn tick(&mut self) -> bool {
        self.iterations_since += 1;
        if self.iterations_since >= self.yield_iterations {
            return true;
        }
        self.last_reset.elapsed() >= self.yield_period
    }

    /// Restart the interval after a completed check.
    pub fn reset(&mut self) {
        self.iterations_since = 0;
        self.last_reset = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_release_classification() {
        assert!(YieldPolicy::YieldAuto.can_release());
        assert!(!YieldPolicy::NoYield.can_release());
        assert!(!YieldPolicy::InterruptOnly.can_release());
        assert!(!YieldPolicy::WriteConflictRetryOnly.can_release());
    }

    #[test]
    fn tracker_fires_on_iteration_budget() {
        let knobs = YieldKnobs {
            yield_iterations: 3,
            yield_period_ms: 60_000,
        };
        let mut t = ElapsedTracker::new(&knobs);
        assert!(!t.tick());
        assert!(!t.tick());
        assert!(t.tick());
        t.reset();
        assert!(!t.tick());
    }

    #[test]
    fn tracker_fires_on_elapsed_period() {
        let knobs = YieldKnobs {
            yield_iterations: 1_000_000,
            yield_period_ms: 0,
        };
        let mut t = ElapsedTracker::new(&knobs);
        assert!(t.tick());
    }
}
