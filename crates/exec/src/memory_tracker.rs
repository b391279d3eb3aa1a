//! Hierarchical memory accounting
//!
//! One [`MemoryTracker`] per operation holds the byte budget; named
//! sub-trackers (one per accumulator or stage) forward every delta to the
//! base so the operation total and each part's share are both visible.
//! Every tracker remembers its lifetime maximum for post-query stats.
//! Driving a tracker's current usage negative is a broken contract and
//! panics. [`MemoryToken`] binds a byte count to a scope: construction
//! adds, drop subtracts.

use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct Counters {
    current: i64,
    lifetime_max: i64,
}

impl Counters {
    fn update(&mut self, diff: i64, what: &str) {
        self.current += diff;
        assert!(
            self.current >= 0,
            "memory tracking underflow in {}: applying {} left {}",
            what,
            diff,
            self.current
        );
        if self.current > self.lifetime_max {
            self.lifetime_max = self.current;
        }
    }
}

struct Shared {
    base: Mutex<Counters>,
    max_allowed: i64,
    allow_disk_use: bool,
}

/// The per-operation budget holder.
#[derive(Clone)]
pub struct MemoryTracker {
    shared: Arc<Shared>,
}

impl MemoryTracker {
    /// Create a tracker with a byte budget.
    pub fn new(max_allowed_bytes: usize, allow_disk_use: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                base: Mutex::new(Counters::default()),
                max_allowed: max_allowed_bytes as i64,
                allow_disk_use,
            }),
        }
    }

    /// Open a named sub-tracker. Its updates propagate here.
    pub fn scoped(&self, name: impl Into<String>) -> SubTracker {
        SubTracker {
            parent: self.clone(),
            name: name.into(),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Apply a delta to the operation total.
    pub fn update(&self, diff: i64) {
        self.shared.base.lock().update(diff, "operation total");
    }

    /// Bytes currently accounted.
    pub fn current_bytes(&self) -> i64 {
        self.shared.base.lock().current
    }

    /// Highest total ever accounted.
    pub fn max_bytes(&self) -> i64 {
        self.shared.base.lock().lifetime_max
    }

    /// Still inside the budget?
    pub fn within_limit(&self) -> bool {
        self.shared.base.lock().current <= self.shared.max_allowed
    }

    /// The configured budget.
    pub fn max_allowed_bytes(&self) -> i64 {
        self.shared.max_allowed
    }

    /// May stages spill to disk instead of failing when over budget?
    pub fn allow_disk_use(&self) -> bool {
        self.shared.allow_disk_use
    }
}

/// A named child tracker. Updates both itself and its parent.
pub struct SubTracker {
    parent: MemoryTracker,
    name: String,
    counters: Mutex<Counters>,
}

impl SubTracker {
    /// Name of the accumulator or stage this tracks.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply a delta here and to the parent.
    pub fn update(&self, diff: i64) {
        self.counters.lock().update(diff, &self.name);
        self.parent.update(diff);
    }

    /// Set this tracker's current usage outright.
    pub fn set(&self, total: i64) {
        let diff = total - self.counters.lock().current;
        self.update(diff);
    }

    /// Bytes this part currently accounts.
    pub fn current_bytes(&self) -> i64 {
        self.counters.lock().current
    }

    /// Highest usage this part ever reached.
    pub fn max_bytes(&self) -> i64 {
        self.counters.lock().lifetime_max
    }

    /// Is the operation total still inside the budget?
    pub fn within_limit(&self) -> bool {
        self.parent.within_limit()
    }

    /// May stages spill to disk instead of failing when over budget?
    pub fn allow_disk_use(&self) -> bool {
        self.parent.allow_disk_use()
    }

    /// RAII token for `bytes` of usage in this scope.
    pub fn token(&self, bytes: usize) -> MemoryToken<'_> {
        self.update(bytes as i64);
        MemoryToken {
            tracker: self,
            bytes: bytes as i64,
        }
    }
}

/// Scope-bound memory accounting: construction added, drop subtracts.
pub struct MemoryToken<'a> {
    tracker: &'a SubTracker,
    bytes: i64,
}

impl MemoryToken<'_> {
    /// Bytes this token holds.
    pub fn bytes(&self) -> i64 {
        self.bytes
    }
}

impl Drop for MemoryToken<'_> {
    fn drop(&mut self) {
        self.tracker.update(-self.bytes);
    }
}
