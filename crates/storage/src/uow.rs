//! Units of work
//!
//! A [`UnitOfWork`] brackets one local write: every mutation applied through
//! it registers an undo action, and the whole set either commits (undos
//! discarded) or rolls back (undos applied in reverse). Dropping an active
//! unit of work rolls it back, so an early `?` return leaves the record
//! store and every index consistent.

use tracing::debug;

type UndoFn = Box<dyn FnOnce() + Send>;

/// State of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UowState {
    Active,
    Committed,
    RolledBack,
}

/// The storage transaction bracket for one local write.
pub struct UnitOfWork {
    state: UowState,
    undo: Vec<UndoFn>,
    /// Change callbacks that run on successful commit (oplog emission,
    /// multikey flag flips).
    on_commit: Vec<Box<dyn FnOnce() + Send>>,
}

impl UnitOfWork {
    /// Open a fresh unit of work.
    pub fn new() -> Self {
        Self {
            state: UowState::Active,
            undo: Vec::new(),
            on_commit: Vec::new(),
        }
    }

    /// True until committed or rolled back.
    pub fn is_active(&self) -> bool {
        self.state == UowState::Active
    }

    /// Register the inverse of a mutation just applied. Undos run in reverse
    /// registration order on rollback.
    pub fn register_undo(&mut self, f: impl FnOnce() + Send + 'static) {
        debug_assert!(self.is_active());
        self.undo.push(Box::new(f));
    }

    /// Register a callback to run only if the unit of work commits.
    pub fn on_commit(&mut self, f: impl FnOnce() + Send + 'static) {
        debug_assert!(self.is_active());
        self.on_commit.push(Box::new(f));
    }

    /// Commit: discard undos, run commit callbacks.
    pub fn commit(mut self) {
        assert!(self.is_active(), "commit on finished unit of work");
        self.state = UowState::Committed;
        self.undo.clear();
        for f in self.on_commit.drain(..) {
            f();
        }
    }

    /// Roll back: apply undos in reverse order.
    pub fn rollback(mut self) {
        self.rollback_in_place();
    }

    fn rollback_in_place(&mut self) {
        if self.state != UowState::Active {
            return;
        }
        self.state = UowState::RolledBack;
        let n = self.undo.len();
        for f in self.undo.drain(..).rev() {
            f();
        }
        self.on_commit.clear();
        if n > 0 {
            debug!(target: "rook::storage", undone = n, "unit of work rolled back");
        }
    }
}

impl Default for UnitOfWork {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        // An abandoned unit of work rolls back.
        self.rollback_in_place();
    }
}
