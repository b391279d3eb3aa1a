//! Storage-engine interface
//!
//! The execution layers consume storage through this narrow surface: record
//! stores with cursors and exact seeks, plus units of work for atomicity.
//! The page-level engine behind it is swappable; `rook-storage` ships the
//! in-memory heap engine the server and the test substrate run on.
//!
//! Thread safety: record stores are shared across operations and must be
//! `Send + Sync`. Cursors belong to one operation and are only `Send`.

use crate::uow::UnitOfWork;
use rook_core::{Document, RecordId, Result};
use std::sync::Arc;

/// Traversal direction of a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Ascending order.
    Forward,
    /// Descending order.
    Backward,
}

impl Direction {
    /// The opposite direction.
    pub fn reverse(self) -> Direction {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }

    /// Numeric sign, +1 forward / -1 backward.
    pub fn sign(self) -> i32 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }
}

/// Result of an update: the record may have been relocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// New record id when the engine relocated the record, else `None`.
    pub relocated_to: Option<RecordId>,
}

/// A collection's primary document storage.
pub trait RecordStore: Send + Sync {
    /// Storage identifier (diagnostics only).
    fn ident(&self) -> &str;

    /// Insert a document, assigning the next record id.
    fn insert(&self, uow: &mut UnitOfWork, doc: Document) -> Result<RecordId>;

    /// Replace the document at `rid`.
    fn update(&self, uow: &mut UnitOfWork, rid: RecordId, doc: Document) -> Result<UpdateOutcome>;

    /// Delete the document at `rid`, returning the pre-image.
    fn remove(&self, uow: &mut UnitOfWork, rid: RecordId) -> Result<Document>;

    /// Point lookup by record id.
    fn find(&self, rid: RecordId) -> Option<Document>;

    /// Open a cursor over the store in storage (record id) order.
    fn cursor(&self, direction: Direction) -> Box<dyn RecordCursor>;

    /// Number of live records.
    fn num_records(&self) -> usize;
}

/// Cursor over a record store.
///
/// Cursors never hold storage locks between calls, so they stay valid across
/// yields; each call observes the store as of that call.
pub trait RecordCursor: Send {
    /// Advance and return the next record, or `None` at the end.
    fn next(&mut self) -> Option<(RecordId, Document)>;

    /// Position at the first record at-or-past `rid` in this cursor's
    /// direction and return it.
    fn seek(&mut self, rid: RecordId) -> Option<(RecordId, Document)>;

    /// Point lookup that does not move the cursor.
    fn seek_exact(&self, rid: RecordId) -> Option<Document>;
}

/// The engine: hands out record stores and units of work.
pub trait StorageEngine: Send + Sync {
    /// Get or create the record store for `ident`.
    fn get_or_create_record_store(&self, ident: &str) -> Arc<dyn RecordStore>;

    /// Drop the record store for `ident`, if present.
    fn drop_record_store(&self, ident: &str);

    /// Open a unit of work (the storage transaction bracket for one local
    /// write).
    fn start_unit_of_work(&self) -> UnitOfWork;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_helpers() {
        assert_eq!(Direction::Forward.reverse(), Direction::Backward);
        assert_eq!(Direction::Backward.sign(), -1);
        assert_eq!(Direction::Forward.sign(), 1);
    }

    #[test]
    fn record_store_is_object_safe() {
        fn accepts(_rs: &dyn RecordStore) {}
        let _ = accepts as fn(&dyn RecordStore);
    }

    #[test]
    fn engine_is_object_safe_and_sync() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn StorageEngine>();
        assert_send_sync::<dyn RecordStore>();
    }
}
