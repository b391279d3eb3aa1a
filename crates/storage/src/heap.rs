//! In-memory heap storage engine
//!
//! Record stores are ordered maps from record id to document behind an
//! RwLock; record ids are assigned monotonically per store. Cursors do not
//! pin the lock between calls, so they tolerate concurrent mutation and
//! survive yields by construction.
//!
//! The engine can inject `WriteConflict` failures on demand, which is how
//! the write path's retry loop is exercised.

use crate::traits::{Direction, RecordCursor, RecordStore, StorageEngine, UpdateOutcome};
use crate::uow::UnitOfWork;
use dashmap::DashMap;
use parking_lot::RwLock;
use rook_core::{Document, Error, RecordId, Result};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

/// The in-memory engine.
pub struct HeapEngine {
    stores: DashMap<String, Arc<HeapRecordStore>>,
    /// Remaining write operations that will fail with `WriteConflict`;
    /// shared with every store this engine creates.
    injected_conflicts: Arc<AtomicU32>,
}

impl HeapEngine {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self {
            stores: DashMap::new(),
            injected_conflicts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Make the next `n` write operations fail with `WriteConflict`.
    /// Used to exercise the write path's retry loop.
    pub fn inject_write_conflicts(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    /// Like [`StorageEngine::get_or_create_record_store`] but typed, for
    /// callers that want the concrete store.
    pub fn heap_store(&self, ident: &str) -> Arc<HeapRecordStore> {
        self.stores
            .entry(ident.to_string())
            .or_insert_with(|| {
                let mut rs = HeapRecordStore::new(ident);
                rs.conflicts = Some(self.injected_conflicts.clone());
                Arc::new(rs)
            })
            .clone()
    }
}

impl Default for HeapEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for HeapEngine {
    fn get_or_create_record_store(&self, ident: &str) -> Arc<dyn RecordStore> {
        self.heap_store(ident)
    }

    fn drop_record_store(&self, ident: &str) {
        self.stores.remove(ident);
    }

    fn start_unit_of_work(&self) -> UnitOfWork {
        UnitOfWork::new()
    }
}

/// One collection's heap storage.
pub struct HeapRecordStore {
    ident: String,
    records: Arc<RwLock<BTreeMap<RecordId, Document>>>,
    next_rid: AtomicI64,
    /// Back-reference for conflict injection; `None` for stores created
    /// outside an engine (unit tests).
    conflicts: Option<Arc<AtomicU32>>,
}

impl HeapRecordStore {
    /// Create a store detached from any engine.
    pub fn new(ident: &str) -> Self {
        Self {
            ident: ident.to_string(),
            records: Arc::new(RwLock::new(BTreeMap::new())),
            next_rid: AtomicI64::new(1),
            conflicts: None,
        }
    }

    fn check_conflict(&self) -> Result<()> {
        if let Some(conflicts) = &self.conflicts {
            let mut remaining = conflicts.load(Ordering::SeqCst);
            while remaining > 0 {
                match conflicts.compare_exchange(
                    remaining,
                    remaining - 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => return Err(Error::write_conflict("injected storage conflict")),
                    Err(actual) => remaining = actual,
                }
            }
        }
        Ok(())
    }
}

impl RecordStore for HeapRecordStore {
    fn ident(&self) -> &str {
        &self.ident
    }

    fn insert(&self, uow: &mut UnitOfWork, doc: Document) -> Result<RecordId> {
        self.check_conflict()?;
        let rid = RecordId(self.next_rid.fetch_add(1, Ordering::SeqCst));
        self.records.write().insert(rid, doc);
        let records = self.records.clone();
        uow.register_undo(move || {
            records.write().remove(&rid);
        });
        Ok(rid)
    }

    fn update(&self, uow: &mut UnitOfWork, rid: RecordId, doc: Document) -> Result<UpdateOutcome> {
        self.check_conflict()?;
        let mut guard = self.records.write();
        let slot = guard.get_mut(&rid).ok_or_else(|| {
            Error::internal(format!("update of missing record {} in {}", rid, self.ident))
        })?;
        let pre_image = std::mem::replace(slot, doc);
        drop(guard);
        let records = self.records.clone();
        uow.register_undo(move || {
            records.write().insert(rid, pre_image);
        });
        // The heap engine never relocates records.
        Ok(UpdateOutcome {
            relocated_to: None,
        })
    }

    fn remove(&self, uow: &mut UnitOfWork, rid: RecordId) -> Result<Document> {
        self.check_conflict()?;
        let pre_image = self.records.write().remove(&rid).ok_or_else(|| {
            Error::internal(format!("delete of missing record {} in {}", rid, self.ident))
        })?;
        let records = self.records.clone();
        let undo_image = pre_image.clone();
        uow.register_undo(move || {
            records.write().insert(rid, undo_image);
        });
        Ok(pre_image)
    }

    fn find(&self, rid: RecordId) -> Option<Document> {
        self.records.read().get(&rid).cloned()
    }

    fn cursor(&self, direction: Direction) -> Box<dyn RecordCursor> {
        Box::new(HeapCursor {
            records: self.records.clone(),
            direction,
            last: None,
        })
    }

    fn num_records(&self) -> usize {
        self.records.read().len()
    }
}

struct HeapCursor {
    records: Arc<RwLock<BTreeMap<RecordId, Document>>>,
    direction: Direction,
    /// Last record id returned; the next call resumes past it.
    last: Option<RecordId>,
}

impl RecordCursor for HeapCursor {
    fn next(&mut self) -> Option<(RecordId, Document)> {
        let guard = self.records.read();
        let entry = match (self.direction, self.last) {
            (Direction::Forward, None) => guard.iter().next(),
            (Direction::Forward, Some(last)) => guard
                .range((Bound::Excluded(last), Bound::Unbounded))
                .next(),
            (Direction::Backward, None) => guard.iter().next_back(),
            (Direction::Backward, Some(last)) => guard
                .range((Bound::Unbounded, Bound::Excluded(last)))
                .next_back(),
        };
        let (rid, doc) = entry.map(|(r, d)| (*r, d.clone()))?;
        self.last = Some(rid);
        Some((rid, doc))
    }

    fn seek(&mut self, rid: RecordId) -> Option<(RecordId, Document)> {
        let guard = self.records.read();
        let entry = match self.direction {
            Direction::Forward => guard.range(rid..).next(),
            Direction::Backward => guard.range(..=rid).next_back(),
        };
        let (rid, doc) = entry.map(|(r, d)| (*r, d.clone()))?;
        self.last = Some(rid);
        Some((rid, doc))
    }

    fn seek_exact(&self, rid: RecordId) -> Option<Document> {
        self.records.read().get(&rid).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rook_core::doc;

    fn store_with_docs(n: i32) -> HeapRecordStore {
        let rs = HeapRecordStore::new("test.docs");
        let mut uow = UnitOfWork::new();
        for i in 0..n {
            rs.insert(&mut uow, doc! { "i": i }).unwrap();
        }
        uow.commit();
        rs
    }

    #[test]
    fn insert_assigns_monotonic_rids() {
        let rs = HeapRecordStore::new("t.c");
        let mut uow = UnitOfWork::new();
        let a = rs.insert(&mut uow, doc! { "x": 1 }).unwrap();
        let b = rs.insert(&mut uow, doc! { "x": 2 }).unwrap();
        uow.commit();
        assert!(a < b);
        assert_eq!(rs.num_records(), 2);
    }

    #[test]
    fn rollback_undoes_all_mutations() {
        let rs = store_with_docs(1);
        let rid = rs.cursor(Direction::Forward).next().unwrap().0;
        {
            let mut uow = UnitOfWork::new();
            rs.insert(&mut uow, doc! { "i": 99 }).unwrap();
            rs.update(&mut uow, rid, doc! { "i": (-1) }).unwrap();
            uow.rollback();
        }
        assert_eq!(rs.num_records(), 1);
        assert_eq!(rs.find(rid).unwrap(), doc! { "i": 0 });
    }

    #[test]
    fn remove_returns_pre_image() {
        let rs = store_with_docs(2);
        let rid = rs.cursor(Direction::Forward).next().unwrap().0;
        let mut uow = UnitOfWork::new();
        let pre = rs.remove(&mut uow, rid).unwrap();
        uow.commit();
        assert_eq!(pre, doc! { "i": 0 });
        assert_eq!(rs.num_records(), 1);
    }

    #[test]
    fn cursor_tolerates_concurrent_deletes() {
        let rs = store_with_docs(5);
        let mut cursor = rs.cursor(Direction::Forward);
        let (first, _) = cursor.next().unwrap();

        // Delete the record the cursor would visit next.
        let victim = RecordId(first.0 + 1);
        let mut uow = UnitOfWork::new();
        rs.remove(&mut uow, victim).unwrap();
        uow.commit();

        let (next, doc) = cursor.next().unwrap();
        assert_eq!(next, RecordId(first.0 + 2));
        assert_eq!(doc, doc! { "i": 2 });
    }

    #[test]
    fn backward_cursor_walks_in_reverse() {
        let rs = store_with_docs(3);
        let mut cursor = rs.cursor(Direction::Backward);
        let mut seen = Vec::new();
        while let Some((_, d)) = cursor.next() {
            seen.push(d.get("i").unwrap().clone());
        }
        assert_eq!(
            seen,
            vec![2i32.into(), 1i32.into(), 0i32.into()]
        );
    }

    #[test]
    fn empty_scan_returns_eof_immediately() {
        let rs = HeapRecordStore::new("t.empty");
        let mut cursor = rs.cursor(Direction::Forward);
        assert!(cursor.next().is_none());
    }

    #[test]
    fn injected_conflicts_surface_and_decay() {
        let engine = HeapEngine::new();
        let rs = engine.heap_store("t.c");
        engine.inject_write_conflicts(2);

        let mut uow = UnitOfWork::new();
        let first = rs.insert(&mut uow, doc! {});
        assert!(matches!(first, Err(Error::WriteConflict(_))));
        let second = rs.insert(&mut uow, doc! {});
        assert!(matches!(second, Err(Error::WriteConflict(_))));
        // Injection exhausted: writes succeed again.
        assert!(rs.insert(&mut uow, doc! {}).is_ok());
        uow.commit();
        assert_eq!(rs.num_records(), 1);
    }
}
