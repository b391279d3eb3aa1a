//! Multi-phase index build
//!
//! Building an index on a populated collection runs in three phases:
//!
//! 1. **Scan + sort + bulk load**: walk the record store, generate keys for
//!    every document, sort them, and bulk-load the tree.
//! 2. **Drain**: writes that landed while the scan ran were queued as side
//!    writes by the write path (the entry is registered but not ready);
//!    apply them in order.
//! 3. **Commit**: drain until the queue is empty, then flip the entry ready
//!    so the planner sees it.
//!
//! The build fails wholesale on the first document whose keys cannot be
//! generated (parallel arrays, bad hashed values), leaving the entry
//! unregistered.

use crate::catalog::{IndexCatalog, IndexCatalogEntry};
use crate::codec::encode_keys;
use crate::descriptor::IndexDescriptor;
use parking_lot::Mutex;
use rook_core::{Error, OperationContext, RecordId, Result};
use rook_storage::{Direction, RecordStore, UnitOfWork};
use std::sync::Arc;
use tracing::info;

/// A write that happened while the scan phase was running.
#[derive(Debug, Clone)]
pub enum SideWrite {
    /// Insert these key bytes.
    Insert {
        /// Encoded key.
        key: Vec<u8>,
        /// Typebits trailer.
        type_bits: Vec<u8>,
        /// Target record.
        rid: RecordId,
    },
    /// Remove these key bytes.
    Remove {
        /// Encoded key.
        key: Vec<u8>,
        /// Target record.
        rid: RecordId,
    },
}

/// An in-progress build.
pub struct IndexBuild {
    entry: Arc<IndexCatalogEntry>,
    side_writes: Mutex<Vec<SideWrite>>,
}

impl IndexBuild {
    /// Start a build: registers a not-ready entry in the catalog so the
    /// write path begins queueing side writes, then returns the handle that
    /// drives the phases.
    pub fn start(catalog: &IndexCatalog, descriptor: IndexDescriptor) -> Result<Arc<IndexBuild>> {
        let entry = IndexCatalogEntry::not_ready(descriptor);
        catalog.register(entry.clone())?;
        Ok(Arc::new(IndexBuild {
            entry,
            side_writes: Mutex::new(Vec::new()),
        }))
    }

    /// The entry being built.
    pub fn entry(&self) -> &Arc<IndexCatalogEntry> {
        &self.entry
    }

    /// Queue a side write. Called by the write path for not-ready entries.
    pub fn push_side_write(&self, write: SideWrite) {
        self.side_writes.lock().push(write);
    }

    /// Phase 1: scan the record store, generate and sort all keys, bulk
    /// load the tree.
    pub fn scan_and_load(
        &self,
        rs: &dyn RecordStore,
        opctx: &OperationContext,
    ) -> Result<BuildStats> {
        let descriptor = self.entry.descriptor().clone();
        let mut entries: Vec<(Vec<u8>, Vec<u8>, RecordId)> = Vec::new();
        let mut docs_scanned = 0u64;

        let mut cursor = rs.cursor(Direction::Forward);
        while let Some((rid, doc)) = cursor.next() {
            opctx.check_for_interrupt()?;
            docs_scanned += 1;
            let key_set = encode_keys(&descriptor, &doc)?;
            self.entry.note_multikey(&key_set.multikey_paths);
            for k in key_set.keys {
                entries.push((k.bytes, k.type_bits, rid));
            }
        }

        entries.sort_by(|a, b| (&a.0, a.2).cmp(&(&b.0, b.2)));
        if descriptor.unique {
            for w in entries.windows(2) {
                if w[0].0 == w[1].0 && w[0].2 != w[1].2 {
                    return Err(Error::duplicate_key(
                        descriptor.name.clone(),
                        format!("{:02x?}", &w[0].0[..w[0].0.len().min(16)]),
                    ));
                }
            }
        }
        entries.dedup_by(|a, b| a.0 == b.0 && a.2 == b.2);

        let keys_loaded = entries.len() as u64;
        self.entry.tree().bulk_load(&entries)?;
        info!(
            target: "rook::index",
            index = %descriptor.name,
            docs = docs_scanned,
            keys = keys_loaded,
            "index build scan phase complete"
        );
        Ok(BuildStats {
            docs_scanned,
            keys_loaded,
        })
    }

    /// Phase 2: apply queued side writes. Returns how many were applied;
    /// callers loop until it returns zero.
    pub fn drain_side_writes(&self, opctx: &OperationContext) -> Result<usize> {
        let writes: Vec<SideWrite> = self.side_writes.lock().drain(..).collect();
        let descriptor = self.entry.descriptor();
        let tree = self.entry.tree();
        for write in &writes {
            opctx.check_for_interrupt()?;
            let mut uow = UnitOfWork::new();
            match write {
                SideWrite::Insert {
                    key,
                    type_bits,
                    rid,
                } => tree.insert(&mut uow, key, type_bits, *rid, descriptor.unique)?,
                SideWrite::Remove { key, rid } => {
                    tree.remove(&mut uow, key, *rid)?;
                }
            }
            uow.commit();
        }
        Ok(writes.len())
    }

    /// Phase 3: drain to empty, then flip ready.
    pub fn commit(&self, opctx: &OperationContext) -> Result<()> {
        while self.drain_side_writes(opctx)? > 0 {}
        self.entry.mark_ready();
        info!(
            target: "rook::index",
            index = %self.entry.descriptor().name,
            "index build committed"
        );
        Ok(())
    }
}

/// Scan-phase counters.
#[derive(Debug, Clone, Copy)]
pub struct BuildStats {
    /// Documents scanned from the record store.
    pub docs_scanned: u64,
    /// Keys bulk-loaded.
    pub keys_loaded: u64,
}
