//! Per-collection index catalog
//!
//! Runtime state of a collection's indexes: the descriptor, the tree, the
//! monotone multikey bits, and the ready flag the multi-phase build flips
//! at commit. The catalog is shared between the write path (maintenance),
//! the planner (index enumeration), and the command layer (create/drop).

use crate::btree::BucketTree;
use crate::descriptor::IndexDescriptor;
use parking_lot::RwLock;
use rook_core::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Runtime state of one index.
pub struct IndexCatalogEntry {
    descriptor: Arc<IndexDescriptor>,
    tree: Arc<BucketTree>,
    /// Monotone: set once any document fans out on any indexed path.
    multikey: AtomicBool,
    /// Which key-pattern fields have ever been array-valued.
    multikey_paths: RwLock<Vec<bool>>,
    /// False while a build is in progress; writes go to the side queue.
    ready: AtomicBool,
}

impl IndexCatalogEntry {
    /// Create an entry with an empty tree, immediately ready (used for
    /// indexes created on an empty collection; builds use `not_ready`).
    pub fn new(descriptor: IndexDescriptor) -> Arc<Self> {
        Self::with_readiness(descriptor, true)
    }

    /// Create an entry whose tree is still being built.
    pub fn not_ready(descriptor: IndexDescriptor) -> Arc<Self> {
        Self::with_readiness(descriptor, false)
    }

    fn with_readiness(descriptor: IndexDescriptor, ready: bool) -> Arc<Self> {
        let paths = descriptor.key_pattern.len();
        let tree = BucketTree::new(descriptor.name.clone());
        Arc::new(Self {
            descriptor: Arc::new(descriptor),
            tree,
            multikey: AtomicBool::new(false),
            multikey_paths: RwLock::new(vec![false; paths]),
            ready: AtomicBool::new(ready),
        })
    }

    /// The index definition.
    pub fn descriptor(&self) -> &Arc<IndexDescriptor> {
        &self.descriptor
    }

    /// The index tree.
    pub fn tree(&self) -> &Arc<BucketTree> {
        &self.tree
    }

    /// Has any document ever fanned out on an indexed path.
    pub fn is_multikey(&self) -> bool {
        self.multikey.load(Ordering::Acquire)
    }

    /// Per-field multikey bits.
    pub fn multikey_paths(&self) -> Vec<bool> {
        self.multikey_paths.read().clone()
    }

    /// Fold in multikey observations from one document's key set.
    /// The flag only ever goes from clear to set.
    pub fn note_multikey(&self, paths: &[bool]) {
        if !paths.iter().any(|p| *p) {
            return;
        }
        let mut guard = self.multikey_paths.write();
        for (slot, seen) in guard.iter_mut().zip(paths.iter()) {
            *slot |= *seen;
        }
        self.multikey.store(true, Ordering::Release);
    }

    /// True once the build committed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Flip the ready flag at build commit.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }
}

/// All indexes of one collection.
#[derive(Default)]
pub struct IndexCatalog {
    entries: RwLock<Vec<Arc<IndexCatalogEntry>>>,
}

impl IndexCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry. Fails when the name is taken.
    pub fn register(&self, entry: Arc<IndexCatalogEntry>) -> Result<()> {
        let mut entries = self.entries.write();
        if entries
            .iter()
            .any(|e| e.descriptor().name == entry.descriptor().name)
        {
            return Err(Error::bad_value(format!(
                "index {} already exists",
                entry.descriptor().name
            )));
        }
        info!(
            target: "rook::index",
            index = %entry.descriptor().name,
            key_pattern = %entry.descriptor().key_pattern,
            "index registered"
        );
        entries.push(entry);
        Ok(())
    }

    /// Drop by name, marking the tree so open cursors invalidate.
    pub fn drop_index(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.write();
        let idx = entries
            .iter()
            .position(|e| e.descriptor().name == name)
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))?;
        let entry = entries.remove(idx);
        entry.tree().mark_dropped();
        info!(target: "rook::index", index = name, "index dropped");
        Ok(())
    }

    /// Entry by name.
    pub fn find(&self, name: &str) -> Option<Arc<IndexCatalogEntry>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.descriptor().name == name)
            .cloned()
    }

    /// All entries, ready or not (the write path maintains both).
    pub fn all(&self) -> Vec<Arc<IndexCatalogEntry>> {
        self.entries.read().clone()
    }

    /// Entries whose builds have committed (the planner's view).
    pub fn ready(&self) -> Vec<Arc<IndexCatalogEntry>> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.is_ready())
            .cloned()
            .collect()
    }

    /// Number of registered indexes.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when no index exists.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::KeyPattern;
    use rook_core::doc;

    fn entry(name: &str) -> Arc<IndexCatalogEntry> {
        IndexCatalogEntry::new(IndexDescriptor::new(
            name,
            KeyPattern::parse(&doc! { "a": 1, "b": 1 }).unwrap(),
        ))
    }

    #[test]
    fn register_and_find() {
        let catalog = IndexCatalog::new();
        catalog.register(entry("a_1_b_1")).unwrap();
        assert!(catalog.find("a_1_b_1").is_some());
        assert!(catalog.find("other").is_none());
        assert_eq!(catalog.len(), 1);
        // Duplicate name rejected.
        assert!(catalog.register(entry("a_1_b_1")).is_err());
    }

    #[test]
    fn drop_marks_tree_dropped() {
        let catalog = IndexCatalog::new();
        let e = entry("a_1_b_1");
        let tree = e.tree().clone();
        catalog.register(e).unwrap();
        catalog.drop_index("a_1_b_1").unwrap();
        assert!(tree.is_dropped());
        assert!(matches!(
            catalog.drop_index("a_1_b_1"),
            Err(Error::IndexNotFound(_))
        ));
    }

    #[test]
    fn multikey_is_monotone() {
        let e = entry("a_1_b_1");
        assert!(!e.is_multikey());
        e.note_multikey(&[false, true]);
        assert!(e.is_multikey());
        assert_eq!(e.multikey_paths(), vec![false, true]);
        // Clearing never happens; further notes only add paths.
        e.note_multikey(&[false, false]);
        assert!(e.is_multikey());
        e.note_multikey(&[true, false]);
        assert_eq!(e.multikey_paths(), vec![true, true]);
    }

    #[test]
    fn ready_filter_hides_building_indexes() {
        let catalog = IndexCatalog::new();
        let building = IndexCatalogEntry::not_ready(IndexDescriptor::new(
            "building",
            KeyPattern::parse(&doc! { "x": 1 }).unwrap(),
        ));
        catalog.register(building.clone()).unwrap();
        catalog.register(entry("done")).unwrap();
        assert_eq!(catalog.ready().len(), 1);
        building.mark_ready();
        assert_eq!(catalog.ready().len(), 2);
    }
}
