//! Write path and index maintenance
//!
//! Every write runs inside a unit of work: mutate the record store, then
//! bring every index in line by deleting the key-set difference
//! `pre − post` and inserting `post − pre`. The unit of work commits only
//! after both halves succeeded, so a failure (duplicate key, parallel
//! arrays) leaves the record store and every index untouched.
//!
//! `WriteConflict` from the storage layer is retried here with bounded
//! exponential backoff; everything else propagates. The replication log
//! hears about committed writes through the [`OpObserver`] seam.

use crate::collection::Collection;
use rook_core::{
    Document, Error, NamespaceString, OperationContext, RecordId, Result, WriteKnobs,
};
use rook_index::{decode_key, encode_keys, IndexCatalogEntry, SideWrite};
use rook_query::{Matcher, Predicate};
use rook_storage::UnitOfWork;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Observer of committed logical writes (replication, change streams,
/// sharding hooks).
pub trait OpObserver: Send + Sync {
    /// A document was inserted.
    fn on_insert(&self, ns: &NamespaceString, doc: &Document, rid: RecordId);
    /// A document was replaced.
    fn on_update(&self, ns: &NamespaceString, pre: &Document, post: &Document, rid: RecordId);
    /// A document was deleted.
    fn on_delete(&self, ns: &NamespaceString, pre: &Document, rid: RecordId);
}

/// Observer that drops everything (standalone mode, tests).
pub struct NullObserver;

impl OpObserver for NullObserver {
    fn on_insert(&self, _ns: &NamespaceString, _doc: &Document, _rid: RecordId) {}
    fn on_update(&self, _ns: &NamespaceString, _pre: &Document, _post: &Document, _rid: RecordId) {}
    fn on_delete(&self, _ns: &NamespaceString, _pre: &Document, _rid: RecordId) {}
}

/// The write entry point.
pub struct WritePath {
    knobs: WriteKnobs,
    observer: Arc<dyn OpObserver>,
}

impl WritePath {
    /// Create a write path reporting to `observer`.
    pub fn new(knobs: WriteKnobs, observer: Arc<dyn OpObserver>) -> Self {
        Self { knobs, observer }
    }

    /// Insert one document.
    pub fn insert(
        &self,
        coll: &Collection,
        doc: Document,
        opctx: &OperationContext,
    ) -> Result<RecordId> {
        self.retry_conflicts(opctx, || self.insert_once(coll, doc.clone()))
    }

    /// Replace the document at `rid`.
    pub fn update(
        &self,
        coll: &Collection,
        rid: RecordId,
        new_doc: Document,
        opctx: &OperationContext,
    ) -> Result<()> {
        self.retry_conflicts(opctx, || self.update_once(coll, rid, new_doc.clone()))
    }

    /// Delete the document at `rid`, returning the pre-image.
    pub fn delete(
        &self,
        coll: &Collection,
        rid: RecordId,
        opctx: &OperationContext,
    ) -> Result<Document> {
        self.retry_conflicts(opctx, || self.delete_once(coll, rid))
    }

    /// Bounded exponential-backoff retry for storage write conflicts.
    fn retry_conflicts<T>(
        &self,
        opctx: &OperationContext,
        mut attempt: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let mut backoff = self.knobs.backoff_base_micros;
        for tries in 0..self.knobs.write_conflict_retry_limit {
            opctx.check_for_interrupt()?;
            match attempt() {
                Err(e) if e.is_write_conflict() => {
                    debug!(target: "rook::txn", tries, "write conflict, retrying");
                    std::thread::sleep(Duration::from_micros(backoff));
                    backoff = (backoff * 2).min(self.knobs.backoff_cap_micros);
                }
                other => return other,
            }
        }
        warn!(
            target: "rook::txn",
            limit = self.knobs.write_conflict_retry_limit,
            "write conflict retry limit exhausted"
        );
        Err(Error::write_conflict("retry limit exhausted"))
    }

    fn insert_once(&self, coll: &Collection, doc: Document) -> Result<RecordId> {
        let mut uow = UnitOfWork::new();
        let rid = coll.record_store().insert(&mut uow, doc.clone())?;
        for entry in coll.index_catalog().all() {
            if entry.is_ready() {
                apply_index_insert(&entry, &doc, rid, &mut uow)?;
            } else {
                queue_side_writes_insert(coll, &entry, &doc, rid)?;
            }
        }
        let observer = self.observer.clone();
        let ns = coll.ns().clone();
        let committed_doc = doc;
        uow.on_commit(move || observer.on_insert(&ns, &committed_doc, rid));
        uow.commit();
        Ok(rid)
    }

    fn update_once(&self, coll: &Collection, rid: RecordId, new_doc: Document) -> Result<()> {
        let mut uow = UnitOfWork::new();
        let pre = coll
            .record_store()
            .find(rid)
            .ok_or_else(|| Error::internal(format!("update target {} missing", rid)))?;
        let outcome = coll.record_store().update(&mut uow, rid, new_doc.clone())?;
        let post_rid = outcome.relocated_to.unwrap_or(rid);

        for entry in coll.index_catalog().all() {
            if entry.is_ready() {
                apply_index_update(&entry, &pre, &new_doc, rid, post_rid, &mut uow)?;
            } else {
                queue_side_writes_update(coll, &entry, &pre, &new_doc, rid, post_rid)?;
            }
        }
        let observer = self.observer.clone();
        let ns = coll.ns().clone();
        let post = new_doc;
        uow.on_commit(move || observer.on_update(&ns, &pre, &post, post_rid));
        uow.commit();
        Ok(())
    }

    fn delete_once(&self, coll: &Collection, rid: RecordId) -> Result<Document> {
        let mut uow = UnitOfWork::new();
        let pre = coll.record_store().remove(&mut uow, rid)?;
        for entry in coll.index_catalog().all() {
            if entry.is_ready() {
                apply_index_delete(&entry, &pre, rid, &mut uow)?;
            } else {
                queue_side_writes_delete(coll, &entry, &pre, rid)?;
            }
        }
        let observer = self.observer.clone();
        let ns = coll.ns().clone();
        let pre_image = pre.clone();
        uow.on_commit(move || observer.on_delete(&ns, &pre_image, rid));
        uow.commit();
        Ok(pre)
    }
}

/// Does the document fall under the index at all (partial filters)?
fn index_wants(entry: &IndexCatalogEntry, doc: &Document) -> Result<bool> {
    match &entry.descriptor().partial_filter {
        None => Ok(true),
        Some(filter) => {
            let matcher = Matcher::new(Predicate::parse(filter)?)?;
            Ok(matcher.matches(doc))
        }
    }
}

fn apply_index_insert(
    entry: &Arc<IndexCatalogEntry>,
    doc: &Document,
    rid: RecordId,
    uow: &mut UnitOfWork,
) -> Result<()> {
    if !index_wants(entry, doc)? {
        return Ok(());
    }
    let descriptor = entry.descriptor();
    let key_set = encode_keys(descriptor, doc)?;
    for key in &key_set.keys {
        entry
            .tree()
            .insert(uow, &key.bytes, &key.type_bits, rid, descriptor.unique)
            .map_err(|e| rewrap_duplicate(e, entry, &key.bytes, &key.type_bits))?;
    }
    // Multikey flips only once the write is in.
    if key_set.is_multikey() {
        let entry = entry.clone();
        let paths = key_set.multikey_paths.clone();
        uow.on_commit(move || entry.note_multikey(&paths));
    }
    Ok(())
}

fn apply_index_update(
    entry: &Arc<IndexCatalogEntry>,
    pre: &Document,
    post: &Document,
    pre_rid: RecordId,
    post_rid: RecordId,
    uow: &mut UnitOfWork,
) -> Result<()> {
    let descriptor = entry.descriptor();
    let pre_keys = if index_wants(entry, pre)? {
        encode_keys(descriptor, pre)?.keys.to_vec()
    } else {
        Vec::new()
    };
    let post_set = if index_wants(entry, post)? {
        encode_keys(descriptor, post)?
    } else {
        rook_index::KeySet {
            keys: Default::default(),
            multikey_paths: vec![false; descriptor.key_pattern.len()],
        }
    };

    let same_rid = pre_rid == post_rid;
    // Delete pre − post, insert post − pre.
    for key in &pre_keys {
        let keep = same_rid && post_set.keys.iter().any(|k| k.bytes == key.bytes);
        if !keep {
            entry.tree().remove(uow, &key.bytes, pre_rid)?;
        }
    }
    for key in &post_set.keys {
        let had = same_rid && pre_keys.iter().any(|k| k.bytes == key.bytes);
        if !had {
            entry
                .tree()
                .insert(uow, &key.bytes, &key.type_bits, post_rid, descriptor.unique)
                .map_err(|e| rewrap_duplicate(e, entry, &key.bytes, &key.type_bits))?;
        }
    }
    if post_set.is_multikey() {
        let entry = entry.clone();
        let paths = post_set.multikey_paths.clone();
        uow.on_commit(move || entry.note_multikey(&paths));
    }
    Ok(())
}

fn apply_index_delete(
    entry: &Arc<IndexCatalogEntry>,
    pre: &Document,
    rid: RecordId,
    uow: &mut UnitOfWork,
) -> Result<()> {
    if !index_wants(entry, pre)? {
        return Ok(());
    }
    let key_set = encode_keys(entry.descriptor(), pre)?;
    for key in &key_set.keys {
        entry.tree().remove(uow, &key.bytes, rid)?;
    }
    Ok(())
}

fn queue_side_writes_insert(
    coll: &Collection,
    entry: &Arc<IndexCatalogEntry>,
    doc: &Document,
    rid: RecordId,
) -> Result<()> {
    if !index_wants(entry, doc)? {
        return Ok(());
    }
    let key_set = encode_keys(entry.descriptor(), doc)?;
    for build in coll.builds_in_progress() {
        if Arc::ptr_eq(build.entry(), entry) {
            for key in &key_set.keys {
                build.push_side_write(SideWrite::Insert {
                    key: key.bytes.clone(),
                    type_bits: key.type_bits.clone(),
                    rid,
                });
            }
        }
    }
    Ok(())
}

fn queue_side_writes_delete(
    coll: &Collection,
    entry: &Arc<IndexCatalogEntry>,
    pre: &Document,
    rid: RecordId,
) -> Result<()> {
    if !index_wants(entry, pre)? {
        return Ok(());
    }
    let key_set = encode_keys(entry.descriptor(), pre)?;
    for build in coll.builds_in_progress() {
        if Arc::ptr_eq(build.entry(), entry) {
            for key in &key_set.keys {
                build.push_side_write(SideWrite::Remove {
                    key: key.bytes.clone(),
                    rid,
                });
            }
        }
    }
    Ok(())
}

fn queue_side_writes_update(
    coll: &Collection,
    entry: &Arc<IndexCatalogEntry>,
    pre: &Document,
    post: &Document,
    pre_rid: RecordId,
    post_rid: RecordId,
) -> Result<()> {
    queue_side_writes_delete(coll, entry, pre, pre_rid)?;
    queue_side_writes_insert(coll, entry, post, post_rid)
}

/// Attach the index name and a decoded key rendering to a raw tree
/// duplicate error.
fn rewrap_duplicate(
    e: Error,
    entry: &IndexCatalogEntry,
    key_bytes: &[u8],
    type_bits: &[u8],
) -> Error {
    match e {
        Error::DuplicateKey { .. } => {
            let descriptor = entry.descriptor();
            let rendered = decode_key(key_bytes, &descriptor.key_pattern, type_bits)
                .map(|values| {
                    let parts: Vec<String> = descriptor
                        .key_pattern
                        .fields()
                        .iter()
                        .zip(values.iter())
                        .map(|(f, v)| format!("{}: {}", f.path, v))
                        .collect();
                    format!("{{ {} }}", parts.join(", "))
                })
                .unwrap_or_else(|_| "<undecodable>".to_string());
            Error::duplicate_key(descriptor.name.clone(), rendered)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionCatalog;
    use rook_core::{doc, QueryKnobs};
    use rook_index::{IndexDescriptor, KeyPattern};
    use rook_storage::HeapEngine;

    fn setup() -> (Arc<HeapEngine>, Arc<Collection>, WritePath) {
        let engine = Arc::new(HeapEngine::new());
        let catalog = CollectionCatalog::new(engine.clone(), QueryKnobs::default());
        let coll = catalog
            .create(&NamespaceString::parse("db.c").unwrap())
            .unwrap();
        let wp = WritePath::new(WriteKnobs::default(), Arc::new(NullObserver));
        (engine, coll, wp)
    }

    fn add_index(coll: &Collection, name: &str, spec: &Document) -> Arc<IndexCatalogEntry> {
        let entry = IndexCatalogEntry::new(IndexDescriptor::new(
            name,
            KeyPattern::parse(spec).unwrap(),
        ));
        coll.index_catalog().register(entry.clone()).unwrap();
        entry
    }

    fn add_unique_index(coll: &Collection, name: &str, spec: &Document) -> Arc<IndexCatalogEntry> {
        let entry = IndexCatalogEntry::new(
            IndexDescriptor::new(name, KeyPattern::parse(spec).unwrap()).unique(true),
        );
        coll.index_catalog().register(entry.clone()).unwrap();
        entry
    }

    #[test]
    fn insert_maintains_every_index() {
        let (_, coll, wp) = setup();
        let a = add_index(&coll, "a_1", &doc! { "a": 1 });
        let b = add_index(&coll, "b_1", &doc! { "b": 1 });
        let opctx = OperationContext::new();
        wp.insert(&coll, doc! { "a": 1, "b": 2 }, &opctx).unwrap();
        assert_eq!(coll.num_records(), 1);
        assert_eq!(a.tree().live_entries(), 1);
        assert_eq!(b.tree().live_entries(), 1);
    }

    #[test]
    fn parallel_array_insert_rolls_back_everything() {
        let (_, coll, wp) = setup();
        let xy = add_index(&coll, "xy", &doc! { "x": 1, "y": 1 });
        let opctx = OperationContext::new();
        let err = wp
            .insert(&coll, doc! { "x": [1, 2], "y": [3, 4] }, &opctx)
            .unwrap_err();
        assert!(matches!(err, Error::CannotIndexParallelArrays(_, _)));
        // The collection must remain empty, and so must the index.
        assert_eq!(coll.num_records(), 0);
        assert_eq!(xy.tree().live_entries(), 0);
    }

    #[test]
    fn duplicate_key_rolls_back_record_insert() {
        let (_, coll, wp) = setup();
        add_unique_index(&coll, "a_1", &doc! { "a": 1 });
        let opctx = OperationContext::new();
        wp.insert(&coll, doc! { "a": 7 }, &opctx).unwrap();
        let err = wp.insert(&coll, doc! { "a": 7 }, &opctx).unwrap_err();
        match err {
            Error::DuplicateKey { index, key } => {
                assert_eq!(index, "a_1");
                assert!(key.contains("a: 7"));
            }
            other => panic!("expected DuplicateKey, got {:?}", other),
        }
        assert_eq!(coll.num_records(), 1);
    }

    #[test]
    fn update_applies_key_set_difference() {
        let (_, coll, wp) = setup();
        let tags = add_index(&coll, "tags_1", &doc! { "tags": 1 });
        let opctx = OperationContext::new();
        let rid = wp
            .insert(&coll, doc! { "tags": [1, 2, 3] }, &opctx)
            .unwrap();
        assert_eq!(tags.tree().live_entries(), 3);
        wp.update(&coll, rid, doc! { "tags": [2, 4] }, &opctx).unwrap();
        // 1 and 3 removed, 2 kept, 4 added.
        assert_eq!(tags.tree().live_entries(), 2);
        assert!(tags.is_multikey());
    }

    #[test]
    fn delete_removes_all_keys_and_reports_pre_image() {
        let (_, coll, wp) = setup();
        let a = add_index(&coll, "a_1", &doc! { "a": 1 });
        let opctx = OperationContext::new();
        let rid = wp.insert(&coll, doc! { "a": 5, "x": 1 }, &opctx).unwrap();
        let pre = wp.delete(&coll, rid, &opctx).unwrap();
        assert_eq!(pre, doc! { "a": 5, "x": 1 });
        assert_eq!(coll.num_records(), 0);
        assert_eq!(a.tree().live_entries(), 0);
    }

    #[test]
    fn write_conflicts_are_retried_until_success() {
        let (engine, coll, wp) = setup();
        add_index(&coll, "a_1", &doc! { "a": 1 });
        engine.inject_write_conflicts(3);
        let opctx = OperationContext::new();
        wp.insert(&coll, doc! { "a": 1 }, &opctx).unwrap();
        assert_eq!(coll.num_records(), 1);
    }

    #[test]
    fn retry_limit_surfaces_conflict() {
        let (engine, coll, wp) = setup();
        let opctx = OperationContext::new();
        let wp_tight = WritePath::new(
            WriteKnobs {
                write_conflict_retry_limit: 2,
                backoff_base_micros: 1,
                backoff_cap_micros: 2,
            },
            Arc::new(NullObserver),
        );
        engine.inject_write_conflicts(10);
        let err = wp_tight
            .insert(&coll, doc! { "a": 1 }, &opctx)
            .unwrap_err();
        assert!(err.is_write_conflict());
        drop(wp);
    }

    #[test]
    fn partial_filter_skips_non_matching_documents() {
        let (_, coll, wp) = setup();
        let entry = IndexCatalogEntry::new(
            IndexDescriptor::new("a_part", KeyPattern::parse(&doc! { "a": 1 }).unwrap())
                .with_partial_filter(doc! { "flag": true }),
        );
        coll.index_catalog().register(entry.clone()).unwrap();
        let opctx = OperationContext::new();
        wp.insert(&coll, doc! { "a": 1, "flag": true }, &opctx).unwrap();
        wp.insert(&coll, doc! { "a": 2, "flag": false }, &opctx).unwrap();
        wp.insert(&coll, doc! { "a": 3 }, &opctx).unwrap();
        assert_eq!(entry.tree().live_entries(), 1);
    }

    #[test]
    fn observer_hears_committed_writes_only() {
        use parking_lot::Mutex;
        struct Recording(Mutex<Vec<String>>);
        impl OpObserver for Recording {
            fn on_insert(&self, _ns: &NamespaceString, _doc: &Document, rid: RecordId) {
                self.0.lock().push(format!("i{}", rid.0));
            }
            fn on_update(
                &self,
                _ns: &NamespaceString,
                _pre: &Document,
                _post: &Document,
                rid: RecordId,
            ) {
                self.0.lock().push(format!("u{}", rid.0));
            }
            fn on_delete(&self, _ns: &NamespaceString, _pre: &Document, rid: RecordId) {
                self.0.lock().push(format!("d{}", rid.0));
            }
        }

        let engine = Arc::new(HeapEngine::new());
        let catalog = CollectionCatalog::new(engine, QueryKnobs::default());
        let coll = catalog
            .create(&NamespaceString::parse("db.c").unwrap())
            .unwrap();
        let observer = Arc::new(Recording(Mutex::new(Vec::new())));
        let wp = WritePath::new(WriteKnobs::default(), observer.clone());
        add_unique_index(&coll, "a_1", &doc! { "a": 1 });

        let opctx = OperationContext::new();
        let rid = wp.insert(&coll, doc! { "a": 1 }, &opctx).unwrap();
        wp.update(&coll, rid, doc! { "a": 2 }, &opctx).unwrap();
        // This one fails and must not be observed.
        let _ = wp.insert(&coll, doc! { "a": 2 }, &opctx).unwrap_err();
        wp.delete(&coll, rid, &opctx).unwrap();

        assert_eq!(
            *observer.0.lock(),
            vec![
                format!("i{}", rid.0),
                format!("u{}", rid.0),
                format!("d{}", rid.0)
            ]
        );
    }
}
