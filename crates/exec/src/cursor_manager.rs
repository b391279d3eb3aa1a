//! Server-side client cursors
//!
//! `find` registers an executor here when its first batch does not exhaust
//! the result set; `getMore` resumes it by cursor id and `killCursors`
//! disposes of it. Cursor ids are process-unique and never reused.

use crate::executor::PlanExecutor;
use parking_lot::Mutex;
use rook_core::{Document, Error, NamespaceString, OperationContext, Result};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

struct ClientCursor {
    ns: NamespaceString,
    executor: PlanExecutor,
}

/// Registry of open client cursors.
pub struct CursorManager {
    cursors: Mutex<FxHashMap<u64, ClientCursor>>,
    next_id: AtomicU64,
}

impl CursorManager {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            cursors: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Park an executor, returning its cursor id.
    pub fn register(&self, ns: NamespaceString, executor: PlanExecutor) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.cursors.lock().insert(id, ClientCursor { ns, executor });
        debug!(target: "rook::cursor", cursor_id = id, "client cursor registered");
        id
    }

    /// Pull up to `batch_size` more documents. The cursor is disposed when
    /// it exhausts; the returned flag says whether it is still open.
    pub fn get_more(
        &self,
        id: u64,
        batch_size: usize,
        opctx: &OperationContext,
    ) -> Result<(Vec<Document>, bool)> {
        let mut guard = self.cursors.lock();
        let cursor = guard.get_mut(&id).ok_or(Error::CursorNotFound(id))?;
        let mut batch = Vec::with_capacity(batch_size.min(128));
        let mut open = true;
        while batch.len() < batch_size {
            match cursor.executor.next(opctx) {
                Ok(Some(doc)) => batch.push(doc),
                Ok(None) => {
                    open = false;
                    break;
                }
                Err(e) => {
                    guard.remove(&id);
                    return Err(e);
                }
            }
        }
        if !open {
            guard.remove(&id);
        }
        Ok((batch, open))
    }

    /// Kill one cursor. True when it existed.
    pub fn kill(&self, id: u64) -> bool {
        self.cursors.lock().remove(&id).is_some()
    }

    /// Kill every cursor over a namespace (collection drop). Returns how
    /// many died.
    pub fn kill_namespace(&self, ns: &NamespaceString) -> usize {
        let mut guard = self.cursors.lock();
        let victims: Vec<u64> = guard
            .iter()
            .filter(|(_, c)| &c.ns == ns)
            .map(|(id, _)| *id)
            .collect();
        for id in &victims {
            guard.remove(id);
        }
        victims.len()
    }

    /// Open cursor count.
    pub fn open_cursors(&self) -> usize {
        self.cursors.lock().len()
    }
}

impl Default for CursorManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionCatalog;
    use crate::executor::{plan_query, ExecParams};
    use crate::write_path::{NullObserver, WritePath};
    use rook_core::{doc, QueryKnobs, WriteKnobs};
    use rook_query::CanonicalQuery;
    use rook_storage::HeapEngine;
    use std::sync::Arc;

    fn executor_over(n: i32) -> (NamespaceString, PlanExecutor, OperationContext) {
        let engine = Arc::new(HeapEngine::new());
        let catalog = CollectionCatalog::new(engine, QueryKnobs::default());
        let ns = NamespaceString::parse("db.c").unwrap();
        let coll = catalog.create(&ns).unwrap();
        let wp = WritePath::new(WriteKnobs::default(), Arc::new(NullObserver));
        let opctx = OperationContext::new();
        for i in 0..n {
            wp.insert(&coll, doc! { "i": i }, &opctx).unwrap();
        }
        let query = CanonicalQuery::parse(&doc! {}, &doc! {}, &doc! {}).unwrap();
        let exec = plan_query(&coll, &query, &ExecParams::default(), &opctx).unwrap();
        (ns, exec, opctx)
    }

    #[test]
    fn get_more_batches_until_exhaustion() {
        let (ns, exec, opctx) = executor_over(5);
        let mgr = CursorManager::new();
        let id = mgr.register(ns, exec);

        let (batch, open) = mgr.get_more(id, 2, &opctx).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(open);
        let (batch, open) = mgr.get_more(id, 10, &opctx).unwrap();
        assert_eq!(batch.len(), 3);
        assert!(!open);
        // Exhausted cursors are gone.
        assert!(matches!(
            mgr.get_more(id, 1, &opctx),
            Err(Error::CursorNotFound(_))
        ));
    }

    #[test]
    fn kill_and_kill_namespace() {
        let (ns, exec, _opctx) = executor_over(3);
        let mgr = CursorManager::new();
        let id = mgr.register(ns.clone(), exec);
        assert!(mgr.kill(id));
        assert!(!mgr.kill(id));

        let (_, exec1, _) = executor_over(3);
        let (_, exec2, _) = executor_over(3);
        mgr.register(ns.clone(), exec1);
        mgr.register(ns.clone(), exec2);
        assert_eq!(mgr.kill_namespace(&ns), 2);
        assert_eq!(mgr.open_cursors(), 0);
    }
}
