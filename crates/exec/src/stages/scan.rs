//! Leaf scan stages and fetch
//!
//! `CollectionScanStage` walks the record store in storage order;
//! `IndexScanStage` wraps a B-tree cursor and deduplicates record ids for
//! multikey indexes; `FetchStage` turns record ids into documents (skipped
//! entirely by covered plans).

use crate::stage::{Stage, StageStats, StatsNode, WorkResult, WsMember};
use rook_core::{OperationContext, RecordId, Result};
use rook_index::{BtreeCursor, KeyPattern, RestoreOutcome};
use rook_storage::{Direction, RecordCursor, RecordStore};
use rustc_hash::FxHashSet;
use std::sync::Arc;

/// Scan the whole record store.
pub struct CollectionScanStage {
    cursor: Box<dyn RecordCursor>,
    stats: StageStats,
    /// Record id to resume past after a yield.
    saved_rid: Option<RecordId>,
}

impl CollectionScanStage {
    /// Open a scan over `rs`.
    pub fn new(rs: &Arc<dyn RecordStore>, direction: Direction) -> Self {
        Self {
            cursor: rs.cursor(direction),
            stats: StageStats::default(),
            saved_rid: None,
        }
    }
}

impl Stage for CollectionScanStage {
    fn name(&self) -> &'static str {
        "COLLSCAN"
    }

    fn work(&mut self, opctx: &OperationContext) -> Result<WorkResult> {
        opctx.check_for_interrupt()?;
        self.stats.works += 1;
        match self.cursor.next() {
            Some((rid, doc)) => {
                self.stats.advances += 1;
                self.stats.docs_examined += 1;
                Ok(WorkResult::Advanced(WsMember::from_doc(rid, doc)))
            }
            None => Ok(WorkResult::Eof),
        }
    }

    fn save_state(&mut self) {
        // The record cursor re-reads position on every call; nothing to pin.
        self.saved_rid = None;
    }

    fn restore_state(&mut self, opctx: &OperationContext) -> Result<()> {
        opctx.check_for_interrupt()
    }

    fn stats_tree(&self) -> StatsNode {
        StatsNode {
            name: self.name(),
            stats: self.stats,
            children: Vec::new(),
        }
    }
}

/// Scan one index through a cursor.
pub struct IndexScanStage {
    cursor: BtreeCursor,
    key_pattern: KeyPattern,
    /// Record ids already produced; `Some` only for multikey indexes.
    dedup: Option<FxHashSet<RecordId>>,
    /// False when the cursor's current entry has not been emitted yet.
    consumed_current: bool,
    stats: StageStats,
}

impl IndexScanStage {
    /// Wrap an opened cursor.
    pub fn new(cursor: BtreeCursor, key_pattern: KeyPattern, multikey: bool) -> Self {
        Self {
            cursor,
            key_pattern,
            dedup: multikey.then(FxHashSet::default),
            consumed_current: false,
            stats: StageStats::default(),
        }
    }

    fn emit_current(&mut self) -> WorkResult {
        let rid = self.cursor.current_record_id();
        if let Some(dedup) = &mut self.dedup {
            if !dedup.insert(rid) {
                // Another key of the same document; skip it.
                return WorkResult::Paused;
            }
        }
        let keys = self
            .key_pattern
            .fields()
            .iter()
            .map(|f| f.path.clone())
            .zip(self.cursor.current_key().iter().cloned())
            .collect();
        self.stats.advances += 1;
        WorkResult::Advanced(WsMember::from_index_key(rid, keys))
    }
}

impl Stage for IndexScanStage {
    fn name(&self) -> &'static str {
        "IXSCAN"
    }

    fn work(&mut self, opctx: &OperationContext) -> Result<WorkResult> {
        self.stats.works += 1;
        if self.cursor.is_eof() {
            return Ok(WorkResult::Eof);
        }
        if !self.consumed_current {
            self.consumed_current = true;
            return Ok(self.emit_current());
        }
        if self.cursor.advance(opctx)? {
            Ok(self.emit_current())
        } else {
            Ok(WorkResult::Eof)
        }
    }

    fn save_state(&mut self) {
        self.cursor.save_state();
    }

    fn restore_state(&mut self, opctx: &OperationContext) -> Result<()> {
        match self.cursor.restore_state(opctx)? {
            // Same entry as before the yield; whether it was already
            // emitted is this stage's own bookkeeping and stands.
            RestoreOutcome::SamePosition | RestoreOutcome::Exhausted => {}
            RestoreOutcome::NewPosition => {
                // The entry now under the cursor has not been returned yet.
                self.consumed_current = false;
            }
        }
        Ok(())
    }

    fn stats_tree(&self) -> StatsNode {
        let mut stats = self.stats;
        stats.keys_examined = self.cursor.stats().keys_examined;
        StatsNode {
            name: self.name(),
            stats,
            children: Vec::new(),
        }
    }
}

/// Load the document behind each record id.
pub struct FetchStage {
    child: Box<dyn Stage>,
    rs: Arc<dyn RecordStore>,
    stats: StageStats,
}

impl FetchStage {
    /// Fetch from `rs` for every child result.
    pub fn new(child: Box<dyn Stage>, rs: Arc<dyn RecordStore>) -> Self {
        Self {
            child,
            rs,
            stats: StageStats::default(),
        }
    }
}

impl Stage for FetchStage {
    fn name(&self) -> &'static str {
        "FETCH"
    }

    fn work(&mut self, opctx: &OperationContext) -> Result<WorkResult> {
        self.stats.works += 1;
        match self.child.work(opctx)? {
            WorkResult::Advanced(mut member) => {
                if member.doc.is_none() {
                    let Some(rid) = member.rid else {
                        return Err(rook_core::Error::internal("fetch without record id"));
                    };
                    match self.rs.find(rid) {
                        Some(doc) => {
                            self.stats.docs_examined += 1;
                            member.doc = Some(doc);
                        }
                        // Deleted between index read and fetch.
                        None => return Ok(WorkResult::Paused),
                    }
                }
                self.stats.advances += 1;
                Ok(WorkResult::Advanced(member))
            }
            other => Ok(other),
        }
    }

    fn save_state(&mut self) {
        self.child.save_state();
    }

    fn restore_state(&mut self, opctx: &OperationContext) -> Result<()> {
        self.child.restore_state(opctx)
    }

    fn stats_tree(&self) -> StatsNode {
        StatsNode {
            name: self.name(),
            stats: self.stats,
            children: vec![self.child.stats_tree()],
        }
    }
}
