//! The execution stage contract
//!
//! Plans execute as pull-based trees of [`Stage`]s. One `work` call makes
//! one unit of progress: it either advances with a result, pauses (made
//! internal progress, call again), or reports EOF. Save/restore propagate
//! down the tree around yields.

use rook_core::{Document, OperationContext, RecordId, Result, Value};

/// The unit flowing between stages.
#[derive(Debug, Clone, Default)]
pub struct WsMember {
    /// Record id, when known.
    pub rid: Option<RecordId>,
    /// The materialized document, absent for index-only members.
    pub doc: Option<Document>,
    /// Decoded index key as `(path, value)` pairs, for covered projections.
    pub index_keys: Option<Vec<(String, Value)>>,
    /// Generated sort key, attached by the sort-key stage.
    pub sort_key: Option<Vec<Value>>,
    /// Text-score metadata attached upstream.
    pub text_score: Option<f64>,
    /// Random-value metadata attached upstream.
    pub rand_val: Option<f64>,
}

impl WsMember {
    /// Member holding a fetched document.
    pub fn from_doc(rid: RecordId, doc: Document) -> Self {
        WsMember {
            rid: Some(rid),
            doc: Some(doc),
            ..Default::default()
        }
    }

    /// Member holding only an index key.
    pub fn from_index_key(rid: RecordId, index_keys: Vec<(String, Value)>) -> Self {
        WsMember {
            rid: Some(rid),
            index_keys: Some(index_keys),
            ..Default::default()
        }
    }

    /// Rough footprint for memory accounting.
    pub fn approximate_size(&self) -> usize {
        let mut size = std::mem::size_of::<Self>();
        if let Some(d) = &self.doc {
            size += d.approximate_size();
        }
        if let Some(keys) = &self.index_keys {
            size += keys.len() * 32;
        }
        size
    }
}

/// Outcome of one unit of work.
#[derive(Debug)]
pub enum WorkResult {
    /// Produced a result.
    Advanced(WsMember),
    /// Made internal progress; call again.
    Paused,
    /// No further results.
    Eof,
}

/// Counters kept by every stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageStats {
    /// `work` calls.
    pub works: u64,
    /// Results produced.
    pub advances: u64,
    /// Documents loaded or examined.
    pub docs_examined: u64,
    /// Index keys examined.
    pub keys_examined: u64,
}

/// A stage's stats joined with its children's.
#[derive(Debug, Clone)]
pub struct StatsNode {
    /// Stage name.
    pub name: &'static str,
    /// Own counters.
    pub stats: StageStats,
    /// Child subtrees.
    pub children: Vec<StatsNode>,
}

impl StatsNode {
    /// Sum of a field over the whole tree.
    pub fn total(&self, f: impl Fn(&StageStats) -> u64 + Copy) -> u64 {
        f(&self.stats) + self.children.iter().map(|c| c.total(f)).sum::<u64>()
    }
}

/// One execution stage.
pub trait Stage: Send {
    /// Stage name for stats and logs.
    fn name(&self) -> &'static str;

    /// Make one unit of progress.
    fn work(&mut self, opctx: &OperationContext) -> Result<WorkResult>;

    /// Remember enough state to survive a yield; propagates to children.
    fn save_state(&mut self);

    /// Re-establish state after a yield; propagates to children.
    fn restore_state(&mut self, opctx: &OperationContext) -> Result<()>;

    /// This stage's stats subtree.
    fn stats_tree(&self) -> StatsNode;
}
