//! Sort-key generation and the blocking sort
//!
//! `SortKeyGeneratorStage` synthesizes a comparable key per document from
//! the sort pattern: array-valued fields contribute their least element
//! ascending and greatest descending (matching the index codec's view of
//! arrays), `$meta` fields read per-document metadata attached upstream,
//! and two array-valued sort paths in one document are ambiguous and fail.
//!
//! `SortStage` buffers members up to its byte budget, spilling sorted runs
//! to disk (when allowed) and merging them with the in-memory tail on
//! drain.

use crate::memory_tracker::SubTracker;
use crate::stage::{Stage, StageStats, StatsNode, WorkResult, WsMember};
use rook_core::{cmp_values, Document, Error, OperationContext, RecordId, Result, Value};
use rook_query::{SortField, SortPattern};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use tracing::debug;

/// Compare two generated sort keys under a pattern.
///
/// Meta text-score fields sort descending (best first); everything else
/// follows the field's declared direction.
pub fn cmp_sort_keys(a: &[Value], b: &[Value], pattern: &SortPattern) -> Ordering {
    for (i, field) in pattern.fields.iter().enumerate() {
        let ord = cmp_values(&a[i], &b[i]);
        let ord = match field {
            SortField::Path { ascending: true, .. } | SortField::MetaRandVal => ord,
            SortField::Path {
                ascending: false, ..
            }
            | SortField::MetaTextScore => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Attach a sort key to every member.
pub struct SortKeyGeneratorStage {
    child: Box<dyn Stage>,
    pattern: SortPattern,
    stats: StageStats,
}

impl SortKeyGeneratorStage {
    /// Generate keys per `pattern`.
    pub fn new(child: Box<dyn Stage>, pattern: SortPattern) -> Self {
        Self {
            child,
            pattern,
            stats: StageStats::default(),
        }
    }

    fn generate(&self, member: &WsMember) -> Result<Vec<Value>> {
        let mut key = Vec::with_capacity(self.pattern.fields.len());
        let mut array_paths = 0usize;
        for field in &self.pattern.fields {
            let value = match field {
                SortField::Path { path, ascending } => {
                    let doc = member
                        .doc
                        .as_ref()
                        .ok_or_else(|| Error::internal("sort key needs fetched documents"))?;
                    let (value, was_array) = sort_value(doc, path, *ascending);
                    if was_array {
                        array_paths += 1;
                        if array_paths > 1 {
                            return Err(Error::CannotSortParallelArrays);
                        }
                    }
                    value
                }
                SortField::MetaTextScore => Value::Double(member.text_score.unwrap_or(0.0)),
                SortField::MetaRandVal => Value::Double(member.rand_val.unwrap_or(0.0)),
            };
            key.push(value);
        }
        Ok(key)
    }
}

/// The sort-relevant value at `path`: for arrays, the least element when
/// ascending and the greatest when descending.
fn sort_value(doc: &Document, path: &str, ascending: bool) -> (Value, bool) {
    match doc.get_path(path) {
        None => (Value::Null, false),
        Some(Value::Array(elems)) if elems.is_empty() => (Value::Null, true),
        Some(Value::Array(elems)) => {
            let pick = elems
                .iter()
                .max_by(|a, b| {
                    let ord = cmp_values(a, b);
                    if ascending {
                        ord.reverse()
                    } else {
                        ord
                    }
                })
                .expect("non-empty");
            (pick.clone(), true)
        }
        Some(v) => (v.clone(), false),
    }
}

impl Stage for SortKeyGeneratorStage {
    fn name(&self) -> &'static str {
        "SORT_KEY_GENERATOR"
    }

    fn work(&mut self, opctx: &OperationContext) -> Result<WorkResult> {
        self.stats.works += 1;
        match self.child.work(opctx)? {
            WorkResult::Advanced(mut member) => {
                member.sort_key = Some(self.generate(&member)?);
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

#[derive(Serialize, Deserialize)]
struct SpillRecord {
    sort_key: Vec<Value>,
    rid: Option<RecordId>,
    doc: Option<Document>,
}

struct SpillRun {
    reader: BufReader<File>,
    head: Option<SpillRecord>,
}

impl SpillRun {
    fn advance(&mut self) {
        self.head = bincode::deserialize_from(&mut self.reader).ok();
    }
}

enum SortPhase {
    Loading,
    Draining,
}

/// Blocking sort with budgeted memory and optional disk spill.
pub struct SortStage {
    child: Box<dyn Stage>,
    pattern: SortPattern,
    tracker: SubTracker,
    budget_bytes: usize,
    limit: Option<u64>,
    buffer: Vec<(Vec<Value>, WsMember)>,
    runs: Vec<SpillRun>,
    spilled_runs: usize,
    phase: SortPhase,
    emitted: u64,
    stats: StageStats,
}

impl SortStage {
    /// Create a sort with the given byte budget; spills when the tracker
    /// allows disk use.
    pub fn new(
        child: Box<dyn Stage>,
        pattern: SortPattern,
        tracker: SubTracker,
        budget_bytes: usize,
        limit: Option<u64>,
    ) -> Self {
        Self {
            child,
            pattern,
            tracker,
            budget_bytes,
            limit,
            buffer: Vec::new(),
            runs: Vec::new(),
            spilled_runs: 0,
            phase: SortPhase::Loading,
            emitted: 0,
            stats: StageStats::default(),
        }
    }

    /// How many runs went to disk.
    pub fn spilled_runs(&self) -> usize {
        self.spilled_runs
    }

    fn over_budget(&self) -> bool {
        self.tracker.current_bytes() as usize > self.budget_bytes
    }

    fn spill(&mut self) -> Result<()> {
        self.sort_buffer();
        let file = tempfile::tempfile()
            .map_err(|e| Error::internal(format!("sort spill file: {}", e)))?;
        let mut writer = BufWriter::new(file);
        let mut released = 0i64;
        for (sort_key, member) in self.buffer.drain(..) {
            released += member.approximate_size() as i64 + 64;
            let record = SpillRecord {
                sort_key,
                rid: member.rid,
                doc: member.doc,
            };
            bincode::serialize_into(&mut writer, &record)
                .map_err(|e| Error::internal(format!("sort spill write: {}", e)))?;
        }
        writer
            .flush()
            .map_err(|e| Error::internal(format!("sort spill flush: {}", e)))?;
        let mut file = writer
            .into_inner()
            .map_err(|e| Error::internal(format!("sort spill finish: {}", e)))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| Error::internal(format!("sort spill rewind: {}", e)))?;
        let mut run = SpillRun {
            reader: BufReader::new(file),
            head: None,
        };
        run.advance();
        self.runs.push(run);
        self.spilled_runs += 1;
        self.tracker.update(-released);
        debug!(target: "rook::exec", runs = self.spilled_runs, "sort spilled a run to disk");
        Ok(())
    }

    fn sort_buffer(&mut self) {
        let pattern = self.pattern.clone();
        self.buffer
            .sort_by(|a, b| cmp_sort_keys(&a.0, &b.0, &pattern));
    }

    fn next_sorted(&mut self) -> Option<WsMember> {
        // The in-memory buffer is sorted ascending; its head is the front.
        let mem_key = self.buffer.first().map(|(k, _)| k.clone());
        let mut best_run: Option<usize> = None;
        for (i, run) in self.runs.iter().enumerate() {
            let Some(head) = &run.head else { continue };
            let better = match best_run {
                None => match &mem_key {
                    None => true,
                    Some(mk) => {
                        cmp_sort_keys(&head.sort_key, mk, &self.pattern) == Ordering::Less
                    }
                },
                Some(j) => {
                    let other = self.runs[j].head.as_ref().expect("tracked head");
                    cmp_sort_keys(&head.sort_key, &other.sort_key, &self.pattern)
                        == Ordering::Less
                }
            };
            if better {
                best_run = Some(i);
            }
        }
        // A run only wins if it beats the memory head too.
        if let (Some(i), Some(mk)) = (best_run, &mem_key) {
            let head = self.runs[i].head.as_ref().expect("tracked head");
            if cmp_sort_keys(&head.sort_key, mk, &self.pattern) != Ordering::Less {
                best_run = None;
            }
        }
        match best_run {
            Some(i) => {
                let record = self.runs[i].head.take().expect("tracked head");
                self.runs[i].advance();
                Some(WsMember {
                    rid: record.rid,
                    doc: record.doc,
                    sort_key: Some(record.sort_key),
                    ..Default::default()
                })
            }
            None if !self.buffer.is_empty() => {
                let (key, mut member) = self.buffer.remove(0);
                self.tracker
                    .update(-(member.approximate_size() as i64 + 64));
                member.sort_key = Some(key);
                Some(member)
            }
            None => None,
        }
    }
}

impl Stage for SortStage {
    fn name(&self) -> &'static str {
        "SORT"
    }

    fn work(&mut self, opctx: &OperationContext) -> Result<WorkResult> {
        self.stats.works += 1;
        loop {
            match self.phase {
                SortPhase::Loading => match self.child.work(opctx)? {
                    WorkResult::Advanced(member) => {
                        let Some(key) = member.sort_key.clone() else {
                            return Err(Error::internal("sort input missing sort key"));
                        };
                        self.tracker.update(member.approximate_size() as i64 + 64);
                        self.buffer.push((key, member));
                        if self.over_budget() {
                            if self.tracker.allow_disk_use() {
                                self.spill()?;
                            } else {
                                return Err(Error::ExceededMemoryLimit(format!(
                                    "sort used more than {} bytes and spilling is disabled",
                                    self.budget_bytes
                                )));
                            }
                        }
                        return Ok(WorkResult::Paused);
                    }
                    WorkResult::Paused => return Ok(WorkResult::Paused),
                    WorkResult::Eof => {
                        self.sort_buffer();
                        self.phase = SortPhase::Draining;
                    }
                },
                SortPhase::Draining => {
                    if let Some(limit) = self.limit {
                        if self.emitted >= limit {
                            return Ok(WorkResult::Eof);
                        }
                    }
                    return match self.next_sorted() {
                        Some(member) => {
                            self.emitted += 1;
                            self.stats.advances += 1;
                            Ok(WorkResult::Advanced(member))
                        }
                        None => Ok(WorkResult::Eof),
                    };
                }
            }
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
