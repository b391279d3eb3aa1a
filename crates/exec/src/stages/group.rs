//! Hash aggregation
//!
//! Groups members by the values of one or more key paths and folds each
//! group through its accumulators. Accumulator memory is accounted through
//! a per-accumulator sub-tracker; when the stage runs past its budget it
//! spills serialized partial groups to disk (when allowed) and merges the
//! partials at drain time.

use crate::memory_tracker::SubTracker;
use crate::stage::{Stage, StageStats, StatsNode, WorkResult, WsMember};
use rook_core::{cmp_values, Document, Error, OperationContext, Result, Value};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use tracing::debug;

/// Accumulator operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccumulatorOp {
    /// Numeric sum.
    Sum,
    /// Minimum value.
    Min,
    /// Maximum value.
    Max,
    /// First value seen in input order.
    First,
    /// Last value seen in input order.
    Last,
    /// All values, in input order.
    Push,
    /// Distinct values.
    AddToSet,
}

/// One accumulator of the group stage.
#[derive(Debug, Clone)]
pub struct AccumulatorSpec {
    /// Output field name.
    pub out: String,
    /// Operator.
    pub op: AccumulatorOp,
    /// Input path evaluated per document.
    pub path: String,
}

/// Running state of one accumulator within one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum AccState {
    Sum { int: i64, float: f64 },
    Extreme(Option<Value>),
    Held(Option<Value>),
    Values(Vec<Value>),
}

impl AccState {
    fn new(op: AccumulatorOp) -> Self {
        match op {
            AccumulatorOp::Sum => AccState::Sum { int: 0, float: 0.0 },
            AccumulatorOp::Min | AccumulatorOp::Max => AccState::Extreme(None),
            AccumulatorOp::First | AccumulatorOp::Last => AccState::Held(None),
            AccumulatorOp::Push | AccumulatorOp::AddToSet => AccState::Values(Vec::new()),
        }
    }

    fn accumulate(&mut self, op: AccumulatorOp, value: Option<&Value>) {
        match (self, op) {
            (AccState::Sum { int, float }, AccumulatorOp::Sum) => match value {
                Some(Value::Int32(v)) => *int += *v as i64,
                Some(Value::Int64(v)) => *int += v,
                Some(Value::Double(v)) => *float += v,
                _ => {}
            },
            (AccState::Extreme(slot), AccumulatorOp::Min) => {
                if let Some(v) = value {
                    let replace = slot
                        .as_ref()
                        .map(|cur| cmp_values(v, cur) == Ordering::Less)
                        .unwrap_or(true);
                    if replace {
                        *slot = Some(v.clone());
                    }
                }
            }
            (AccState::Extreme(slot), AccumulatorOp::Max) => {
                if let Some(v) = value {
                    let replace = slot
                        .as_ref()
                        .map(|cur| cmp_values(v, cur) == Ordering::Greater)
                        .unwrap_or(true);
                    if replace {
                        *slot = Some(v.clone());
                    }
                }
            }
            (AccState::Held(slot), AccumulatorOp::First) => {
                if slot.is_none() {
                    *slot = Some(value.cloned().unwrap_or(Value::Null));
                }
            }
            (AccState::Held(slot), AccumulatorOp::Last) => {
                *slot = Some(value.cloned().unwrap_or(Value::Null));
            }
            (AccState::Values(values), AccumulatorOp::Push) => {
                values.push(value.cloned().unwrap_or(Value::Null));
            }
            (AccState::Values(values), AccumulatorOp::AddToSet) => {
                if let Some(v) = value {
                    if !values.iter().any(|x| cmp_values(x, v) == Ordering::Equal) {
                        values.push(v.clone());
                    }
                }
            }
            _ => unreachable!("accumulator state does not match operator"),
        }
    }

    /// Merge a spilled partial into this state.
    fn merge(&mut self, op: AccumulatorOp, other: AccState) {
        match (self, op, other) {
            (AccState::Sum { int, float }, AccumulatorOp::Sum, AccState::Sum { int: i2, float: f2 }) => {
                *int += i2;
                *float += f2;
            }
            (slot @ AccState::Extreme(_), AccumulatorOp::Min, AccState::Extreme(Some(v))) => {
                slot.accumulate(AccumulatorOp::Min, Some(&v));
            }
            (slot @ AccState::Extreme(_), AccumulatorOp::Max, AccState::Extreme(Some(v))) => {
                slot.accumulate(AccumulatorOp::Max, Some(&v));
            }
            (AccState::Held(slot), AccumulatorOp::First, AccState::Held(Some(v))) => {
                // Spills happen in input order; the earliest spill wins.
                if slot.is_none() {
                    *slot = Some(v);
                }
            }
            (AccState::Held(slot), AccumulatorOp::Last, AccState::Held(Some(v))) => {
                *slot = Some(v);
            }
            (AccState::Values(values), AccumulatorOp::Push, AccState::Values(mut other)) => {
                values.append(&mut other);
            }
            (AccState::Values(values), AccumulatorOp::AddToSet, AccState::Values(other)) => {
                for v in other {
                    if !values.iter().any(|x| cmp_values(x, &v) == Ordering::Equal) {
                        values.push(v);
                    }
                }
            }
            _ => {}
        }
    }

    fn finalize(self) -> Value {
        match self {
            AccState::Sum { int, float } => {
                if float == 0.0 {
                    Value::Int64(int)
                } else {
                    Value::Double(int as f64 + float)
                }
            }
            AccState::Extreme(slot) | AccState::Held(slot) => slot.unwrap_or(Value::Null),
            AccState::Values(values) => Value::Array(values),
        }
    }

    fn approximate_size(&self) -> usize {
        match self {
            AccState::Sum { .. } => 16,
            AccState::Extreme(v) | AccState::Held(v) => 16 + v.as_ref().map_or(0, value_size),
            AccState::Values(vs) => 16 + vs.iter().map(value_size).sum::<usize>(),
        }
    }
}

fn value_size(v: &Value) -> usize {
    match v {
        Value::String(s) => 24 + s.len(),
        Value::Binary(b) => 24 + b.len(),
        Value::Document(d) => d.approximate_size(),
        Value::Array(vs) => 24 + vs.iter().map(value_size).sum::<usize>(),
        _ => 16,
    }
}

#[derive(Serialize, Deserialize)]
struct SpilledGroup {
    key_bytes: Vec<u8>,
    key_values: Vec<Value>,
    states: Vec<AccState>,
}

struct GroupEntry {
    key_values: Vec<Value>,
    states: Vec<AccState>,
}

enum GroupPhase {
    Loading,
    Draining(Vec<Document>),
}

/// Hash-based group-and-accumulate.
pub struct GroupStage {
    child: Box<dyn Stage>,
    /// `(output name, input path)` pairs forming the group key.
    key_paths: Vec<(String, String)>,
    accumulators: Vec<AccumulatorSpec>,
    table: FxHashMap<Vec<u8>, GroupEntry>,
    tracker: SubTracker,
    budget_bytes: usize,
    spills: Vec<BufReader<File>>,
    phase: GroupPhase,
    stats: StageStats,
}

impl GroupStage {
    /// Group the child by `key_paths`, folding `accumulators`.
    pub fn new(
        child: Box<dyn Stage>,
        key_paths: Vec<(String, String)>,
        accumulators: Vec<AccumulatorSpec>,
        tracker: SubTracker,
        budget_bytes: usize,
    ) -> Self {
        Self {
            child,
            key_paths,
            accumulators,
            table: FxHashMap::default(),
            tracker,
            budget_bytes,
            spills: Vec::new(),
            phase: GroupPhase::Loading,
            stats: StageStats::default(),
        }
    }

    /// Number of partial spills taken.
    pub fn spill_count(&self) -> usize {
        self.spills.len()
    }

    /// Merge a later partial into the table.
    fn fold_in(&mut self, key_bytes: Vec<u8>, later: GroupEntry) {
        match self.table.entry(key_bytes) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                for (i, spec) in self.accumulators.iter().enumerate() {
                    e.get_mut().states[i].merge(spec.op, later.states[i].clone());
                }
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(later);
            }
        }
    }

    fn absorb(&mut self, member: &WsMember) -> Result<()> {
        let doc = member
            .doc
            .as_ref()
            .ok_or_else(|| Error::internal("group stage needs fetched documents"))?;
        let key_values: Vec<Value> = self
            .key_paths
            .iter()
            .map(|(_, path)| doc.get_path(path).cloned().unwrap_or(Value::Null))
            .collect();
        let key_bytes = bincode::serialize(&key_values)
            .map_err(|e| Error::internal(format!("group key encode: {}", e)))?;

        let entry = match self.table.entry(key_bytes) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let states = self
                    .accumulators
                    .iter()
                    .map(|a| AccState::new(a.op))
                    .collect();
                self.tracker.update(64);
                e.insert(GroupEntry {
                    key_values,
                    states,
                })
            }
        };
        for (i, spec) in self.accumulators.iter().enumerate() {
            let before = entry.states[i].approximate_size();
            entry.states[i].accumulate(spec.op, doc.get_path(&spec.path));
            let after = entry.states[i].approximate_size();
            self.tracker.update(after as i64 - before as i64);
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        let file = tempfile::tempfile()
            .map_err(|e| Error::internal(format!("group spill file: {}", e)))?;
        let mut writer = BufWriter::new(file);
        let mut released = 0i64;
        for (key_bytes, entry) in self.table.drain() {
            released += 64 + entry
                .states
                .iter()
                .map(AccState::approximate_size)
                .sum::<usize>() as i64;
            let record = SpilledGroup {
                key_bytes,
                key_values: entry.key_values,
                states: entry.states,
            };
            bincode::serialize_into(&mut writer, &record)
                .map_err(|e| Error::internal(format!("group spill write: {}", e)))?;
        }
        writer
            .flush()
            .map_err(|e| Error::internal(format!("group spill flush: {}", e)))?;
        let mut file = writer
            .into_inner()
            .map_err(|e| Error::internal(format!("group spill finish: {}", e)))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| Error::internal(format!("group spill rewind: {}", e)))?;
        self.spills.push(BufReader::new(file));
        self.tracker.update(-released);
        debug!(target: "rook::exec", spills = self.spills.len(), "group spilled partials");
        Ok(())
    }

    fn finish(&mut self) -> Result<Vec<Document>> {
        // Rebuild in input order: earliest spill is the base, later spills
        // and finally the in-memory partials merge into it. Order matters
        // for first/last semantics.
        let in_memory: Vec<(Vec<u8>, GroupEntry)> = self.table.drain().collect();
        let spills = std::mem::take(&mut self.spills);
        for mut reader in spills {
            while let Ok(record) = bincode::deserialize_from::<_, SpilledGroup>(&mut reader) {
                self.fold_in(
                    record.key_bytes,
                    GroupEntry {
                        key_values: record.key_values,
                        states: record.states,
                    },
                );
            }
        }
        for (key_bytes, entry) in in_memory {
            self.fold_in(key_bytes, entry);
        }

        let mut out = Vec::with_capacity(self.table.len());
        for (_, entry) in self.table.drain() {
            let mut doc = Document::new();
            for ((out_name, _), value) in self.key_paths.iter().zip(entry.key_values) {
                doc.push(out_name.clone(), value);
            }
            for (spec, state) in self.accumulators.iter().zip(entry.states) {
                doc.push(spec.out.clone(), state.finalize());
            }
            out.push(doc);
        }
        // Deterministic output order by key.
        out.sort_by(|a, b| {
            let ka: Vec<&Value> = self.key_paths.iter().filter_map(|(n, _)| a.get(n)).collect();
            let kb: Vec<&Value> = self.key_paths.iter().filter_map(|(n, _)| b.get(n)).collect();
            ka.iter()
                .zip(kb.iter())
                .map(|(x, y)| cmp_values(x, y))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
        Ok(out)
    }
}

impl Stage for GroupStage {
    fn name(&self) -> &'static str {
        "GROUP"
    }

    fn work(&mut self, opctx: &OperationContext) -> Result<WorkResult> {
        self.stats.works += 1;
        loop {
            if let GroupPhase::Draining(docs) = &mut self.phase {
                return match docs.pop() {
                    Some(doc) => {
                        self.stats.advances += 1;
                        Ok(WorkResult::Advanced(WsMember {
                            doc: Some(doc),
                            ..Default::default()
                        }))
                    }
                    None => Ok(WorkResult::Eof),
                };
            }
            match self.child.work(opctx)? {
                WorkResult::Advanced(member) => {
                    self.absorb(&member)?;
                    if self.tracker.current_bytes() as usize > self.budget_bytes {
                        if self.tracker.allow_disk_use() {
                            self.spill()?;
                        } else {
                            return Err(Error::ExceededMemoryLimit(format!(
                                "group used more than {} bytes and spilling is disabled",
                                self.budget_bytes
                            )));
                        }
                    }
                    return Ok(WorkResult::Paused);
                }
                WorkResult::Paused => return Ok(WorkResult::Paused),
                WorkResult::Eof => {
                    let mut docs = self.finish()?;
                    docs.reverse(); // pop from the back below
                    self.phase = GroupPhase::Draining(docs);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_tracker::MemoryTracker;
    use rook_core::doc;
    use rook_core::RecordId;

    struct VecSource {
        docs: Vec<Document>,
    }

    impl Stage for VecSource {
        fn name(&self) -> &'static str {
            "VECSOURCE"
        }
        fn work(&mut self, _opctx: &OperationContext) -> Result<WorkResult> {
            Ok(match self.docs.pop() {
                Some(doc) => {
                    WorkResult::Advanced(WsMember::from_doc(RecordId(self.docs.len() as i64), doc))
                }
                None => WorkResult::Eof,
            })
        }
        fn save_state(&mut self) {}
        fn restore_state(&mut self, _opctx: &OperationContext) -> Result<()> {
            Ok(())
        }
        fn stats_tree(&self) -> StatsNode {
            StatsNode {
                name: "VECSOURCE",
                stats: StageStats::default(),
                children: Vec::new(),
            }
        }
    }

    fn source(mut docs: Vec<Document>) -> Box<dyn Stage> {
        docs.reverse(); // popped back-to-front
        Box::new(VecSource { docs })
    }

    fn orders() -> Vec<Document> {
        vec![
            doc! { "item": "a", "qty": 5 },
            doc! { "item": "b", "qty": 10 },
            doc! { "item": "a", "qty": 7 },
            doc! { "item": "b", "qty": 1 },
        ]
    }

    fn drain(stage: &mut GroupStage) -> Vec<Document> {
        let opctx = OperationContext::new();
        let mut out = Vec::new();
        loop {
            match stage.work(&opctx).unwrap() {
                WorkResult::Advanced(m) => out.push(m.doc.unwrap()),
                WorkResult::Paused => {}
                WorkResult::Eof => break,
            }
        }
        out
    }

    fn accumulators() -> Vec<AccumulatorSpec> {
        vec![
            AccumulatorSpec {
                out: "total".into(),
                op: AccumulatorOp::Sum,
                path: "qty".into(),
            },
            AccumulatorSpec {
                out: "min".into(),
                op: AccumulatorOp::Min,
                path: "qty".into(),
            },
            AccumulatorSpec {
                out: "first".into(),
                op: AccumulatorOp::First,
                path: "qty".into(),
            },
            AccumulatorSpec {
                out: "all".into(),
                op: AccumulatorOp::Push,
                path: "qty".into(),
            },
        ]
    }

    #[test]
    fn groups_and_accumulates() {
        let tracker = MemoryTracker::new(1 << 20, false);
        let mut stage = GroupStage::new(
            source(orders()),
            vec![("_id".into(), "item".into())],
            accumulators(),
            tracker.scoped("group"),
            1 << 20,
        );
        let docs = drain(&mut stage);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].get("_id"), Some(&Value::String("a".into())));
        assert_eq!(docs[0].get("total"), Some(&Value::Int64(12)));
        assert_eq!(docs[0].get("min"), Some(&Value::Int32(5)));
        assert_eq!(docs[0].get("first"), Some(&Value::Int32(5)));
        assert_eq!(
            docs[0].get("all"),
            Some(&Value::Array(vec![Value::Int32(5), Value::Int32(7)]))
        );
        assert_eq!(docs[1].get("total"), Some(&Value::Int64(11)));
        assert_eq!(stage.spill_count(), 0);
    }

    #[test]
    fn spilled_partials_merge_identically() {
        // A budget of one byte forces a spill after every input document.
        let tracker = MemoryTracker::new(1 << 20, true);
        let mut stage = GroupStage::new(
            source(orders()),
            vec![("_id".into(), "item".into())],
            accumulators(),
            tracker.scoped("group"),
            1,
        );
        let docs = drain(&mut stage);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].get("total"), Some(&Value::Int64(12)));
        // First/push semantics survive the spill-merge in input order.
        assert_eq!(docs[0].get("first"), Some(&Value::Int32(5)));
        assert_eq!(
            docs[0].get("all"),
            Some(&Value::Array(vec![Value::Int32(5), Value::Int32(7)]))
        );
        assert_eq!(docs[1].get("first"), Some(&Value::Int32(10)));
    }

    #[test]
    fn over_budget_without_disk_fails() {
        let tracker = MemoryTracker::new(1 << 20, false);
        let mut stage = GroupStage::new(
            source(orders()),
            vec![("_id".into(), "item".into())],
            accumulators(),
            tracker.scoped("group"),
            1,
        );
        let opctx = OperationContext::new();
        let err = loop {
            match stage.work(&opctx) {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, Error::ExceededMemoryLimit(_)));
    }
}
