//! Write stages
//!
//! Pipeline tails that apply their input stream through the write path:
//! insert a prepared batch, update or delete matched documents, and the
//! `$out` materialization with its replace-collection and insert-documents
//! modes.

use crate::collection::Collection;
use crate::stage::{Stage, StageStats, StatsNode, WorkResult, WsMember};
use crate::write_path::WritePath;
use rook_core::{Document, Error, OperationContext, Result, Value};
use rook_storage::Direction;
use std::sync::Arc;
use tracing::info;

/// Insert a prepared batch of documents.
pub struct InsertStage {
    docs: std::vec::IntoIter<Document>,
    coll: Arc<Collection>,
    write_path: Arc<WritePath>,
    stats: StageStats,
}

impl InsertStage {
    /// Insert `docs` into `coll`.
    pub fn new(docs: Vec<Document>, coll: Arc<Collection>, write_path: Arc<WritePath>) -> Self {
        Self {
            docs: docs.into_iter(),
            coll,
            write_path,
            stats: StageStats::default(),
        }
    }
}

impl Stage for InsertStage {
    fn name(&self) -> &'static str {
        "INSERT"
    }

    fn work(&mut self, opctx: &OperationContext) -> Result<WorkResult> {
        self.stats.works += 1;
        match self.docs.next() {
            Some(doc) => {
                let rid = self.write_path.insert(&self.coll, doc.clone(), opctx)?;
                self.stats.advances += 1;
                Ok(WorkResult::Advanced(WsMember::from_doc(rid, doc)))
            }
            None => Ok(WorkResult::Eof),
        }
    }

    fn save_state(&mut self) {}

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

/// How an update rewrites its target.
#[derive(Debug, Clone)]
pub enum UpdateSpec {
    /// Replace the whole document (the `_id` survives).
    Replace(Document),
    /// Set the named top-level paths.
    Set(Document),
}

impl UpdateSpec {
    /// Parse `{$set: {...}}` versus a replacement document.
    pub fn parse(update: &Document) -> Result<UpdateSpec> {
        let has_operators = update.keys().any(|k| k.starts_with('$'));
        if !has_operators {
            return Ok(UpdateSpec::Replace(update.clone()));
        }
        match update.get("$set") {
            Some(Value::Document(sets)) if update.len() == 1 => {
                Ok(UpdateSpec::Set(sets.clone()))
            }
            _ => Err(Error::bad_value(
                "update must be a replacement document or a single $set",
            )),
        }
    }

    /// The post-image for a given pre-image.
    pub fn apply(&self, pre: &Document) -> Document {
        match self {
            UpdateSpec::Replace(doc) => {
                let mut post = doc.clone();
                if post.get("_id").is_none() {
                    if let Some(id) = pre.get("_id") {
                        let mut with_id = Document::new();
                        with_id.push("_id", id.clone());
                        for (name, v) in post.iter() {
                            with_id.push(name.clone(), v.clone());
                        }
                        post = with_id;
                    }
                }
                post
            }
            UpdateSpec::Set(sets) => {
                let mut post = pre.clone();
                for (name, v) in sets.iter() {
                    post.set(name, v.clone());
                }
                post
            }
        }
    }
}

/// Update each matched document.
pub struct UpdateStage {
    child: Box<dyn Stage>,
    spec: UpdateSpec,
    coll: Arc<Collection>,
    write_path: Arc<WritePath>,
    stats: StageStats,
}

impl UpdateStage {
    /// Apply `spec` to every child result.
    pub fn new(
        child: Box<dyn Stage>,
        spec: UpdateSpec,
        coll: Arc<Collection>,
        write_path: Arc<WritePath>,
    ) -> Self {
        Self {
            child,
            spec,
            coll,
            write_path,
            stats: StageStats::default(),
        }
    }
}

impl Stage for UpdateStage {
    fn name(&self) -> &'static str {
        "UPDATE"
    }

    fn work(&mut self, opctx: &OperationContext) -> Result<WorkResult> {
        self.stats.works += 1;
        match self.child.work(opctx)? {
            WorkResult::Advanced(member) => {
                let (Some(rid), Some(pre)) = (member.rid, member.doc.as_ref()) else {
                    return Err(Error::internal("update stage needs rid and document"));
                };
                let post = self.spec.apply(pre);
                self.write_path.update(&self.coll, rid, post.clone(), opctx)?;
                self.stats.advances += 1;
                Ok(WorkResult::Advanced(WsMember::from_doc(rid, post)))
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

/// Delete each matched document, emitting the pre-image.
pub struct DeleteStage {
    child: Box<dyn Stage>,
    coll: Arc<Collection>,
    write_path: Arc<WritePath>,
    stats: StageStats,
}

impl DeleteStage {
    /// Delete every child result from `coll`.
    pub fn new(child: Box<dyn Stage>, coll: Arc<Collection>, write_path: Arc<WritePath>) -> Self {
        Self {
            child,
            coll,
            write_path,
            stats: StageStats::default(),
        }
    }
}

impl Stage for DeleteStage {
    fn name(&self) -> &'static str {
        "DELETE"
    }

    fn work(&mut self, opctx: &OperationContext) -> Result<WorkResult> {
        self.stats.works += 1;
        match self.child.work(opctx)? {
            WorkResult::Advanced(member) => {
                let Some(rid) = member.rid else {
                    return Err(Error::internal("delete stage needs a record id"));
                };
                let pre = self.write_path.delete(&self.coll, rid, opctx)?;
                self.stats.advances += 1;
                Ok(WorkResult::Advanced(WsMember::from_doc(rid, pre)))
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

/// `$out` write mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutMode {
    /// Atomically replace the target's contents with the stream.
    ReplaceCollection,
    /// Append the stream to the target.
    InsertDocuments,
}

/// Materialize the stream into a target collection.
pub struct OutStage {
    child: Box<dyn Stage>,
    target: Arc<Collection>,
    write_path: Arc<WritePath>,
    mode: OutMode,
    buffered: Vec<Document>,
    done: bool,
    stats: StageStats,
}

impl OutStage {
    /// Write every child document into `target` under `mode`.
    pub fn new(
        child: Box<dyn Stage>,
        target: Arc<Collection>,
        write_path: Arc<WritePath>,
        mode: OutMode,
    ) -> Self {
        Self {
            child,
            target,
            write_path,
            mode,
            buffered: Vec::new(),
            done: false,
            stats: StageStats::default(),
        }
    }

    fn flush(&mut self, opctx: &OperationContext) -> Result<()> {
        if self.mode == OutMode::ReplaceCollection {
            // Clear the target, then load the buffered stream.
            let mut cursor = self.target.record_store().cursor(Direction::Forward);
            let mut victims = Vec::new();
            while let Some((rid, _)) = cursor.next() {
                victims.push(rid);
            }
            for rid in victims {
                self.write_path.delete(&self.target, rid, opctx)?;
            }
        }
        let docs = std::mem::take(&mut self.buffered);
        let written = docs.len();
        for doc in docs {
            self.write_path.insert(&self.target, doc, opctx)?;
            self.stats.advances += 1;
        }
        info!(
            target: "rook::exec",
            ns = %self.target.ns(),
            written,
            mode = ?self.mode,
            "$out materialized"
        );
        Ok(())
    }
}

impl Stage for OutStage {
    fn name(&self) -> &'static str {
        "OUT"
    }

    fn work(&mut self, opctx: &OperationContext) -> Result<WorkResult> {
        self.stats.works += 1;
        if self.done {
            return Ok(WorkResult::Eof);
        }
        match self.child.work(opctx)? {
            WorkResult::Advanced(member) => {
                let doc = member
                    .doc
                    .ok_or_else(|| Error::internal("$out needs fetched documents"))?;
                match self.mode {
                    // Replace mode buffers so a mid-stream failure never
                    // leaves a half-replaced target.
                    OutMode::ReplaceCollection => self.buffered.push(doc),
                    OutMode::InsertDocuments => {
                        self.write_path.insert(&self.target, doc, opctx)?;
                        self.stats.advances += 1;
                    }
                }
                Ok(WorkResult::Paused)
            }
            WorkResult::Paused => Ok(WorkResult::Paused),
            WorkResult::Eof => {
                if self.mode == OutMode::ReplaceCollection {
                    self.flush(opctx)?;
                }
                self.done = true;
                Ok(WorkResult::Eof)
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
