//! Rollback
//!
//! When a node's log diverges from the newly elected primary's past a
//! common point, the divergent tail is undone: each local operation past
//! the common point is reversed (newest first) through the
//! [`RollbackApply`] seam, the log is truncated, and the node re-enters
//! `Secondary`. Operations whose undo fails locally are collected for
//! refetch from the sync source.

use crate::coordinator::ReplicationCoordinator;
use crate::oplog::{OpKind, Oplog, OplogEntry};
use crate::optime::OpTime;
use rook_core::{Document, RecordId, Result};
use tracing::{info, warn};

/// Storage-side inverse operations, implemented by the server against the
/// write path.
pub trait RollbackApply {
    /// Undo an insert: delete the record.
    fn undo_insert(&self, ns: &str, rid: RecordId) -> Result<()>;
    /// Undo an update: restore the pre-image.
    fn undo_update(&self, ns: &str, rid: RecordId, pre: &Document) -> Result<()>;
    /// Undo a delete: re-insert the pre-image.
    fn undo_delete(&self, ns: &str, rid: RecordId, pre: &Document) -> Result<()>;
}

/// What a rollback did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackStats {
    /// Where the histories agreed.
    pub common_point: OpTime,
    /// Operations undone locally.
    pub ops_undone: usize,
    /// `(ns, rid)` pairs that must be refetched from the sync source.
    pub refetch: Vec<(String, RecordId)>,
}

/// Roll the node back to the latest point shared with `remote_chain`.
///
/// Fails without touching anything when the histories share no point; a
/// node in that position must resync from scratch.
pub fn rollback_to_common_point(
    coordinator: &ReplicationCoordinator,
    oplog: &Oplog,
    remote_chain: &[OpTime],
    apply: &dyn RollbackApply,
) -> Result<RollbackStats> {
    let Some(common_point) = oplog.common_point(remote_chain) else {
        return Err(rook_core::Error::bad_value(
            "no common oplog point with sync source; full resync required",
        ));
    };

    coordinator.enter_rollback()?;
    info!(
        target: "rook::repl",
        common = %common_point,
        "rolling back to common point"
    );

    let tail = oplog.truncate_after(common_point);
    let mut refetch = Vec::new();
    let mut ops_undone = 0usize;
    for entry in &tail {
        match undo(apply, entry) {
            Ok(()) => ops_undone += 1,
            Err(e) => {
                warn!(
                    target: "rook::repl",
                    optime = %entry.optime,
                    ns = %entry.ns,
                    error = %e,
                    "operation not undoable locally, queueing refetch"
                );
                refetch.push((entry.ns.clone(), entry.rid));
            }
        }
    }

    coordinator.set_rolled_back_to(common_point);
    coordinator.leave_rollback()?;
    info!(target: "rook::repl", ops_undone, "rollback complete");
    Ok(RollbackStats {
        common_point,
        ops_undone,
        refetch,
    })
}

fn undo(apply: &dyn RollbackApply, entry: &OplogEntry) -> Result<()> {
    match &entry.kind {
        OpKind::Insert { .. } => apply.undo_insert(&entry.ns, entry.rid),
        OpKind::Update { pre, .. } => apply.undo_update(&entry.ns, entry.rid, pre),
        OpKind::Delete { pre } => apply.undo_delete(&entry.ns, entry.rid, pre),
    }
}
