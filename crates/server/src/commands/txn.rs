//! Cross-shard transaction commands

use super::CommandRequest;
use crate::database::Database;
use rook_core::{Document, Error, OperationContext, Result, Value};
use rook_shard::{Decision, ShardId};

fn txn_id(request: &CommandRequest) -> Result<String> {
    match request.body.get("txnId") {
        Some(Value::String(id)) => Ok(id.clone()),
        Some(Value::Int64(n)) => Ok(n.to_string()),
        Some(Value::Int32(n)) => Ok(n.to_string()),
        _ => Err(Error::bad_value("transaction commands require txnId")),
    }
}

fn participants(request: &CommandRequest) -> Vec<ShardId> {
    match request.body.get("participants") {
        Some(Value::Array(shards)) => shards
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(ShardId::new(s.clone())),
                _ => None,
            })
            .collect(),
        _ => vec![ShardId::new("local")],
    }
}

pub(super) fn commit_transaction(
    db: &Database,
    request: &CommandRequest,
    _opctx: &OperationContext,
) -> Result<Document> {
    let txn_id = txn_id(request)?;
    let participants = participants(request);
    let client = db.loopback_participants();
    let decision = db
        .txn_coordinator()
        .commit_transaction(&txn_id, &participants, &client)?;
    match decision {
        Decision::Commit { commit_ts } => {
            let mut out = Document::new();
            out.push("commitTimestamp", Value::Timestamp(commit_ts));
            Ok(out)
        }
        Decision::Abort => Err(Error::NoSuchTransaction),
    }
}

pub(super) fn abort_transaction(
    db: &Database,
    request: &CommandRequest,
    _opctx: &OperationContext,
) -> Result<Document> {
    let txn_id = txn_id(request)?;
    let participants = participants(request);
    let client = db.loopback_participants();
    db.txn_coordinator()
        .abort_transaction(&txn_id, &participants, &client)?;
    Ok(Document::new())
}
