//! CRUD commands

use super::CommandRequest;
use crate::database::Database;
use rook_core::{Document, Error, OperationContext, Result, Value};

pub(super) fn find(
    db: &Database,
    request: &CommandRequest,
    opctx: &OperationContext,
) -> Result<Document> {
    let ns = request.target_ns()?;
    let filter = request.doc_arg("filter");
    let sort = request.doc_arg("sort");
    let projection = request.doc_arg("projection");
    let skip = request.num_arg("skip", 0).max(0) as u64;
    let limit = request.num_arg("limit", 0).max(0) as u64;
    let batch_size = request.num_arg("batchSize", 101).max(1) as usize;

    let result = db.find(
        &ns, &filter, &sort, &projection, skip, limit, batch_size, opctx,
    )?;

    let mut cursor = Document::new();
    cursor.push("id", Value::Int64(result.cursor_id as i64));
    cursor.push("ns", ns.to_string());
    cursor.push(
        "firstBatch",
        Value::Array(result.batch.into_iter().map(Value::Document).collect()),
    );
    let mut out = Document::new();
    out.push("cursor", Value::Document(cursor));
    Ok(out)
}

pub(super) fn get_more(
    db: &Database,
    request: &CommandRequest,
    opctx: &OperationContext,
) -> Result<Document> {
    let cursor_id = request.num_arg("getMore", 0);
    if cursor_id <= 0 {
        return Err(Error::bad_value("getMore requires a cursor id"));
    }
    let batch_size = request.num_arg("batchSize", 101).max(1) as usize;
    let (batch, open) = db
        .cursors()
        .get_more(cursor_id as u64, batch_size, opctx)?;

    let mut cursor = Document::new();
    cursor.push(
        "id",
        Value::Int64(if open { cursor_id } else { 0 }),
    );
    cursor.push(
        "nextBatch",
        Value::Array(batch.into_iter().map(Value::Document).collect()),
    );
    let mut out = Document::new();
    out.push("cursor", Value::Document(cursor));
    Ok(out)
}

pub(super) fn kill_cursors(
    db: &Database,
    request: &CommandRequest,
    _opctx: &OperationContext,
) -> Result<Document> {
    let ids = match request.body.get("cursors") {
        Some(Value::Array(ids)) => ids.clone(),
        _ => return Err(Error::bad_value("killCursors requires a cursors array")),
    };
    let mut killed = Vec::new();
    let mut not_found = Vec::new();
    for id in ids {
        let id = match id {
            Value::Int64(v) => v,
            Value::Int32(v) => v as i64,
            _ => continue,
        };
        if db.cursors().kill(id as u64) {
            killed.push(Value::Int64(id));
        } else {
            not_found.push(Value::Int64(id));
        }
    }
    let mut out = Document::new();
    out.push("cursorsKilled", Value::Array(killed));
    out.push("cursorsNotFound", Value::Array(not_found));
    Ok(out)
}

pub(super) fn insert(
    db: &Database,
    request: &CommandRequest,
    opctx: &OperationContext,
) -> Result<Document> {
    let ns = request.target_ns()?;
    let docs = request.docs_arg("documents");
    if docs.is_empty() {
        return Err(Error::bad_value("insert requires documents"));
    }
    let n = db.insert_docs(&ns, docs, opctx)?;
    let mut out = Document::new();
    out.push("n", Value::Int64(n as i64));
    Ok(out)
}

pub(super) fn update(
    db: &Database,
    request: &CommandRequest,
    opctx: &OperationContext,
) -> Result<Document> {
    let ns = request.target_ns()?;
    let updates = request.docs_arg("updates");
    if updates.is_empty() {
        return Err(Error::bad_value("update requires updates"));
    }
    let mut matched = 0u64;
    let mut modified = 0u64;
    for u in updates {
        let q = match u.get("q") {
            Some(Value::Document(d)) => d.clone(),
            _ => Document::new(),
        };
        let update_doc = match u.get("u") {
            Some(Value::Document(d)) => d.clone(),
            _ => return Err(Error::bad_value("update entry requires 'u'")),
        };
        let multi = matches!(u.get("multi"), Some(Value::Boolean(true)));
        let (m, n) = db.update_docs(&ns, &q, &update_doc, multi, opctx)?;
        matched += m;
        modified += n;
    }
    let mut out = Document::new();
    out.push("n", Value::Int64(matched as i64));
    out.push("nModified", Value::Int64(modified as i64));
    Ok(out)
}

pub(super) fn delete(
    db: &Database,
    request: &CommandRequest,
    opctx: &OperationContext,
) -> Result<Document> {
    let ns = request.target_ns()?;
    let deletes = request.docs_arg("deletes");
    if deletes.is_empty() {
        return Err(Error::bad_value("delete requires deletes"));
    }
    let mut n = 0u64;
    for d in deletes {
        let q = match d.get("q") {
            Some(Value::Document(doc)) => doc.clone(),
            _ => Document::new(),
        };
        let limit_one = request_limit_one(&d);
        n += db.delete_docs(&ns, &q, limit_one, opctx)?;
    }
    let mut out = Document::new();
    out.push("n", Value::Int64(n as i64));
    Ok(out)
}

fn request_limit_one(entry: &Document) -> bool {
    matches!(
        entry.get("limit"),
        Some(Value::Int32(1)) | Some(Value::Int64(1))
    )
}

pub(super) fn find_and_modify(
    db: &Database,
    request: &CommandRequest,
    opctx: &OperationContext,
) -> Result<Document> {
    let ns = request.target_ns()?;
    let filter = request.doc_arg("query");
    let sort = request.doc_arg("sort");
    let remove = request.bool_arg("remove", false);
    let return_new = request.bool_arg("new", false);
    let update = match request.body.get("update") {
        Some(Value::Document(d)) => Some(d.clone()),
        _ => None,
    };
    if remove && update.is_some() {
        return Err(Error::bad_value("findAndModify cannot both update and remove"));
    }
    let value = db.find_and_modify(
        &ns,
        &filter,
        &sort,
        update.as_ref(),
        remove,
        return_new,
        opctx,
    )?;
    let mut out = Document::new();
    match value {
        Some(doc) => out.push("value", Value::Document(doc)),
        None => out.push("value", Value::Null),
    }
    Ok(out)
}

pub(super) fn aggregate(
    db: &Database,
    request: &CommandRequest,
    opctx: &OperationContext,
) -> Result<Document> {
    let ns = request.target_ns()?;
    let pipeline = match request.body.get("pipeline") {
        Some(Value::Array(stages)) => stages.clone(),
        _ => return Err(Error::bad_value("aggregate requires a pipeline array")),
    };
    let docs = db.aggregate(&ns, &pipeline, opctx)?;
    let mut cursor = Document::new();
    cursor.push("id", Value::Int64(0));
    cursor.push("ns", ns.to_string());
    cursor.push(
        "firstBatch",
        Value::Array(docs.into_iter().map(Value::Document).collect()),
    );
    let mut out = Document::new();
    out.push("cursor", Value::Document(cursor));
    Ok(out)
}
