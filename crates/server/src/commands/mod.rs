//! Command dispatch
//!
//! Commands arrive as a name (the body's first field) plus arguments and
//! optional bulk document sequences. A registry table maps names to
//! handlers; unknown names fail with `CommandNotFound`. Every response,
//! success or failure, carries `ok`, the signed `$clusterTime`, and
//! `operationTime`; failures add `errmsg`, `codeName`, and the applicable
//! error labels.

mod crud;
mod ddl;
mod repl_cmds;
mod txn;

pub use repl_cmds::heartbeat_to_doc;

use crate::database::Database;
use crate::wire::OpMsg;
use once_cell::sync::Lazy;
use rook_core::{
    Document, Error, ErrorLabels, NamespaceString, OperationContext, Result, Value,
};
use std::collections::HashMap;
use tracing::debug;

/// A parsed command invocation.
pub struct CommandRequest {
    /// Command name (the body's first field).
    pub name: String,
    /// Full body document.
    pub body: Document,
    /// Bulk document sequences.
    pub sequences: Vec<(String, Vec<Document>)>,
}

impl CommandRequest {
    /// Pull the command out of a wire envelope.
    pub fn from_op_msg(msg: OpMsg) -> Result<CommandRequest> {
        let name = msg
            .body
            .keys()
            .next()
            .ok_or_else(|| Error::bad_value("empty command body"))?
            .to_string();
        Ok(CommandRequest {
            name,
            body: msg.body,
            sequences: msg.sequences,
        })
    }

    /// Database name (`$db`), defaulting like the shell does.
    pub fn db(&self) -> String {
        match self.body.get("$db") {
            Some(Value::String(db)) => db.clone(),
            _ => "test".to_string(),
        }
    }

    /// The namespace the command addresses: its first field names the
    /// collection.
    pub fn target_ns(&self) -> Result<NamespaceString> {
        match self.body.get(&self.name) {
            Some(Value::String(coll)) => Ok(NamespaceString::new(self.db(), coll.clone())?),
            _ => Err(Error::bad_value(format!(
                "command {} requires a collection name",
                self.name
            ))),
        }
    }

    /// A required document argument.
    pub fn doc_arg(&self, field: &str) -> Document {
        match self.body.get(field) {
            Some(Value::Document(d)) => d.clone(),
            _ => Document::new(),
        }
    }

    /// A numeric argument, defaulted.
    pub fn num_arg(&self, field: &str, default: i64) -> i64 {
        match self.body.get(field) {
            Some(Value::Int32(n)) => *n as i64,
            Some(Value::Int64(n)) => *n,
            Some(Value::Double(d)) => *d as i64,
            _ => default,
        }
    }

    /// A boolean argument, defaulted.
    pub fn bool_arg(&self, field: &str, default: bool) -> bool {
        match self.body.get(field) {
            Some(Value::Boolean(b)) => *b,
            _ => default,
        }
    }

    /// An array argument from the body or a document sequence.
    pub fn docs_arg(&self, field: &str) -> Vec<Document> {
        if let Some(Value::Array(values)) = self.body.get(field) {
            return values
                .iter()
                .filter_map(|v| match v {
                    Value::Document(d) => Some(d.clone()),
                    _ => None,
                })
                .collect();
        }
        self.sequences
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, docs)| docs.clone())
            .unwrap_or_default()
    }
}

type Handler = fn(&Database, &CommandRequest, &OperationContext) -> Result<Document>;

static REGISTRY: Lazy<HashMap<&'static str, Handler>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, Handler> = HashMap::new();
    table.insert("find", crud::find);
    table.insert("getMore", crud::get_more);
    table.insert("killCursors", crud::kill_cursors);
    table.insert("insert", crud::insert);
    table.insert("update", crud::update);
    table.insert("delete", crud::delete);
    table.insert("findAndModify", crud::find_and_modify);
    table.insert("aggregate", crud::aggregate);
    table.insert("createIndexes", ddl::create_indexes);
    table.insert("dropIndexes", ddl::drop_indexes);
    table.insert("commitTransaction", txn::commit_transaction);
    table.insert("abortTransaction", txn::abort_transaction);
    table.insert("replSetHeartbeat", repl_cmds::repl_set_heartbeat);
    table.insert("replSetGetStatus", repl_cmds::repl_set_get_status);
    table.insert("replSetInitiate", repl_cmds::repl_set_initiate);
    table
});

fn is_write_command(name: &str) -> bool {
    matches!(name, "insert" | "update" | "delete" | "findAndModify")
}

/// Run a command and build the response document. Errors never escape;
/// they become `ok: 0` responses with labels.
pub fn dispatch(db: &Database, request: &CommandRequest, opctx: &OperationContext) -> Document {
    debug!(target: "rook::command", command = %request.name, "dispatching");
    let result = match REGISTRY.get(request.name.as_str()) {
        Some(handler) => handler(db, request, opctx),
        None => Err(Error::CommandNotFound(request.name.clone())),
    };

    let mut response = match result {
        Ok(doc) => {
            let mut doc = doc;
            doc.set("ok", 1i32);
            doc
        }
        Err(e) => {
            let labels = ErrorLabels::new(&e, &request.name)
                .commit_or_abort(matches!(
                    request.name.as_str(),
                    "commitTransaction" | "abortTransaction"
                ))
                .writes_performed(false)
                .build();
            let mut doc = Document::new();
            doc.push("ok", 0i32);
            doc.push("errmsg", e.to_string());
            doc.push("codeName", e.code_name());
            if !labels.is_empty() && is_write_command(&request.name) {
                doc.push(
                    "errorLabels",
                    Value::Array(
                        labels
                            .iter()
                            .map(|l| Value::String(l.as_str().to_string()))
                            .collect(),
                    ),
                );
            }
            doc
        }
    };

    // Every response gossips the signed cluster time and the operation
    // time this node has applied through.
    let signed = db.keys().sign(db.clock().now());
    let mut cluster_time = Document::new();
    cluster_time.push("clusterTime", Value::Timestamp(signed.time));
    let mut signature = Document::new();
    signature.push("hash", Value::Binary(signed.signature));
    signature.push("keyId", Value::Int64(signed.key_id as i64));
    cluster_time.push("signature", Value::Document(signature));
    response.push("$clusterTime", Value::Document(cluster_time));
    response.push(
        "operationTime",
        Value::Timestamp(db.repl().last_applied().timestamp),
    );
    response
}

/// Wire entry point: decode, dispatch, encode the reply.
pub fn handle_message(db: &Database, bytes: &[u8]) -> Result<Vec<u8>> {
    let (header, msg) = OpMsg::decode(bytes)?;
    let request = CommandRequest::from_op_msg(msg)?;
    let opctx = OperationContext::new();
    let response = dispatch(db, &request, &opctx);
    OpMsg::with_body(response).encode(header.request_id + 1_000_000, header.request_id)
}
