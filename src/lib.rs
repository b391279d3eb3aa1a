//! # RookDB
//!
//! A document database engine: schema-flexible collections with B-tree
//! indexes, a cost-sampled query planner with a plan cache, a pull-based
//! execution pipeline with cooperative yielding, replica-set consensus, and
//! shard routing with cross-shard two-phase commit.
//!
//! # Quick start
//!
//! ```
//! use rookdb::{doc, CommandRequest, Database, OperationContext, ServerOptions};
//!
//! let db = Database::open(ServerOptions::default()).unwrap();
//! let opctx = OperationContext::new();
//!
//! let insert = CommandRequest {
//!     name: "insert".into(),
//!     body: doc! { "insert": "users", "$db": "app", "documents": [ { "name": "ada" } ] },
//!     sequences: vec![],
//! };
//! let response = rookdb::dispatch(&db, &insert, &opctx);
//! assert_eq!(response.get("ok"), Some(&rookdb::Value::Int32(1)));
//! ```
//!
//! # Architecture
//!
//! The [`Database`] is the assembled server; commands go through
//! [`dispatch`] (or [`handle_message`] for framed wire bytes). The
//! internal crates layer storage → index → query → execution → server;
//! replication and sharding sit beside them. Only the surface re-exported
//! here is considered stable.

pub use rook_core::{
    arr, doc, ChunkVersion, Document, Error, ErrorLabel, NamespaceString, OperationContext,
    RecordId, Result, ServerOptions, Timestamp, Value,
};
pub use rook_server::{
    dispatch, handle_message, CommandRequest, Database, FindResult, MsgHeader, OpMsg,
};
