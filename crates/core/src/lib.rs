//! Core types for the RookDB document engine
//!
//! This crate defines the vocabulary shared by every other crate:
//! - `Value` / `Document`: the self-describing document model with its total
//!   type order
//! - `RecordId`: stable identifier of a stored document
//! - `NamespaceString`: `db.coll` collection names
//! - `Error` / `Result`: the canonical error model with error labels
//! - `OperationContext`: cancellation token + deadline carried by every
//!   long-running call
//! - `ServerOptions` and the per-subsystem tuning knobs

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod document;
pub mod error;
pub mod namespace;
pub mod opctx;
pub mod options;
pub mod record_id;
pub mod value;

pub use document::Document;
pub use error::{ChunkVersion, Error, ErrorLabel, ErrorLabels, Result};
pub use namespace::{NamespaceError, NamespaceString};
pub use opctx::{CancellationToken, OperationContext};
pub use options::{
    ClusterRole, ExecKnobs, QueryKnobs, ReplKnobs, ServerOptions, ShardKnobs, WriteKnobs,
    YieldKnobs, EXIT_CLEAN, EXIT_OOM_MALLOC, EXIT_OOM_REALLOC, EXIT_UNCAUGHT,
};
pub use record_id::RecordId;
pub use value::{cmp_values, Decimal, ObjectId, Timestamp, TypeRank, Value};
