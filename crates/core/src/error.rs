//! The canonical error model
//!
//! One `Error` enum covers every recoverable and fatal failure the engine
//! reports, with constructor helpers and the classification predicates the
//! retry loops key on. Error labels attached to failed client responses are
//! derived from the error kind plus operation context by [`ErrorLabels`].

use crate::namespace::NamespaceString;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Version stamp of a sharded collection's chunk map: `(epoch, major, minor)`.
///
/// The epoch changes only when the collection is dropped and recreated or
/// resharded; major bumps on chunk migration, minor on split/merge.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ChunkVersion {
    /// Collection incarnation.
    pub epoch: u64,
    /// Bumped when a chunk moves between shards.
    pub major: u32,
    /// Bumped on split/merge within a shard.
    pub minor: u32,
}

impl ChunkVersion {
    /// Create a version stamp.
    pub fn new(epoch: u64, major: u32, minor: u32) -> Self {
        Self {
            epoch,
            major,
            minor,
        }
    }

    /// True when `self` is stale relative to `other` within the same epoch.
    pub fn is_older_than(&self, other: &ChunkVersion) -> bool {
        self.epoch == other.epoch && (self.major, self.minor) < (other.major, other.minor)
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}.{}", self.epoch, self.major, self.minor)
    }
}

/// Engine error.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or out-of-range input.
    #[error("bad value: {0}")]
    BadValue(String),

    /// Referenced collection does not exist.
    #[error("namespace not found: {0}")]
    NamespaceNotFound(NamespaceString),

    /// Collection already exists.
    #[error("namespace exists: {0}")]
    NamespaceExists(NamespaceString),

    /// Unique index violation.
    #[error("duplicate key for index {index}: {key}")]
    DuplicateKey {
        /// Index name.
        index: String,
        /// Rendering of the offending key.
        key: String,
    },

    /// Referenced index does not exist.
    #[error("index not found: {0}")]
    IndexNotFound(String),

    /// A compound key pattern met two array-valued paths in one document.
    #[error("cannot index parallel arrays [{0}] [{1}]")]
    CannotIndexParallelArrays(String, String),

    /// A sort pattern met two array-valued paths in one document.
    #[error("cannot sort with keys that are parallel arrays")]
    CannotSortParallelArrays,

    /// Optimistic storage conflict; retried by the write path.
    #[error("write conflict: {0}")]
    WriteConflict(String),

    /// Operation was cancelled.
    #[error("operation was interrupted")]
    Interrupted,

    /// Operation deadline expired.
    #[error("operation exceeded time limit")]
    ExceededTimeLimit,

    /// Routing table version mismatch; client must refresh.
    #[error("stale config: wanted {wanted}, received {received}")]
    StaleConfig {
        /// Version the shard holds.
        wanted: ChunkVersion,
        /// Version the client sent.
        received: ChunkVersion,
    },

    /// Database (primary-shard) version mismatch.
    #[error("stale database version for {db}: wanted {wanted}, received {received}")]
    StaleDbVersion {
        /// Database name.
        db: String,
        /// Version the shard holds.
        wanted: u64,
        /// Version the client sent.
        received: u64,
    },

    /// Transaction id unknown to this node.
    #[error("no such transaction")]
    NoSuchTransaction,

    /// Transaction number is older than the latest seen for the session.
    #[error("transaction too old")]
    TransactionTooOld,

    /// A prepared transaction holds locks the operation needs.
    #[error("prepared transaction in progress")]
    PreparedTransactionInProgress,

    /// The database's primary shard is being moved.
    #[error("movePrimary in progress")]
    MovePrimaryInProgress,

    /// Index metadata names an on-disk format this build does not support.
    #[error("unsupported index version {0}")]
    UnsupportedIndexVersion(u8),

    /// A yielded plan was invalidated by a catalog change.
    #[error("query plan killed: {0}")]
    QueryPlanKilled(String),

    /// Saved cursor position can no longer be restored.
    #[error("cursor invalidated: {0}")]
    CursorInvalidated(String),

    /// Client cursor id unknown (exhausted, killed, or never existed).
    #[error("cursor not found: {0}")]
    CursorNotFound(u64),

    /// No handler registered for a command name.
    #[error("no such command: '{0}'")]
    CommandNotFound(String),

    /// An operation ran past its configured memory budget and spilling was
    /// not permitted. Recoverable, unlike `OutOfMemory`.
    #[error("exceeded memory limit: {0}")]
    ExceededMemoryLimit(String),

    /// Allocation failure. Fatal: the process aborts after flushing logs.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Malformed document bytes on the wire or on disk.
    #[error("invalid BSON: {0}")]
    InvalidBson(String),

    /// Broken internal invariant. Fatal for the operation, bug for us.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<crate::namespace::NamespaceError> for Error {
    fn from(e: crate::namespace::NamespaceError) -> Self {
        Error::BadValue(e.to_string())
    }
}

impl Error {
    /// Create a `BadValue` error.
    pub fn bad_value(msg: impl Into<String>) -> Self {
        Error::BadValue(msg.into())
    }

    /// Create a `DuplicateKey` error.
    pub fn duplicate_key(index: impl Into<String>, key: impl fmt::Display) -> Self {
        Error::DuplicateKey {
            index: index.into(),
            key: key.to_string(),
        }
    }

    /// Create a `WriteConflict` error.
    pub fn write_conflict(msg: impl Into<String>) -> Self {
        Error::WriteConflict(msg.into())
    }

    /// Create an `Internal` error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Stable name of the error kind, used in responses and logs.
    pub fn code_name(&self) -> &'static str {
        match self {
            Error::BadValue(_) => "BadValue",
            Error::NamespaceNotFound(_) => "NamespaceNotFound",
            Error::NamespaceExists(_) => "NamespaceExists",
            Error::DuplicateKey { .. } => "DuplicateKey",
            Error::IndexNotFound(_) => "IndexNotFound",
            Error::CannotIndexParallelArrays(_, _) => "CannotIndexParallelArrays",
            Error::CannotSortParallelArrays => "CannotSortParallelArrays",
            Error::WriteConflict(_) => "WriteConflict",
            Error::Interrupted => "Interrupted",
            Error::ExceededTimeLimit => "ExceededTimeLimit",
            Error::StaleConfig { .. } => "StaleConfig",
            Error::StaleDbVersion { .. } => "StaleDbVersion",
            Error::NoSuchTransaction => "NoSuchTransaction",
            Error::TransactionTooOld => "TransactionTooOld",
            Error::PreparedTransactionInProgress => "PreparedTransactionInProgress",
            Error::MovePrimaryInProgress => "MovePrimaryInProgress",
            Error::UnsupportedIndexVersion(_) => "UnsupportedIndexVersion",
            Error::QueryPlanKilled(_) => "QueryPlanKilled",
            Error::CursorInvalidated(_) => "CursorInvalidated",
            Error::CursorNotFound(_) => "CursorNotFound",
            Error::CommandNotFound(_) => "CommandNotFound",
            Error::ExceededMemoryLimit(_) => "ExceededMemoryLimit",
            Error::OutOfMemory(_) => "OutOfMemory",
            Error::InvalidBson(_) => "InvalidBSON",
            Error::Internal(_) => "InternalError",
        }
    }

    /// True for errors the write path recovers from by reopening the unit of
    /// work and retrying locally.
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, Error::WriteConflict(_))
    }

    /// True for errors recovered by refreshing the routing table and
    /// retrying the same operation.
    pub fn is_stale_routing(&self) -> bool {
        matches!(self, Error::StaleConfig { .. } | Error::StaleDbVersion { .. })
    }

    /// True for cancellation-shaped errors that surface to the client
    /// unmodified.
    pub fn is_interruption(&self) -> bool {
        matches!(
            self,
            Error::Interrupted | Error::ExceededTimeLimit | Error::QueryPlanKilled(_)
        )
    }

    /// True for errors that abort the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::OutOfMemory(_))
    }
}

/// Error labels attached to failed client responses.
///
/// Labels tell drivers which retry strategy applies: retry the whole
/// transaction, retry the one write, or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLabel {
    /// The whole multi-document transaction may be retried.
    TransientTransaction,
    /// The individual write may be retried.
    RetryableWrite,
    /// A change stream cannot resume from this error.
    NonResumableChangeStream,
    /// A change stream may resume from this error.
    ResumableChangeStream,
    /// The failed command performed no writes.
    NoWritesPerformed,
}

impl ErrorLabel {
    /// Wire name of the label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorLabel::TransientTransaction => "TransientTransactionError",
            ErrorLabel::RetryableWrite => "RetryableWriteError",
            ErrorLabel::NonResumableChangeStream => "NonResumableChangeStreamError",
            ErrorLabel::ResumableChangeStream => "ResumableChangeStreamError",
            ErrorLabel::NoWritesPerformed => "NoWritesPerformed",
        }
    }
}

/// Derives the label set for one failed operation.
pub struct ErrorLabels<'a> {
    error: &'a Error,
    command_name: &'a str,
    in_transaction: bool,
    is_commit_or_abort: bool,
    writes_performed: bool,
}

impl<'a> ErrorLabels<'a> {
    /// Start a builder for the given failure.
    pub fn new(error: &'a Error, command_name: &'a str) -> Self {
        Self {
            error,
            command_name,
            in_transaction: false,
            is_commit_or_abort: false,
            writes_performed: false,
        }
    }

    /// Mark the operation as part of a multi-document transaction.
    pub fn in_transaction(mut self, yes: bool) -> Self {
        self.in_transaction = yes;
        self
    }

    /// Mark the command as commitTransaction/abortTransaction.
    pub fn commit_or_abort(mut self, yes: bool) -> Self {
        self.is_commit_or_abort = yes;
        self
    }

    /// Record whether any write was applied before the failure.
    pub fn writes_performed(mut self, yes: bool) -> Self {
        self.writes_performed = yes;
        self
    }

    fn is_transient_transaction(&self) -> bool {
        // Only for operations inside a transaction that has not committed;
        // commit itself failing with a conflict is not transient.
        if !self.in_transaction || self.is_commit_or_abort {
            return false;
        }
        matches!(
            self.error,
            Error::WriteConflict(_)
                | Error::StaleConfig { .. }
                | Error::StaleDbVersion { .. }
                | Error::NoSuchTransaction
                | Error::PreparedTransactionInProgress
        )
    }

    fn is_retryable_write(&self) -> bool {
        if self.in_transaction && !self.is_commit_or_abort {
            return false;
        }
        is_write_command(self.command_name)
            && matches!(
                self.error,
                Error::Interrupted | Error::ExceededTimeLimit | Error::WriteConflict(_)
            )
    }

    /// Compute the labels for this failure.
    pub fn build(&self) -> Vec<ErrorLabel> {
        let mut labels = Vec::new();
        if self.is_transient_transaction() {
            labels.push(ErrorLabel::TransientTransaction);
        }
        if self.is_retryable_write() {
            labels.push(ErrorLabel::RetryableWrite);
        }
        if is_write_command(self.command_name) && !self.writes_performed {
            labels.push(ErrorLabel::NoWritesPerformed);
        }
        labels
    }
}

fn is_write_command(name: &str) -> bool {
    matches!(
        name,
        "insert" | "update" | "delete" | "findAndModify" | "commitTransaction" | "abortTransaction"
    )
}
