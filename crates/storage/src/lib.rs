//! Storage-engine interface and the in-memory heap engine
//!
//! Everything above this crate reaches storage through the traits in
//! [`traits`]: record stores with cursors and exact seeks, and units of work
//! for write atomicity. [`heap`] is the reference engine backing the server
//! and the test substrate; [`metadata`] layers string-keyed durable metadata
//! (catalog, replica-set config, coordinator records) over reserved record
//! stores.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod heap;
pub mod metadata;
pub mod traits;
pub mod uow;

pub use heap::{HeapEngine, HeapRecordStore};
pub use metadata::{MetadataStore, CATALOG_IDENT, COORDINATOR_IDENT, REPL_CONFIG_IDENT};
pub use traits::{Direction, RecordCursor, RecordStore, StorageEngine, UpdateOutcome};
pub use uow::UnitOfWork;
