//! The server surface: wire framing, command dispatch, and the assembled
//! `Database`
//!
//! [`wire`] frames messages; [`commands`] parses and dispatches them
//! against a [`Database`], which wires the storage engine, collection
//! catalog, write path, cursors, replication, and the two-phase-commit
//! services together.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod commands;
pub mod database;
pub mod pipeline;
pub mod wire;

pub use commands::{dispatch, handle_message, CommandRequest};
pub use database::{Database, FindResult};
pub use wire::{MsgHeader, OpMsg, HEADER_LEN, OP_MSG};
