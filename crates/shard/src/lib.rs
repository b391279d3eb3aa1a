//! Sharding: chunk maps, routing, and cross-shard two-phase commit
//!
//! - [`chunk_map`]: versioned shard-key interval maps
//! - [`routing`]: the shard-version protocol, write targeting, database
//!   primaries, retryable-write statement dedup
//! - [`coordinator`] / [`participant`]: the durable two-phase commit
//!   protocol

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk_map;
pub mod coordinator;
pub mod participant;
pub mod routing;

pub use chunk_map::{Chunk, ChunkMap, ShardId};
pub use coordinator::{Decision, ParticipantClient, TwoPhaseCoordinator, Vote};
pub use participant::{TransactionParticipant, TxnState};
pub use routing::{
    DatabaseRegistry, DatabaseVersion, RoutingTable, ShardKeyChange, StatementRegistry,
    WriteDistributionMetrics, WriteTargeting,
};
