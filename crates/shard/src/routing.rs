//! Shard routing
//!
//! The router's side of the shard-version protocol: every targeted
//! operation carries the client's last-known chunk-map version, the shard
//! rejects stale ones with `StaleConfig`, and the client refreshes and
//! retries (bounded). Retried writes deduplicate by statement id so a
//! retry lands exactly once. Each write is also classified as targeting
//! one shard, several, or all of them, feeding the distribution metrics
//! the analysis tooling reads.

use crate::chunk_map::{ChunkMap, ShardId};
use parking_lot::RwLock;
use rook_core::{ChunkVersion, Document, Error, Result, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Where a write must go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteTargeting {
    /// The predicate pins a full shard key: one shard.
    SingleShard(ShardId),
    /// The predicate bounds the key to a subset of shards.
    MultiShard(Vec<ShardId>),
    /// No usable shard-key constraint: broadcast.
    AllShards(Vec<ShardId>),
}

/// Counters for the write-distribution analysis.
#[derive(Debug, Default, Clone, Copy)]
pub struct WriteDistributionMetrics {
    /// Writes that targeted exactly one shard.
    pub single_shard: u64,
    /// Writes that targeted a proper subset.
    pub multi_shard: u64,
    /// Writes that broadcast to every shard.
    pub all_shards: u64,
}

/// The routing table cache a router holds for one collection.
pub struct RoutingTable {
    map: RwLock<ChunkMap>,
    metrics: RwLock<WriteDistributionMetrics>,
}

impl RoutingTable {
    /// Wrap a chunk map.
    pub fn new(map: ChunkMap) -> Self {
        Self {
            map: RwLock::new(map),
            metrics: RwLock::new(WriteDistributionMetrics::default()),
        }
    }

    /// Current version stamp.
    pub fn version(&self) -> ChunkVersion {
        self.map.read().version
    }

    /// Snapshot of the chunk map (copy-on-write style read).
    pub fn chunk_map(&self) -> ChunkMap {
        self.map.read().clone()
    }

    /// Install a newer map (refresh from the config catalog).
    pub fn refresh(&self, newer: ChunkMap) {
        let mut map = self.map.write();
        if newer.version.is_older_than(&map.version) {
            return;
        }
        debug!(
            target: "rook::shard",
            ns = %newer.ns,
            version = %newer.version,
            "routing table refreshed"
        );
        *map = newer;
    }

    /// The shard-side version check: reject operations attached to an
    /// older version so the client refreshes.
    pub fn check_version(&self, received: ChunkVersion) -> Result<()> {
        let wanted = self.map.read().version;
        if received.is_older_than(&wanted) || received.epoch != wanted.epoch {
            return Err(Error::StaleConfig { wanted, received });
        }
        Ok(())
    }

    /// Route one write by its filter, recording the classification.
    pub fn target_write(&self, filter: &Document) -> WriteTargeting {
        let map = self.map.read();
        let targeting = match extract_shard_key(filter, &map.key_path) {
            ShardKeyConstraint::Exact(value) => {
                WriteTargeting::SingleShard(map.owner_of(&value).clone())
            }
            ShardKeyConstraint::Range(values) => {
                let shards: HashSet<ShardId> =
                    values.iter().map(|v| map.owner_of(v).clone()).collect();
                let mut shards: Vec<ShardId> = shards.into_iter().collect();
                shards.sort();
                if shards.len() == 1 {
                    WriteTargeting::SingleShard(shards.pop().expect("one shard"))
                } else {
                    WriteTargeting::MultiShard(shards)
                }
            }
            ShardKeyConstraint::None => WriteTargeting::AllShards(map.shards()),
        };
        let mut metrics = self.metrics.write();
        match &targeting {
            WriteTargeting::SingleShard(_) => metrics.single_shard += 1,
            WriteTargeting::MultiShard(_) => metrics.multi_shard += 1,
            WriteTargeting::AllShards(_) => metrics.all_shards += 1,
        }
        targeting
    }

    /// Distribution counters so far.
    pub fn metrics(&self) -> WriteDistributionMetrics {
        *self.metrics.read()
    }
}

/// The routed form of an update that moves a document's shard key.
///
/// When the post-image's key lands in a chunk on another shard, the update
/// cannot run in place: it becomes a delete on the old owner plus an
/// insert on the new one, executed as a cross-shard transaction through
/// the commit coordinator with both shards as participants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardKeyChange {
    /// Shard holding the pre-image.
    pub delete_on: ShardId,
    /// Shard that owns the post-image's key.
    pub insert_on: ShardId,
}

impl ShardKeyChange {
    /// Participant list for the transaction.
    pub fn participants(&self) -> Vec<ShardId> {
        let mut out = vec![self.delete_on.clone(), self.insert_on.clone()];
        out.dedup();
        out
    }
}

impl RoutingTable {
    /// Classify an update by its pre- and post-image shard keys. `None`
    /// when the key is unchanged or stays on one shard (a plain in-place
    /// update suffices).
    pub fn plan_shard_key_change(
        &self,
        pre: &Document,
        post: &Document,
    ) -> Option<ShardKeyChange> {
        let map = self.map.read();
        let old_key = pre.get_path(&map.key_path)?;
        let new_key = post.get_path(&map.key_path)?;
        let delete_on = map.owner_of(old_key).clone();
        let insert_on = map.owner_of(new_key).clone();
        if delete_on == insert_on {
            return None;
        }
        Some(ShardKeyChange {
            delete_on,
            insert_on,
        })
    }
}

enum ShardKeyConstraint {
    /// Equality on the full shard key under simple collation.
    Exact(Value),
    /// An enumerable set of key points (`$in`).
    Range(Vec<Value>),
    /// Nothing usable.
    None,
}

/// Pull the shard-key constraint out of a filter document. Only top-level
/// equality and `$in` under simple collation target; strings under a
/// non-simple collation would not, but collations are a per-query option
/// the caller screens before routing.
fn extract_shard_key(filter: &Document, key_path: &str) -> ShardKeyConstraint {
    match filter.get(key_path) {
        Some(Value::Document(ops)) if ops.keys().any(|k| k.starts_with('$')) => {
            match ops.get("$in") {
                Some(Value::Array(values)) if ops.len() == 1 => {
                    ShardKeyConstraint::Range(values.clone())
                }
                _ => match ops.get("$eq") {
                    Some(v) if ops.len() == 1 => ShardKeyConstraint::Exact(v.clone()),
                    _ => ShardKeyConstraint::None,
                },
            }
        }
        Some(v) => ShardKeyConstraint::Exact(v.clone()),
        None => ShardKeyConstraint::None,
    }
}

/// Version of one database's primary-shard assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DatabaseVersion(pub u64);

/// Primary-shard registry for unsharded collections.
#[derive(Default)]
pub struct DatabaseRegistry {
    entries: RwLock<HashMap<String, (ShardId, DatabaseVersion)>>,
}

impl DatabaseRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign or move the primary shard of a database.
    pub fn set_primary(&self, db: impl Into<String>, shard: ShardId) -> DatabaseVersion {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(db.into())
            .or_insert((shard.clone(), DatabaseVersion(0)));
        entry.0 = shard;
        entry.1 = DatabaseVersion(entry.1 .0 + 1);
        entry.1
    }

    /// Primary shard and version of a database.
    pub fn primary(&self, db: &str) -> Option<(ShardId, DatabaseVersion)> {
        self.entries.read().get(db).cloned()
    }

    /// Shard-side check mirroring [`RoutingTable::check_version`].
    pub fn check_version(&self, db: &str, received: DatabaseVersion) -> Result<()> {
        let Some((_, wanted)) = self.primary(db) else {
            return Ok(());
        };
        if received.0 < wanted.0 {
            return Err(Error::StaleDbVersion {
                db: db.to_string(),
                wanted: wanted.0,
                received: received.0,
            });
        }
        Ok(())
    }
}

/// Statement-id registry backing retryable writes: a retried statement is
/// applied exactly once.
#[derive(Default)]
pub struct StatementRegistry {
    applied: RwLock<HashSet<(u64, u32)>>,
    executions: AtomicU64,
}

impl StatementRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `(session, statement)` as applied; false when it already
    /// was (the retry must not re-apply).
    pub fn begin(&self, session_id: u64, statement_id: u32) -> bool {
        let fresh = self.applied.write().insert((session_id, statement_id));
        if fresh {
            self.executions.fetch_add(1, Ordering::Relaxed);
        }
        fresh
    }

    /// How many distinct statements were applied.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }
}
