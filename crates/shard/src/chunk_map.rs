//! Chunk maps
//!
//! For each sharded collection the cluster keeps a sorted map from
//! half-open shard-key intervals to owning shards, stamped with a
//! [`ChunkVersion`]. Chunk mutations bump the version: a move bumps the
//! major component (every router must refresh), a split or merge bumps the
//! minor.

use rook_core::{cmp_values, ChunkVersion, Error, Result, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use tracing::info;

/// Shard identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub String);

impl ShardId {
    /// Build from any string-ish.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One half-open interval `[min, max)` of the shard-key space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Inclusive lower bound.
    pub min: Value,
    /// Exclusive upper bound (`MaxKey` closes the last chunk).
    pub max: Value,
    /// Owning shard.
    pub shard: ShardId,
}

impl Chunk {
    fn contains(&self, v: &Value) -> bool {
        cmp_values(v, &self.min) != Ordering::Less
            && (matches!(self.max, Value::MaxKey) || cmp_values(v, &self.max) == Ordering::Less)
    }
}

/// The routing table of one sharded collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMap {
    /// Namespace string of the collection.
    pub ns: String,
    /// Dotted path of the shard key.
    pub key_path: String,
    /// Current version stamp.
    pub version: ChunkVersion,
    chunks: Vec<Chunk>,
}

impl ChunkMap {
    /// A fresh one-chunk map covering the whole key space on `shard`.
    pub fn new(ns: impl Into<String>, key_path: impl Into<String>, shard: ShardId) -> Self {
        Self {
            ns: ns.into(),
            key_path: key_path.into(),
            version: ChunkVersion::new(1, 1, 0),
            chunks: vec![Chunk {
                min: Value::MinKey,
                max: Value::MaxKey,
                shard,
            }],
        }
    }

    /// The chunks in key order.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Owning shard of a shard-key value.
    pub fn owner_of(&self, key_value: &Value) -> &ShardId {
        let chunk = self
            .chunks
            .iter()
            .find(|c| c.contains(key_value))
            .unwrap_or_else(|| self.chunks.last().expect("chunk map never empty"));
        &chunk.shard
    }

    /// Every shard owning at least one chunk.
    pub fn shards(&self) -> Vec<ShardId> {
        let mut out: Vec<ShardId> = self.chunks.iter().map(|c| c.shard.clone()).collect();
        out.sort();
        out.dedup();
        out
    }

    /// Split the chunk containing `at` into `[min, at)` and `[at, max)`.
    /// Bumps the minor version.
    pub fn split_at(&mut self, at: Value) -> Result<()> {
        let idx = self
            .chunks
            .iter()
            .position(|c| c.contains(&at))
            .ok_or_else(|| Error::bad_value("split point outside key space"))?;
        let chunk = &self.chunks[idx];
        if cmp_values(&at, &chunk.min) == Ordering::Equal {
            return Err(Error::bad_value("split point is already a chunk boundary"));
        }
        let upper = Chunk {
            min: at.clone(),
            max: chunk.max.clone(),
            shard: chunk.shard.clone(),
        };
        self.chunks[idx].max = at;
        self.chunks.insert(idx + 1, upper);
        self.version.minor += 1;
        info!(target: "rook::shard", ns = %self.ns, version = %self.version, "chunk split");
        Ok(())
    }

    /// Merge the chunk starting at `min` with its successor. Both must be
    /// on the same shard. Bumps the minor version.
    pub fn merge_with_next(&mut self, min: &Value) -> Result<()> {
        let idx = self
            .chunks
            .iter()
            .position(|c| cmp_values(&c.min, min) == Ordering::Equal)
            .ok_or_else(|| Error::bad_value("no chunk starts at the given bound"))?;
        if idx + 1 >= self.chunks.len() {
            return Err(Error::bad_value("no successor chunk to merge with"));
        }
        if self.chunks[idx].shard != self.chunks[idx + 1].shard {
            return Err(Error::bad_value("cannot merge chunks on different shards"));
        }
        let next = self.chunks.remove(idx + 1);
        self.chunks[idx].max = next.max;
        self.version.minor += 1;
        info!(target: "rook::shard", ns = %self.ns, version = %self.version, "chunks merged");
        Ok(())
    }

    /// Move the chunk starting at `min` to another shard. Bumps the major
    /// version and resets minor.
    pub fn move_chunk(&mut self, min: &Value, to: ShardId) -> Result<()> {
        let idx = self
            .chunks
            .iter()
            .position(|c| cmp_values(&c.min, min) == Ordering::Equal)
            .ok_or_else(|| Error::bad_value("no chunk starts at the given bound"))?;
        self.chunks[idx].shard = to;
        self.version.major += 1;
        self.version.minor = 0;
        info!(target: "rook::shard", ns = %self.ns, version = %self.version, "chunk moved");
        Ok(())
    }

    /// Check that the chunks tile the key space without gaps or overlaps.
    pub fn validate(&self) -> Result<()> {
        let first = self.chunks.first().ok_or_else(|| Error::internal("empty chunk map"))?;
        if !matches!(first.min, Value::MinKey) {
            return Err(Error::internal("chunk map does not start at MinKey"));
        }
        let last = self.chunks.last().expect("non-empty");
        if !matches!(last.max, Value::MaxKey) {
            return Err(Error::internal("chunk map does not end at MaxKey"));
        }
        for pair in self.chunks.windows(2) {
            if cmp_values(&pair[0].max, &pair[1].min) != Ordering::Equal {
                return Err(Error::internal("chunk map has a gap or overlap"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> ChunkMap {
        ChunkMap::new("db.c", "user_id", ShardId::new("shard0"))
    }

    #[test]
    fn fresh_map_routes_everything_to_one_shard() {
        let m = map();
        m.validate().unwrap();
        assert_eq!(m.owner_of(&Value::Int32(5)).0, "shard0");
        assert_eq!(m.owner_of(&Value::String("x".into())).0, "shard0");
        assert_eq!(m.version, ChunkVersion::new(1, 1, 0));
    }

    #[test]
    fn split_bumps_minor_and_partitions() {
        let mut m = map();
        m.split_at(Value::Int32(100)).unwrap();
        m.validate().unwrap();
        assert_eq!(m.chunks().len(), 2);
        assert_eq!(m.version, ChunkVersion::new(1, 1, 1));
        // Split at an existing boundary is rejected.
        assert!(m.split_at(Value::Int32(100)).is_err());
    }

    #[test]
    fn move_bumps_major_and_reroutes() {
        let mut m = map();
        m.split_at(Value::Int32(100)).unwrap();
        m.move_chunk(&Value::Int32(100), ShardId::new("shard1")).unwrap();
        m.validate().unwrap();
        assert_eq!(m.version, ChunkVersion::new(1, 2, 0));
        assert_eq!(m.owner_of(&Value::Int32(99)).0, "shard0");
        assert_eq!(m.owner_of(&Value::Int32(100)).0, "shard1");
        assert_eq!(m.owner_of(&Value::Int32(500)).0, "shard1");
        assert_eq!(m.shards().len(), 2);
    }

    #[test]
    fn merge_requires_same_shard() {
        let mut m = map();
        m.split_at(Value::Int32(100)).unwrap();
        m.move_chunk(&Value::Int32(100), ShardId::new("shard1")).unwrap();
        assert!(m.merge_with_next(&Value::MinKey).is_err());
        m.move_chunk(&Value::Int32(100), ShardId::new("shard0")).unwrap();
        m.merge_with_next(&Value::MinKey).unwrap();
        assert_eq!(m.chunks().len(), 1);
        m.validate().unwrap();
    }
}
