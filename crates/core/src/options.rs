//! Server options and subsystem tuning knobs
//!
//! `ServerOptions` is the process-wide configuration bag constructed once at
//! startup (from CLI flags and/or a config file) and handed down to the
//! subsystems. Per-subsystem knobs live in their own structs so tests can
//! construct a fresh, tightly scoped configuration per case.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Process exit code for a clean shutdown.
pub const EXIT_CLEAN: i32 = 0;
/// Process exit code when a buffer allocation fails.
pub const EXIT_OOM_MALLOC: i32 = 42;
/// Process exit code when a buffer reallocation fails.
pub const EXIT_OOM_REALLOC: i32 = 43;
/// Process exit code for an uncaught internal assertion.
pub const EXIT_UNCAUGHT: i32 = 100;

/// Role of this process within a sharded cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClusterRole {
    /// Plain replica-set member or standalone.
    #[default]
    None,
    /// Shard server (`--shardsvr`).
    ShardServer,
    /// Config server (`--configsvr`).
    ConfigServer,
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOptions {
    /// Replica-set name (`--replSet`); `None` runs standalone.
    pub repl_set: Option<String>,
    /// Cluster role.
    pub cluster_role: ClusterRole,
    /// Listen port (`--port`).
    pub port: u16,
    /// Bind address (`--bind_ip`).
    pub bind_ip: String,
    /// Data directory (`--dbpath`).
    pub db_path: PathBuf,
    /// Query subsystem knobs.
    pub query: QueryKnobs,
    /// Execution subsystem knobs.
    pub exec: ExecKnobs,
    /// Yield policy knobs.
    pub yielding: YieldKnobs,
    /// Write path knobs.
    pub write: WriteKnobs,
    /// Replication knobs.
    pub repl: ReplKnobs,
    /// Sharding knobs.
    pub shard: ShardKnobs,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            repl_set: None,
            cluster_role: ClusterRole::None,
            port: 27017,
            bind_ip: "127.0.0.1".to_string(),
            db_path: PathBuf::from("/data/db"),
            query: QueryKnobs::default(),
            exec: ExecKnobs::default(),
            yielding: YieldKnobs::default(),
            write: WriteKnobs::default(),
            repl: ReplKnobs::default(),
            shard: ShardKnobs::default(),
        }
    }
}

/// Planner and plan-cache knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryKnobs {
    /// Work units each candidate plan may consume during multi-planning.
    pub plan_evaluation_works: u32,
    /// Plan cache budget in bytes.
    pub plan_cache_max_bytes: usize,
    /// Cache entry is evicted after this many consecutive misses
    /// (replans that did not reuse it productively).
    pub plan_cache_evict_after_misses: u32,
}

impl Default for QueryKnobs {
    fn default() -> Self {
        Self {
            plan_evaluation_works: 10_000,
            plan_cache_max_bytes: 5 * 1024 * 1024,
            plan_cache_evict_after_misses: 8,
        }
    }
}

/// Execution pipeline knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecKnobs {
    /// Sort stage memory budget before it must spill or fail.
    pub sort_max_memory_bytes: usize,
    /// Group stage memory budget before it must spill or fail.
    pub group_max_memory_bytes: usize,
    /// Per-consumer buffered bytes in an exchange.
    pub exchange_buffer_max_bytes: usize,
}

impl Default for ExecKnobs {
    fn default() -> Self {
        Self {
            sort_max_memory_bytes: 32 * 1024 * 1024,
            group_max_memory_bytes: 16 * 1024 * 1024,
            exchange_buffer_max_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Yield cadence knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YieldKnobs {
    /// Work iterations between yield checks.
    pub yield_iterations: u32,
    /// Elapsed milliseconds between yield checks.
    pub yield_period_ms: u64,
}

impl Default for YieldKnobs {
    fn default() -> Self {
        Self {
            yield_iterations: 1000,
            yield_period_ms: 10,
        }
    }
}

/// Write path knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteKnobs {
    /// Attempts before a WriteConflict stops being retried locally.
    pub write_conflict_retry_limit: u32,
    /// Base backoff between conflict retries, in microseconds. Doubles per
    /// attempt up to `backoff_cap_micros`.
    pub backoff_base_micros: u64,
    /// Backoff ceiling in microseconds.
    pub backoff_cap_micros: u64,
}

impl Default for WriteKnobs {
    fn default() -> Self {
        Self {
            write_conflict_retry_limit: 100,
            backoff_base_micros: 50,
            backoff_cap_micros: 10_000,
        }
    }
}

/// Replication knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplKnobs {
    /// Heartbeat cadence in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Heartbeat timeout: a member missing this long is marked down.
    pub heartbeat_timeout_ms: u64,
    /// Election timeout before a secondary considers the primary gone.
    pub election_timeout_ms: u64,
    /// Upper bound of the randomized election retry backoff.
    pub election_backoff_max_ms: u64,
    /// Cluster-time signing key rotation cadence in seconds.
    pub key_rotation_interval_secs: u64,
}

impl Default for ReplKnobs {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 2000,
            heartbeat_timeout_ms: 10_000,
            election_timeout_ms: 10_000,
            election_backoff_max_ms: 1000,
            key_rotation_interval_secs: 90 * 24 * 3600,
        }
    }
}

/// Sharding knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardKnobs {
    /// Attempts to refresh the routing table after StaleConfig before the
    /// error surfaces to the client.
    pub stale_config_retry_limit: u32,
    /// Two-phase-commit participant response timeout in milliseconds.
    pub prepare_timeout_ms: u64,
}

impl Default for ShardKnobs {
    fn default() -> Self {
        Self {
            stale_config_retry_limit: 3,
            prepare_timeout_ms: 30_000,
        }
    }
}
