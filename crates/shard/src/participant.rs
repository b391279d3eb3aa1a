//! Two-phase commit participant
//!
//! A participant that voted commit is on the hook: it holds its prepared
//! transaction durable, restarts included, until the coordinator's
//! decision arrives, and the decision it applies is final. Commit and
//! abort are idempotent so decision re-delivery is harmless.

use parking_lot::Mutex;
use rook_core::{Error, Result, Timestamp};
use rook_storage::MetadataStore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::info;

/// Durable state of one transaction on this participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    /// Prepared and holding locks, awaiting the decision.
    Prepared {
        /// This participant's prepare timestamp.
        prepare_ts: Timestamp,
    },
    /// Committed at the timestamp.
    Committed {
        /// The coordinator's commit timestamp.
        commit_ts: Timestamp,
    },
    /// Aborted.
    Aborted,
}

fn state_key(txn_id: &str) -> String {
    format!("prepared/{}", txn_id)
}

/// This shard's participant service.
pub struct TransactionParticipant {
    store: Arc<MetadataStore>,
    /// Ordinal source for prepare timestamps.
    next_increment: AtomicU32,
    /// Serializes state changes per participant.
    apply_lock: Mutex<()>,
}

impl TransactionParticipant {
    /// Open over the reserved transaction store.
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self {
            store,
            next_increment: AtomicU32::new(1),
            apply_lock: Mutex::new(()),
        }
    }

    /// Prepare `txn_id`: persist the prepared state and return the prepare
    /// timestamp. Preparing an already-prepared transaction returns the
    /// original timestamp.
    pub fn prepare(&self, txn_id: &str, wall_secs: u32) -> Result<Timestamp> {
        let _guard = self.apply_lock.lock();
        match self.state(txn_id)? {
            Some(TxnState::Prepared { prepare_ts }) => Ok(prepare_ts),
            Some(TxnState::Committed { .. }) | Some(TxnState::Aborted) => {
                Err(Error::PreparedTransactionInProgress)
            }
            None => {
                let prepare_ts =
                    Timestamp::new(wall_secs, self.next_increment.fetch_add(1, Ordering::SeqCst));
                self.store
                    .put(&state_key(txn_id), &TxnState::Prepared { prepare_ts })?;
                info!(target: "rook::shard", txn = txn_id, ts = %prepare_ts, "transaction prepared");
                Ok(prepare_ts)
            }
        }
    }

    /// Apply a commit decision. Idempotent; committing an aborted
    /// transaction is a protocol violation.
    pub fn commit(&self, txn_id: &str, commit_ts: Timestamp) -> Result<()> {
        let _guard = self.apply_lock.lock();
        match self.state(txn_id)? {
            Some(TxnState::Committed { .. }) => Ok(()),
            Some(TxnState::Aborted) => Err(Error::Internal(format!(
                "commit delivered for aborted transaction {}",
                txn_id
            ))),
            Some(TxnState::Prepared { prepare_ts }) => {
                if commit_ts < prepare_ts {
                    return Err(Error::Internal(format!(
                        "commit timestamp {} below prepare timestamp {}",
                        commit_ts, prepare_ts
                    )));
                }
                self.store
                    .put(&state_key(txn_id), &TxnState::Committed { commit_ts })?;
                info!(target: "rook::shard", txn = txn_id, ts = %commit_ts, "transaction committed");
                Ok(())
            }
            None => Err(Error::NoSuchTransaction),
        }
    }

    /// Apply an abort decision. Idempotent; aborting a committed
    /// transaction is a protocol violation. Aborting an unprepared
    /// transaction records the abort (the coordinator may abort before
    /// this participant ever prepared).
    pub fn abort(&self, txn_id: &str) -> Result<()> {
        let _guard = self.apply_lock.lock();
        match self.state(txn_id)? {
            Some(TxnState::Aborted) => Ok(()),
            Some(TxnState::Committed { .. }) => Err(Error::Internal(format!(
                "abort delivered for committed transaction {}",
                txn_id
            ))),
            Some(TxnState::Prepared { .. }) | None => {
                self.store.put(&state_key(txn_id), &TxnState::Aborted)?;
                info!(target: "rook::shard", txn = txn_id, "transaction aborted");
                Ok(())
            }
        }
    }

    /// Current durable state of a transaction.
    pub fn state(&self, txn_id: &str) -> Result<Option<TxnState>> {
        self.store.get(&state_key(txn_id))
    }

    /// Transactions still holding prepared state.
    pub fn prepared_transactions(&self) -> Vec<String> {
        self.store
            .keys_with_prefix("prepared/")
            .into_iter()
            .filter(|k| {
                matches!(
                    self.store.get::<TxnState>(k),
                    Ok(Some(TxnState::Prepared { .. }))
                )
            })
            .map(|k| k.trim_start_matches("prepared/").to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rook_storage::{HeapEngine, COORDINATOR_IDENT};

    fn participant(engine: &HeapEngine) -> TransactionParticipant {
        TransactionParticipant::new(Arc::new(MetadataStore::open(engine, COORDINATOR_IDENT)))
    }

    #[test]
    fn prepare_commit_round_trip_is_idempotent() {
        let engine = HeapEngine::new();
        let p = participant(&engine);
        let ts = p.prepare("t1", 100).unwrap();
        // Re-prepare returns the same timestamp.
        assert_eq!(p.prepare("t1", 200).unwrap(), ts);

        let commit_ts = Timestamp::new(100, 99);
        p.commit("t1", commit_ts).unwrap();
        // Re-delivery is a no-op.
        p.commit("t1", commit_ts).unwrap();
        assert_eq!(
            p.state("t1").unwrap(),
            Some(TxnState::Committed { commit_ts })
        );
        // The decision is final.
        assert!(p.abort("t1").is_err());
    }

    #[test]
    fn abort_is_idempotent_and_final() {
        let engine = HeapEngine::new();
        let p = participant(&engine);
        p.prepare("t2", 100).unwrap();
        p.abort("t2").unwrap();
        p.abort("t2").unwrap();
        assert!(p.commit("t2", Timestamp::new(100, 50)).is_err());
        // Abort of a never-prepared transaction is recorded.
        p.abort("t3").unwrap();
        assert_eq!(p.state("t3").unwrap(), Some(TxnState::Aborted));
    }

    #[test]
    fn prepared_state_survives_restart() {
        let engine = HeapEngine::new();
        let ts = {
            let p = participant(&engine);
            p.prepare("t4", 123).unwrap()
        };
        // New participant over the same storage: still prepared, still
        // able to commit.
        let p = participant(&engine);
        assert_eq!(p.prepared_transactions(), vec!["t4"]);
        assert_eq!(p.state("t4").unwrap(), Some(TxnState::Prepared { prepare_ts: ts }));
        p.commit("t4", Timestamp::new(124, 0)).unwrap();
    }

    #[test]
    fn commit_below_prepare_timestamp_is_rejected() {
        let engine = HeapEngine::new();
        let p = participant(&engine);
        let ts = p.prepare("t5", 100).unwrap();
        let too_low = Timestamp::new(ts.secs - 1, 0);
        assert!(p.commit("t5", too_low).is_err());
    }
}
