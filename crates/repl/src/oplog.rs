//! The replication log
//!
//! An ordered log of logical operations with their pre/post images, as the
//! change-stream configuration requires. Entries are addressed by optime;
//! the log answers the questions rollback needs: what is my tail, where do
//! two logs diverge, and what lies after the common point.

use crate::optime::OpTime;
use parking_lot::RwLock;
use rook_core::{Document, Error, RecordId, Result};
use serde::{Deserialize, Serialize};

/// The logical operation of one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// Document inserted.
    Insert {
        /// The inserted document.
        doc: Document,
    },
    /// Document replaced.
    Update {
        /// Image before the update.
        pre: Document,
        /// Image after the update.
        post: Document,
    },
    /// Document deleted.
    Delete {
        /// Image before the delete.
        pre: Document,
    },
}

/// One replication-log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    /// Position of the entry.
    pub optime: OpTime,
    /// Namespace the operation applied to.
    pub ns: String,
    /// Record id the operation touched.
    pub rid: RecordId,
    /// The operation.
    pub kind: OpKind,
}

/// In-order log of applied operations.
#[derive(Default)]
pub struct Oplog {
    entries: RwLock<Vec<OplogEntry>>,
}

impl Oplog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry; optimes must be strictly increasing.
    pub fn append(&self, entry: OplogEntry) -> Result<()> {
        let mut entries = self.entries.write();
        if let Some(last) = entries.last() {
            if entry.optime <= last.optime {
                return Err(Error::internal(format!(
                    "oplog optime regression: {} after {}",
                    entry.optime, last.optime
                )));
            }
        }
        entries.push(entry);
        Ok(())
    }

    /// Optime of the newest entry.
    pub fn last_optime(&self) -> OpTime {
        self.entries
            .read()
            .last()
            .map(|e| e.optime)
            .unwrap_or_default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// All optimes, oldest first.
    pub fn optimes(&self) -> Vec<OpTime> {
        self.entries.read().iter().map(|e| e.optime).collect()
    }

    /// Entries strictly after `optime`, oldest first.
    pub fn entries_after(&self, optime: OpTime) -> Vec<OplogEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.optime > optime)
            .cloned()
            .collect()
    }

    /// Latest optime present in both this log and the remote chain, if the
    /// histories share any point at all.
    pub fn common_point(&self, remote: &[OpTime]) -> Option<OpTime> {
        let entries = self.entries.read();
        entries
            .iter()
            .rev()
            .map(|e| e.optime)
            .find(|local| remote.contains(local))
    }

    /// Drop every entry after `optime`, returning the dropped tail
    /// newest-first (the order rollback undoes it in).
    pub fn truncate_after(&self, optime: OpTime) -> Vec<OplogEntry> {
        let mut entries = self.entries.write();
        let keep = entries
            .iter()
            .position(|e| e.optime > optime)
            .unwrap_or(entries.len());
        let mut tail: Vec<OplogEntry> = entries.split_off(keep);
        tail.reverse();
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rook_core::{doc, Timestamp};

    fn entry(secs: u32, term: u64) -> OplogEntry {
        OplogEntry {
            optime: OpTime::new(Timestamp::new(secs, 0), term),
            ns: "db.c".to_string(),
            rid: RecordId(secs as i64),
            kind: OpKind::Insert {
                doc: doc! { "s": (secs as i32) },
            },
        }
    }

    #[test]
    fn append_enforces_monotone_optimes() {
        let log = Oplog::new();
        log.append(entry(1, 1)).unwrap();
        log.append(entry(2, 1)).unwrap();
        assert!(log.append(entry(2, 1)).is_err());
        assert_eq!(log.len(), 2);
        assert_eq!(log.last_optime(), OpTime::new(Timestamp::new(2, 0), 1));
    }

    #[test]
    fn common_point_finds_divergence() {
        let log = Oplog::new();
        for s in 1..=5 {
            log.append(entry(s, 1)).unwrap();
        }
        // Remote shares 1..=3 then diverges into term 2.
        let remote: Vec<OpTime> = (1..=3)
            .map(|s| OpTime::new(Timestamp::new(s, 0), 1))
            .chain([OpTime::new(Timestamp::new(4, 0), 2)])
            .collect();
        assert_eq!(
            log.common_point(&remote),
            Some(OpTime::new(Timestamp::new(3, 0), 1))
        );
        // Disjoint histories share nothing.
        assert_eq!(log.common_point(&[OpTime::new(Timestamp::new(9, 0), 9)]), None);
    }

    #[test]
    fn truncate_returns_tail_newest_first() {
        let log = Oplog::new();
        for s in 1..=5 {
            log.append(entry(s, 1)).unwrap();
        }
        let tail = log.truncate_after(OpTime::new(Timestamp::new(3, 0), 1));
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].optime.timestamp.secs, 5);
        assert_eq!(tail[1].optime.timestamp.secs, 4);
        assert_eq!(log.len(), 3);
    }
}
