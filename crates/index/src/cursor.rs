//! B-tree index cursor
//!
//! A stateful iterator over one index tree, either between a start and end
//! key or driven by an interval vector. The cursor re-locates by value on
//! every step, skips tombstoned entries (warning when a long run of them is
//! crossed), honors the end bound per direction, and supports saving and
//! restoring its position across yields under concurrent mutation:
//!
//! - if the saved `(key, rid)` is still present and live, restore resumes
//!   exactly there;
//! - if it is tombstoned, restore skips forward past the markers;
//! - if it vanished, restore positions at the first live entry past the
//!   saved key in scan direction.

use crate::bounds::{BoundsCheck, BoundsChecker, SeekPoint};
use crate::btree::{BucketTree, Entry};
use crate::codec::{decode_key, encode_seek_key};
use crate::descriptor::{IndexDescriptor, IndexVersion};
use rook_core::{Error, OperationContext, RecordId, Result, Value};
use rook_storage::Direction;
use std::sync::Arc;
use tracing::warn;

/// Consecutive tombstones crossed before the cursor logs about it.
const UNUSED_SKIP_WARN_THRESHOLD: u64 = 10;

/// Per-cursor counters surfaced into plan stats.
#[derive(Debug, Clone, Copy, Default)]
pub struct CursorStats {
    /// Live entries examined (tombstones excluded).
    pub keys_examined: u64,
    /// Tombstoned entries stepped over.
    pub unused_skipped: u64,
    /// Tree re-descents performed for the bounds iterator.
    pub seeks: u64,
}

/// How a restore found the saved position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The exact saved entry is live again under the cursor.
    SamePosition,
    /// The saved entry is gone; the cursor sits on the next live entry,
    /// which has not been returned yet.
    NewPosition,
    /// Nothing remains past the saved position.
    Exhausted,
}

enum Mode {
    Range {
        /// Encoded end key and inclusivity; `None` scans to the edge.
        end: Option<(Vec<u8>, bool)>,
    },
    Bounds(BoundsChecker),
}

struct Current {
    entry: Entry,
    values: Vec<Value>,
}

/// Cursor over one index.
pub struct BtreeCursor {
    tree: Arc<BucketTree>,
    descriptor: Arc<IndexDescriptor>,
    direction: Direction,
    mode: Mode,
    current: Option<Current>,
    saved: Option<Option<(Vec<u8>, RecordId)>>,
    stats: CursorStats,
}

impl BtreeCursor {
    /// Open a cursor between `start_values` and `end_values`.
    ///
    /// `start_values` is always inclusive; `end_inclusive` governs the end
    /// bound. Partial tuples bound a key-prefix. Construction dispatches on
    /// the descriptor's on-disk version.
    pub fn open_range(
        tree: Arc<BucketTree>,
        descriptor: Arc<IndexDescriptor>,
        start_values: &[Value],
        end_values: &[Value],
        end_inclusive: bool,
        direction: Direction,
        opctx: &OperationContext,
    ) -> Result<BtreeCursor> {
        // V0 and V1 share one cursor; the version still gates construction
        // so metadata naming an unknown format fails before any I/O.
        match descriptor.version {
            IndexVersion::V0 | IndexVersion::V1 => {}
        }
        opctx.check_for_interrupt()?;

        let end = if end_values.is_empty() {
            None
        } else {
            let mut bytes = encode_seek_key(&descriptor.key_pattern, descriptor.collation, end_values);
            let partial = end_values.len() < descriptor.key_pattern.len();
            // A partial inclusive end (forward) or partial exclusive end
            // (backward) must cover every extension of the prefix.
            if partial
                && ((direction == Direction::Forward && end_inclusive)
                    || (direction == Direction::Backward && !end_inclusive))
            {
                bytes.push(0xff);
            }
            Some((bytes, end_inclusive))
        };

        let mut cursor = BtreeCursor {
            tree,
            descriptor,
            direction,
            mode: Mode::Range { end },
            current: None,
            saved: None,
            stats: CursorStats::default(),
        };
        cursor.initial_seek(start_values)?;
        Ok(cursor)
    }

    /// Open a cursor driven by an interval vector.
    pub fn open_with_bounds(
        tree: Arc<BucketTree>,
        descriptor: Arc<IndexDescriptor>,
        checker: BoundsChecker,
        opctx: &OperationContext,
    ) -> Result<BtreeCursor> {
        match descriptor.version {
            IndexVersion::V0 | IndexVersion::V1 => {}
        }
        opctx.check_for_interrupt()?;
        let direction = checker.direction();
        let start = checker.bounds().start_values(direction);
        let mut cursor = BtreeCursor {
            tree,
            descriptor,
            direction,
            mode: Mode::Bounds(checker),
            current: None,
            saved: None,
            stats: CursorStats::default(),
        };
        cursor.initial_seek(&start)?;
        Ok(cursor)
    }

    /// True when the cursor is exhausted.
    pub fn is_eof(&self) -> bool {
        self.current.is_none()
    }

    /// Decoded key of the current entry. Requires `!is_eof()`.
    pub fn current_key(&self) -> &[Value] {
        &self.current.as_ref().expect("cursor at EOF").values
    }

    /// Record id of the current entry. Requires `!is_eof()`.
    pub fn current_record_id(&self) -> RecordId {
        self.current.as_ref().expect("cursor at EOF").entry.rid
    }

    /// Typebits of the current entry (empty under V0).
    pub fn current_type_bits(&self) -> &[u8] {
        &self.current.as_ref().expect("cursor at EOF").entry.type_bits
    }

    /// Counters.
    pub fn stats(&self) -> CursorStats {
        self.stats
    }

    /// Move one entry in scan direction. Returns false at EOF.
    pub fn advance(&mut self, opctx: &OperationContext) -> Result<bool> {
        opctx.check_for_interrupt()?;
        let Some(cur) = &self.current else {
            return Ok(false);
        };
        let next = self.step_from(&cur.entry.key.clone(), cur.entry.rid);
        self.settle(next)?;
        Ok(!self.is_eof())
    }

    /// Remember the current position by value.
    pub fn save_state(&mut self) {
        self.saved = Some(
            self.current
                .as_ref()
                .map(|c| (c.entry.key.clone(), c.entry.rid)),
        );
    }

    /// Re-establish position after a yield.
    pub fn restore_state(&mut self, opctx: &OperationContext) -> Result<RestoreOutcome> {
        opctx.check_for_interrupt()?;
        if self.tree.is_dropped() {
            return Err(Error::CursorInvalidated(format!(
                "index {} was dropped during yield",
                self.tree.name()
            )));
        }
        let saved = self
            .saved
            .take()
            .ok_or_else(|| Error::internal("restore without save"))?;
        let Some((key, rid)) = saved else {
            // Saved at EOF; EOF is final.
            self.current = None;
            return Ok(RestoreOutcome::Exhausted);
        };

        let landed = match self.direction {
            Direction::Forward => self.tree.seek_ge(&key, rid),
            Direction::Backward => self.tree.seek_le(&key, rid),
        };
        let exact = matches!(
            &landed,
            Some(e) if e.key == key && e.rid == rid && e.used
        );
        if exact {
            self.settle(landed)?;
            return Ok(RestoreOutcome::SamePosition);
        }
        self.settle(landed)?;
        if self.is_eof() {
            Ok(RestoreOutcome::Exhausted)
        } else {
            Ok(RestoreOutcome::NewPosition)
        }
    }

    fn initial_seek(&mut self, start_values: &[Value]) -> Result<()> {
        let landed = if start_values.is_empty() {
            match self.direction {
                Direction::Forward => self.tree.first(),
                Direction::Backward => self.tree.last(),
            }
        } else {
            let mut bytes = encode_seek_key(
                &self.descriptor.key_pattern,
                self.descriptor.collation,
                start_values,
            );
            match self.direction {
                Direction::Forward => self.tree.seek_ge(&bytes, RecordId::MIN),
                Direction::Backward => {
                    // Include every extension of a partial start prefix.
                    if start_values.len() < self.descriptor.key_pattern.len() {
                        bytes.push(0xff);
                    }
                    self.tree.seek_le(&bytes, RecordId::MAX)
                }
            }
        };
        self.settle(landed)
    }

    fn step_from(&self, key: &[u8], rid: RecordId) -> Option<Entry> {
        match self.direction {
            Direction::Forward => self.tree.next_after(key, rid),
            Direction::Backward => self.tree.prev_before(key, rid),
        }
    }

    /// From a landing entry, skip tombstones and out-of-bounds keys until a
    /// returnable entry or EOF, re-descending where the bounds iterator says
    /// a linear walk would crawl a gap.
    fn settle(&mut self, mut landed: Option<Entry>) -> Result<()> {
        let mut unused_run = 0u64;
        loop {
            let Some(entry) = landed else {
                self.note_unused_run(unused_run);
                self.current = None;
                return Ok(());
            };

            if !entry.used {
                unused_run += 1;
                self.stats.unused_skipped += 1;
                landed = self.step_from(&entry.key, entry.rid);
                continue;
            }
            self.note_unused_run(std::mem::take(&mut unused_run));

            let values = decode_key(&entry.key, &self.descriptor.key_pattern, &entry.type_bits)?;
            match &self.mode {
                Mode::Range { end } => {
                    if self.past_end(&entry.key, end) {
                        self.current = None;
                        return Ok(());
                    }
                    self.stats.keys_examined += 1;
                    self.current = Some(Current { entry, values });
                    return Ok(());
                }
                Mode::Bounds(checker) => match checker.check(&values) {
                    BoundsCheck::InBounds => {
                        self.stats.keys_examined += 1;
                        self.current = Some(Current { entry, values });
                        return Ok(());
                    }
                    BoundsCheck::Done => {
                        self.current = None;
                        return Ok(());
                    }
                    BoundsCheck::Advance(seek_point) => {
                        self.stats.seeks += 1;
                        let next = self.seek_to(&values, &seek_point);
                        // A re-descent that fails to move falls back to a
                        // linear step so the scan always progresses.
                        landed = match next {
                            Some(e) if e.key == entry.key && e.rid == entry.rid => {
                                self.step_from(&entry.key, entry.rid)
                            }
                            other => other,
                        };
                    }
                },
            }
        }
    }

    fn note_unused_run(&self, run: u64) {
        if run > UNUSED_SKIP_WARN_THRESHOLD {
            warn!(
                target: "rook::index",
                index = self.tree.name(),
                skipped = run,
                "long run of unused index entries skipped"
            );
        }
    }

    fn past_end(&self, key: &[u8], end: &Option<(Vec<u8>, bool)>) -> bool {
        let Some((end_key, inclusive)) = end else {
            return false;
        };
        let cmp = key.cmp(end_key);
        match self.direction {
            Direction::Forward => {
                cmp == std::cmp::Ordering::Greater
                    || (cmp == std::cmp::Ordering::Equal && !inclusive)
            }
            Direction::Backward => {
                cmp == std::cmp::Ordering::Less
                    || (cmp == std::cmp::Ordering::Equal && !inclusive)
            }
        }
    }

    /// Re-descend the tree per a bounds-iterator seek point.
    fn seek_to(&self, current_values: &[Value], seek_point: &SeekPoint) -> Option<Entry> {
        let pattern = &self.descriptor.key_pattern;
        let collation = self.descriptor.collation;
        let mut vals: Vec<Value> = current_values[..seek_point.keep_prefix].to_vec();

        if seek_point.after_prefix {
            let mut bytes = encode_seek_key(pattern, collation, &vals);
            return match self.direction {
                Direction::Forward => {
                    bytes.push(0xff);
                    self.tree.seek_ge(&bytes, RecordId::MIN)
                }
                Direction::Backward => self.tree.seek_le(&bytes, RecordId::MIN),
            };
        }

        let mut exclusive = false;
        for (value, inclusive) in &seek_point.target {
            vals.push(value.clone());
            if !inclusive {
                exclusive = true;
                break;
            }
        }
        let mut bytes = encode_seek_key(pattern, collation, &vals);
        match self.direction {
            Direction::Forward => {
                if exclusive {
                    bytes.push(0xff);
                }
                self.tree.seek_ge(&bytes, RecordId::MIN)
            }
            Direction::Backward => {
                if !exclusive {
                    bytes.push(0xff);
                    self.tree.seek_le(&bytes, RecordId::MAX)
                } else {
                    self.tree.seek_le(&bytes, RecordId::MIN)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::{FieldIntervals, IndexBounds, Interval};
    use crate::codec::encode_keys;
    use crate::descriptor::KeyPattern;
    use rook_core::doc;
    use rook_storage::UnitOfWork;

    fn index_with_ints(values: &[i32]) -> (Arc<BucketTree>, Arc<IndexDescriptor>) {
        let descriptor = Arc::new(IndexDescriptor::new(
            "a_1",
            KeyPattern::parse(&doc! { "a": 1 }).unwrap(),
        ));
        let tree = BucketTree::new("a_1");
        let mut uow = UnitOfWork::new();
        for (i, v) in values.iter().enumerate() {
            let ks = encode_keys(&descriptor, &doc! { "a": (*v) }).unwrap();
            for k in ks.keys {
                tree.insert(&mut uow, &k.bytes, &k.type_bits, RecordId(i as i64 + 1), false)
                    .unwrap();
            }
        }
        uow.commit();
        (tree, descriptor)
    }

    fn collect_ints(cursor: &mut BtreeCursor, opctx: &OperationContext) -> Vec<i32> {
        let mut out = Vec::new();
        while !cursor.is_eof() {
            match cursor.current_key()[0] {
                Value::Int32(v) => out.push(v),
                ref other => panic!("unexpected key {:?}", other),
            }
            cursor.advance(opctx).unwrap();
        }
        out
    }

    #[test]
    fn range_scan_forward_inclusive() {
        let (tree, desc) = index_with_ints(&[1, 3, 5, 7, 9]);
        let opctx = OperationContext::new();
        let mut cursor = BtreeCursor::open_range(
            tree,
            desc,
            &[Value::Int32(3)],
            &[Value::Int32(7)],
            true,
            Direction::Forward,
            &opctx,
        )
        .unwrap();
        assert_eq!(collect_ints(&mut cursor, &opctx), vec![3, 5, 7]);
        assert_eq!(cursor.stats().keys_examined, 3);
    }

    #[test]
    fn range_scan_exclusive_end() {
        let (tree, desc) = index_with_ints(&[1, 3, 5, 7]);
        let opctx = OperationContext::new();
        let mut cursor = BtreeCursor::open_range(
            tree,
            desc,
            &[Value::Int32(1)],
            &[Value::Int32(7)],
            false,
            Direction::Forward,
            &opctx,
        )
        .unwrap();
        assert_eq!(collect_ints(&mut cursor, &opctx), vec![1, 3, 5]);
    }

    #[test]
    fn point_scan_returns_exact_matches_only() {
        let (tree, desc) = index_with_ints(&[1, 5, 5, 5, 9]);
        let opctx = OperationContext::new();
        let mut cursor = BtreeCursor::open_range(
            tree,
            desc,
            &[Value::Int32(5)],
            &[Value::Int32(5)],
            true,
            Direction::Forward,
            &opctx,
        )
        .unwrap();
        assert_eq!(collect_ints(&mut cursor, &opctx), vec![5, 5, 5]);
    }

    #[test]
    fn descending_scan_from_max_key() {
        let (tree, desc) = index_with_ints(&[2, 4, 6]);
        let opctx = OperationContext::new();
        let mut cursor = BtreeCursor::open_range(
            tree,
            desc,
            &[Value::MaxKey],
            &[],
            true,
            Direction::Backward,
            &opctx,
        )
        .unwrap();
        assert_eq!(collect_ints(&mut cursor, &opctx), vec![6, 4, 2]);
    }

    #[test]
    fn empty_index_is_immediate_eof() {
        let (tree, desc) = index_with_ints(&[]);
        let opctx = OperationContext::new();
        let cursor = BtreeCursor::open_range(
            tree,
            desc,
            &[],
            &[],
            true,
            Direction::Forward,
            &opctx,
        )
        .unwrap();
        assert!(cursor.is_eof());
    }

    #[test]
    fn cursor_skips_tombstones_without_counting_them() {
        let (tree, desc) = index_with_ints(&[1, 2, 3, 4, 5]);
        // Tombstone 2..=4.
        {
            let mut uow = UnitOfWork::new();
            for v in 2..=4 {
                let ks = encode_keys(&desc, &doc! { "a": v }).unwrap();
                tree.remove(&mut uow, &ks.keys[0].bytes, RecordId(v as i64))
                    .unwrap();
            }
            uow.commit();
        }
        let opctx = OperationContext::new();
        let mut cursor = BtreeCursor::open_range(
            tree,
            desc,
            &[],
            &[],
            true,
            Direction::Forward,
            &opctx,
        )
        .unwrap();
        assert_eq!(collect_ints(&mut cursor, &opctx), vec![1, 5]);
        assert_eq!(cursor.stats().keys_examined, 2);
        assert_eq!(cursor.stats().unused_skipped, 3);
    }

    #[test]
    fn save_restore_same_position() {
        let (tree, desc) = index_with_ints(&[1, 2, 3]);
        let opctx = OperationContext::new();
        let mut cursor = BtreeCursor::open_range(
            tree,
            desc,
            &[],
            &[],
            true,
            Direction::Forward,
            &opctx,
        )
        .unwrap();
        assert_eq!(cursor.current_key()[0], Value::Int32(1));
        cursor.save_state();
        assert_eq!(
            cursor.restore_state(&opctx).unwrap(),
            RestoreOutcome::SamePosition
        );
        cursor.advance(&opctx).unwrap();
        assert_eq!(cursor.current_key()[0], Value::Int32(2));
    }

    #[test]
    fn save_restore_across_delete_of_current() {
        let (tree, desc) = index_with_ints(&[10, 20, 30, 40]);
        let opctx = OperationContext::new();
        let mut cursor = BtreeCursor::open_range(
            tree.clone(),
            desc.clone(),
            &[],
            &[],
            true,
            Direction::Forward,
            &opctx,
        )
        .unwrap();
        cursor.advance(&opctx).unwrap(); // now at 20
        cursor.save_state();

        // Concurrent session deletes the entry under the cursor.
        {
            let mut uow = UnitOfWork::new();
            let ks = encode_keys(&desc, &doc! { "a": 20 }).unwrap();
            tree.remove(&mut uow, &ks.keys[0].bytes, RecordId(2)).unwrap();
            uow.commit();
        }

        // The saved entry survives as a tombstone: restore moves past it.
        assert_eq!(
            cursor.restore_state(&opctx).unwrap(),
            RestoreOutcome::NewPosition
        );
        assert_eq!(cursor.current_key()[0], Value::Int32(30));
        // No duplicate, no skip.
        assert_eq!(collect_ints(&mut cursor, &opctx), vec![30, 40]);
    }

    #[test]
    fn restore_after_index_drop_is_invalidated() {
        let (tree, desc) = index_with_ints(&[1]);
        let opctx = OperationContext::new();
        let mut cursor = BtreeCursor::open_range(
            tree.clone(),
            desc,
            &[],
            &[],
            true,
            Direction::Forward,
            &opctx,
        )
        .unwrap();
        cursor.save_state();
        tree.mark_dropped();
        assert!(matches!(
            cursor.restore_state(&opctx),
            Err(Error::CursorInvalidated(_))
        ));
    }

    #[test]
    fn interrupt_surfaces_on_advance() {
        let (tree, desc) = index_with_ints(&[1, 2]);
        let opctx = OperationContext::new();
        let mut cursor = BtreeCursor::open_range(
            tree,
            desc,
            &[],
            &[],
            true,
            Direction::Forward,
            &opctx,
        )
        .unwrap();
        opctx.kill();
        assert!(matches!(cursor.advance(&opctx), Err(Error::Interrupted)));
    }

    #[test]
    fn bounds_driven_scan_re_descends_over_gaps() {
        let values: Vec<i32> = (0..1000).collect();
        let (tree, desc) = index_with_ints(&values);
        let opctx = OperationContext::new();
        let bounds = IndexBounds {
            fields: vec![FieldIntervals {
                intervals: vec![
                    Interval {
                        low: Value::Int32(10),
                        low_inclusive: true,
                        high: Value::Int32(12),
                        high_inclusive: true,
                    },
                    Interval {
                        low: Value::Int32(990),
                        low_inclusive: false,
                        high: Value::Int32(995),
                        high_inclusive: true,
                    },
                ],
            }],
        };
        let checker = BoundsChecker::new(bounds, Direction::Forward);
        let mut cursor =
            BtreeCursor::open_with_bounds(tree, desc, checker, &opctx).unwrap();
        assert_eq!(
            collect_ints(&mut cursor, &opctx),
            vec![10, 11, 12, 991, 992, 993, 994, 995]
        );
        // The gap was jumped, not walked.
        assert!(cursor.stats().seeks >= 1);
        assert!(cursor.stats().keys_examined <= 10);
    }

    #[test]
    fn compound_bounds_backtrack_over_exhausted_suffix() {
        let descriptor = Arc::new(IndexDescriptor::new(
            "ab_1",
            KeyPattern::parse(&doc! { "a": 1, "b": 1 }).unwrap(),
        ));
        let tree = BucketTree::new("ab_1");
        let mut uow = UnitOfWork::new();
        let mut rid = 1i64;
        for a in [1, 2, 3] {
            for b in [1, 5, 10] {
                let ks = encode_keys(&descriptor, &doc! { "a": a, "b": b }).unwrap();
                tree.insert(&mut uow, &ks.keys[0].bytes, &ks.keys[0].type_bits, RecordId(rid), false)
                    .unwrap();
                rid += 1;
            }
        }
        uow.commit();

        // a in {1, 3}, b <= 5.
        let bounds = IndexBounds {
            fields: vec![
                FieldIntervals {
                    intervals: vec![
                        Interval::point(Value::Int32(1)),
                        Interval::point(Value::Int32(3)),
                    ],
                },
                FieldIntervals::single(Interval {
                    low: Value::MinKey,
                    low_inclusive: true,
                    high: Value::Int32(5),
                    high_inclusive: true,
                }),
            ],
        };
        let opctx = OperationContext::new();
        let checker = BoundsChecker::new(bounds, Direction::Forward);
        let mut cursor =
            BtreeCursor::open_with_bounds(tree, descriptor, checker, &opctx).unwrap();
        let mut seen = Vec::new();
        while !cursor.is_eof() {
            let k = cursor.current_key();
            seen.push((k[0].clone(), k[1].clone()));
            cursor.advance(&opctx).unwrap();
        }
        assert_eq!(
            seen,
            vec![
                (Value::Int32(1), Value::Int32(1)),
                (Value::Int32(1), Value::Int32(5)),
                (Value::Int32(3), Value::Int32(1)),
                (Value::Int32(3), Value::Int32(5)),
            ]
        );
    }
}
