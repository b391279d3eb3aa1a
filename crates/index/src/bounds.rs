//! Index bounds
//!
//! An [`IndexBounds`] is the per-field interval vector a predicate compiles
//! to: for each key-pattern field, a sorted list of disjoint intervals. The
//! [`BoundsChecker`] drives a cursor through the bounds: given the current
//! key it either accepts it, declares the scan exhausted, or hands back a
//! [`SeekPoint`] telling the cursor to re-descend instead of walking
//! linearly through a gap.

use rook_core::{cmp_values, Value};
use rook_storage::Direction;
use std::cmp::Ordering;
use std::fmt;

/// One closed/open/half-open interval over values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    /// Lower endpoint.
    pub low: Value,
    /// Whether `low` itself is inside.
    pub low_inclusive: bool,
    /// Upper endpoint.
    pub high: Value,
    /// Whether `high` itself is inside.
    pub high_inclusive: bool,
}

impl Interval {
    /// The single-value interval `[v, v]`.
    pub fn point(v: Value) -> Self {
        Self {
            low: v.clone(),
            low_inclusive: true,
            high: v,
            high_inclusive: true,
        }
    }

    /// The all-values interval `[MinKey, MaxKey]`.
    pub fn full() -> Self {
        Self {
            low: Value::MinKey,
            low_inclusive: true,
            high: Value::MaxKey,
            high_inclusive: true,
        }
    }

    /// True for `[v, v]`.
    pub fn is_point(&self) -> bool {
        self.low_inclusive
            && self.high_inclusive
            && cmp_values(&self.low, &self.high) == Ordering::Equal
    }

    /// True for the all-values interval.
    pub fn is_full(&self) -> bool {
        matches!(self.low, Value::MinKey)
            && matches!(self.high, Value::MaxKey)
            && self.low_inclusive
            && self.high_inclusive
    }

    /// Is `v` inside this interval?
    pub fn contains(&self, v: &Value) -> bool {
        let lo = cmp_values(v, &self.low);
        let hi = cmp_values(v, &self.high);
        let above_low = lo == Ordering::Greater || (lo == Ordering::Equal && self.low_inclusive);
        let below_high = hi == Ordering::Less || (hi == Ordering::Equal && self.high_inclusive);
        above_low && below_high
    }

    /// Is `v` below this interval's interior?
    fn is_before(&self, v: &Value) -> bool {
        match cmp_values(v, &self.low) {
            Ordering::Less => true,
            Ordering::Equal => !self.low_inclusive,
            Ordering::Greater => false,
        }
    }

    /// Is `v` above this interval's interior?
    fn is_past(&self, v: &Value) -> bool {
        match cmp_values(v, &self.high) {
            Ordering::Greater => true,
            Ordering::Equal => !self.high_inclusive,
            Ordering::Less => false,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}, {}{}",
            if self.low_inclusive { "[" } else { "(" },
            self.low,
            self.high,
            if self.high_inclusive { "]" } else { ")" },
        )
    }
}

/// The ordered, disjoint interval list of one key field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIntervals {
    /// Intervals in ascending order.
    pub intervals: Vec<Interval>,
}

impl FieldIntervals {
    /// All-values field.
    pub fn full() -> Self {
        Self {
            intervals: vec![Interval::full()],
        }
    }

    /// Single-interval field.
    pub fn single(interval: Interval) -> Self {
        Self {
            intervals: vec![interval],
        }
    }

    /// One point interval only.
    pub fn is_single_point(&self) -> bool {
        self.intervals.len() == 1 && self.intervals[0].is_point()
    }

    /// Every interval is a point.
    pub fn is_all_points(&self) -> bool {
        !self.intervals.is_empty() && self.intervals.iter().all(Interval::is_point)
    }

    /// The all-values field.
    pub fn is_full(&self) -> bool {
        self.intervals.len() == 1 && self.intervals[0].is_full()
    }
}

/// Per-field interval vector for one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBounds {
    /// One entry per key-pattern field, in key order.
    pub fields: Vec<FieldIntervals>,
}

impl IndexBounds {
    /// Unconstrained bounds over `n` fields.
    pub fn full(n: usize) -> Self {
        Self {
            fields: (0..n).map(|_| FieldIntervals::full()).collect(),
        }
    }

    /// Number of key fields.
    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// The tuple the scan starts from, by direction.
    pub fn start_values(&self, direction: Direction) -> Vec<Value> {
        self.fields
            .iter()
            .map(|f| match direction {
                Direction::Forward => f.intervals.first().map(|i| i.low.clone()),
                Direction::Backward => f.intervals.last().map(|i| i.high.clone()),
            })
            .map(|v| v.unwrap_or(Value::MinKey))
            .collect()
    }

    /// Packed score for plan ranking: longer single-point prefix beats
    /// longer all-points prefix beats more bounded fields beats shorter key.
    pub fn packed_score(&self) -> u64 {
        let mut single_point_prefix = 0u64;
        let mut points_prefix = 0u64;
        let mut bounded = 0u64;
        let mut still_single = true;
        let mut still_points = true;
        for f in &self.fields {
            if f.is_full() {
                break;
            }
            if still_single && f.is_single_point() {
                single_point_prefix += 1;
            } else {
                still_single = false;
            }
            if still_points && f.is_all_points() {
                points_prefix += 1;
            } else {
                still_points = false;
            }
            bounded += 1;
        }
        (single_point_prefix << 48)
            | (points_prefix << 32)
            | (bounded << 16)
            | (u16::MAX as u64 - self.fields.len() as u64)
    }
}

/// Verdict of the checker for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundsCheck {
    /// Key is inside the bounds; emit it.
    InBounds,
    /// No further key can be inside; the scan is exhausted.
    Done,
    /// Key is in a gap: re-descend per the seek point.
    Advance(SeekPoint),
}

/// Where to re-descend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeekPoint {
    /// Leading fields of the current key to keep.
    pub keep_prefix: usize,
    /// Values (and inclusivity) for the fields after the kept prefix.
    pub target: Vec<(Value, bool)>,
    /// Seek strictly past every key sharing the kept prefix instead of to a
    /// target tuple.
    pub after_prefix: bool,
}

/// Drives a cursor through an interval vector.
#[derive(Debug, Clone)]
pub struct BoundsChecker {
    bounds: IndexBounds,
    direction: Direction,
}

impl BoundsChecker {
    /// Create a checker for a scan in `direction`.
    pub fn new(bounds: IndexBounds, direction: Direction) -> Self {
        Self { bounds, direction }
    }

    /// The bounds being scanned.
    pub fn bounds(&self) -> &IndexBounds {
        &self.bounds
    }

    /// Scan direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Classify the current key tuple.
    pub fn check(&self, key: &[Value]) -> BoundsCheck {
        debug_assert_eq!(key.len(), self.bounds.num_fields());
        for (i, v) in key.iter().enumerate() {
            let field = &self.bounds.fields[i];
            match self.position(field, v) {
                FieldPos::In => continue,
                FieldPos::Before(idx) => {
                    let mut target = Vec::new();
                    for j in i..self.bounds.num_fields() {
                        let (value, inclusive) = if j == i {
                            self.entry_edge(&field.intervals[idx])
                        } else {
                            let ivals = &self.bounds.fields[j].intervals;
                            match self.direction {
                                Direction::Forward => {
                                    let first = &ivals[0];
                                    (first.low.clone(), first.low_inclusive)
                                }
                                Direction::Backward => {
                                    let last = &ivals[ivals.len() - 1];
                                    (last.high.clone(), last.high_inclusive)
                                }
                            }
                        };
                        target.push((value, inclusive));
                    }
                    return BoundsCheck::Advance(SeekPoint {
                        keep_prefix: i,
                        target,
                        after_prefix: false,
                    });
                }
                FieldPos::PastAll => {
                    if i == 0 {
                        return BoundsCheck::Done;
                    }
                    return BoundsCheck::Advance(SeekPoint {
                        keep_prefix: i,
                        target: Vec::new(),
                        after_prefix: true,
                    });
                }
            }
        }
        BoundsCheck::InBounds
    }

    /// Entry edge of an interval in scan direction.
    fn entry_edge(&self, interval: &Interval) -> (Value, bool) {
        match self.direction {
            Direction::Forward => (interval.low.clone(), interval.low_inclusive),
            Direction::Backward => (interval.high.clone(), interval.high_inclusive),
        }
    }

    fn position(&self, field: &FieldIntervals, v: &Value) -> FieldPos {
        match self.direction {
            Direction::Forward => {
                for (idx, ival) in field.intervals.iter().enumerate() {
                    if ival.contains(v) {
                        return FieldPos::In;
                    }
                    if ival.is_before(v) {
                        return FieldPos::Before(idx);
                    }
                }
                FieldPos::PastAll
            }
            Direction::Backward => {
                for (idx, ival) in field.intervals.iter().enumerate().rev() {
                    if ival.contains(v) {
                        return FieldPos::In;
                    }
                    if ival.is_past(v) {
                        return FieldPos::Before(idx);
                    }
                }
                FieldPos::PastAll
            }
        }
    }
}

enum FieldPos {
    /// Inside some interval.
    In,
    /// In the gap ahead of interval `idx` (scan-direction-wise).
    Before(usize),
    /// Beyond every interval of the field.
    PastAll,
}
