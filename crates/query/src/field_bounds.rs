//! Predicate-to-ranges compiler
//!
//! Factors a predicate into per-field [`FieldBound`]s: for each constrained
//! path, the tightest `[lower, upper]` bracket all its constraints allow.
//! Multiple constraints on one field intersect (greater lower bound, lesser
//! upper bound, inclusivity ANDed on ties). One-sided bounds are closed to
//! the type bracket of the bounded side so an index scan never crosses into
//! other type regions.
//!
//! The derived [`QueryPattern`] is the shape fingerprint the plan cache
//! keys on, and [`FieldBoundSet::simplified_query`] rebuilds a canonical
//! predicate document such that compiling it again reproduces the same
//! bounds (a fixed point).

use crate::predicate::{ComparisonOp, Predicate};
use rook_core::{cmp_values, Document, TypeRank, Value};
use rook_index::{FieldIntervals, IndexBounds, Interval, KeyPattern};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// The range of one field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldBound {
    /// Lower endpoint.
    pub lower: Value,
    /// Whether `lower` is inside.
    pub lower_inclusive: bool,
    /// Upper endpoint.
    pub upper: Value,
    /// Whether `upper` is inside.
    pub upper_inclusive: bool,
}

impl Default for FieldBound {
    fn default() -> Self {
        Self::trivial()
    }
}

impl FieldBound {
    /// The unconstrained bound.
    pub fn trivial() -> Self {
        Self {
            lower: Value::MinKey,
            lower_inclusive: true,
            upper: Value::MaxKey,
            upper_inclusive: true,
        }
    }

    /// Bound for a single leaf constraint; `None` when the constraint
    /// cannot tighten a range (`$ne`, `$exists`, non-prefix regex).
    fn from_leaf(pred: &Predicate) -> Option<FieldBound> {
        let mut bound = match pred {
            Predicate::Comparison { op, value, .. } => {
                let mut b = FieldBound::trivial();
                match op {
                    ComparisonOp::Eq => {
                        b.lower = value.clone();
                        b.upper = value.clone();
                    }
                    ComparisonOp::Lt => {
                        b.upper = value.clone();
                        b.upper_inclusive = false;
                    }
                    ComparisonOp::Lte => b.upper = value.clone(),
                    ComparisonOp::Gt => {
                        b.lower = value.clone();
                        b.lower_inclusive = false;
                    }
                    ComparisonOp::Gte => b.lower = value.clone(),
                    ComparisonOp::Ne => return None,
                }
                b
            }
            Predicate::In { values, .. } => {
                if values.is_empty() {
                    // Empty $in matches nothing.
                    return Some(FieldBound {
                        lower: Value::MaxKey,
                        lower_inclusive: false,
                        upper: Value::MinKey,
                        upper_inclusive: false,
                    });
                }
                let mut min = &values[0];
                let mut max = &values[0];
                for v in values {
                    if cmp_values(v, min) == Ordering::Less {
                        min = v;
                    }
                    if cmp_values(v, max) == Ordering::Greater {
                        max = v;
                    }
                }
                FieldBound {
                    lower: min.clone(),
                    lower_inclusive: true,
                    upper: max.clone(),
                    upper_inclusive: true,
                }
            }
            Predicate::All { values, .. } => {
                let first = values.first()?;
                FieldBound {
                    lower: first.clone(),
                    lower_inclusive: true,
                    upper: first.clone(),
                    upper_inclusive: true,
                }
            }
            Predicate::Regex {
                pattern, options, ..
            } => {
                let prefix = simple_regex_prefix(pattern, options)?;
                FieldBound {
                    lower: Value::String(prefix.clone()),
                    lower_inclusive: true,
                    upper: Value::String(increment_prefix(&prefix)),
                    upper_inclusive: false,
                }
            }
            _ => return None,
        };
        bound.close_type_bracket();
        Some(bound)
    }

    /// Tighten a one-sided bound to the type bracket of the bounded side.
    fn close_type_bracket(&mut self) {
        let lower_open = matches!(self.lower, Value::MinKey);
        let upper_open = matches!(self.upper, Value::MaxKey);
        if !lower_open && upper_open {
            let (v, inclusive) = type_bracket_end(&self.lower);
            self.upper = v;
            self.upper_inclusive = inclusive;
        } else if lower_open && !upper_open {
            let (v, inclusive) = type_bracket_start(&self.upper);
            self.lower = v;
            self.lower_inclusive = inclusive;
        }
    }

    /// Intersect with another bound: greater lower, lesser upper,
    /// inclusivity ANDed on equal endpoints.
    pub fn intersect(&mut self, other: &FieldBound) {
        match cmp_values(&other.upper, &self.upper) {
            Ordering::Equal => self.upper_inclusive &= other.upper_inclusive,
            Ordering::Less => {
                self.upper = other.upper.clone();
                self.upper_inclusive = other.upper_inclusive;
            }
            Ordering::Greater => {}
        }
        match cmp_values(&other.lower, &self.lower) {
            Ordering::Equal => self.lower_inclusive &= other.lower_inclusive,
            Ordering::Greater => {
                self.lower = other.lower.clone();
                self.lower_inclusive = other.lower_inclusive;
            }
            Ordering::Less => {}
        }
    }

    /// Single-value bound.
    pub fn is_equality(&self) -> bool {
        self.lower_inclusive
            && self.upper_inclusive
            && cmp_values(&self.lower, &self.upper) == Ordering::Equal
    }

    /// Anything tighter than the trivial bound.
    pub fn is_nontrivial(&self) -> bool {
        !matches!(self.lower, Value::MinKey) || !matches!(self.upper, Value::MaxKey)
    }

    /// No value can satisfy the bound.
    pub fn is_empty(&self) -> bool {
        match cmp_values(&self.lower, &self.upper) {
            Ordering::Greater => true,
            Ordering::Equal => !(self.lower_inclusive && self.upper_inclusive),
            Ordering::Less => false,
        }
    }

    /// The bound as a cursor interval.
    pub fn to_interval(&self) -> Interval {
        Interval {
            low: self.lower.clone(),
            low_inclusive: self.lower_inclusive,
            high: self.upper.clone(),
            high_inclusive: self.upper_inclusive,
        }
    }
}

impl fmt::Display for FieldBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}, {}{}",
            if self.lower_inclusive { "[" } else { "(" },
            self.lower,
            self.upper,
            if self.upper_inclusive { "]" } else { ")" },
        )
    }
}

fn type_bracket_end(v: &Value) -> (Value, bool) {
    match v.type_rank() {
        TypeRank::Numeric => (Value::Double(f64::INFINITY), true),
        // Strings end where documents begin.
        TypeRank::String => (Value::Document(Document::new()), false),
        _ => (Value::MaxKey, true),
    }
}

fn type_bracket_start(v: &Value) -> (Value, bool) {
    match v.type_rank() {
        TypeRank::Numeric => (Value::Double(f64::NEG_INFINITY), true),
        TypeRank::String => (Value::String(String::new()), true),
        _ => (Value::MinKey, true),
    }
}

/// Literal anchored prefix of a regex, if the pattern has one usable for a
/// range scan. Case-insensitive patterns never do.
pub fn simple_regex_prefix(pattern: &str, options: &str) -> Option<String> {
    if options.contains('i') {
        return None;
    }
    let rest = pattern.strip_prefix('^')?;
    let mut prefix = String::new();
    for c in rest.chars() {
        if ".*+?()[]{}|\\$".contains(c) {
            break;
        }
        prefix.push(c);
    }
    if prefix.is_empty() {
        None
    } else {
        Some(prefix)
    }
}

/// The least string strictly above every string starting with `prefix`:
/// increment the last byte, dropping trailing 0xff bytes first.
pub fn increment_prefix(prefix: &str) -> String {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(&last) = bytes.last() {
        if last == 0xff {
            bytes.pop();
        } else {
            *bytes.last_mut().expect("non-empty") += 1;
            break;
        }
    }
    // Incrementing the last byte of valid UTF-8 may leave the tail invalid;
    // fall back to lossy, ordering is what matters.
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Shape of one field's bound, for the cache fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoundKind {
    /// `lower == upper`, both inclusive.
    Equality,
    /// Only the lower side constrains.
    LowerBound,
    /// Only the upper side constrains.
    UpperBound,
    /// Both sides constrain.
    UpperAndLowerBound,
    /// Constrained in a way the bracket does not capture.
    Nontrivial,
}

/// Predicate-shape fingerprint: per-field bound kinds plus the sort and
/// projection shapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryPattern {
    /// `(path, kind)` pairs in path order.
    pub fields: Vec<(String, BoundKind)>,
    /// Canonical rendering of the sort specification.
    pub sort_shape: String,
    /// Canonical rendering of the projection specification.
    pub projection_shape: String,
}

/// The per-field bounds of one (conjunctive) predicate.
#[derive(Debug, Clone, Default)]
pub struct FieldBoundSet {
    bounds: BTreeMap<String, FieldBound>,
}

impl FieldBoundSet {
    /// Compile a predicate.
    ///
    /// With `intersect` false (used when the chosen index is multikey,
    /// where element-wise constraints must not be combined), the first
    /// constraint per path wins instead of intersecting.
    pub fn build(predicate: &Predicate, intersect: bool) -> FieldBoundSet {
        let mut set = FieldBoundSet::default();
        set.fold(predicate, intersect);
        set
    }

    fn fold(&mut self, predicate: &Predicate, intersect: bool) {
        match predicate {
            Predicate::And(subs) => {
                for s in subs {
                    self.fold(s, intersect);
                }
            }
            // Disjunctions contribute nothing to a conjunctive bracket.
            Predicate::Or(_) | Predicate::AlwaysTrue => {}
            leaf => {
                let path = match leaf {
                    Predicate::Comparison { path, .. }
                    | Predicate::In { path, .. }
                    | Predicate::All { path, .. }
                    | Predicate::Regex { path, .. }
                    | Predicate::Exists { path, .. } => path.clone(),
                    _ => return,
                };
                let Some(bound) = FieldBound::from_leaf(leaf) else {
                    return;
                };
                match self.bounds.entry(path) {
                    std::collections::btree_map::Entry::Vacant(e) => {
                        e.insert(bound);
                    }
                    std::collections::btree_map::Entry::Occupied(mut e) => {
                        if intersect {
                            e.get_mut().intersect(&bound);
                        }
                    }
                }
            }
        }
    }

    /// The bound for `path`, trivial when unconstrained.
    pub fn get(&self, path: &str) -> FieldBound {
        self.bounds.get(path).cloned().unwrap_or_default()
    }

    /// Constrained paths in order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.bounds.keys().map(|s| s.as_str())
    }

    /// Number of constrained paths.
    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    /// True when nothing is constrained.
    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    /// True when some field's bound is unsatisfiable.
    pub fn has_empty_bound(&self) -> bool {
        self.bounds.values().any(FieldBound::is_empty)
    }

    /// The shape fingerprint over these bounds.
    pub fn pattern(&self, sort_shape: &str, projection_shape: &str) -> QueryPattern {
        let fields = self
            .bounds
            .iter()
            .filter_map(|(path, b)| {
                let kind = if b.is_equality() {
                    BoundKind::Equality
                } else if b.is_nontrivial() {
                    let lower = !matches!(b.lower, Value::MinKey);
                    let upper = !matches!(b.upper, Value::MaxKey);
                    match (lower, upper) {
                        (true, true) => BoundKind::UpperAndLowerBound,
                        (true, false) => BoundKind::LowerBound,
                        (false, true) => BoundKind::UpperBound,
                        (false, false) => return None,
                    }
                } else {
                    return None;
                };
                Some((path.clone(), kind))
            })
            .collect();
        QueryPattern {
            fields,
            sort_shape: sort_shape.to_string(),
            projection_shape: projection_shape.to_string(),
        }
    }

    /// Rebuild a canonical predicate document from the bounds.
    ///
    /// With an empty `fields` list every constrained path is emitted.
    /// Compiling the result reproduces these bounds.
    pub fn simplified_query(&self, fields: &[String]) -> Document {
        let names: Vec<String> = if fields.is_empty() {
            self.bounds.keys().cloned().collect()
        } else {
            fields.to_vec()
        };
        let mut out = Document::new();
        for name in names {
            let bound = self.get(&name);
            if bound.is_equality() {
                out.push(name, bound.lower.clone());
            } else if bound.is_nontrivial() {
                let mut ops = Document::new();
                if !matches!(bound.lower, Value::MinKey) {
                    ops.push(
                        if bound.lower_inclusive { "$gte" } else { "$gt" },
                        bound.lower.clone(),
                    );
                }
                if !matches!(bound.upper, Value::MaxKey) {
                    ops.push(
                        if bound.upper_inclusive { "$lte" } else { "$lt" },
                        bound.upper.clone(),
                    );
                }
                out.push(name, Value::Document(ops));
            }
        }
        out
    }

    /// Bind the bounds onto an index's key pattern, producing the interval
    /// vector its cursor scans. Unconstrained fields scan everything.
    pub fn index_bounds(&self, key_pattern: &KeyPattern) -> IndexBounds {
        IndexBounds {
            fields: key_pattern
                .fields()
                .iter()
                .map(|f| {
                    let bound = self.get(&f.path);
                    if bound.is_nontrivial() {
                        FieldIntervals::single(bound.to_interval())
                    } else {
                        FieldIntervals::full()
                    }
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rook_core::doc;

    fn bounds_of(query: &Document) -> FieldBoundSet {
        FieldBoundSet::build(&Predicate::parse(query).unwrap(), true)
    }

    #[test]
    fn equality_collapses_bound() {
        let set = bounds_of(&doc! { "a": 5 });
        let b = set.get("a");
        assert!(b.is_equality());
        assert_eq!(b.lower, Value::Int32(5));
    }

    #[test]
    fn range_ops_set_sides_and_close_type_bracket() {
        let set = bounds_of(&doc! { "a": { "$gte": 5 } });
        let b = set.get("a");
        assert_eq!(b.lower, Value::Int32(5));
        assert!(b.lower_inclusive);
        // Upper closed to the numeric bracket, not MaxKey.
        assert_eq!(b.upper, Value::Double(f64::INFINITY));

        let set = bounds_of(&doc! { "s": { "$lt": "m" } });
        let b = set.get("s");
        assert_eq!(b.lower, Value::String(String::new()));
        assert_eq!(b.upper, Value::String("m".into()));
        assert!(!b.upper_inclusive);
    }

    #[test]
    fn overlapping_constraints_intersect() {
        let set = bounds_of(&doc! { "a": { "$gte": 5, "$lt": 10, "$gt": 5 } });
        let b = set.get("a");
        assert_eq!(b.lower, Value::Int32(5));
        // $gte 5 ∧ $gt 5 → exclusive wins on the tie.
        assert!(!b.lower_inclusive);
        assert_eq!(b.upper, Value::Int32(10));
        assert!(!b.upper_inclusive);
    }

    #[test]
    fn contradictory_constraints_produce_empty_bound() {
        let set = bounds_of(&doc! { "a": { "$gt": 10, "$lt": 5 } });
        assert!(set.get("a").is_empty());
        assert!(set.has_empty_bound());
    }

    #[test]
    fn in_brackets_to_min_max() {
        let set = bounds_of(&doc! { "a": { "$in": [7, 2, 9] } });
        let b = set.get("a");
        assert_eq!(b.lower, Value::Int32(2));
        assert_eq!(b.upper, Value::Int32(9));
        assert!(b.lower_inclusive && b.upper_inclusive);
    }

    #[test]
    fn all_takes_first_element_as_equality() {
        let set = bounds_of(&doc! { "a": { "$all": [4, 8] } });
        let b = set.get("a");
        assert!(b.is_equality());
        assert_eq!(b.lower, Value::Int32(4));
    }

    #[test]
    fn regex_prefix_becomes_half_open_range() {
        let set = bounds_of(&doc! { "s": { "$regex": "^abc" } });
        let b = set.get("s");
        assert_eq!(b.lower, Value::String("abc".into()));
        assert_eq!(b.upper, Value::String("abd".into()));
        assert!(!b.upper_inclusive);

        // Unanchored or case-insensitive regexes stay trivial.
        assert!(!bounds_of(&doc! { "s": { "$regex": "abc" } }).get("s").is_nontrivial());
        let set = bounds_of(&doc! { "s": { "$regex": "^abc", "$options": "i" } });
        assert!(!set.get("s").is_nontrivial());
    }

    #[test]
    fn regex_prefix_stops_at_metachar() {
        assert_eq!(simple_regex_prefix("^foo.*", ""), Some("foo".into()));
        assert_eq!(simple_regex_prefix("^", ""), None);
        assert_eq!(simple_regex_prefix("foo", ""), None);
    }

    #[test]
    fn ne_and_exists_stay_residual() {
        let set = bounds_of(&doc! { "a": { "$ne": 5 }, "b": { "$exists": true } });
        assert!(!set.get("a").is_nontrivial());
        assert!(!set.get("b").is_nontrivial());
    }

    #[test]
    fn multikey_mode_keeps_first_constraint_only() {
        let pred = Predicate::parse(&doc! { "a": { "$gt": 5, "$lt": 3 } }).unwrap();
        let set = FieldBoundSet::build(&pred, false);
        let b = set.get("a");
        // No intersection: the first constraint stands alone, satisfiable.
        assert!(!b.is_empty());
        assert_eq!(b.lower, Value::Int32(5));
        assert_eq!(b.upper, Value::Double(f64::INFINITY));
    }

    #[test]
    fn query_pattern_classifies_fields() {
        let set = bounds_of(&doc! {
            "a": 1,
            "b": { "$gt": 0, "$lt": 9 },
            "c": { "$gte": 0 },
            "d": { "$lt": 9 },
        });
        let qp = set.pattern("{e: 1}", "{}");
        let kinds: Vec<_> = qp.fields.iter().map(|(p, k)| (p.as_str(), *k)).collect();
        // Type-bracket closing makes one-sided numeric bounds two-sided in
        // the bracket sense; classification looks at the sentinel sides.
        assert_eq!(kinds[0], ("a", BoundKind::Equality));
        assert_eq!(kinds[1].0, "b");
        assert_eq!(kinds[1].1, BoundKind::UpperAndLowerBound);
        assert_eq!(qp.sort_shape, "{e: 1}");
    }

    #[test]
    fn identical_shapes_produce_identical_patterns() {
        let a = bounds_of(&doc! { "a": { "$gt": 1 }, "b": 5 }).pattern("{c: 1}", "{}");
        let b = bounds_of(&doc! { "a": { "$gt": 100 }, "b": "x" }).pattern("{c: 1}", "{}");
        // Shapes ignore operand values and types.
        assert_eq!(a, b);
    }

    #[test]
    fn simplified_query_is_a_fixed_point() {
        let original = doc! { "a": { "$gte": 5, "$lt": 10 }, "b": 3, "s": { "$regex": "^ab" } };
        let set = bounds_of(&original);
        let simplified = set.simplified_query(&[]);
        let set2 = bounds_of(&simplified);
        for path in ["a", "b", "s"] {
            assert_eq!(set.get(path), set2.get(path), "path {}", path);
        }
        // And once more for good measure: already canonical.
        let simplified2 = set2.simplified_query(&[]);
        assert_eq!(simplified, simplified2);
    }

    #[test]
    fn index_bounds_bind_pattern_fields() {
        let set = bounds_of(&doc! { "a": 1, "b": { "$gte": 5 } });
        let kp = KeyPattern::parse(&doc! { "a": 1, "b": 1, "c": 1 }).unwrap();
        let bounds = set.index_bounds(&kp);
        assert_eq!(bounds.num_fields(), 3);
        assert!(bounds.fields[0].is_single_point());
        assert!(!bounds.fields[1].is_full());
        assert!(bounds.fields[2].is_full());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_bound() -> impl Strategy<Value = FieldBound> {
            (any::<i32>(), any::<bool>(), any::<i32>(), any::<bool>()).prop_map(
                |(lo, lo_in, hi, hi_in)| FieldBound {
                    lower: Value::Int32(lo.min(hi)),
                    lower_inclusive: lo_in,
                    upper: Value::Int32(lo.max(hi)),
                    upper_inclusive: hi_in,
                },
            )
        }

        proptest! {
            #[test]
            fn intersection_is_commutative(a in arb_bound(), b in arb_bound()) {
                let mut ab = a.clone();
                ab.intersect(&b);
                let mut ba = b.clone();
                ba.intersect(&a);
                prop_assert_eq!(ab, ba);
            }

            #[test]
            fn intersection_is_idempotent(a in arb_bound(), b in arb_bound()) {
                let mut once = a.clone();
                once.intersect(&b);
                let mut twice = once.clone();
                twice.intersect(&b);
                prop_assert_eq!(once, twice);
            }

            #[test]
            fn intersection_never_widens(a in arb_bound(), b in arb_bound()) {
                let mut ab = a.clone();
                ab.intersect(&b);
                prop_assert!(cmp_values(&ab.lower, &a.lower) != Ordering::Less);
                prop_assert!(cmp_values(&ab.upper, &a.upper) != Ordering::Greater);
            }
        }
    }
}
