//! The document value model
//!
//! `Value` is the self-describing value type stored in documents and index
//! keys. Values of different types form a single total order: first by the
//! canonical type rank, then by the type's own comparison. All four numeric
//! variants share one rank and compare by numeric value across their union,
//! so `Int32(3)`, `Int64(3)` and `Double(3.0)` are equal under `cmp_values`.

use crate::document::Document;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A 12-byte object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub [u8; 12]);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Storage-engine timestamp: seconds since epoch plus an ordinal that
/// disambiguates operations within one second.
///
/// This is the unit the replication log is addressed in (see `rook-repl`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub secs: u32,
    /// Ordinal within the second.
    pub increment: u32,
}

impl Timestamp {
    /// Create a timestamp.
    pub fn new(secs: u32, increment: u32) -> Self {
        Self { secs, increment }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.secs, self.increment)
    }
}

/// A fixed-point decimal: `mantissa * 10^-scale`.
///
/// Covers the decimal numeric type without pulling in a full IEEE decimal
/// implementation. Comparison against the other numeric variants is exact
/// (cross-multiplied in 128-bit space), never routed through `f64`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Decimal {
    /// Scaled integer value.
    pub mantissa: i64,
    /// Number of decimal fraction digits. Bounded to 18 by constructors.
    pub scale: u32,
}

impl Decimal {
    /// Largest supported scale. Keeps cross-multiplied comparisons inside i128.
    pub const MAX_SCALE: u32 = 18;

    /// Create a decimal, clamping the scale to [`Decimal::MAX_SCALE`].
    pub fn new(mantissa: i64, scale: u32) -> Self {
        Self {
            mantissa,
            scale: scale.min(Self::MAX_SCALE),
        }
    }

    fn pow10(scale: u32) -> i128 {
        10i128.pow(scale)
    }

    /// Numeric comparison against another decimal.
    pub fn cmp_decimal(&self, other: &Decimal) -> Ordering {
        let lhs = self.mantissa as i128 * Self::pow10(other.scale);
        let rhs = other.mantissa as i128 * Self::pow10(self.scale);
        lhs.cmp(&rhs)
    }

    /// Numeric comparison against an integer.
    pub fn cmp_i64(&self, other: i64) -> Ordering {
        let lhs = self.mantissa as i128;
        let rhs = other as i128 * Self::pow10(self.scale);
        lhs.cmp(&rhs)
    }

    /// Approximate conversion for comparison against doubles.
    pub fn to_f64(&self) -> f64 {
        self.mantissa as f64 / Self::pow10(self.scale) as f64
    }

    /// The largest integer less than or equal to this decimal.
    pub fn floor_i64(&self) -> i64 {
        let q = (self.mantissa as i128).div_euclid(Self::pow10(self.scale));
        q.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// Fractional part in `[0, 1)`.
    pub fn fraction(&self) -> f64 {
        let r = (self.mantissa as i128).rem_euclid(Self::pow10(self.scale));
        r as f64 / Self::pow10(self.scale) as f64
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.mantissa);
        }
        let p = Self::pow10(self.scale);
        let abs = (self.mantissa as i128).unsigned_abs();
        let sign = if self.mantissa < 0 { "-" } else { "" };
        write!(
            f,
            "{}{}.{:0width$}",
            sign,
            abs / p.unsigned_abs(),
            abs % p.unsigned_abs(),
            width = self.scale as usize
        )
    }
}

/// Canonical type rank used for cross-type ordering.
///
/// The numeric variants all map to [`TypeRank::Numeric`]. The discriminant
/// values are spaced so new types can be slotted in without reordering, and
/// they double as the leading byte of encoded index keys (see `rook-index`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TypeRank {
    /// Below every other value.
    MinKey = 0x04,
    /// Null.
    Null = 0x0a,
    /// All numeric types.
    Numeric = 0x1e,
    /// UTF-8 strings.
    String = 0x3c,
    /// Embedded documents.
    Document = 0x46,
    /// Arrays.
    Array = 0x50,
    /// Binary blobs.
    Binary = 0x5a,
    /// Object ids.
    ObjectId = 0x64,
    /// Booleans.
    Boolean = 0x6e,
    /// Wall-clock datetimes.
    DateTime = 0x78,
    /// Storage timestamps.
    Timestamp = 0x82,
    /// Regular expressions.
    Regex = 0x8c,
    /// Above every other value.
    MaxKey = 0xf0,
}

/// A single document value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// Sentinel below all other values.
    MinKey,
    /// Null.
    Null,
    /// 32-bit integer.
    Int32(i32),
    /// 64-bit integer.
    Int64(i64),
    /// 64-bit float.
    Double(f64),
    /// Fixed-point decimal.
    Decimal(Decimal),
    /// UTF-8 string.
    String(String),
    /// Embedded document.
    Document(Document),
    /// Array of values.
    Array(Vec<Value>),
    /// Binary blob.
    Binary(Vec<u8>),
    /// Object id.
    ObjectId(ObjectId),
    /// Boolean.
    Boolean(bool),
    /// Milliseconds since the Unix epoch.
    DateTime(i64),
    /// Storage timestamp.
    Timestamp(Timestamp),
    /// Regular expression: (pattern, options).
    Regex(String, String),
    /// Sentinel above all other values.
    MaxKey,
}

impl Value {
    /// Canonical type rank of this value.
    pub fn type_rank(&self) -> TypeRank {
        match self {
            Value::MinKey => TypeRank::MinKey,
            Value::Null => TypeRank::Null,
            Value::Int32(_) | Value::Int64(_) | Value::Double(_) | Value::Decimal(_) => {
                TypeRank::Numeric
            }
            Value::String(_) => TypeRank::String,
            Value::Document(_) => TypeRank::Document,
            Value::Array(_) => TypeRank::Array,
            Value::Binary(_) => TypeRank::Binary,
            Value::ObjectId(_) => TypeRank::ObjectId,
            Value::Boolean(_) => TypeRank::Boolean,
            Value::DateTime(_) => TypeRank::DateTime,
            Value::Timestamp(_) => TypeRank::Timestamp,
            Value::Regex(_, _) => TypeRank::Regex,
            Value::MaxKey => TypeRank::MaxKey,
        }
    }

    /// True for any of the four numeric variants.
    pub fn is_numeric(&self) -> bool {
        self.type_rank() == TypeRank::Numeric
    }

    /// Smallest value of this value's type bracket, used to close one-sided
    /// range bounds.
    pub fn min_for_type(&self) -> Value {
        match self.type_rank() {
            TypeRank::MinKey => Value::MinKey,
            TypeRank::Null => Value::Null,
            TypeRank::Numeric => Value::Double(f64::NEG_INFINITY),
            TypeRank::String => Value::String(String::new()),
            TypeRank::Document => Value::Document(Document::new()),
            TypeRank::Array => Value::Array(Vec::new()),
            TypeRank::Binary => Value::Binary(Vec::new()),
            TypeRank::ObjectId => Value::ObjectId(ObjectId([0u8; 12])),
            TypeRank::Boolean => Value::Boolean(false),
            TypeRank::DateTime => Value::DateTime(i64::MIN),
            TypeRank::Timestamp => Value::Timestamp(Timestamp::new(0, 0)),
            TypeRank::Regex => Value::Regex(String::new(), String::new()),
            TypeRank::MaxKey => Value::MaxKey,
        }
    }

    /// Largest value of this value's type bracket.
    pub fn max_for_type(&self) -> Value {
        match self.type_rank() {
            TypeRank::MinKey => Value::MinKey,
            TypeRank::Null => Value::Null,
            TypeRank::Numeric => Value::Double(f64::INFINITY),
            // For unbounded-above brackets the successor type's minimum is the
            // exclusive ceiling; MaxKey is a safe inclusive stand-in.
            _ => Value::MaxKey,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        cmp_values(self, other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(cmp_values(self, other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_values(self, other)
    }
}

/// Compare an i64 against an f64 by numeric value, without precision loss.
///
/// NaN orders below every number, matching the index-key ordering.
fn cmp_i64_f64(i: i64, d: f64) -> Ordering {
    if d.is_nan() {
        return Ordering::Greater;
    }
    if d == f64::INFINITY {
        return Ordering::Less;
    }
    if d == f64::NEG_INFINITY {
        return Ordering::Greater;
    }
    // Exact within the 2^53 window where f64 represents all integers.
    const EXACT: i64 = 1 << 53;
    if (-EXACT..=EXACT).contains(&i) {
        return (i as f64).partial_cmp(&d).unwrap_or(Ordering::Equal);
    }
    // Outside the window: compare against the double's floor in i64 space.
    let df = d.floor();
    if df >= i64::MAX as f64 {
        return Ordering::Less;
    }
    if df < i64::MIN as f64 {
        return Ordering::Greater;
    }
    let dfi = df as i64;
    match i.cmp(&dfi) {
        Ordering::Equal => {
            // Equal floors: the double wins only if it has a fraction.
            if d > df {
                Ordering::Less
            } else {
                Ordering::Equal
            }
        }
        ord => ord,
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    // NaN sorts first among numerics.
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn cmp_numeric(a: &Value, b: &Value) -> Ordering {
    use Value::*;
    match (a, b) {
        (Int32(x), Int32(y)) => x.cmp(y),
        (Int32(x), Int64(y)) => (*x as i64).cmp(y),
        (Int64(x), Int32(y)) => x.cmp(&(*y as i64)),
        (Int64(x), Int64(y)) => x.cmp(y),
        (Int32(x), Double(y)) => cmp_i64_f64(*x as i64, *y),
        (Int64(x), Double(y)) => cmp_i64_f64(*x, *y),
        (Double(x), Int32(y)) => cmp_i64_f64(*y as i64, *x).reverse(),
        (Double(x), Int64(y)) => cmp_i64_f64(*y, *x).reverse(),
        (Double(x), Double(y)) => cmp_f64(*x, *y),
        (Decimal(x), Decimal(y)) => x.cmp_decimal(y),
        (Decimal(x), Int32(y)) => x.cmp_i64(*y as i64),
        (Decimal(x), Int64(y)) => x.cmp_i64(*y),
        (Int32(x), Decimal(y)) => y.cmp_i64(*x as i64).reverse(),
        (Int64(x), Decimal(y)) => y.cmp_i64(*x).reverse(),
        (Decimal(x), Double(y)) => cmp_f64(x.to_f64(), *y),
        (Double(x), Decimal(y)) => cmp_f64(*x, y.to_f64()),
        _ => unreachable!("cmp_numeric called with non-numeric value"),
    }
}

/// The total order over values described in the data model: type rank first,
/// then the per-type comparison.
pub fn cmp_values(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (a.type_rank(), b.type_rank());
    if ra != rb {
        return ra.cmp(&rb);
    }
    use Value::*;
    match (a, b) {
        (MinKey, MinKey) | (Null, Null) | (MaxKey, MaxKey) => Ordering::Equal,
        (String(x), String(y)) => x.cmp(y),
        (Document(x), Document(y)) => cmp_documents(x, y),
        (Array(x), Array(y)) => cmp_value_slices(x, y),
        (Binary(x), Binary(y)) => x.len().cmp(&y.len()).then_with(|| x.cmp(y)),
        (ObjectId(x), ObjectId(y)) => x.cmp(y),
        (Boolean(x), Boolean(y)) => x.cmp(y),
        (DateTime(x), DateTime(y)) => x.cmp(y),
        (Timestamp(x), Timestamp(y)) => x.cmp(y),
        (Regex(px, ox), Regex(py, oy)) => px.cmp(py).then_with(|| ox.cmp(oy)),
        _ => cmp_numeric(a, b),
    }
}

fn cmp_documents(a: &Document, b: &Document) -> Ordering {
    for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
        let ord = ka.cmp(kb).then_with(|| cmp_values(va, vb));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn cmp_value_slices(a: &[Value], b: &[Value]) -> Ordering {
    for (va, vb) in a.iter().zip(b.iter()) {
        let ord = cmp_values(va, vb);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::MinKey => write!(f, "MinKey"),
            Value::Null => write!(f, "null"),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Decimal(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "\"{}\"", v),
            Value::Document(v) => write!(f, "{}", v),
            Value::Array(vs) => {
                write!(f, "[")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Binary(v) => write!(f, "Binary({} bytes)", v.len()),
            Value::ObjectId(v) => write!(f, "ObjectId({})", v),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::DateTime(v) => write!(f, "Date({})", v),
            Value::Timestamp(v) => write!(f, "Timestamp({})", v),
            Value::Regex(p, o) => write!(f, "/{}/{}", p, o),
            Value::MaxKey => write!(f, "MaxKey"),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Document> for Value {
    fn from(v: Document) -> Self {
        Value::Document(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_ranks_follow_canonical_order() {
        let ordered = [
            Value::MinKey,
            Value::Null,
            Value::Int32(0),
            Value::String("".into()),
            Value::Document(Document::new()),
            Value::Array(vec![]),
            Value::Binary(vec![]),
            Value::ObjectId(ObjectId([0; 12])),
            Value::Boolean(false),
            Value::DateTime(0),
            Value::Timestamp(Timestamp::new(0, 0)),
            Value::Regex("".into(), "".into()),
            Value::MaxKey,
        ];
        for pair in ordered.windows(2) {
            assert_eq!(cmp_values(&pair[0], &pair[1]), Ordering::Less);
        }
    }

    #[test]
    fn numeric_types_compare_by_value() {
        assert_eq!(
            cmp_values(&Value::Int32(3), &Value::Double(3.0)),
            Ordering::Equal
        );
        assert_eq!(
            cmp_values(&Value::Int64(3), &Value::Int32(3)),
            Ordering::Equal
        );
        assert_eq!(
            cmp_values(&Value::Double(2.5), &Value::Int32(3)),
            Ordering::Less
        );
        assert_eq!(
            cmp_values(&Value::Decimal(Decimal::new(25, 1)), &Value::Double(2.5)),
            Ordering::Equal
        );
        assert_eq!(
            cmp_values(&Value::Decimal(Decimal::new(31, 1)), &Value::Int32(3)),
            Ordering::Greater
        );
    }

    #[test]
    fn large_int64_vs_double_is_exact() {
        // 2^53 + 1 is not representable as f64; the comparison must not
        // collapse it onto 2^53.
        let big = (1i64 << 53) + 1;
        assert_eq!(
            cmp_values(&Value::Int64(big), &Value::Double((1i64 << 53) as f64)),
            Ordering::Greater
        );
    }

    #[test]
    fn nan_sorts_below_all_numbers() {
        assert_eq!(
            cmp_values(&Value::Double(f64::NAN), &Value::Double(f64::NEG_INFINITY)),
            Ordering::Less
        );
        assert_eq!(
            cmp_values(&Value::Double(f64::NAN), &Value::Int64(i64::MIN)),
            Ordering::Less
        );
        // But still above Null, which is a different type rank.
        assert_eq!(
            cmp_values(&Value::Double(f64::NAN), &Value::Null),
            Ordering::Greater
        );
    }

    #[test]
    fn binary_compares_by_length_first() {
        assert_eq!(
            cmp_values(&Value::Binary(vec![0xff]), &Value::Binary(vec![0, 0])),
            Ordering::Less
        );
    }

    #[test]
    fn arrays_compare_elementwise() {
        let a = Value::Array(vec![Value::Int32(1), Value::Int32(2)]);
        let b = Value::Array(vec![Value::Int32(1), Value::Int32(3)]);
        let c = Value::Array(vec![Value::Int32(1)]);
        assert_eq!(cmp_values(&a, &b), Ordering::Less);
        assert_eq!(cmp_values(&c, &a), Ordering::Less);
    }

    #[test]
    fn decimal_display() {
        assert_eq!(Decimal::new(25, 1).to_string(), "2.5");
        assert_eq!(Decimal::new(-25, 1).to_string(), "-2.5");
        assert_eq!(Decimal::new(7, 0).to_string(), "7");
    }

    #[test]
    fn decimal_floor_and_fraction() {
        let d = Decimal::new(-35, 1); // -3.5
        assert_eq!(d.floor_i64(), -4);
        assert!((d.fraction() - 0.5).abs() < 1e-12);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn numeric_value() -> impl Strategy<Value = Value> {
            prop_oneof![
                any::<i32>().prop_map(Value::Int32),
                any::<i64>().prop_map(Value::Int64),
                any::<f64>().prop_map(Value::Double),
                (any::<i64>(), 0u32..=6).prop_map(|(m, s)| Value::Decimal(Decimal::new(m, s))),
            ]
        }

        proptest! {
            #[test]
            fn numeric_order_is_antisymmetric(a in numeric_value(), b in numeric_value()) {
                prop_assert_eq!(cmp_values(&a, &b), cmp_values(&b, &a).reverse());
            }

            #[test]
            fn int_double_order_is_transitive(
                a in prop_oneof![any::<i64>().prop_map(Value::Int64), any::<f64>().prop_map(Value::Double)],
                b in prop_oneof![any::<i64>().prop_map(Value::Int64), any::<f64>().prop_map(Value::Double)],
                c in prop_oneof![any::<i64>().prop_map(Value::Int64), any::<f64>().prop_map(Value::Double)],
            ) {
                let mut vals = [a, b, c];
                vals.sort_by(cmp_values);
                prop_assert!(cmp_values(&vals[0], &vals[2]) != Ordering::Greater);
            }

            #[test]
            fn int_double_agree_on_shared_values(v in -(1i64 << 52)..(1i64 << 52)) {
                prop_assert_eq!(
                    cmp_values(&Value::Int64(v), &Value::Double(v as f64)),
                    Ordering::Equal
                );
            }
        }
    }
}
