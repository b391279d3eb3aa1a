//! Ordered key codec
//!
//! Encodes key-pattern tuples into byte strings whose unsigned lexicographic
//! order equals the semantic order of the tuple under the index's direction
//! vector and collation. The four numeric types share one encoded form, so
//! `int(3)` and `double(3.0)` produce identical bytes; `V1` keys carry a
//! typebits trailer recording the original numeric variant of each field so
//! covered reads round-trip exact types.
//!
//! The codec is intentionally lossy for everything else (collated strings
//! decode to their sort key, decimals decode to doubles): encoded keys exist
//! for ordering, and the stored document is consulted for returned values.

use crate::descriptor::{Collation, IndexDescriptor, IndexDirection, IndexVersion, KeyPattern};
use byteorder::{BigEndian, ByteOrder};
use rook_core::{cmp_values, Document, Error, ObjectId, Result, Timestamp, TypeRank, Value};
use smallvec::{smallvec, SmallVec};
use std::cmp::Ordering;

/// Numeric sub-marker bytes; ordered NaN < -inf < finite < +inf.
const NUM_NAN: u8 = 0x00;
const NUM_NEG_INF: u8 = 0x01;
const NUM_FINITE: u8 = 0x02;
const NUM_POS_INF: u8 = 0x03;

/// Marker starting each field inside an encoded nested document.
const DOC_FIELD_MARK: u8 = 0x01;
/// Terminator of nested documents and arrays.
const NEST_END: u8 = 0x00;

/// Typebits values, 3 bits per key field.
const TB_OTHER: u8 = 0;
const TB_INT32: u8 = 1;
const TB_INT64: u8 = 2;
const TB_DOUBLE: u8 = 3;
const TB_DECIMAL: u8 = 4;

/// One encoded index key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedKey {
    /// Ordering bytes.
    pub bytes: Vec<u8>,
    /// Typebits trailer; empty under `V0`.
    pub type_bits: Vec<u8>,
}

/// The keys one document generates for one index, plus the per-path
/// multikey observations the catalog entry folds in.
#[derive(Debug, Clone)]
pub struct KeySet {
    /// Encoded keys; more than one when an indexed path held an array.
    pub keys: SmallVec<[EncodedKey; 1]>,
    /// Per key-pattern field: did this document hold an array there.
    pub multikey_paths: Vec<bool>,
}

impl KeySet {
    /// True when the document produced no keys (sparse miss).
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// True when any path was array-valued.
    pub fn is_multikey(&self) -> bool {
        self.multikey_paths.iter().any(|b| *b)
    }
}

/// Generate the key set for `doc` under `descriptor`.
///
/// Fails with `CannotIndexParallelArrays` when two pattern fields are
/// array-valued in the same document.
pub fn encode_keys(descriptor: &IndexDescriptor, doc: &Document) -> Result<KeySet> {
    let pattern = &descriptor.key_pattern;
    let mut per_field: Vec<SmallVec<[Value; 1]>> = Vec::with_capacity(pattern.len());
    let mut multikey_paths = vec![false; pattern.len()];
    let mut first_array: Option<usize> = None;
    let mut all_missing = true;

    for (i, field) in pattern.fields().iter().enumerate() {
        let extracted = extract_values(doc, &field.path);
        if !extracted.missing {
            all_missing = false;
        }
        if extracted.was_array {
            if field.direction == IndexDirection::Hashed {
                return Err(Error::bad_value(format!(
                    "hashed index field {} cannot be an array",
                    field.path
                )));
            }
            match first_array {
                None => first_array = Some(i),
                Some(j) => {
                    return Err(Error::CannotIndexParallelArrays(
                        pattern.fields()[j].path.clone(),
                        field.path.clone(),
                    ))
                }
            }
            multikey_paths[i] = true;
        }
        per_field.push(extracted.values);
    }

    if descriptor.sparse && all_missing {
        return Ok(KeySet {
            keys: SmallVec::new(),
            multikey_paths,
        });
    }

    // Cartesian product; at most one field has fan-out > 1.
    let mut keys: SmallVec<[EncodedKey; 1]> = smallvec![EncodedKey {
        bytes: Vec::new(),
        type_bits: Vec::new(),
    }];
    for (i, field) in pattern.fields().iter().enumerate() {
        let values = &per_field[i];
        let mut next: SmallVec<[EncodedKey; 1]> = SmallVec::new();
        for key in keys.iter() {
            for value in values.iter() {
                let mut bytes = key.bytes.clone();
                let value = match field.direction {
                    IndexDirection::Hashed => hash_value(value, descriptor.collation),
                    _ => value.clone(),
                };
                encode_field(
                    &mut bytes,
                    &value,
                    field.direction == IndexDirection::Descending,
                    descriptor.collation,
                );
                let mut type_bits = key.type_bits.clone();
                if descriptor.version == IndexVersion::V1 {
                    TypeBitsWriter::append(&mut type_bits, i, type_bit_of(&value));
                }
                next.push(EncodedKey { bytes, type_bits });
            }
        }
        keys = next;
    }

    // Array elements that compare equal produce one key.
    keys.sort_by(|a, b| a.bytes.cmp(&b.bytes));
    keys.dedup_by(|a, b| a.bytes == b.bytes);

    Ok(KeySet {
        keys,
        multikey_paths,
    })
}

/// Encode a seek key from a (possibly partial) tuple of field values.
pub fn encode_seek_key(pattern: &KeyPattern, collation: Collation, values: &[Value]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for (field, value) in pattern.fields().iter().zip(values.iter()) {
        let value = match field.direction {
            IndexDirection::Hashed => hash_value(value, collation),
            _ => value.clone(),
        };
        encode_field(
            &mut bytes,
            &value,
            field.direction == IndexDirection::Descending,
            collation,
        );
    }
    bytes
}

/// Byte comparison is the key comparison.
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Decode an encoded key back into one comparable value per field.
///
/// Numerics come back as the exact variant when `type_bits` are present,
/// else as doubles. Collated strings come back as their sort key.
pub fn decode_key(
    bytes: &[u8],
    pattern: &KeyPattern,
    type_bits: &[u8],
) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(pattern.len());
    let mut pos = 0usize;
    for (i, field) in pattern.fields().iter().enumerate() {
        let invert = field.direction == IndexDirection::Descending;
        let mut reader = Reader {
            data: bytes,
            pos,
            invert,
        };
        let mut value = decode_value(&mut reader)?;
        pos = reader.pos;
        if let Value::Double(d) = value {
            value = match TypeBitsWriter::read(type_bits, i) {
                TB_INT32 => Value::Int32(d as i32),
                TB_INT64 => Value::Int64(d as i64),
                _ => Value::Double(d),
            };
        }
        out.push(value);
    }
    Ok(out)
}

/// Hash transform for hashed key-pattern fields.
fn hash_value(value: &Value, collation: Collation) -> Value {
    let mut bytes = Vec::new();
    encode_field(&mut bytes, value, false, collation);
    Value::Int64(xxhash_rust::xxh3::xxh3_64(&bytes) as i64)
}

fn type_bit_of(value: &Value) -> u8 {
    match value {
        Value::Int32(_) => TB_INT32,
        Value::Int64(_) => TB_INT64,
        Value::Double(_) => TB_DOUBLE,
        Value::Decimal(_) => TB_DECIMAL,
        _ => TB_OTHER,
    }
}

/// 3-bit-per-field typebits packing.
struct TypeBitsWriter;

impl TypeBitsWriter {
    fn append(bits: &mut Vec<u8>, field_index: usize, value: u8) {
        let bit_pos = field_index * 3;
        let byte = bit_pos / 8;
        while bits.len() <= (bit_pos + 2) / 8 {
            bits.push(0);
        }
        let shift = bit_pos % 8;
        bits[byte] |= value << shift;
        if shift > 5 {
            bits[byte + 1] |= value >> (8 - shift);
        }
    }

    fn read(bits: &[u8], field_index: usize) -> u8 {
        let bit_pos = field_index * 3;
        let byte = bit_pos / 8;
        if byte >= bits.len() {
            return TB_OTHER;
        }
        let shift = bit_pos % 8;
        let mut v = bits[byte] >> shift;
        if shift > 5 && byte + 1 < bits.len() {
            v |= bits[byte + 1] << (8 - shift);
        }
        v & 0b111
    }
}

/// Extraction result for one key-pattern path.
struct Extracted {
    values: SmallVec<[Value; 1]>,
    was_array: bool,
    missing: bool,
}

/// Pull the value set at a dotted path, fanning out over arrays.
///
/// A missing path contributes `Null`; an empty array likewise. Intermediate
/// arrays descend into their document elements.
fn extract_values(doc: &Document, path: &str) -> Extracted {
    let mut current: SmallVec<[&Value; 1]> = SmallVec::new();
    let mut was_array = false;

    let mut roots: SmallVec<[&Document; 1]> = smallvec![doc];
    let segments: Vec<&str> = path.split('.').collect();
    for (si, seg) in segments.iter().enumerate() {
        current.clear();
        for root in roots.iter() {
            if let Some(v) = root.get(seg) {
                current.push(v);
            }
        }
        if si + 1 == segments.len() {
            break;
        }
        // Descend: documents directly, arrays through their document elements.
        let mut next_roots: SmallVec<[&Document; 1]> = SmallVec::new();
        for v in current.iter() {
            match v {
                Value::Document(d) => next_roots.push(d),
                Value::Array(elems) => {
                    was_array = true;
                    for e in elems {
                        if let Value::Document(d) = e {
                            next_roots.push(d);
                        }
                    }
                }
                _ => {}
            }
        }
        roots = next_roots;
    }

    let mut values: SmallVec<[Value; 1]> = SmallVec::new();
    let mut missing = true;
    for v in current.iter() {
        missing = false;
        match v {
            Value::Array(elems) => {
                was_array = true;
                if elems.is_empty() {
                    values.push(Value::Null);
                } else {
                    for e in elems {
                        values.push(e.clone());
                    }
                }
            }
            other => values.push((*other).clone()),
        }
    }
    if values.is_empty() {
        values.push(Value::Null);
    }
    // Deduplicate equal fan-out values.
    values.sort_by(cmp_values);
    values.dedup_by(|a, b| cmp_values(a, b) == Ordering::Equal);

    Extracted {
        values,
        was_array,
        missing,
    }
}

/// Encode one field, inverting the bytes for descending fields.
fn encode_field(buf: &mut Vec<u8>, value: &Value, descending: bool, collation: Collation) {
    if !descending {
        encode_value(buf, value, collation);
        return;
    }
    let mut tmp = Vec::new();
    encode_value(&mut tmp, value, collation);
    buf.extend(tmp.iter().map(|b| !b));
}

fn encode_value(buf: &mut Vec<u8>, value: &Value, collation: Collation) {
    buf.push(value.type_rank() as u8);
    match value {
        Value::MinKey | Value::Null | Value::MaxKey => {}
        Value::Int32(v) => encode_numeric(buf, *v as i64, 0),
        Value::Int64(v) => encode_numeric(buf, *v, 0),
        Value::Double(d) => encode_double(buf, *d),
        Value::Decimal(d) => {
            encode_numeric(buf, d.floor_i64(), frac_to_bits(d.fraction()));
        }
        Value::String(s) => encode_string(buf, &collation.sort_key(s)),
        Value::Document(d) => {
            for (name, v) in d.iter() {
                buf.push(DOC_FIELD_MARK);
                buf.extend_from_slice(name.as_bytes());
                buf.push(0x00);
                encode_value(buf, v, collation);
            }
            buf.push(NEST_END);
        }
        Value::Array(vs) => {
            for v in vs {
                encode_value(buf, v, collation);
            }
            buf.push(NEST_END);
        }
        Value::Binary(b) => {
            let mut len = [0u8; 4];
            BigEndian::write_u32(&mut len, b.len() as u32);
            buf.extend_from_slice(&len);
            buf.extend_from_slice(b);
        }
        Value::ObjectId(oid) => buf.extend_from_slice(&oid.0),
        Value::Boolean(b) => buf.push(*b as u8),
        Value::DateTime(millis) => {
            let mut b = [0u8; 8];
            BigEndian::write_u64(&mut b, (*millis as u64) ^ (1 << 63));
            buf.extend_from_slice(&b);
        }
        Value::Timestamp(ts) => {
            let mut b = [0u8; 8];
            BigEndian::write_u32(&mut b[..4], ts.secs);
            BigEndian::write_u32(&mut b[4..], ts.increment);
            buf.extend_from_slice(&b);
        }
        Value::Regex(pattern, options) => {
            encode_string(buf, pattern.as_bytes());
            encode_string(buf, options.as_bytes());
        }
    }
}

/// NUL-escaped, double-NUL-terminated string body.
fn encode_string(buf: &mut Vec<u8>, s: &[u8]) {
    for &b in s {
        buf.push(b);
        if b == 0x00 {
            buf.push(0xff);
        }
    }
    buf.push(0x00);
    buf.push(0x00);
}

/// Fraction bytes: the raw IEEE bits of the fraction double. Fractions are
/// non-negative, and IEEE bits of non-negative doubles order like the values.
fn frac_to_bits(frac: f64) -> u64 {
    frac.to_bits()
}

fn encode_double(buf: &mut Vec<u8>, d: f64) {
    if d.is_nan() {
        buf.push(NUM_NAN);
        return;
    }
    if d == f64::INFINITY {
        buf.push(NUM_POS_INF);
        return;
    }
    if d == f64::NEG_INFINITY {
        buf.push(NUM_NEG_INF);
        return;
    }
    let floor = d.floor();
    let (floor_i, frac) = if floor <= i64::MIN as f64 {
        (i64::MIN, 0.0)
    } else if floor >= i64::MAX as f64 {
        (i64::MAX, 0.0)
    } else {
        (floor as i64, d - floor)
    };
    encode_numeric(buf, floor_i, frac_to_bits(frac));
}

/// Finite numeric body: marker, offset-binary floor, fraction bits.
fn encode_numeric(buf: &mut Vec<u8>, floor: i64, frac_bits: u64) {
    buf.push(NUM_FINITE);
    let mut b = [0u8; 16];
    BigEndian::write_u64(&mut b[..8], (floor as u64) ^ (1 << 63));
    BigEndian::write_u64(&mut b[8..], frac_bits);
    buf.extend_from_slice(&b);
}

/// Streaming reader that un-inverts descending fields on the fly.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    invert: bool,
}

impl<'a> Reader<'a> {
    fn next(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| Error::internal("truncated index key"))?;
        self.pos += 1;
        Ok(if self.invert { !b } else { b })
    }

    fn peek(&self) -> Option<u8> {
        self.data
            .get(self.pos)
            .map(|b| if self.invert { !*b } else { *b })
    }

    fn take(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.next()?);
        }
        Ok(out)
    }
}

fn decode_value(reader: &mut Reader<'_>) -> Result<Value> {
    let disc = reader.next()?;
    let value = if disc == TypeRank::MinKey as u8 {
        Value::MinKey
    } else if disc == TypeRank::Null as u8 {
        Value::Null
    } else if disc == TypeRank::Numeric as u8 {
        match reader.next()? {
            NUM_NAN => Value::Double(f64::NAN),
            NUM_NEG_INF => Value::Double(f64::NEG_INFINITY),
            NUM_POS_INF => Value::Double(f64::INFINITY),
            NUM_FINITE => {
                let body = reader.take(16)?;
                let floor = (BigEndian::read_u64(&body[..8]) ^ (1 << 63)) as i64;
                let frac = f64::from_bits(BigEndian::read_u64(&body[8..]));
                Value::Double(floor as f64 + frac)
            }
            other => return Err(Error::internal(format!("bad numeric marker {}", other))),
        }
    } else if disc == TypeRank::String as u8 {
        Value::String(decode_string(reader)?)
    } else if disc == TypeRank::Document as u8 {
        let mut d = Document::new();
        loop {
            match reader.peek() {
                Some(NEST_END) => {
                    reader.next()?;
                    break;
                }
                Some(DOC_FIELD_MARK) => {
                    reader.next()?;
                    let mut name = Vec::new();
                    loop {
                        let b = reader.next()?;
                        if b == 0x00 {
                            break;
                        }
                        name.push(b);
                    }
                    let name = String::from_utf8(name)
                        .map_err(|_| Error::internal("bad field name in index key"))?;
                    let v = decode_value(reader)?;
                    d.push(name, v);
                }
                _ => return Err(Error::internal("bad nested document in index key")),
            }
        }
        Value::Document(d)
    } else if disc == TypeRank::Array as u8 {
        let mut vs = Vec::new();
        loop {
            match reader.peek() {
                Some(NEST_END) => {
                    reader.next()?;
                    break;
                }
                Some(_) => vs.push(decode_value(reader)?),
                None => return Err(Error::internal("truncated array in index key")),
            }
        }
        Value::Array(vs)
    } else if disc == TypeRank::Binary as u8 {
        let len = BigEndian::read_u32(&reader.take(4)?) as usize;
        Value::Binary(reader.take(len)?)
    } else if disc == TypeRank::ObjectId as u8 {
        let bytes = reader.take(12)?;
        let mut oid = [0u8; 12];
        oid.copy_from_slice(&bytes);
        Value::ObjectId(ObjectId(oid))
    } else if disc == TypeRank::Boolean as u8 {
        Value::Boolean(reader.next()? != 0)
    } else if disc == TypeRank::DateTime as u8 {
        let bytes = reader.take(8)?;
        Value::DateTime((BigEndian::read_u64(&bytes) ^ (1 << 63)) as i64)
    } else if disc == TypeRank::Timestamp as u8 {
        let bytes = reader.take(8)?;
        Value::Timestamp(Timestamp::new(
            BigEndian::read_u32(&bytes[..4]),
            BigEndian::read_u32(&bytes[4..]),
        ))
    } else if disc == TypeRank::Regex as u8 {
        let pattern = decode_string(reader)?;
        let options = decode_string(reader)?;
        Value::Regex(pattern, options)
    } else if disc == TypeRank::MaxKey as u8 {
        Value::MaxKey
    } else {
        return Err(Error::internal(format!(
            "bad type discriminant {:#x} in index key",
            disc
        )));
    };
    Ok(value)
}

fn decode_string(reader: &mut Reader<'_>) -> Result<String> {
    let mut out = Vec::new();
    loop {
        let b = reader.next()?;
        if b == 0x00 {
            match reader.next()? {
                0x00 => break,
                0xff => out.push(0x00),
                other => {
                    return Err(Error::internal(format!(
                        "bad string escape {:#x} in index key",
                        other
                    )))
                }
            }
        } else {
            out.push(b);
        }
    }
    String::from_utf8(out).map_err(|_| Error::internal("non-UTF-8 string in index key"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::KeyPatternField;
    use rook_core::{arr, doc, Decimal};

    fn pattern(spec: &Document) -> KeyPattern {
        KeyPattern::parse(spec).unwrap()
    }

    fn descriptor(spec: &Document) -> IndexDescriptor {
        IndexDescriptor::new("test_idx", pattern(spec))
    }

    fn single_key(desc: &IndexDescriptor, doc: &Document) -> EncodedKey {
        let ks = encode_keys(desc, doc).unwrap();
        assert_eq!(ks.keys.len(), 1, "expected single key");
        ks.keys.into_iter().next().unwrap()
    }

    #[test]
    fn int_and_double_encode_identically() {
        let desc = descriptor(&doc! { "a": 1 });
        let k1 = single_key(&desc, &doc! { "a": 3 });
        let k2 = single_key(&desc, &doc! { "a": 3.0f64 });
        assert_eq!(k1.bytes, k2.bytes);
        // But typebits distinguish them under V1.
        assert_ne!(k1.type_bits, k2.type_bits);
    }

    #[test]
    fn v0_omits_typebits() {
        let desc = descriptor(&doc! { "a": 1 }).with_version(IndexVersion::V0);
        let k = single_key(&desc, &doc! { "a": 3 });
        assert!(k.type_bits.is_empty());
    }

    #[test]
    fn encoded_order_matches_semantic_order() {
        let desc = descriptor(&doc! { "a": 1 });
        let values = vec![
            Value::MinKey,
            Value::Null,
            Value::Double(f64::NAN),
            Value::Double(f64::NEG_INFINITY),
            Value::Int64(-10),
            Value::Int32(0),
            Value::Double(0.5),
            Value::Int32(1),
            Value::Double(1.5),
            Value::Int64(1 << 60),
            Value::Double(f64::INFINITY),
            Value::String("".into()),
            Value::String("a".into()),
            Value::String("a\u{0}b".into()),
            Value::String("ab".into()),
            Value::Boolean(false),
            Value::Boolean(true),
            Value::DateTime(-5),
            Value::DateTime(5),
            Value::MaxKey,
        ];
        let mut prev: Option<(Vec<u8>, Value)> = None;
        for v in values {
            let mut d = Document::new();
            d.push("a", v.clone());
            let k = single_key(&desc, &d);
            if let Some((pk, pv)) = prev {
                let semantic = cmp_values(&pv, &v);
                assert_eq!(
                    pk.cmp(&k.bytes),
                    semantic,
                    "order mismatch between {} and {}",
                    pv,
                    v
                );
            }
            prev = Some((k.bytes, v));
        }
    }

    #[test]
    fn descending_field_reverses_order() {
        let desc = IndexDescriptor::new(
            "a_-1",
            KeyPattern::new(vec![KeyPatternField {
                path: "a".into(),
                direction: IndexDirection::Descending,
            }])
            .unwrap(),
        );
        let k1 = single_key(&desc, &doc! { "a": 1 });
        let k2 = single_key(&desc, &doc! { "a": 2 });
        assert!(k1.bytes > k2.bytes);
    }

    #[test]
    fn compound_mixed_directions() {
        let desc = descriptor(&doc! { "a": 1, "b": (-1i32) });
        let k_1_9 = single_key(&desc, &doc! { "a": 1, "b": 9 });
        let k_1_3 = single_key(&desc, &doc! { "a": 1, "b": 3 });
        let k_2_9 = single_key(&desc, &doc! { "a": 2, "b": 9 });
        // a ascending dominates; within equal a, larger b sorts first.
        assert!(k_1_9.bytes < k_1_3.bytes);
        assert!(k_1_3.bytes < k_2_9.bytes);
    }

    #[test]
    fn array_field_fans_out_and_dedups() {
        let desc = descriptor(&doc! { "a": 1 });
        let ks = encode_keys(&desc, &doc! { "a": [3, 1, 3] }).unwrap();
        assert_eq!(ks.keys.len(), 2);
        assert!(ks.is_multikey());
        assert_eq!(ks.multikey_paths, vec![true]);
        // Keys come out sorted.
        assert!(ks.keys[0].bytes < ks.keys[1].bytes);
    }

    #[test]
    fn parallel_arrays_are_rejected() {
        let desc = descriptor(&doc! { "x": 1, "y": 1 });
        let err = encode_keys(&desc, &doc! { "x": [1, 2], "y": [3, 4] }).unwrap_err();
        assert!(matches!(err, Error::CannotIndexParallelArrays(_, _)));
    }

    #[test]
    fn one_array_with_scalar_companions_is_fine() {
        let desc = descriptor(&doc! { "x": 1, "y": 1 });
        let ks = encode_keys(&desc, &doc! { "x": [1, 2], "y": 3 }).unwrap();
        assert_eq!(ks.keys.len(), 2);
        assert_eq!(ks.multikey_paths, vec![true, false]);
    }

    #[test]
    fn missing_field_encodes_as_null() {
        let desc = descriptor(&doc! { "a": 1, "b": 1 });
        let with_null = single_key(&desc, &doc! { "a": 1, "b": null });
        let missing = single_key(&desc, &doc! { "a": 1 });
        assert_eq!(with_null.bytes, missing.bytes);
    }

    #[test]
    fn sparse_index_skips_all_missing() {
        let desc = descriptor(&doc! { "a": 1 }).sparse(true);
        let ks = encode_keys(&desc, &doc! { "other": 1 }).unwrap();
        assert!(ks.is_empty());
        // Present fields still index.
        let ks = encode_keys(&desc, &doc! { "a": null }).unwrap();
        assert_eq!(ks.keys.len(), 1);
    }

    #[test]
    fn dotted_paths_and_nested_arrays() {
        let desc = descriptor(&doc! { "a.b": 1 });
        let ks = encode_keys(
            &desc,
            &doc! { "a": [ { "b": 1 }, { "b": 2 }, { "c": 3 } ] },
        )
        .unwrap();
        // Elements with the path produce keys; the pathless element adds null.
        assert_eq!(ks.keys.len(), 2);
        assert!(ks.is_multikey());
    }

    #[test]
    fn collation_folds_before_encoding() {
        let desc = descriptor(&doc! { "s": 1 }).with_collation(Collation::CaseInsensitive);
        let k1 = single_key(&desc, &doc! { "s": "ABC" });
        let k2 = single_key(&desc, &doc! { "s": "abc" });
        assert_eq!(k1.bytes, k2.bytes);
    }

    #[test]
    fn hashed_field_encodes_deterministic_hash() {
        let desc = descriptor(&doc! { "h": "hashed" });
        let k1 = single_key(&desc, &doc! { "h": "value" });
        let k2 = single_key(&desc, &doc! { "h": "value" });
        let k3 = single_key(&desc, &doc! { "h": "other" });
        assert_eq!(k1.bytes, k2.bytes);
        assert_ne!(k1.bytes, k3.bytes);
        let err = encode_keys(&desc, &doc! { "h": [1, 2] }).unwrap_err();
        assert!(matches!(err, Error::BadValue(_)));
    }

    #[test]
    fn decode_round_trips_comparable_form() {
        let desc = descriptor(&doc! { "a": 1, "b": (-1i32) });
        let source = doc! { "a": 42, "b": "text" };
        let k = single_key(&desc, &source);
        let decoded = decode_key(&k.bytes, &desc.key_pattern, &k.type_bits).unwrap();
        assert_eq!(decoded[0], Value::Int32(42));
        assert_eq!(decoded[1], Value::String("text".into()));
    }

    #[test]
    fn decode_without_typebits_yields_doubles() {
        let desc = descriptor(&doc! { "a": 1 }).with_version(IndexVersion::V0);
        let k = single_key(&desc, &doc! { "a": 42 });
        let decoded = decode_key(&k.bytes, &desc.key_pattern, &k.type_bits).unwrap();
        assert_eq!(decoded[0], Value::Double(42.0));
    }

    #[test]
    fn seek_key_prefix_sorts_before_extensions() {
        let kp = pattern(&doc! { "a": 1, "b": 1 });
        let prefix = encode_seek_key(&kp, Collation::Simple, &[Value::Int32(1)]);
        let full = encode_seek_key(
            &kp,
            Collation::Simple,
            &[Value::Int32(1), Value::MinKey],
        );
        assert!(prefix < full);
    }

    #[test]
    fn nested_values_encode_in_order() {
        let desc = descriptor(&doc! { "a": 1 });
        let k_doc = single_key(&desc, &doc! { "a": { "x": 1 } });
        let k_doc2 = single_key(&desc, &doc! { "a": { "x": 2 } });
        let k_arr = {
            let mut d = Document::new();
            d.push("a", arr![[1]]);
            // Array of arrays: the outer fan-out produces the inner array.
            let ks = encode_keys(&desc, &d).unwrap();
            ks.keys[0].bytes.clone()
        };
        assert!(k_doc.bytes < k_doc2.bytes);
        // Documents sort before arrays.
        assert!(k_doc2.bytes < k_arr);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn scalar() -> impl Strategy<Value = Value> {
            prop_oneof![
                Just(Value::Null),
                any::<i32>().prop_map(Value::Int32),
                any::<i64>().prop_map(Value::Int64),
                (-1.0e12f64..1.0e12).prop_map(Value::Double),
                "[a-z]{0,8}".prop_map(Value::String),
                any::<bool>().prop_map(Value::Boolean),
                any::<i64>().prop_map(Value::DateTime),
            ]
        }

        proptest! {
            #[test]
            fn encoding_preserves_order(a in scalar(), b in scalar()) {
                let desc = descriptor(&doc! { "k": 1 });
                let mut da = Document::new();
                da.push("k", a.clone());
                let mut db = Document::new();
                db.push("k", b.clone());
                let ka = single_key(&desc, &da);
                let kb = single_key(&desc, &db);
                prop_assert_eq!(ka.bytes.cmp(&kb.bytes), cmp_values(&a, &b));
            }

            #[test]
            fn decimal_encoding_never_contradicts(
                m in -1_000_000i64..1_000_000,
                s in 0u32..4,
                d in -1000.0f64..1000.0,
            ) {
                let desc = descriptor(&doc! { "k": 1 });
                let dec = Value::Decimal(Decimal::new(m, s));
                let dbl = Value::Double(d);
                let mut d1 = Document::new();
                d1.push("k", dec.clone());
                let mut d2 = Document::new();
                d2.push("k", dbl.clone());
                let k1 = single_key(&desc, &d1);
                let k2 = single_key(&desc, &d2);
                // Encoded order may merge near-equal values but must never
                // reverse the semantic order.
                let semantic = cmp_values(&dec, &dbl);
                let encoded = k1.bytes.cmp(&k2.bytes);
                prop_assert!(encoded == semantic || encoded == Ordering::Equal);
            }
        }
    }
}
