//! Index descriptors
//!
//! An [`IndexDescriptor`] is the catalog-level definition of one index: the
//! key pattern, the on-disk format version, and the option flags. It is pure
//! metadata; the runtime state (the tree, the multikey bits) lives in the
//! catalog entry.

use rook_core::{Document, Error, Result, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction or transform of one key-pattern field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexDirection {
    /// Ascending (`1`).
    Ascending,
    /// Descending (`-1`).
    Descending,
    /// Hashed (`"hashed"`): key holds a 64-bit hash of the value.
    Hashed,
}

impl IndexDirection {
    /// True for the two ordered directions.
    pub fn is_ordered(&self) -> bool {
        !matches!(self, IndexDirection::Hashed)
    }
}

/// One field of a key pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPatternField {
    /// Dotted field path.
    pub path: String,
    /// Direction or transform.
    pub direction: IndexDirection,
}

/// Ordered list of `(path, direction)` pairs defining the index key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPattern {
    fields: Vec<KeyPatternField>,
}

impl KeyPattern {
    /// Build from parts.
    pub fn new(fields: Vec<KeyPatternField>) -> Result<Self> {
        if fields.is_empty() {
            return Err(Error::bad_value("index key pattern must not be empty"));
        }
        Ok(Self { fields })
    }

    /// Parse the document form: `{ a: 1, b: -1, c: "hashed" }`.
    pub fn parse(spec: &Document) -> Result<Self> {
        let mut fields = Vec::with_capacity(spec.len());
        for (path, v) in spec.iter() {
            let direction = match v {
                Value::Int32(1) | Value::Int64(1) => IndexDirection::Ascending,
                Value::Int32(-1) | Value::Int64(-1) => IndexDirection::Descending,
                Value::Double(d) if *d == 1.0 => IndexDirection::Ascending,
                Value::Double(d) if *d == -1.0 => IndexDirection::Descending,
                Value::String(s) if s == "hashed" => IndexDirection::Hashed,
                other => {
                    return Err(Error::bad_value(format!(
                        "bad index key pattern element {}: {}",
                        path, other
                    )))
                }
            };
            fields.push(KeyPatternField {
                path: path.clone(),
                direction,
            });
        }
        Self::new(fields)
    }

    /// Fields in key order.
    pub fn fields(&self) -> &[KeyPatternField] {
        &self.fields
    }

    /// Number of key fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when the pattern has no fields (never, post-validation).
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The document form of the pattern.
    pub fn to_document(&self) -> Document {
        let mut d = Document::new();
        for f in &self.fields {
            match f.direction {
                IndexDirection::Ascending => d.push(f.path.clone(), 1i32),
                IndexDirection::Descending => d.push(f.path.clone(), -1i32),
                IndexDirection::Hashed => d.push(f.path.clone(), "hashed"),
            }
        }
        d
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_document())
    }
}

/// On-disk index entry format version.
///
/// `V0` stores bare key bytes; `V1` appends a typebits trailer recording the
/// original numeric variant of each field so covered reads round-trip exact
/// types. Everything else dispatches through the cursor factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexVersion {
    /// Legacy format, no typebits.
    V0,
    /// Current format with typebits trailer.
    V1,
}

impl IndexVersion {
    /// Parse the catalog byte. Unknown versions are a hard error so a
    /// downgraded binary never misreads newer entries.
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(IndexVersion::V0),
            1 => Ok(IndexVersion::V1),
            other => Err(Error::UnsupportedIndexVersion(other)),
        }
    }

    /// Catalog byte of this version.
    pub fn as_u8(&self) -> u8 {
        match self {
            IndexVersion::V0 => 0,
            IndexVersion::V1 => 1,
        }
    }
}

/// String collation applied to keys before encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Collation {
    /// Byte-wise comparison.
    #[default]
    Simple,
    /// Case-insensitive comparison (keys fold to lowercase).
    CaseInsensitive,
}

impl Collation {
    /// Collation-provided sort key for a string.
    pub fn sort_key(&self, s: &str) -> Vec<u8> {
        match self {
            Collation::Simple => s.as_bytes().to_vec(),
            Collation::CaseInsensitive => s.to_lowercase().into_bytes(),
        }
    }

    /// True for the simple (byte-wise) collation.
    pub fn is_simple(&self) -> bool {
        matches!(self, Collation::Simple)
    }
}

/// Catalog-level definition of one index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// Index name, unique within its collection.
    pub name: String,
    /// Key pattern.
    pub key_pattern: KeyPattern,
    /// On-disk format version.
    pub version: IndexVersion,
    /// Reject duplicate keys.
    pub unique: bool,
    /// Skip documents where every indexed field is missing.
    pub sparse: bool,
    /// Only index documents matching this predicate.
    pub partial_filter: Option<Document>,
    /// String collation.
    pub collation: Collation,
}

impl IndexDescriptor {
    /// Create a plain ascending/descending index descriptor with defaults.
    pub fn new(name: impl Into<String>, key_pattern: KeyPattern) -> Self {
        Self {
            name: name.into(),
            key_pattern,
            version: IndexVersion::V1,
            unique: false,
            sparse: false,
            partial_filter: None,
            collation: Collation::Simple,
        }
    }

    /// Builder-style uniqueness flag.
    pub fn unique(mut self, yes: bool) -> Self {
        self.unique = yes;
        self
    }

    /// Builder-style sparseness flag.
    pub fn sparse(mut self, yes: bool) -> Self {
        self.sparse = yes;
        self
    }

    /// Builder-style version override.
    pub fn with_version(mut self, version: IndexVersion) -> Self {
        self.version = version;
        self
    }

    /// Builder-style collation override.
    pub fn with_collation(mut self, collation: Collation) -> Self {
        self.collation = collation;
        self
    }

    /// Builder-style partial filter.
    pub fn with_partial_filter(mut self, filter: Document) -> Self {
        self.partial_filter = Some(filter);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rook_core::doc;

    #[test]
    fn parse_key_pattern_directions() {
        let kp = KeyPattern::parse(&doc! { "a": 1, "b": (-1i32), "c": "hashed" }).unwrap();
        assert_eq!(kp.len(), 3);
        assert_eq!(kp.fields()[0].direction, IndexDirection::Ascending);
        assert_eq!(kp.fields()[1].direction, IndexDirection::Descending);
        assert_eq!(kp.fields()[2].direction, IndexDirection::Hashed);
        assert_eq!(kp.to_document(), doc! { "a": 1, "b": (-1i32), "c": "hashed" });
    }

    #[test]
    fn parse_rejects_bad_elements() {
        assert!(KeyPattern::parse(&doc! { "a": 2 }).is_err());
        assert!(KeyPattern::parse(&doc! { "a": "text" }).is_err());
        assert!(KeyPattern::parse(&doc! {}).is_err());
    }

    #[test]
    fn version_byte_round_trip() {
        assert_eq!(IndexVersion::from_u8(0).unwrap(), IndexVersion::V0);
        assert_eq!(IndexVersion::from_u8(1).unwrap(), IndexVersion::V1);
        assert!(matches!(
            IndexVersion::from_u8(9),
            Err(Error::UnsupportedIndexVersion(9))
        ));
        assert_eq!(IndexVersion::V1.as_u8(), 1);
    }

    #[test]
    fn case_insensitive_collation_folds() {
        let c = Collation::CaseInsensitive;
        assert_eq!(c.sort_key("AbC"), b"abc".to_vec());
        assert!(!c.is_simple());
        assert!(Collation::Simple.is_simple());
    }
}
