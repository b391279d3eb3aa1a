//! Ordered field-value documents
//!
//! A [`Document`] is an insertion-ordered sequence of `(name, Value)` pairs.
//! Field order is preserved and significant for comparison. Dotted-path
//! lookup descends through nested documents; array fan-out along a path is
//! the index layer's concern and lives with the key codec.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An ordered sequence of field-value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    fields: Vec<(String, Value)>,
}

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Number of top-level fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when the document has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Append a field. Duplicate names are allowed at this layer; writers
    /// deduplicate where the semantics require it.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Set a field, replacing the first existing field of the same name.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value;
        } else {
            self.fields.push((name.to_string(), value));
        }
    }

    /// Remove the first field with the given name, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(idx).1)
    }

    /// Look up a top-level field.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find_map(|(n, v)| if n == name { Some(v) } else { None })
    }

    /// Look up a dotted path (`"a.b.c"`), descending through nested
    /// documents. Returns `None` if any intermediate segment is missing or
    /// not a document.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        let mut segments = path.split('.').peekable();
        while let Some(seg) = segments.next() {
            let v = current.get(seg)?;
            if segments.peek().is_none() {
                return Some(v);
            }
            match v {
                Value::Document(d) => current = d,
                _ => return None,
            }
        }
        None
    }

    /// Iterate fields in document order.
    pub fn iter(&self) -> impl Iterator<Item = &(String, Value)> {
        self.fields.iter()
    }

    /// Field names in document order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    /// Rough in-memory footprint, used by memory accounting.
    pub fn approximate_size(&self) -> usize {
        let mut size = std::mem::size_of::<Self>();
        for (name, value) in &self.fields {
            size += name.len() + value_size(value);
        }
        size
    }
}

fn value_size(v: &Value) -> usize {
    std::mem::size_of::<Value>()
        + match v {
            Value::String(s) => s.len(),
            Value::Binary(b) => b.len(),
            Value::Regex(p, o) => p.len() + o.len(),
            Value::Document(d) => d.approximate_size(),
            Value::Array(vs) => vs.iter().map(value_size).sum(),
            _ => 0,
        }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", name, value)?;
        }
        write!(f, "}}")
    }
}

/// Build a [`Document`] literal.
///
/// ```
/// use rook_core::{doc, Value};
/// let d = doc! { "a": 1, "b": { "c": "x" } };
/// assert_eq!(d.get_path("b.c"), Some(&Value::String("x".into())));
/// ```
#[macro_export]
macro_rules! doc {
    () => { $crate::Document::new() };
    ($($name:tt : $value:tt),+ $(,)?) => {{
        let mut d = $crate::Document::new();
        $( d.push($name, $crate::doc_value!($value)); )+
        d
    }};
}

/// Build a [`Value::Array`] literal; companion to [`doc!`].
#[macro_export]
macro_rules! arr {
    ($($value:tt),* $(,)?) => {
        $crate::Value::Array(vec![ $( $crate::doc_value!($value) ),* ])
    };
}

/// Internal literal-to-`Value` conversion used by [`doc!`] and [`arr!`].
#[macro_export]
#[doc(hidden)]
macro_rules! doc_value {
    ({ $($name:tt : $value:tt),* $(,)? }) => {
        $crate::Value::Document($crate::doc! { $($name : $value),* })
    };
    ([ $($value:tt),* $(,)? ]) => {
        $crate::arr![ $($value),* ]
    };
    (null) => { $crate::Value::Null };
    ($other:expr) => { $crate::Value::from($other) };
}

#[cfg(test)]
mod tests {
    use crate::{arr, doc, Value};

    #[test]
    fn push_and_get_preserve_order() {
        let mut d = doc! { "b": 2, "a": 1 };
        d.push("c", 3i32);
        let keys: Vec<_> = d.keys().collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
        assert_eq!(d.get("a"), Some(&Value::Int32(1)));
        assert_eq!(d.get("missing"), None);
    }

    #[test]
    fn dotted_path_descends_documents() {
        let d = doc! { "a": { "b": { "c": 7 } } };
        assert_eq!(d.get_path("a.b.c"), Some(&Value::Int32(7)));
        assert_eq!(d.get_path("a.b"), Some(&Value::Document(doc! { "c": 7 })));
        assert_eq!(d.get_path("a.x.c"), None);
        assert_eq!(d.get_path("a.b.c.d"), None);
    }

    #[test]
    fn set_replaces_in_place() {
        let mut d = doc! { "a": 1, "b": 2 };
        d.set("a", 10i32);
        assert_eq!(d.get("a"), Some(&Value::Int32(10)));
        assert_eq!(d.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn array_literal() {
        let d = doc! { "tags": ["x", 1, null] };
        match d.get("tags") {
            Some(Value::Array(vs)) => {
                assert_eq!(vs.len(), 3);
                assert_eq!(vs[2], Value::Null);
            }
            other => panic!("expected array, got {:?}", other),
        }
        assert_eq!(arr![1, 2], Value::Array(vec![Value::Int32(1), Value::Int32(2)]));
    }

    #[test]
    fn display_is_readable() {
        let d = doc! { "a": 1, "s": "x" };
        assert_eq!(d.to_string(), "{a: 1, s: \"x\"}");
    }
}
