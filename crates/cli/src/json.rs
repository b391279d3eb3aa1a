//! JSON ⇄ document conversion for the shell
//!
//! The interactive shell speaks JSON; the engine speaks documents. The
//! conversion is lossy only where JSON itself is (binary, timestamps and
//! regexes render as tagged objects).

use rook_core::{Document, Timestamp, Value};

/// Convert a parsed JSON value into an engine value.
pub fn json_to_value(v: &serde_json::Value) -> Value {
    match v {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i >= i32::MIN as i64 && i <= i32::MAX as i64 {
                    Value::Int32(i as i32)
                } else {
                    Value::Int64(i)
                }
            } else {
                Value::Double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => {
            Value::Array(items.iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(map) => {
            let mut d = Document::new();
            for (k, v) in map {
                d.push(k.clone(), json_to_value(v));
            }
            Value::Document(d)
        }
    }
}

/// Convert a JSON object into a document. Non-objects yield `None`.
pub fn json_to_document(v: &serde_json::Value) -> Option<Document> {
    match json_to_value(v) {
        Value::Document(d) => Some(d),
        _ => None,
    }
}

/// Render an engine value as JSON.
pub fn value_to_json(v: &Value) -> serde_json::Value {
    match v {
        Value::MinKey => serde_json::json!({ "$minKey": 1 }),
        Value::MaxKey => serde_json::json!({ "$maxKey": 1 }),
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Int32(n) => serde_json::json!(n),
        Value::Int64(n) => serde_json::json!(n),
        Value::Double(d) => serde_json::json!(d),
        Value::Decimal(d) => serde_json::json!({ "$decimal": d.to_string() }),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Document(d) => document_to_json(d),
        Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(value_to_json).collect())
        }
        Value::Binary(b) => serde_json::json!({ "$binary": { "len": b.len() } }),
        Value::ObjectId(oid) => serde_json::json!({ "$oid": oid.to_string() }),
        Value::DateTime(ms) => serde_json::json!({ "$date": ms }),
        Value::Timestamp(Timestamp { secs, increment }) => {
            serde_json::json!({ "$timestamp": { "t": secs, "i": increment } })
        }
        Value::Regex(pattern, options) => {
            serde_json::json!({ "$regex": pattern, "$options": options })
        }
    }
}

/// Render a document as JSON.
pub fn document_to_json(d: &Document) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (k, v) in d.iter() {
        map.insert(k.clone(), value_to_json(v));
    }
    serde_json::Value::Object(map)
}
