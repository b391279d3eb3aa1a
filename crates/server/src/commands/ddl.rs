//! Index DDL commands

use super::CommandRequest;
use crate::database::Database;
use rook_core::{Document, Error, OperationContext, Result, Value};
use rook_index::{Collation, IndexDescriptor, IndexVersion, KeyPattern};

pub(super) fn create_indexes(
    db: &Database,
    request: &CommandRequest,
    opctx: &OperationContext,
) -> Result<Document> {
    let ns = request.target_ns()?;
    let specs = request.docs_arg("indexes");
    if specs.is_empty() {
        return Err(Error::bad_value("createIndexes requires an indexes array"));
    }
    let before = db
        .catalog()
        .get(&ns)
        .map(|c| c.index_catalog().len())
        .unwrap_or(0);

    for spec in specs {
        let key = match spec.get("key") {
            Some(Value::Document(d)) => d.clone(),
            _ => return Err(Error::bad_value("index spec requires a key document")),
        };
        let key_pattern = KeyPattern::parse(&key)?;
        let name = match spec.get("name") {
            Some(Value::String(n)) => n.clone(),
            _ => default_index_name(&key),
        };
        let mut descriptor = IndexDescriptor::new(name, key_pattern)
            .unique(matches!(spec.get("unique"), Some(Value::Boolean(true))))
            .sparse(matches!(spec.get("sparse"), Some(Value::Boolean(true))));
        if let Some(v) = spec.get("v") {
            let raw = match v {
                Value::Int32(n) => *n as u8,
                Value::Int64(n) => *n as u8,
                _ => return Err(Error::bad_value("index version must be numeric")),
            };
            descriptor = descriptor.with_version(IndexVersion::from_u8(raw)?);
        }
        if let Some(Value::Document(collation)) = spec.get("collation") {
            descriptor = descriptor.with_collation(parse_collation(collation)?);
        }
        if let Some(Value::Document(filter)) = spec.get("partialFilterExpression") {
            descriptor = descriptor.with_partial_filter(filter.clone());
        }
        db.create_index(&ns, descriptor, opctx)?;
    }

    let after = db
        .catalog()
        .get(&ns)
        .map(|c| c.index_catalog().len())
        .unwrap_or(0);
    let mut out = Document::new();
    out.push("numIndexesBefore", Value::Int64(before as i64));
    out.push("numIndexesAfter", Value::Int64(after as i64));
    Ok(out)
}

fn default_index_name(key: &Document) -> String {
    key.iter()
        .map(|(path, v)| format!("{}_{}", path, v))
        .collect::<Vec<_>>()
        .join("_")
}

fn parse_collation(spec: &Document) -> Result<Collation> {
    match spec.get("locale") {
        Some(Value::String(locale)) if locale == "simple" => Ok(Collation::Simple),
        Some(Value::String(locale)) if locale == "case_insensitive" => {
            Ok(Collation::CaseInsensitive)
        }
        other => Err(Error::bad_value(format!(
            "unsupported collation locale {:?}",
            other
        ))),
    }
}

pub(super) fn drop_indexes(
    db: &Database,
    request: &CommandRequest,
    _opctx: &OperationContext,
) -> Result<Document> {
    let ns = request.target_ns()?;
    let name = match request.body.get("index") {
        Some(Value::String(n)) => n.clone(),
        _ => return Err(Error::bad_value("dropIndexes requires an index name")),
    };
    db.drop_index(&ns, &name)?;
    Ok(Document::new())
}
