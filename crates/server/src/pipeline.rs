//! Aggregation pipeline scheduling
//!
//! Translates a pipeline document into a stage tree: a leading `$match`
//! goes through the planner (so it can use indexes), every later stage
//! composes over the planned prefix. Expression compilation beyond stage
//! scheduling is out of scope; accumulator and group-key operands are
//! `"$path"` references.

use crate::database::Database;
use rook_core::{Document, Error, NamespaceString, OperationContext, Result, Value};
use rook_exec::stages::{
    AccumulatorOp, AccumulatorSpec, GroupStage, LimitStage, OutMode, OutStage, ProjectionStage,
    SkipStage, SortKeyGeneratorStage, SortStage,
};
use rook_exec::{Collection, MemoryTracker, PlanExecutor, Stage};
use rook_query::{CanonicalQuery, SortPattern};
use std::sync::Arc;

/// Execute the pipeline over `coll`; `$out` pipelines return no documents.
pub fn run_pipeline(
    db: &Database,
    coll: &Arc<Collection>,
    ns: &NamespaceString,
    stages: &[Value],
    opctx: &OperationContext,
) -> Result<Vec<Document>> {
    let mut specs = Vec::with_capacity(stages.len());
    for stage in stages {
        let Value::Document(doc) = stage else {
            return Err(Error::bad_value("pipeline stages must be documents"));
        };
        if doc.len() != 1 {
            return Err(Error::bad_value(
                "pipeline stage must have exactly one operator",
            ));
        }
        let (name, operand) = doc.iter().next().expect("length checked");
        specs.push((name.as_str(), operand));
    }

    // A leading $match plans with index support.
    let mut filter = Document::new();
    let mut rest = &specs[..];
    if let Some(&(name, operand)) = specs.first() {
        if name == "$match" {
            let Value::Document(m) = operand else {
                return Err(Error::bad_value("$match requires a document"));
            };
            filter = m.clone();
            rest = &specs[1..];
        }
    }

    let params = db.exec_params();
    let query = CanonicalQuery::parse(&filter, &Document::new(), &Document::new())?;
    let mut root: Box<dyn Stage> = rook_exec::plan_query(coll, &query, &params, opctx)?.into_root();
    let tracker = MemoryTracker::new(
        params.exec.sort_max_memory_bytes + params.exec.group_max_memory_bytes,
        params.allow_disk_use,
    );

    for (i, (name, operand)) in rest.iter().enumerate() {
        match *name {
            "$match" => {
                let Value::Document(m) = operand else {
                    return Err(Error::bad_value("$match requires a document"));
                };
                let predicate = rook_query::Predicate::parse(m)?;
                root = Box::new(rook_exec::stages::FilterStage::new(
                    root,
                    rook_query::Matcher::new(predicate)?,
                ));
            }
            "$sort" => {
                let Value::Document(s) = operand else {
                    return Err(Error::bad_value("$sort requires a document"));
                };
                let pattern = SortPattern::parse(s)?;
                root = Box::new(SortKeyGeneratorStage::new(root, pattern.clone()));
                root = Box::new(SortStage::new(
                    root,
                    pattern,
                    tracker.scoped(format!("sort[{}]", i)),
                    params.exec.sort_max_memory_bytes,
                    None,
                ));
            }
            "$limit" => root = Box::new(LimitStage::new(root, numeric_operand(operand, "$limit")?)),
            "$skip" => root = Box::new(SkipStage::new(root, numeric_operand(operand, "$skip")?)),
            "$group" => {
                let Value::Document(g) = operand else {
                    return Err(Error::bad_value("$group requires a document"));
                };
                let (key_paths, accumulators) = parse_group(g)?;
                root = Box::new(GroupStage::new(
                    root,
                    key_paths,
                    accumulators,
                    tracker.scoped(format!("group[{}]", i)),
                    params.exec.group_max_memory_bytes,
                ));
            }
            "$project" => {
                let Value::Document(p) = operand else {
                    return Err(Error::bad_value("$project requires a document"));
                };
                root = Box::new(ProjectionStage::new(root, p.clone()));
            }
            "$out" => {
                if i + 1 != rest.len() {
                    return Err(Error::bad_value("$out must be the last pipeline stage"));
                }
                let (target, mode) = parse_out(operand, ns)?;
                let target_coll = db.catalog().get_or_create(&target)?;
                let mut stage =
                    OutStage::new(root, target_coll, db.write_path().clone(), mode);
                drive_to_eof(&mut stage, opctx)?;
                return Ok(Vec::new());
            }
            other => {
                return Err(Error::bad_value(format!(
                    "unsupported pipeline stage {}",
                    other
                )))
            }
        }
    }

    let mut executor = PlanExecutor::from_root(root, coll, &params);
    executor.collect(opctx)
}

/// Drive a terminal write stage to completion.
fn drive_to_eof(stage: &mut dyn Stage, opctx: &OperationContext) -> Result<()> {
    loop {
        if let rook_exec::WorkResult::Eof = stage.work(opctx)? {
            return Ok(());
        }
    }
}

fn numeric_operand(v: &Value, stage: &str) -> Result<u64> {
    match v {
        Value::Int32(n) if *n >= 0 => Ok(*n as u64),
        Value::Int64(n) if *n >= 0 => Ok(*n as u64),
        _ => Err(Error::bad_value(format!(
            "{} requires a non-negative integer",
            stage
        ))),
    }
}

/// `"$path"` → `path`.
fn path_operand(v: &Value, context: &str) -> Result<String> {
    match v {
        Value::String(s) if s.starts_with('$') => Ok(s[1..].to_string()),
        _ => Err(Error::bad_value(format!(
            "{} requires a \"$field\" path reference",
            context
        ))),
    }
}

type GroupParts = (Vec<(String, String)>, Vec<AccumulatorSpec>);

fn parse_group(spec: &Document) -> Result<GroupParts> {
    let mut key_paths = Vec::new();
    let mut accumulators = Vec::new();
    for (name, operand) in spec.iter() {
        if name == "_id" {
            match operand {
                Value::Null => {}
                Value::String(_) => {
                    key_paths.push(("_id".to_string(), path_operand(operand, "$group _id")?));
                }
                Value::Document(keys) => {
                    for (out, key) in keys.iter() {
                        key_paths
                            .push((out.clone(), path_operand(key, "$group _id component")?));
                    }
                }
                _ => return Err(Error::bad_value("$group _id must be null, a path, or a document")),
            }
            continue;
        }
        let Value::Document(acc) = operand else {
            return Err(Error::bad_value(format!(
                "accumulator {} must be a document",
                name
            )));
        };
        if acc.len() != 1 {
            return Err(Error::bad_value(format!(
                "accumulator {} must have exactly one operator",
                name
            )));
        }
        let (op_name, path) = acc.iter().next().expect("length checked");
        let op = match op_name.as_str() {
            "$sum" => AccumulatorOp::Sum,
            "$min" => AccumulatorOp::Min,
            "$max" => AccumulatorOp::Max,
            "$first" => AccumulatorOp::First,
            "$last" => AccumulatorOp::Last,
            "$push" => AccumulatorOp::Push,
            "$addToSet" => AccumulatorOp::AddToSet,
            other => {
                return Err(Error::bad_value(format!(
                    "unsupported accumulator {}",
                    other
                )))
            }
        };
        accumulators.push(AccumulatorSpec {
            out: name.clone(),
            op,
            path: path_operand(path, op_name)?,
        });
    }
    Ok((key_paths, accumulators))
}

fn parse_out(operand: &Value, ns: &NamespaceString) -> Result<(NamespaceString, OutMode)> {
    match operand {
        Value::String(coll) => Ok((
            NamespaceString::new(ns.db.clone(), coll.clone())?,
            OutMode::ReplaceCollection,
        )),
        Value::Document(spec) => {
            let Some(Value::String(coll)) = spec.get("to") else {
                return Err(Error::bad_value("$out document form needs a 'to' collection"));
            };
            let mode = match spec.get("mode") {
                None => OutMode::ReplaceCollection,
                Some(Value::String(m)) if m == "replaceCollection" => OutMode::ReplaceCollection,
                Some(Value::String(m)) if m == "insertDocuments" => OutMode::InsertDocuments,
                Some(other) => {
                    return Err(Error::bad_value(format!("bad $out mode {}", other)))
                }
            };
            Ok((NamespaceString::new(ns.db.clone(), coll.clone())?, mode))
        }
        _ => Err(Error::bad_value("$out requires a collection name or document")),
    }
}
