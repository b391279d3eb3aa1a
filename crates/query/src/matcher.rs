//! Residual predicate evaluation
//!
//! The matcher evaluates the full predicate against a document. Array
//! semantics follow the storage model: a constraint on a path matches when
//! the value at the path satisfies it, or when the path holds an array any
//! of whose elements satisfies it. Ordered comparisons only apply within
//! the operand's type bracket.

use crate::predicate::{ComparisonOp, Predicate};
use regex::Regex;
use rook_core::{cmp_values, Document, Error, Result, Value};
use rustc_hash::FxHashMap;
use std::cmp::Ordering;

/// A compiled, reusable matcher for one predicate.
pub struct Matcher {
    predicate: Predicate,
    regexes: FxHashMap<(String, String), Regex>,
}

impl Matcher {
    /// Compile the predicate (regexes are built once, up front).
    pub fn new(predicate: Predicate) -> Result<Matcher> {
        let mut regexes = FxHashMap::default();
        let mut compile_err = None;
        predicate.visit(&mut |node| {
            if let Predicate::Regex {
                pattern, options, ..
            } = node
            {
                let key = (pattern.clone(), options.clone());
                if !regexes.contains_key(&key) {
                    match regex::RegexBuilder::new(pattern)
                        .case_insensitive(options.contains('i'))
                        .multi_line(options.contains('m'))
                        .dot_matches_new_line(options.contains('s'))
                        .build()
                    {
                        Ok(re) => {
                            regexes.insert(key, re);
                        }
                        Err(e) => compile_err = Some(Error::bad_value(format!(
                            "invalid regex /{}/{}: {}",
                            pattern, options, e
                        ))),
                    }
                }
            }
        });
        if let Some(e) = compile_err {
            return Err(e);
        }
        Ok(Matcher { predicate, regexes })
    }

    /// The predicate being evaluated.
    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    /// Does `doc` satisfy the predicate?
    pub fn matches(&self, doc: &Document) -> bool {
        self.eval(&self.predicate, doc)
    }

    fn eval(&self, pred: &Predicate, doc: &Document) -> bool {
        match pred {
            Predicate::AlwaysTrue => true,
            Predicate::And(subs) => subs.iter().all(|s| self.eval(s, doc)),
            Predicate::Or(subs) => subs.iter().any(|s| self.eval(s, doc)),
            Predicate::Comparison { path, op, value } => {
                let lookup = lookup(doc, path);
                match op {
                    ComparisonOp::Eq => eq_matches(&lookup, value),
                    ComparisonOp::Ne => !eq_matches(&lookup, value),
                    ComparisonOp::Lt => ordered_matches(&lookup, value, Ordering::Less, false),
                    ComparisonOp::Lte => ordered_matches(&lookup, value, Ordering::Less, true),
                    ComparisonOp::Gt => ordered_matches(&lookup, value, Ordering::Greater, false),
                    ComparisonOp::Gte => ordered_matches(&lookup, value, Ordering::Greater, true),
                }
            }
            Predicate::In { path, values } => {
                let lookup = lookup(doc, path);
                values.iter().any(|v| eq_matches(&lookup, v))
            }
            Predicate::All { path, values } => {
                let lookup = lookup(doc, path);
                values.iter().all(|v| {
                    lookup
                        .candidates
                        .iter()
                        .any(|c| cmp_values(c, v) == Ordering::Equal)
                })
            }
            Predicate::Regex { path, pattern, options } => {
                let Some(re) = self.regexes.get(&(pattern.clone(), options.clone())) else {
                    return false;
                };
                lookup(doc, path)
                    .candidates
                    .iter()
                    .any(|c| matches!(c, Value::String(s) if re.is_match(s)))
            }
            Predicate::Exists { path, yes } => lookup(doc, path).exists == *yes,
        }
    }
}

/// Values a path constraint tests against: the value itself plus, when it
/// is an array, each element.
struct Lookup {
    candidates: Vec<Value>,
    exists: bool,
}

fn lookup(doc: &Document, path: &str) -> Lookup {
    let mut docs: Vec<&Document> = vec![doc];
    let segments: Vec<&str> = path.split('.').collect();
    let mut found: Vec<&Value> = Vec::new();

    for (si, seg) in segments.iter().enumerate() {
        found.clear();
        for d in &docs {
            if let Some(v) = d.get(seg) {
                found.push(v);
            }
        }
        if si + 1 == segments.len() {
            break;
        }
        let mut next: Vec<&Document> = Vec::new();
        for v in &found {
            match v {
                Value::Document(d) => next.push(d),
                Value::Array(elems) => {
                    for e in elems {
                        if let Value::Document(d) = e {
                            next.push(d);
                        }
                    }
                }
                _ => {}
            }
        }
        docs = next;
    }

    let exists = !found.is_empty();
    let mut candidates = Vec::new();
    for v in found {
        candidates.push(v.clone());
        if let Value::Array(elems) = v {
            candidates.extend(elems.iter().cloned());
        }
    }
    Lookup { candidates, exists }
}

fn eq_matches(lookup: &Lookup, operand: &Value) -> bool {
    if matches!(operand, Value::Null) && !lookup.exists {
        // Equality with null matches a missing path.
        return true;
    }
    lookup
        .candidates
        .iter()
        .any(|c| cmp_values(c, operand) == Ordering::Equal)
}

fn ordered_matches(lookup: &Lookup, operand: &Value, want: Ordering, or_equal: bool) -> bool {
    let bracket = operand.type_rank();
    lookup.candidates.iter().any(|c| {
        if c.type_rank() != bracket {
            return false;
        }
        let ord = cmp_values(c, operand);
        ord == want || (or_equal && ord == Ordering::Equal)
    })
}
