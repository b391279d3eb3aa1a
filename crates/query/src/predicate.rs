//! Predicate documents and their parsed form
//!
//! A query predicate arrives as a document: `{path: literal}` equalities,
//! `{path: {$op: value, ...}}` operator documents, and `$and`/`$or`
//! combinators. [`Predicate::parse`] turns it into the AST the bounds
//! compiler, the matcher, and the planner share.

use rook_core::{Document, Error, Result, Value};
use std::fmt;

/// Comparison operators that bound a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    /// `$eq` / bare literal.
    Eq,
    /// `$ne` (residual-only; never drives bounds).
    Ne,
    /// `$lt`.
    Lt,
    /// `$lte`.
    Lte,
    /// `$gt`.
    Gt,
    /// `$gte`.
    Gte,
}

impl ComparisonOp {
    /// Wire spelling.
    pub fn name(&self) -> &'static str {
        match self {
            ComparisonOp::Eq => "$eq",
            ComparisonOp::Ne => "$ne",
            ComparisonOp::Lt => "$lt",
            ComparisonOp::Lte => "$lte",
            ComparisonOp::Gt => "$gt",
            ComparisonOp::Gte => "$gte",
        }
    }
}

/// Parsed predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every document.
    AlwaysTrue,
    /// Single comparison on a field path.
    Comparison {
        /// Dotted field path.
        path: String,
        /// Operator.
        op: ComparisonOp,
        /// Operand.
        value: Value,
    },
    /// `{path: {$in: [...]}}`.
    In {
        /// Dotted field path.
        path: String,
        /// Accepted values.
        values: Vec<Value>,
    },
    /// `{path: {$all: [...]}}`.
    All {
        /// Dotted field path.
        path: String,
        /// Values that must all be present.
        values: Vec<Value>,
    },
    /// `{path: {$regex: ...}}` or a regex literal.
    Regex {
        /// Dotted field path.
        path: String,
        /// Pattern source.
        pattern: String,
        /// Option flags (`i`, `m`, ...).
        options: String,
    },
    /// `{path: {$exists: bool}}`.
    Exists {
        /// Dotted field path.
        path: String,
        /// Whether the path must exist.
        yes: bool,
    },
    /// Conjunction.
    And(Vec<Predicate>),
    /// Disjunction.
    Or(Vec<Predicate>),
}

impl Predicate {
    /// Parse a predicate document.
    pub fn parse(query: &Document) -> Result<Predicate> {
        let mut clauses = Vec::new();
        for (name, value) in query.iter() {
            match name.as_str() {
                "$and" | "$or" => {
                    let Value::Array(subs) = value else {
                        return Err(Error::bad_value(format!("{} requires an array", name)));
                    };
                    let mut parsed = Vec::with_capacity(subs.len());
                    for sub in subs {
                        let Value::Document(d) = sub else {
                            return Err(Error::bad_value(format!(
                                "{} elements must be documents",
                                name
                            )));
                        };
                        parsed.push(Predicate::parse(d)?);
                    }
                    clauses.push(if name == "$and" {
                        Predicate::And(parsed)
                    } else {
                        Predicate::Or(parsed)
                    });
                }
                path if path.starts_with('$') => {
                    return Err(Error::bad_value(format!("unknown top-level operator {}", path)));
                }
                path => clauses.push(Self::parse_field(path, value)?),
            }
        }
        Ok(match clauses.len() {
            0 => Predicate::AlwaysTrue,
            1 => clauses.pop().expect("length checked"),
            _ => Predicate::And(clauses),
        })
    }

    fn parse_field(path: &str, value: &Value) -> Result<Predicate> {
        match value {
            Value::Regex(pattern, options) => Ok(Predicate::Regex {
                path: path.to_string(),
                pattern: pattern.clone(),
                options: options.clone(),
            }),
            Value::Document(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                let mut clauses = Vec::new();
                let mut regex_pattern: Option<String> = None;
                let mut regex_options = String::new();
                for (op, operand) in ops.iter() {
                    match op.as_str() {
                        "$eq" => clauses.push(Self::cmp(path, ComparisonOp::Eq, operand)),
                        "$ne" => clauses.push(Self::cmp(path, ComparisonOp::Ne, operand)),
                        "$lt" => clauses.push(Self::cmp(path, ComparisonOp::Lt, operand)),
                        "$lte" => clauses.push(Self::cmp(path, ComparisonOp::Lte, operand)),
                        "$gt" => clauses.push(Self::cmp(path, ComparisonOp::Gt, operand)),
                        "$gte" => clauses.push(Self::cmp(path, ComparisonOp::Gte, operand)),
                        "$in" => clauses.push(Predicate::In {
                            path: path.to_string(),
                            values: Self::array_operand(op, operand)?,
                        }),
                        "$all" => clauses.push(Predicate::All {
                            path: path.to_string(),
                            values: Self::array_operand(op, operand)?,
                        }),
                        "$exists" => clauses.push(Predicate::Exists {
                            path: path.to_string(),
                            yes: !matches!(
                                operand,
                                Value::Boolean(false) | Value::Int32(0) | Value::Int64(0)
                            ),
                        }),
                        "$regex" => match operand {
                            Value::String(p) => regex_pattern = Some(p.clone()),
                            Value::Regex(p, o) => {
                                regex_pattern = Some(p.clone());
                                regex_options = o.clone();
                            }
                            _ => {
                                return Err(Error::bad_value("$regex requires a string or regex"))
                            }
                        },
                        "$options" => match operand {
                            Value::String(o) => regex_options = o.clone(),
                            _ => return Err(Error::bad_value("$options requires a string")),
                        },
                        other => {
                            return Err(Error::bad_value(format!(
                                "unknown operator {} for field {}",
                                other, path
                            )))
                        }
                    }
                }
                if let Some(pattern) = regex_pattern {
                    clauses.push(Predicate::Regex {
                        path: path.to_string(),
                        pattern,
                        options: regex_options,
                    });
                }
                Ok(match clauses.len() {
                    0 => Predicate::AlwaysTrue,
                    1 => clauses.pop().expect("length checked"),
                    _ => Predicate::And(clauses),
                })
            }
            literal => Ok(Self::cmp(path, ComparisonOp::Eq, literal)),
        }
    }

    fn cmp(path: &str, op: ComparisonOp, value: &Value) -> Predicate {
        Predicate::Comparison {
            path: path.to_string(),
            op,
            value: value.clone(),
        }
    }

    fn array_operand(op: &str, operand: &Value) -> Result<Vec<Value>> {
        match operand {
            Value::Array(vs) => Ok(vs.clone()),
            _ => Err(Error::bad_value(format!("{} requires an array", op))),
        }
    }

    /// Top-level disjuncts: the branches of a root `$or`, else the whole
    /// predicate. The planner builds one subplan per disjunct.
    pub fn disjuncts(&self) -> Vec<&Predicate> {
        match self {
            Predicate::Or(subs) if !subs.is_empty() => subs.iter().collect(),
            other => vec![other],
        }
    }

    /// Walk the tree, visiting every node.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Predicate)) {
        f(self);
        match self {
            Predicate::And(subs) | Predicate::Or(subs) => {
                for s in subs {
                    s.visit(f);
                }
            }
            _ => {}
        }
    }

    /// Paths this predicate constrains anywhere in the tree.
    pub fn referenced_paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.visit(&mut |node| match node {
            Predicate::Comparison { path, .. }
            | Predicate::In { path, .. }
            | Predicate::All { path, .. }
            | Predicate::Regex { path, .. }
            | Predicate::Exists { path, .. } => out.push(path.as_str()),
            _ => {}
        });
        out.sort_unstable();
        out.dedup();
        out
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::AlwaysTrue => write!(f, "{{}}"),
            Predicate::Comparison { path, op, value } => {
                write!(f, "{{{}: {{{}: {}}}}}", path, op.name(), value)
            }
            Predicate::In { path, values } => {
                write!(f, "{{{}: {{$in: {} values}}}}", path, values.len())
            }
            Predicate::All { path, values } => {
                write!(f, "{{{}: {{$all: {} values}}}}", path, values.len())
            }
            Predicate::Regex { path, pattern, .. } => write!(f, "{{{}: /{}/}}", path, pattern),
            Predicate::Exists { path, yes } => write!(f, "{{{}: {{$exists: {}}}}}", path, yes),
            Predicate::And(subs) => write!(f, "$and({} clauses)", subs.len()),
            Predicate::Or(subs) => write!(f, "$or({} clauses)", subs.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rook_core::doc;

    #[test]
    fn bare_literal_is_equality() {
        let p = Predicate::parse(&doc! { "a": 5 }).unwrap();
        assert_eq!(
            p,
            Predicate::Comparison {
                path: "a".into(),
                op: ComparisonOp::Eq,
                value: Value::Int32(5),
            }
        );
    }

    #[test]
    fn operator_document_parses_to_conjunction() {
        let p = Predicate::parse(&doc! { "a": { "$gte": 5, "$lt": 10 } }).unwrap();
        match p {
            Predicate::And(subs) => {
                assert_eq!(subs.len(), 2);
                assert!(matches!(
                    &subs[0],
                    Predicate::Comparison { op: ComparisonOp::Gte, .. }
                ));
                assert!(matches!(
                    &subs[1],
                    Predicate::Comparison { op: ComparisonOp::Lt, .. }
                ));
            }
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn multiple_fields_conjoin() {
        let p = Predicate::parse(&doc! { "a": 1, "b": { "$gt": 2 } }).unwrap();
        assert!(matches!(p, Predicate::And(ref subs) if subs.len() == 2));
    }

    #[test]
    fn or_parses_and_exposes_disjuncts() {
        let p = Predicate::parse(&doc! {
            "$or": [ { "a": 1 }, { "b": 2 } ]
        })
        .unwrap();
        assert_eq!(p.disjuncts().len(), 2);
        // A non-or predicate is its own single disjunct.
        let q = Predicate::parse(&doc! { "a": 1 }).unwrap();
        assert_eq!(q.disjuncts().len(), 1);
    }

    #[test]
    fn regex_forms() {
        let p = Predicate::parse(&doc! { "name": { "$regex": "^ab", "$options": "i" } }).unwrap();
        assert_eq!(
            p,
            Predicate::Regex {
                path: "name".into(),
                pattern: "^ab".into(),
                options: "i".into(),
            }
        );
        let mut d = Document::new();
        d.push("name", Value::Regex("^cd".into(), "".into()));
        let p = Predicate::parse(&d).unwrap();
        assert!(matches!(p, Predicate::Regex { ref pattern, .. } if pattern == "^cd"));
    }

    #[test]
    fn document_literal_without_operators_is_equality() {
        let p = Predicate::parse(&doc! { "a": { "b": 1 } }).unwrap();
        assert!(matches!(
            p,
            Predicate::Comparison { op: ComparisonOp::Eq, ref value, .. }
                if matches!(value, Value::Document(_))
        ));
    }

    #[test]
    fn unknown_operator_is_rejected() {
        assert!(Predicate::parse(&doc! { "a": { "$frob": 1 } }).is_err());
        assert!(Predicate::parse(&doc! { "$nor": [] }).is_err());
        assert!(Predicate::parse(&doc! { "a": { "$in": 5 } }).is_err());
    }

    #[test]
    fn referenced_paths_dedup() {
        let p = Predicate::parse(&doc! {
            "$or": [ { "a": 1 }, { "a": 2, "b": 3 } ]
        })
        .unwrap();
        assert_eq!(p.referenced_paths(), vec!["a", "b"]);
    }

    #[test]
    fn empty_predicate_is_always_true() {
        assert_eq!(Predicate::parse(&doc! {}).unwrap(), Predicate::AlwaysTrue);
    }
}
