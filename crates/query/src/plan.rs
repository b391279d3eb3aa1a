//! Query plan intermediate representation
//!
//! A plan is a tree of [`PlanNode`]s, one variant per stage kind, walked by
//! visitors. The executor lowers a chosen plan into its stage tree; the
//! cache stores the shape (index choice and direction) without bound
//! values.

use crate::predicate::Predicate;
use rook_core::{Document, Error, Result, Value};
use rook_index::{IndexBounds, KeyPattern};
use rook_storage::Direction;
use std::fmt;

/// One field of a sort specification.
#[derive(Debug, Clone, PartialEq)]
pub enum SortField {
    /// Sort by a document path.
    Path {
        /// Dotted path.
        path: String,
        /// Ascending or descending.
        ascending: bool,
    },
    /// Sort by text-score metadata attached upstream.
    MetaTextScore,
    /// Sort by the random-value metadata attached upstream.
    MetaRandVal,
}

/// Parsed sort specification.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SortPattern {
    /// Fields in significance order.
    pub fields: Vec<SortField>,
}

impl SortPattern {
    /// Parse `{a: 1, b: -1, score: {$meta: "textScore"}}`.
    pub fn parse(spec: &Document) -> Result<SortPattern> {
        let mut fields = Vec::with_capacity(spec.len());
        for (path, v) in spec.iter() {
            let field = match v {
                Value::Int32(1) | Value::Int64(1) => SortField::Path {
                    path: path.clone(),
                    ascending: true,
                },
                Value::Int32(-1) | Value::Int64(-1) => SortField::Path {
                    path: path.clone(),
                    ascending: false,
                },
                Value::Double(d) if *d == 1.0 || *d == -1.0 => SortField::Path {
                    path: path.clone(),
                    ascending: *d == 1.0,
                },
                Value::Document(meta) => match meta.get("$meta") {
                    Some(Value::String(s)) if s == "textScore" => SortField::MetaTextScore,
                    Some(Value::String(s)) if s == "randVal" => SortField::MetaRandVal,
                    _ => {
                        return Err(Error::bad_value(format!(
                            "bad $meta sort for field {}",
                            path
                        )))
                    }
                },
                other => {
                    return Err(Error::bad_value(format!(
                        "bad sort element {}: {}",
                        path, other
                    )))
                }
            };
            fields.push(field);
        }
        Ok(SortPattern { fields })
    }

    /// No sort requested.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Canonical shape string for cache keys.
    pub fn shape(&self) -> String {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|f| match f {
                SortField::Path { path, ascending } => {
                    format!("{}:{}", path, if *ascending { 1 } else { -1 })
                }
                SortField::MetaTextScore => "$textScore".to_string(),
                SortField::MetaRandVal => "$randVal".to_string(),
            })
            .collect();
        format!("{{{}}}", parts.join(","))
    }

    /// True when any field sorts on metadata.
    pub fn has_meta(&self) -> bool {
        self.fields
            .iter()
            .any(|f| !matches!(f, SortField::Path { .. }))
    }
}

/// One node of a plan tree.
#[derive(Debug, Clone)]
pub enum PlanNode {
    /// Scan the record store in storage order.
    CollScan {
        /// Scan direction.
        direction: Direction,
    },
    /// Scan one index through an interval vector.
    IndexScan {
        /// Index name.
        index_name: String,
        /// The index's key pattern.
        key_pattern: KeyPattern,
        /// Interval vector to scan.
        bounds: IndexBounds,
        /// Scan direction.
        direction: Direction,
    },
    /// Load the document for each record id produced below.
    Fetch {
        /// Input node.
        child: Box<PlanNode>,
    },
    /// Drop documents failing the residual predicate.
    Filter {
        /// Input node.
        child: Box<PlanNode>,
        /// Residual predicate.
        residual: Predicate,
    },
    /// Blocking sort of the child's output.
    Sort {
        /// Input node.
        child: Box<PlanNode>,
        /// Sort specification.
        pattern: SortPattern,
        /// Optional bound used for top-k.
        limit: Option<u64>,
    },
    /// Skip the first `n` results.
    Skip {
        /// Input node.
        child: Box<PlanNode>,
        /// Results to drop.
        n: u64,
    },
    /// Stop after `n` results.
    Limit {
        /// Input node.
        child: Box<PlanNode>,
        /// Results to emit.
        n: u64,
    },
    /// Shape-transform the output documents.
    Projection {
        /// Input node.
        child: Box<PlanNode>,
        /// Projection specification.
        spec: Document,
        /// Whether the index key alone can satisfy the projection.
        covered: bool,
    },
    /// Union of subplans deduplicated by record id (one per `$or` branch).
    MergeDedup {
        /// One subplan per disjunct.
        children: Vec<PlanNode>,
    },
}

impl PlanNode {
    /// Child nodes.
    pub fn children(&self) -> Vec<&PlanNode> {
        match self {
            PlanNode::CollScan { .. } | PlanNode::IndexScan { .. } => Vec::new(),
            PlanNode::Fetch { child }
            | PlanNode::Filter { child, .. }
            | PlanNode::Sort { child, .. }
            | PlanNode::Skip { child, .. }
            | PlanNode::Limit { child, .. }
            | PlanNode::Projection { child, .. } => vec![child],
            PlanNode::MergeDedup { children } => children.iter().collect(),
        }
    }

    /// Pre-order walk.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a PlanNode)) {
        f(self);
        for c in self.children() {
            c.visit(f);
        }
    }

    /// Does the tree contain a blocking sort?
    pub fn has_blocking_sort(&self) -> bool {
        let mut found = false;
        self.visit(&mut |n| {
            if matches!(n, PlanNode::Sort { .. }) {
                found = true;
            }
        });
        found
    }

    /// Name of the index the tree scans, if any.
    pub fn index_name(&self) -> Option<&str> {
        let mut name = None;
        self.visit(&mut |n| {
            if let PlanNode::IndexScan { index_name, .. } = n {
                name.get_or_insert(index_name.as_str());
            }
        });
        name
    }

    /// Packed bounds score of the tree's index scan, zero without one.
    pub fn bounds_score(&self) -> u64 {
        let mut score = 0u64;
        self.visit(&mut |n| {
            if let PlanNode::IndexScan { bounds, .. } = n {
                score = score.max(bounds.packed_score());
            }
        });
        score
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        match self {
            PlanNode::CollScan { direction } => format!("COLLSCAN({:?})", direction),
            PlanNode::IndexScan { index_name, .. } => format!("IXSCAN({})", index_name),
            PlanNode::Fetch { child } => format!("FETCH<-{}", child.summary()),
            PlanNode::Filter { child, .. } => format!("FILTER<-{}", child.summary()),
            PlanNode::Sort { child, .. } => format!("SORT<-{}", child.summary()),
            PlanNode::Skip { child, n } => format!("SKIP({})<-{}", n, child.summary()),
            PlanNode::Limit { child, n } => format!("LIMIT({})<-{}", n, child.summary()),
            PlanNode::Projection { child, covered, .. } => {
                if *covered {
                    format!("PROJ_COVERED<-{}", child.summary())
                } else {
                    format!("PROJ<-{}", child.summary())
                }
            }
            PlanNode::MergeDedup { children } => format!("OR({} branches)", children.len()),
        }
    }
}

impl fmt::Display for PlanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}

/// A fully-formed candidate plan.
#[derive(Debug, Clone)]
pub struct QuerySolution {
    /// Root of the plan tree.
    pub root: PlanNode,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rook_core::doc;

    #[test]
    fn sort_pattern_parses_and_shapes() {
        let sp = SortPattern::parse(&doc! { "a": 1, "b": (-1i32) }).unwrap();
        assert_eq!(sp.fields.len(), 2);
        assert_eq!(sp.shape(), "{a:1,b:-1}");
        assert!(!sp.has_meta());

        let sp = SortPattern::parse(&doc! { "score": { "$meta": "textScore" } }).unwrap();
        assert!(sp.has_meta());
        assert_eq!(sp.shape(), "{$textScore}");

        assert!(SortPattern::parse(&doc! { "a": 2 }).is_err());
        assert!(SortPattern::parse(&doc! { "a": { "$meta": "bogus" } }).is_err());
    }

    #[test]
    fn visitors_find_structure() {
        let plan = PlanNode::Limit {
            n: 5,
            child: Box::new(PlanNode::Sort {
                pattern: SortPattern::default(),
                limit: None,
                child: Box::new(PlanNode::Fetch {
                    child: Box::new(PlanNode::IndexScan {
                        index_name: "a_1".into(),
                        key_pattern: KeyPattern::parse(&doc! { "a": 1 }).unwrap(),
                        bounds: IndexBounds::full(1),
                        direction: Direction::Forward,
                    }),
                }),
            }),
        };
        assert!(plan.has_blocking_sort());
        assert_eq!(plan.index_name(), Some("a_1"));
        let mut count = 0;
        plan.visit(&mut |_| count += 1);
        assert_eq!(count, 4);
        assert!(plan.summary().contains("IXSCAN"));
    }
}
