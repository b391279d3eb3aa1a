//! Candidate plan enumeration
//!
//! Given a canonical query and the collection's ready indexes, produce the
//! candidate plans the multi-planner trials:
//!
//! 1. one `IndexScan → [Fetch] → [Filter] → [Sort]` plan per index whose
//!    leading field the predicate constrains, with the sort omitted when
//!    the index order already provides it;
//! 2. a `CollScan → Filter → [Sort]` fallback, always;
//! 3. for a top-level `$or`, a record-id-deduplicating union of one
//!    subplan per disjunct.

use crate::field_bounds::{FieldBoundSet, QueryPattern};
use crate::plan::{PlanNode, QuerySolution, SortField, SortPattern};
use crate::predicate::{ComparisonOp, Predicate};
use rook_core::{Document, Result, Value};
use rook_index::{IndexDescriptor, IndexDirection};
use rook_storage::Direction;
use std::sync::Arc;
use tracing::debug;

/// What the planner needs to know about one index.
#[derive(Debug, Clone)]
pub struct IndexInfo {
    /// The definition.
    pub descriptor: Arc<IndexDescriptor>,
    /// Whether any document fanned out on an indexed path.
    pub multikey: bool,
}

/// A parsed, shape-stable query.
#[derive(Debug, Clone)]
pub struct CanonicalQuery {
    /// Filter predicate.
    pub predicate: Predicate,
    /// Requested sort.
    pub sort: SortPattern,
    /// Requested projection (empty document returns whole documents).
    pub projection: Document,
}

impl CanonicalQuery {
    /// Parse the find-shaped triple.
    pub fn parse(filter: &Document, sort: &Document, projection: &Document) -> Result<Self> {
        Ok(CanonicalQuery {
            predicate: Predicate::parse(filter)?,
            sort: SortPattern::parse(sort)?,
            projection: projection.clone(),
        })
    }

    /// Projection shape string for the cache key.
    pub fn projection_shape(&self) -> String {
        let mut names: Vec<&str> = self.projection.keys().collect();
        names.sort_unstable();
        format!("{{{}}}", names.join(","))
    }

    /// The plan-cache fingerprint of this query.
    pub fn cache_key(&self) -> QueryPattern {
        FieldBoundSet::build(&self.predicate, true)
            .pattern(&self.sort.shape(), &self.projection_shape())
    }
}

/// Enumerate candidate plans, fallback last.
pub fn enumerate_plans(query: &CanonicalQuery, indexes: &[IndexInfo]) -> Vec<QuerySolution> {
    let disjuncts = query.predicate.disjuncts();
    let mut solutions = Vec::new();

    if disjuncts.len() > 1 {
        if let Some(root) = or_plan(&disjuncts, indexes) {
            solutions.push(QuerySolution {
                root: finish(root, query, false),
            });
        }
    } else {
        for info in indexes {
            if let Some(solution) = index_plan(query, info) {
                solutions.push(solution);
            }
        }
    }

    solutions.push(QuerySolution {
        root: finish(collscan_plan(&query.predicate), query, false),
    });
    debug!(
        target: "rook::query",
        candidates = solutions.len(),
        "plan enumeration complete"
    );
    solutions
}

/// Re-create the winning plan shape for a cache hit: same index, same
/// direction, fresh bound values from the new predicate.
pub fn plan_from_cache(
    query: &CanonicalQuery,
    index_name: Option<&str>,
    indexes: &[IndexInfo],
) -> Option<QuerySolution> {
    match index_name {
        None => Some(QuerySolution {
            root: finish(collscan_plan(&query.predicate), query, false),
        }),
        Some(name) => {
            let info = indexes
                .iter()
                .find(|i| i.descriptor.name == name)?;
            index_plan(query, info)
        }
    }
}

fn collscan_plan(predicate: &Predicate) -> PlanNode {
    let scan = PlanNode::CollScan {
        direction: Direction::Forward,
    };
    if matches!(predicate, Predicate::AlwaysTrue) {
        scan
    } else {
        PlanNode::Filter {
            child: Box::new(scan),
            residual: predicate.clone(),
        }
    }
}

fn index_plan(query: &CanonicalQuery, info: &IndexInfo) -> Option<QuerySolution> {
    let descriptor = &info.descriptor;
    let pattern = &descriptor.key_pattern;
    // Hashed and partial indexes never enter plan selection here; partial
    // indexes would need a subsumption proof against the filter.
    if pattern.fields().iter().any(|f| !f.direction.is_ordered())
        || descriptor.partial_filter.is_some()
    {
        return None;
    }

    let bounds_set = FieldBoundSet::build(&query.predicate, !info.multikey);
    let leading = &pattern.fields()[0].path;
    if !bounds_set.get(leading).is_nontrivial() {
        return None;
    }

    let (direction, sort_provided) = sort_compatibility(&query.sort, descriptor);
    let bounds = bounds_set.index_bounds(pattern);

    let mut node = PlanNode::IndexScan {
        index_name: descriptor.name.clone(),
        key_pattern: pattern.clone(),
        bounds,
        direction,
    };

    let needs_residual = residual_needed(&query.predicate, info.multikey);
    let covered =
        projection_covered(&query.projection, descriptor, info.multikey) && !needs_residual;
    if !covered {
        node = PlanNode::Fetch {
            child: Box::new(node),
        };
    }
    if needs_residual {
        node = PlanNode::Filter {
            child: Box::new(node),
            residual: query.predicate.clone(),
        };
    }
    Some(QuerySolution {
        root: finish(node, query, sort_provided),
    })
}

fn or_plan(disjuncts: &[&Predicate], indexes: &[IndexInfo]) -> Option<PlanNode> {
    let mut children = Vec::with_capacity(disjuncts.len());
    for disjunct in disjuncts {
        let mut child = None;
        for info in indexes {
            let descriptor = &info.descriptor;
            if descriptor.partial_filter.is_some()
                || descriptor
                    .key_pattern
                    .fields()
                    .iter()
                    .any(|f| !f.direction.is_ordered())
            {
                continue;
            }
            let bounds_set = FieldBoundSet::build(disjunct, !info.multikey);
            if bounds_set.get(&descriptor.key_pattern.fields()[0].path).is_nontrivial() {
                let scan = PlanNode::IndexScan {
                    index_name: descriptor.name.clone(),
                    key_pattern: descriptor.key_pattern.clone(),
                    bounds: bounds_set.index_bounds(&descriptor.key_pattern),
                    direction: Direction::Forward,
                };
                child = Some(PlanNode::Filter {
                    child: Box::new(PlanNode::Fetch {
                        child: Box::new(scan),
                    }),
                    residual: (*disjunct).clone(),
                });
                break;
            }
        }
        children.push(child?);
    }
    Some(PlanNode::MergeDedup { children })
}

/// Add sort (when not provided by the scan order) and projection on top.
fn finish(mut node: PlanNode, query: &CanonicalQuery, sort_provided: bool) -> PlanNode {
    if !query.sort.is_empty() && !sort_provided {
        node = PlanNode::Sort {
            child: Box::new(node),
            pattern: query.sort.clone(),
            limit: None,
        };
    }
    if !query.projection.is_empty() {
        let covered = matches!(&node, PlanNode::IndexScan { .. });
        node = PlanNode::Projection {
            child: Box::new(node),
            spec: query.projection.clone(),
            covered,
        };
    }
    node
}

/// Can the index's order satisfy the sort, and in which scan direction?
fn sort_compatibility(sort: &SortPattern, descriptor: &IndexDescriptor) -> (Direction, bool) {
    if sort.is_empty() {
        return (Direction::Forward, true);
    }
    if sort.has_meta() || sort.fields.len() > descriptor.key_pattern.len() {
        return (Direction::Forward, false);
    }
    let mut forward_ok = true;
    let mut backward_ok = true;
    for (sf, kf) in sort.fields.iter().zip(descriptor.key_pattern.fields()) {
        let SortField::Path { path, ascending } = sf else {
            return (Direction::Forward, false);
        };
        if path != &kf.path {
            return (Direction::Forward, false);
        }
        let key_ascending = kf.direction == IndexDirection::Ascending;
        if *ascending == key_ascending {
            backward_ok = false;
        } else {
            forward_ok = false;
        }
    }
    if forward_ok {
        (Direction::Forward, true)
    } else if backward_ok {
        (Direction::Backward, true)
    } else {
        (Direction::Forward, false)
    }
}

/// Is the projection answerable from the index key alone?
fn projection_covered(projection: &Document, descriptor: &IndexDescriptor, multikey: bool) -> bool {
    if projection.is_empty() || multikey {
        return false;
    }
    // Inclusion-style projections only, and every included path (besides a
    // suppressed _id) must be an indexed field.
    let mut includes = Vec::new();
    for (path, v) in projection.iter() {
        match v {
            Value::Int32(0) | Value::Int64(0) | Value::Boolean(false) if path == "_id" => {}
            Value::Int32(1) | Value::Int64(1) | Value::Boolean(true) => includes.push(path),
            _ => return false,
        }
    }
    if includes.is_empty() {
        return false;
    }
    includes.iter().all(|p| {
        descriptor
            .key_pattern
            .fields()
            .iter()
            .any(|f| &f.path == *p)
    })
}

/// Does the plan still need the residual filter after the bounds?
fn residual_needed(predicate: &Predicate, multikey: bool) -> bool {
    if multikey {
        return true;
    }
    let mut needed = false;
    predicate.visit(&mut |node| match node {
        Predicate::AlwaysTrue | Predicate::And(_) => {}
        Predicate::Comparison { op, .. } => {
            if *op == ComparisonOp::Ne {
                needed = true;
            }
        }
        // Brackets over-approximate these; the filter decides.
        _ => needed = true,
    });
    needed
}

#[cfg(test)]
mod tests {
    use super::*;
    use rook_core::doc;
    use rook_index::KeyPattern;

    fn info(name: &str, spec: &Document) -> IndexInfo {
        IndexInfo {
            descriptor: Arc::new(IndexDescriptor::new(
                name,
                KeyPattern::parse(spec).unwrap(),
            )),
            multikey: false,
        }
    }

    fn query(filter: &Document, sort: &Document) -> CanonicalQuery {
        CanonicalQuery::parse(filter, sort, &doc! {}).unwrap()
    }

    #[test]
    fn relevant_index_produces_plan_plus_fallback() {
        let q = query(&doc! { "a": 1 }, &doc! {});
        let plans = enumerate_plans(&q, &[info("a_1", &doc! { "a": 1 })]);
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].root.index_name(), Some("a_1"));
        assert!(plans[1].root.index_name().is_none());
    }

    #[test]
    fn irrelevant_index_is_skipped() {
        let q = query(&doc! { "b": 1 }, &doc! {});
        let plans = enumerate_plans(&q, &[info("a_1", &doc! { "a": 1 })]);
        assert_eq!(plans.len(), 1);
    }

    #[test]
    fn equality_plan_needs_no_filter() {
        let q = query(&doc! { "a": 1, "b": { "$gte": 5 } }, &doc! {});
        let plans = enumerate_plans(&q, &[info("ab", &doc! { "a": 1, "b": 1 })]);
        let mut has_filter = false;
        plans[0].root.visit(&mut |n| {
            if matches!(n, PlanNode::Filter { .. }) {
                has_filter = true;
            }
        });
        assert!(!has_filter);
    }

    #[test]
    fn in_keeps_residual_filter() {
        let q = query(&doc! { "a": { "$in": [1, 5] } }, &doc! {});
        let plans = enumerate_plans(&q, &[info("a_1", &doc! { "a": 1 })]);
        let mut has_filter = false;
        plans[0].root.visit(&mut |n| {
            if matches!(n, PlanNode::Filter { .. }) {
                has_filter = true;
            }
        });
        assert!(has_filter);
    }

    #[test]
    fn index_satisfying_sort_omits_sort_stage() {
        let q = query(&doc! { "a": { "$gt": 0 } }, &doc! { "a": 1 });
        let plans = enumerate_plans(&q, &[info("a_1", &doc! { "a": 1 })]);
        assert!(!plans[0].root.has_blocking_sort());
        // The fallback collscan must sort.
        assert!(plans[1].root.has_blocking_sort());
    }

    #[test]
    fn inverted_sort_flips_scan_direction() {
        let q = query(&doc! { "a": { "$gt": 0 } }, &doc! { "a": (-1i32) });
        let plans = enumerate_plans(&q, &[info("a_1", &doc! { "a": 1 })]);
        let mut dir = None;
        plans[0].root.visit(&mut |n| {
            if let PlanNode::IndexScan { direction, .. } = n {
                dir = Some(*direction);
            }
        });
        assert_eq!(dir, Some(Direction::Backward));
        assert!(!plans[0].root.has_blocking_sort());
    }

    #[test]
    fn multikey_index_keeps_filter() {
        let q = query(&doc! { "a": 1 }, &doc! {});
        let mut mk = info("a_1", &doc! { "a": 1 });
        mk.multikey = true;
        let plans = enumerate_plans(&q, &[mk]);
        let mut has_filter = false;
        plans[0].root.visit(&mut |n| {
            if matches!(n, PlanNode::Filter { .. }) {
                has_filter = true;
            }
        });
        assert!(has_filter);
    }

    #[test]
    fn or_builds_merge_dedup_when_all_branches_indexed() {
        let q = query(&doc! { "$or": [ { "a": 1 }, { "b": 2 } ] }, &doc! {});
        let plans = enumerate_plans(
            &q,
            &[info("a_1", &doc! { "a": 1 }), info("b_1", &doc! { "b": 1 })],
        );
        assert_eq!(plans.len(), 2);
        assert!(matches!(
            plans[0].root,
            PlanNode::MergeDedup { ref children } if children.len() == 2
        ));
    }

    #[test]
    fn or_with_unindexed_branch_falls_back() {
        let q = query(&doc! { "$or": [ { "a": 1 }, { "z": 2 } ] }, &doc! {});
        let plans = enumerate_plans(&q, &[info("a_1", &doc! { "a": 1 })]);
        assert_eq!(plans.len(), 1);
        assert!(plans[0].root.index_name().is_none());
    }

    #[test]
    fn covered_projection_skips_fetch() {
        let q = CanonicalQuery::parse(
            &doc! { "a": 1 },
            &doc! {},
            &doc! { "a": 1, "_id": 0 },
        )
        .unwrap();
        let plans = enumerate_plans(&q, &[info("a_1", &doc! { "a": 1 })]);
        let mut has_fetch = false;
        plans[0].root.visit(&mut |n| {
            if matches!(n, PlanNode::Fetch { .. }) {
                has_fetch = true;
            }
        });
        assert!(!has_fetch);
    }

    #[test]
    fn cache_key_is_shape_stable() {
        let a = query(&doc! { "a": { "$gt": 5 }, "b": 1 }, &doc! { "c": 1 });
        let b = query(&doc! { "a": { "$gt": 99 }, "b": 2 }, &doc! { "c": 1 });
        let c = query(&doc! { "a": { "$gt": 5 }, "b": 1 }, &doc! { "c": (-1i32) });
        assert_eq!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), c.cache_key());
    }

    #[test]
    fn plan_from_cache_rebuilds_shape() {
        let q = query(&doc! { "a": 7 }, &doc! {});
        let indexes = [info("a_1", &doc! { "a": 1 })];
        let cached = plan_from_cache(&q, Some("a_1"), &indexes).unwrap();
        assert_eq!(cached.root.index_name(), Some("a_1"));
        // Dropped index: no plan.
        assert!(plan_from_cache(&q, Some("gone"), &indexes).is_none());
        // Collscan shape.
        let cs = plan_from_cache(&q, None, &indexes).unwrap();
        assert!(cs.root.index_name().is_none());
    }
}
