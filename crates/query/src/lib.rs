//! Query layer: predicates, bounds compilation, planning, and the plan cache
//!
//! - [`predicate`]: the parsed predicate AST shared by everything below
//! - [`field_bounds`]: predicate → per-field ranges + shape fingerprint
//! - [`matcher`]: residual predicate evaluation over documents
//! - [`plan`] / [`planner`]: the plan IR and candidate enumeration
//! - [`ranker`]: lock-step trial scoring
//! - [`plan_cache`]: budgeted LRU from shape to winning plan

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod field_bounds;
pub mod matcher;
pub mod plan;
pub mod plan_cache;
pub mod planner;
pub mod predicate;
pub mod ranker;

pub use field_bounds::{BoundKind, FieldBound, FieldBoundSet, QueryPattern};
pub use matcher::Matcher;
pub use plan::{PlanNode, QuerySolution, SortField, SortPattern};
pub use plan_cache::{CachedPlan, PlanCache};
pub use planner::{enumerate_plans, plan_from_cache, CanonicalQuery, IndexInfo};
pub use predicate::{ComparisonOp, Predicate};
pub use ranker::{pick_winner, CandidatePerf};
