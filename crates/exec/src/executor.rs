//! Plan execution
//!
//! Lowers a chosen plan tree into stages, runs the multi-plan trial when
//! the cache has no answer, and drives the winning tree through a
//! pull-based executor with cooperative yielding.

use crate::collection::Collection;
use crate::memory_tracker::MemoryTracker;
use crate::stage::{Stage, StatsNode, WorkResult, WsMember};
use crate::stages::{
    CollectionScanStage, FetchStage, FilterStage, IndexScanStage, LimitStage, OrStage,
    ProjectionStage, SkipStage, SortKeyGeneratorStage, SortStage,
};
use crate::yield_policy::{ElapsedTracker, YieldPolicy};
use rook_core::{
    Document, Error, ExecKnobs, OperationContext, QueryKnobs, Result, YieldKnobs,
};
use rook_index::{BoundsChecker, BtreeCursor};
use rook_query::{
    enumerate_plans, pick_winner, plan_from_cache, CachedPlan, CandidatePerf, CanonicalQuery,
    Matcher, PlanNode, QuerySolution,
};
use rook_storage::Direction;
use std::sync::Arc;
use tracing::debug;

/// Everything stage construction needs.
pub struct ExecParams {
    /// Execution knobs (budgets).
    pub exec: ExecKnobs,
    /// Planner knobs (trial budget, cache sizing).
    pub query: QueryKnobs,
    /// Yield cadence.
    pub yielding: YieldKnobs,
    /// Declared yield policy.
    pub policy: YieldPolicy,
    /// May blocking stages spill to disk.
    pub allow_disk_use: bool,
}

impl Default for ExecParams {
    fn default() -> Self {
        Self {
            exec: ExecKnobs::default(),
            query: QueryKnobs::default(),
            yielding: YieldKnobs::default(),
            policy: YieldPolicy::YieldAuto,
            allow_disk_use: true,
        }
    }
}

/// Lower a plan tree into its stage tree.
pub fn build_stages(
    plan: &PlanNode,
    coll: &Arc<Collection>,
    params: &ExecParams,
    tracker: &MemoryTracker,
    opctx: &OperationContext,
) -> Result<Box<dyn Stage>> {
    Ok(match plan {
        PlanNode::CollScan { direction } => {
            Box::new(CollectionScanStage::new(coll.record_store(), *direction))
        }
        PlanNode::IndexScan {
            index_name,
            key_pattern,
            bounds,
            direction,
        } => {
            let entry = coll
                .index_catalog()
                .find(index_name)
                .ok_or_else(|| Error::IndexNotFound(index_name.clone()))?;
            let checker = BoundsChecker::new(bounds.clone(), *direction);
            let cursor = BtreeCursor::open_with_bounds(
                entry.tree().clone(),
                entry.descriptor().clone(),
                checker,
                opctx,
            )?;
            Box::new(IndexScanStage::new(
                cursor,
                key_pattern.clone(),
                entry.is_multikey(),
            ))
        }
        PlanNode::Fetch { child } => Box::new(FetchStage::new(
            build_stages(child, coll, params, tracker, opctx)?,
            coll.record_store().clone(),
        )),
        PlanNode::Filter { child, residual } => Box::new(FilterStage::new(
            build_stages(child, coll, params, tracker, opctx)?,
            Matcher::new(residual.clone())?,
        )),
        PlanNode::Sort {
            child,
            pattern,
            limit,
        } => {
            let inner = build_stages(child, coll, params, tracker, opctx)?;
            let keyed = Box::new(SortKeyGeneratorStage::new(inner, pattern.clone()));
            Box::new(SortStage::new(
                keyed,
                pattern.clone(),
                tracker.scoped("sort"),
                params.exec.sort_max_memory_bytes,
                *limit,
            ))
        }
        PlanNode::Skip { child, n } => Box::new(SkipStage::new(
            build_stages(child, coll, params, tracker, opctx)?,
            *n,
        )),
        PlanNode::Limit { child, n } => Box::new(LimitStage::new(
            build_stages(child, coll, params, tracker, opctx)?,
            *n,
        )),
        PlanNode::Projection {
            child,
            spec,
            covered,
        } => {
            let inner = build_stages(child, coll, params, tracker, opctx)?;
            if *covered {
                Box::new(ProjectionStage::new_covered(inner, spec.clone()))
            } else {
                Box::new(ProjectionStage::new(inner, spec.clone()))
            }
        }
        PlanNode::MergeDedup { children } => {
            let mut stages = Vec::with_capacity(children.len());
            for c in children {
                stages.push(build_stages(c, coll, params, tracker, opctx)?);
            }
            Box::new(OrStage::new(stages))
        }
    })
}

/// A runnable, yielding plan.
pub struct PlanExecutor {
    root: Box<dyn Stage>,
    coll: Arc<Collection>,
    catalog_generation: u64,
    policy: YieldPolicy,
    elapsed: ElapsedTracker,
    summary: String,
    from_cache: bool,
}

impl PlanExecutor {
    /// Wrap an externally assembled stage tree (aggregation pipelines
    /// compose extra stages over a planned prefix).
    pub fn from_root(root: Box<dyn Stage>, coll: &Arc<Collection>, params: &ExecParams) -> Self {
        PlanExecutor {
            root,
            coll: coll.clone(),
            catalog_generation: coll.catalog_generation(),
            policy: params.policy,
            elapsed: ElapsedTracker::new(&params.yielding),
            summary: "PIPELINE".to_string(),
            from_cache: false,
        }
    }

    /// Give up the stage tree for further composition.
    pub fn into_root(self) -> Box<dyn Stage> {
        self.root
    }

    /// Pull the next result document.
    pub fn next(&mut self, opctx: &OperationContext) -> Result<Option<Document>> {
        loop {
            if self.elapsed.tick() {
                self.yield_or_interrupt(opctx)?;
            }
            match self.root.work(opctx)? {
                WorkResult::Advanced(member) => return Ok(Some(materialize(member)?)),
                WorkResult::Paused => continue,
                WorkResult::Eof => return Ok(None),
            }
        }
    }

    /// Drain everything.
    pub fn collect(&mut self, opctx: &OperationContext) -> Result<Vec<Document>> {
        let mut out = Vec::new();
        while let Some(doc) = self.next(opctx)? {
            out.push(doc);
        }
        Ok(out)
    }

    fn yield_or_interrupt(&mut self, opctx: &OperationContext) -> Result<()> {
        self.elapsed.reset();
        opctx.check_for_interrupt()?;
        match self.policy {
            YieldPolicy::NoYield
            | YieldPolicy::InterruptOnly
            | YieldPolicy::WriteConflictRetryOnly => Ok(()),
            YieldPolicy::AlwaysTimeOut => Err(Error::ExceededTimeLimit),
            YieldPolicy::AlwaysMarkKilled => Err(Error::QueryPlanKilled(
                "killed at forced yield point".to_string(),
            )),
            YieldPolicy::YieldAuto => {
                self.root.save_state();
                // Snapshot and lock release happens here; the heap engine
                // holds neither across calls.
                if self.coll.catalog_generation() != self.catalog_generation {
                    return Err(Error::QueryPlanKilled(
                        "collection catalog changed during yield".to_string(),
                    ));
                }
                self.root.restore_state(opctx)
            }
        }
    }

    /// Execution stats tree.
    pub fn stats(&self) -> StatsNode {
        self.root.stats_tree()
    }

    /// One-line plan description.
    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Did this plan come from the cache without a trial?
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }
}

/// Turn a member into the outgoing document.
fn materialize(member: WsMember) -> Result<Document> {
    if let Some(doc) = member.doc {
        return Ok(doc);
    }
    if let Some(keys) = member.index_keys {
        let mut doc = Document::new();
        for (path, value) in keys {
            doc.push(path, value);
        }
        return Ok(doc);
    }
    Err(Error::internal("result member carries no document"))
}

/// Plan (through the cache, multi-planning on miss) and return a runnable
/// executor.
pub fn plan_query(
    coll: &Arc<Collection>,
    query: &CanonicalQuery,
    params: &ExecParams,
    opctx: &OperationContext,
) -> Result<PlanExecutor> {
    let infos = coll.index_infos();
    let cache_key = query.cache_key();

    if let Some(cached) = coll.plan_cache().get(&cache_key) {
        match plan_from_cache(query, cached.index_name.as_deref(), &infos) {
            Some(solution) => match executor_for(coll, &solution, params, opctx, true) {
                Ok(exec) => {
                    debug!(target: "rook::query", plan = %solution.root, "plan cache hit");
                    return Ok(exec);
                }
                // The cached choice no longer builds; count the miss and
                // replan.
                Err(Error::IndexNotFound(_)) => {
                    coll.plan_cache().note_miss(&cache_key);
                }
                Err(e) => return Err(e),
            },
            None => {
                coll.plan_cache().note_miss(&cache_key);
            }
        }
    }

    let solutions = enumerate_plans(query, &infos);
    let winner = if solutions.len() == 1 {
        &solutions[0]
    } else {
        let idx = run_trial(&solutions, coll, params, opctx)?;
        let winner = &solutions[idx];
        let direction = scan_direction(&winner.root);
        coll.plan_cache().put(
            cache_key,
            CachedPlan {
                index_name: winner.root.index_name().map(String::from),
                direction,
            },
        );
        winner
    };
    debug!(target: "rook::query", plan = %winner.root, "plan selected");
    executor_for(coll, winner, params, opctx, false)
}

fn executor_for(
    coll: &Arc<Collection>,
    solution: &QuerySolution,
    params: &ExecParams,
    opctx: &OperationContext,
    from_cache: bool,
) -> Result<PlanExecutor> {
    let tracker = MemoryTracker::new(
        params.exec.sort_max_memory_bytes + params.exec.group_max_memory_bytes,
        params.allow_disk_use,
    );
    let root = build_stages(&solution.root, coll, params, &tracker, opctx)?;
    Ok(PlanExecutor {
        root,
        coll: coll.clone(),
        catalog_generation: coll.catalog_generation(),
        policy: params.policy,
        elapsed: ElapsedTracker::new(&params.yielding),
        summary: solution.root.summary(),
        from_cache,
    })
}

fn scan_direction(plan: &PlanNode) -> Direction {
    let mut dir = Direction::Forward;
    plan.visit(&mut |n| {
        if let PlanNode::IndexScan { direction, .. } = n {
            dir = *direction;
        }
    });
    dir
}

/// Lock-step trial: pull one work unit from each candidate per round until
/// one finishes or the budget runs out; rank what the counters say.
fn run_trial(
    solutions: &[QuerySolution],
    coll: &Arc<Collection>,
    params: &ExecParams,
    opctx: &OperationContext,
) -> Result<usize> {
    struct Candidate {
        stage: Box<dyn Stage>,
        perf: CandidatePerf,
        failed: bool,
    }

    let tracker = MemoryTracker::new(
        params.exec.sort_max_memory_bytes + params.exec.group_max_memory_bytes,
        params.allow_disk_use,
    );
    let mut candidates = Vec::with_capacity(solutions.len());
    for solution in solutions {
        let stage = build_stages(&solution.root, coll, params, &tracker, opctx)?;
        candidates.push(Candidate {
            stage,
            perf: CandidatePerf {
                has_blocking_sort: solution.root.has_blocking_sort(),
                bounds_score: solution.root.bounds_score(),
                ..Default::default()
            },
            failed: false,
        });
    }

    let budget = params.query.plan_evaluation_works as u64;
    'rounds: for _ in 0..budget {
        let mut all_done = true;
        for candidate in candidates.iter_mut() {
            if candidate.failed || candidate.perf.reached_eof {
                continue;
            }
            all_done = false;
            candidate.perf.works += 1;
            match candidate.stage.work(opctx) {
                Ok(WorkResult::Advanced(_)) => candidate.perf.advances += 1,
                Ok(WorkResult::Paused) => {}
                Ok(WorkResult::Eof) => {
                    candidate.perf.reached_eof = true;
                    break 'rounds;
                }
                Err(e) if e.is_interruption() => return Err(e),
                Err(_) => candidate.failed = true,
            }
        }
        if all_done {
            break;
        }
    }

    for candidate in candidates.iter_mut() {
        candidate.perf.docs_fetched = candidate.stage.stats_tree().total(|s| s.docs_examined);
        if candidate.failed {
            candidate.perf.works = u64::MAX;
            candidate.perf.advances = 0;
        }
    }
    let perfs: Vec<CandidatePerf> = candidates.iter().map(|c| c.perf).collect();
    Ok(pick_winner(&perfs))
}
