//! Filter, limit/skip, and the `$or` union stage

use crate::stage::{Stage, StageStats, StatsNode, WorkResult};
use rook_core::{Error, OperationContext, RecordId, Result};
use rook_query::Matcher;
use rustc_hash::FxHashSet;

/// Drop members failing the residual predicate.
pub struct FilterStage {
    child: Box<dyn Stage>,
    matcher: Matcher,
    stats: StageStats,
}

impl FilterStage {
    /// Filter the child through `matcher`.
    pub fn new(child: Box<dyn Stage>, matcher: Matcher) -> Self {
        Self {
            child,
            matcher,
            stats: StageStats::default(),
        }
    }
}

impl Stage for FilterStage {
    fn name(&self) -> &'static str {
        "FILTER"
    }

    fn work(&mut self, opctx: &OperationContext) -> Result<WorkResult> {
        self.stats.works += 1;
        match self.child.work(opctx)? {
            WorkResult::Advanced(member) => {
                let Some(doc) = &member.doc else {
                    return Err(Error::internal("filter stage needs fetched documents"));
                };
                if self.matcher.matches(doc) {
                    self.stats.advances += 1;
                    Ok(WorkResult::Advanced(member))
                } else {
                    Ok(WorkResult::Paused)
                }
            }
            other => Ok(other),
        }
    }

    fn save_state(&mut self) {
        self.child.save_state();
    }

    fn restore_state(&mut self, opctx: &OperationContext) -> Result<()> {
        self.child.restore_state(opctx)
    }

    fn stats_tree(&self) -> StatsNode {
        StatsNode {
            name: self.name(),
            stats: self.stats,
            children: vec![self.child.stats_tree()],
        }
    }
}

/// Emit at most `n` results.
pub struct LimitStage {
    child: Box<dyn Stage>,
    remaining: u64,
    stats: StageStats,
}

impl LimitStage {
    /// Limit the child to `n` results.
    pub fn new(child: Box<dyn Stage>, n: u64) -> Self {
        Self {
            child,
            remaining: n,
            stats: StageStats::default(),
        }
    }
}

impl Stage for LimitStage {
    fn name(&self) -> &'static str {
        "LIMIT"
    }

    fn work(&mut self, opctx: &OperationContext) -> Result<WorkResult> {
        self.stats.works += 1;
        if self.remaining == 0 {
            return Ok(WorkResult::Eof);
        }
        match self.child.work(opctx)? {
            WorkResult::Advanced(member) => {
                self.remaining -= 1;
                self.stats.advances += 1;
                Ok(WorkResult::Advanced(member))
            }
            other => Ok(other),
        }
    }

    fn save_state(&mut self) {
        self.child.save_state();
    }

    fn restore_state(&mut self, opctx: &OperationContext) -> Result<()> {
        self.child.restore_state(opctx)
    }

    fn stats_tree(&self) -> StatsNode {
        StatsNode {
            name: self.name(),
            stats: self.stats,
            children: vec![self.child.stats_tree()],
        }
    }
}

/// Drop the first `n` results.
pub struct SkipStage {
    child: Box<dyn Stage>,
    to_skip: u64,
    stats: StageStats,
}

impl SkipStage {
    /// Skip the child's first `n` results.
    pub fn new(child: Box<dyn Stage>, n: u64) -> Self {
        Self {
            child,
            to_skip: n,
            stats: StageStats::default(),
        }
    }
}

impl Stage for SkipStage {
    fn name(&self) -> &'static str {
        "SKIP"
    }

    fn work(&mut self, opctx: &OperationContext) -> Result<WorkResult> {
        self.stats.works += 1;
        match self.child.work(opctx)? {
            WorkResult::Advanced(member) => {
                if self.to_skip > 0 {
                    self.to_skip -= 1;
                    Ok(WorkResult::Paused)
                } else {
                    self.stats.advances += 1;
                    Ok(WorkResult::Advanced(member))
                }
            }
            other => Ok(other),
        }
    }

    fn save_state(&mut self) {
        self.child.save_state();
    }

    fn restore_state(&mut self, opctx: &OperationContext) -> Result<()> {
        self.child.restore_state(opctx)
    }

    fn stats_tree(&self) -> StatsNode {
        StatsNode {
            name: self.name(),
            stats: self.stats,
            children: vec![self.child.stats_tree()],
        }
    }
}

/// Union of `$or` branch subplans, deduplicated by record id.
pub struct OrStage {
    children: Vec<Box<dyn Stage>>,
    current: usize,
    seen: FxHashSet<RecordId>,
    stats: StageStats,
}

impl OrStage {
    /// Union the given subplans.
    pub fn new(children: Vec<Box<dyn Stage>>) -> Self {
        Self {
            children,
            current: 0,
            seen: FxHashSet::default(),
            stats: StageStats::default(),
        }
    }
}

impl Stage for OrStage {
    fn name(&self) -> &'static str {
        "OR"
    }

    fn work(&mut self, opctx: &OperationContext) -> Result<WorkResult> {
        self.stats.works += 1;
        let Some(child) = self.children.get_mut(self.current) else {
            return Ok(WorkResult::Eof);
        };
        match child.work(opctx)? {
            WorkResult::Advanced(member) => {
                if let Some(rid) = member.rid {
                    if !self.seen.insert(rid) {
                        // Document already produced by an earlier branch.
                        return Ok(WorkResult::Paused);
                    }
                }
                self.stats.advances += 1;
                Ok(WorkResult::Advanced(member))
            }
            WorkResult::Paused => Ok(WorkResult::Paused),
            WorkResult::Eof => {
                self.current += 1;
                if self.current >= self.children.len() {
                    Ok(WorkResult::Eof)
                } else {
                    Ok(WorkResult::Paused)
                }
            }
        }
    }

    fn save_state(&mut self) {
        for c in &mut self.children {
            c.save_state();
        }
    }

    fn restore_state(&mut self, opctx: &OperationContext) -> Result<()> {
        for c in &mut self.children {
            c.restore_state(opctx)?;
        }
        Ok(())
    }

    fn stats_tree(&self) -> StatsNode {
        StatsNode {
            name: self.name(),
            stats: self.stats,
            children: self.children.iter().map(|c| c.stats_tree()).collect(),
        }
    }
}
