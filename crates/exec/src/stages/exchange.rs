//! Exchange: fan-out from one producer to N consumers
//!
//! The producer stage is pulled lazily by whichever consumer runs dry
//! first; produced members route to per-consumer buffers under the
//! configured policy. Each consumer observes its buffer in producer order;
//! no cross-consumer ordering is promised. A consumer whose peers lag
//! behind the buffer cap reports `Paused` rather than overrunning memory,
//! so the slowest consumer paces the pipeline.

use crate::stage::{Stage, StageStats, StatsNode, WorkResult, WsMember};
use parking_lot::Mutex;
use rook_core::{cmp_values, Error, OperationContext, Result, Value};
use std::collections::VecDeque;
use std::sync::Arc;

/// Routing policy of an exchange.
#[derive(Debug, Clone)]
pub enum ExchangePolicy {
    /// Member `k` goes to consumer `k mod N`.
    RoundRobin,
    /// Every member goes to every consumer.
    Broadcast,
    /// Members bucket by the value at `path` against sorted `boundaries`
    /// (length N+1).
    Range {
        /// Shard-key path routed on.
        path: String,
        /// Partition boundaries, ascending, one more than consumers.
        boundaries: Vec<Value>,
    },
}

struct ExchangeCore {
    source: Box<dyn Stage>,
    policy: ExchangePolicy,
    buffers: Vec<VecDeque<WsMember>>,
    buffered_bytes: Vec<usize>,
    max_buffer_bytes: usize,
    produced: u64,
    source_eof: bool,
}

impl ExchangeCore {
    fn route(&mut self, member: WsMember) -> Result<()> {
        let n = self.buffers.len();
        let targets: Vec<usize> = match &self.policy {
            ExchangePolicy::RoundRobin => vec![(self.produced % n as u64) as usize],
            ExchangePolicy::Broadcast => (0..n).collect(),
            ExchangePolicy::Range { path, boundaries } => {
                let doc = member
                    .doc
                    .as_ref()
                    .ok_or_else(|| Error::internal("range exchange needs documents"))?;
                let value = doc.get_path(path).cloned().unwrap_or(Value::Null);
                vec![range_partition(boundaries, &value, n)]
            }
        };
        self.produced += 1;
        let size = member.approximate_size();
        let (last, rest) = targets.split_last().expect("at least one target");
        for target in rest {
            self.buffers[*target].push_back(member.clone());
            self.buffered_bytes[*target] += size;
        }
        self.buffers[*last].push_back(member);
        self.buffered_bytes[*last] += size;
        Ok(())
    }

    fn any_peer_full(&self, me: usize) -> bool {
        self.buffered_bytes
            .iter()
            .enumerate()
            .any(|(i, bytes)| i != me && *bytes >= self.max_buffer_bytes)
    }
}

/// Bucket `value` into the partition `i` with
/// `boundaries[i] <= value < boundaries[i+1]`.
fn range_partition(boundaries: &[Value], value: &Value, n: usize) -> usize {
    for i in 0..n {
        if cmp_values(value, &boundaries[i + 1]) == std::cmp::Ordering::Less {
            return i;
        }
    }
    n - 1
}

/// Build an exchange over `source`, returning one consumer stage per slot.
pub fn exchange(
    source: Box<dyn Stage>,
    policy: ExchangePolicy,
    consumers: usize,
    max_buffer_bytes: usize,
) -> Vec<ExchangeConsumer> {
    assert!(consumers > 0, "exchange needs at least one consumer");
    if let ExchangePolicy::Range { boundaries, .. } = &policy {
        assert_eq!(
            boundaries.len(),
            consumers + 1,
            "range exchange needs N+1 boundaries"
        );
    }
    let core = Arc::new(Mutex::new(ExchangeCore {
        source,
        policy,
        buffers: (0..consumers).map(|_| VecDeque::new()).collect(),
        buffered_bytes: vec![0; consumers],
        max_buffer_bytes,
        produced: 0,
        source_eof: false,
    }));
    (0..consumers)
        .map(|idx| ExchangeConsumer {
            core: core.clone(),
            idx,
            stats: StageStats::default(),
        })
        .collect()
}

/// One consumer endpoint of an exchange.
pub struct ExchangeConsumer {
    core: Arc<Mutex<ExchangeCore>>,
    idx: usize,
    stats: StageStats,
}

impl Stage for ExchangeConsumer {
    fn name(&self) -> &'static str {
        "EXCHANGE"
    }

    fn work(&mut self, opctx: &OperationContext) -> Result<WorkResult> {
        self.stats.works += 1;
        let mut core = self.core.lock();
        loop {
            if let Some(member) = core.buffers[self.idx].pop_front() {
                core.buffered_bytes[self.idx] =
                    core.buffered_bytes[self.idx].saturating_sub(member.approximate_size());
                self.stats.advances += 1;
                return Ok(WorkResult::Advanced(member));
            }
            if core.source_eof {
                return Ok(WorkResult::Eof);
            }
            if core.any_peer_full(self.idx) {
                // A slower consumer pins the buffer; let it drain first.
                return Ok(WorkResult::Paused);
            }
            match core.source.work(opctx)? {
                WorkResult::Advanced(member) => core.route(member)?,
                WorkResult::Paused => return Ok(WorkResult::Paused),
                WorkResult::Eof => core.source_eof = true,
            }
        }
    }

    fn save_state(&mut self) {
        self.core.lock().source.save_state();
    }

    fn restore_state(&mut self, opctx: &OperationContext) -> Result<()> {
        self.core.lock().source.restore_state(opctx)
    }

    fn stats_tree(&self) -> StatsNode {
        StatsNode {
            name: self.name(),
            stats: self.stats,
            children: vec![self.core.lock().source.stats_tree()],
        }
    }
}
