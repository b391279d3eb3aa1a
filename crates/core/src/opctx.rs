//! Operation context and cooperative cancellation
//!
//! Every long-running call receives an [`OperationContext`] carrying a
//! cancellation token and an optional deadline. Components check it at their
//! suspension points (cursor advances, stage boundaries, RPC edges); a
//! cancelled token or an expired deadline surfaces as `Interrupted` /
//! `ExceededTimeLimit` at the next check. Tokens are cloneable so outbound
//! RPCs can share the caller's cancellation scope.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

/// Shared cancellation flag.
///
/// Cloning shares the flag; cancelling any clone cancels all of them.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create an uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to every holder of this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// True once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Per-operation execution context.
#[derive(Debug, Clone)]
pub struct OperationContext {
    op_id: u64,
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl OperationContext {
    /// Create a context with no deadline.
    pub fn new() -> Self {
        Self {
            op_id: NEXT_OP_ID.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Create a context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        let mut ctx = Self::new();
        ctx.deadline = Some(Instant::now() + timeout);
        ctx
    }

    /// Unique id of the operation, for kill-op targeting and logs.
    pub fn op_id(&self) -> u64 {
        self.op_id
    }

    /// The cancellation token, cloneable into outbound work.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Mark the operation as killed.
    pub fn kill(&self) {
        self.token.cancel();
    }

    /// Deadline, if one was set.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time remaining before the deadline, if one was set.
    pub fn remaining_time(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Raise if the operation was cancelled or its deadline has passed.
    ///
    /// This is the suspension-point check: cheap enough to call on every
    /// cursor advance.
    pub fn check_for_interrupt(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Interrupted);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::ExceededTimeLimit);
            }
        }
        Ok(())
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_is_not_interrupted() {
        let ctx = OperationContext::new();
        assert!(ctx.check_for_interrupt().is_ok());
    }

    #[test]
    fn kill_surfaces_as_interrupted() {
        let ctx = OperationContext::new();
        ctx.kill();
        assert!(matches!(ctx.check_for_interrupt(), Err(Error::Interrupted)));
    }

    #[test]
    fn cloned_token_shares_cancellation() {
        let ctx = OperationContext::new();
        let token = ctx.token().clone();
        token.cancel();
        assert!(matches!(ctx.check_for_interrupt(), Err(Error::Interrupted)));
    }

    #[test]
    fn expired_deadline_surfaces_as_time_limit() {
        let ctx = OperationContext::with_timeout(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(2));
        assert!(matches!(
            ctx.check_for_interrupt(),
            Err(Error::ExceededTimeLimit)
        ));
    }

    #[test]
    fn op_ids_are_unique() {
        let a = OperationContext::new();
        let b = OperationContext::new();
        assert_ne!(a.op_id(), b.op_id());
    }
}
