//! Replica-set member states

use serde::{Deserialize, Serialize};
use std::fmt;

/// The finite set of member states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberState {
    /// Process starting, configuration not loaded.
    Startup,
    /// Accepting writes for the set.
    Primary,
    /// Replicating from the primary.
    Secondary,
    /// Applying operations to catch up; not readable.
    Recovering,
    /// Undoing divergent operations after an election loss.
    Rollback,
    /// Unreachable, as observed by peers.
    Down,
    /// Removed from the current configuration.
    Removed,
    /// Initial sync after configuration load.
    Startup2,
    /// Votes but holds no data.
    Arbiter,
    /// Unrecoverable error; replication stopped.
    Fatal,
}

impl MemberState {
    /// Wire name (matches the status document).
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberState::Startup => "STARTUP",
            MemberState::Primary => "PRIMARY",
            MemberState::Secondary => "SECONDARY",
            MemberState::Recovering => "RECOVERING",
            MemberState::Rollback => "ROLLBACK",
            MemberState::Down => "DOWN",
            MemberState::Removed => "REMOVED",
            MemberState::Startup2 => "STARTUP2",
            MemberState::Arbiter => "ARBITER",
            MemberState::Fatal => "FATAL",
        }
    }

    /// Numeric code (matches the status document).
    pub fn code(&self) -> i32 {
        match self {
            MemberState::Startup => 0,
            MemberState::Primary => 1,
            MemberState::Secondary => 2,
            MemberState::Recovering => 3,
            MemberState::Startup2 => 5,
            MemberState::Arbiter => 7,
            MemberState::Down => 8,
            MemberState::Rollback => 9,
            MemberState::Removed => 10,
            MemberState::Fatal => 4,
        }
    }

    /// Can this member serve reads?
    pub fn is_readable(&self) -> bool {
        matches!(self, MemberState::Primary | MemberState::Secondary)
    }

    /// Is the transition from `self` to `next` legal?
    pub fn can_transition_to(&self, next: MemberState) -> bool {
        use MemberState::*;
        if *self == next {
            return true;
        }
        match (self, next) {
            // Anything can fail.
            (_, Fatal) => true,
            // Removal/readmission happens on any reconfig.
            (_, Removed) | (Removed, Startup2) => true,
            (Startup, Startup2) | (Startup, Arbiter) => true,
            (Startup2, Secondary) | (Startup2, Recovering) => true,
            (Recovering, Secondary) | (Secondary, Recovering) => true,
            (Secondary, Primary) | (Primary, Secondary) => true,
            (Secondary, Rollback) | (Rollback, Secondary) | (Rollback, Recovering) => true,
            (Down, Secondary) | (Secondary, Down) | (Primary, Down) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
