//! Optimes

use rook_core::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position in the replication log: `(timestamp, term)`.
///
/// Ordered by timestamp first; the term disambiguates entries written by
/// different primaries at the same wall second.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct OpTime {
    /// Storage timestamp of the log entry.
    pub timestamp: Timestamp,
    /// Election term the entry was written in.
    pub term: u64,
}

impl OpTime {
    /// Build an optime.
    pub fn new(timestamp: Timestamp, term: u64) -> Self {
        Self { timestamp, term }
    }

    /// The null optime, before every real one.
    pub fn initial() -> Self {
        Self::default()
    }

    /// True for the null optime.
    pub fn is_initial(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{t: {}, term: {}}}", self.timestamp, self.term)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_timestamp_then_term() {
        let a = OpTime::new(Timestamp::new(10, 1), 1);
        let b = OpTime::new(Timestamp::new(10, 2), 1);
        let c = OpTime::new(Timestamp::new(11, 0), 0);
        assert!(a < b);
        assert!(b < c);
        assert!(OpTime::initial() < a);
        assert!(OpTime::initial().is_initial());
    }
}
