//! Record identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a stored document within a collection.
///
/// RecordIds are assigned monotonically by the record store and stay stable
/// for the lifetime of the document (the storage interface signals the rare
/// relocation case explicitly). The reserved `MIN`/`MAX` sentinels direct
/// cursor seeks to the extreme edge of an equal-key run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct RecordId(pub i64);

impl RecordId {
    /// Sorts before every assignable record id.
    pub const MIN: RecordId = RecordId(i64::MIN);
    /// Sorts after every assignable record id.
    pub const MAX: RecordId = RecordId(i64::MAX);

    /// True for ids the record store can actually assign.
    pub fn is_normal(&self) -> bool {
        *self != Self::MIN && *self != Self::MAX
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rid:{}", self.0)
    }
}
