//! Index layer: ordered key codec, bucket B-tree, and index cursors
//!
//! - [`codec`]: encodes key-pattern tuples into order-preserving byte
//!   strings (the only comparison the tree ever does is `memcmp`)
//! - [`btree`]: bucket pages with tombstoned slots holding `(key, rid)`
//!   entries
//! - [`cursor`]: range- and bounds-driven traversal with yield-safe
//!   save/restore
//! - [`bounds`]: the interval-vector types produced by the query layer and
//!   consumed by the cursor
//! - [`catalog`] / [`build`]: per-collection index runtime state and the
//!   multi-phase build

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bounds;
pub mod btree;
pub mod build;
pub mod catalog;
pub mod codec;
pub mod cursor;
pub mod descriptor;

pub use bounds::{BoundsCheck, BoundsChecker, FieldIntervals, IndexBounds, Interval, SeekPoint};
pub use btree::{BucketTree, Entry};
pub use build::{BuildStats, IndexBuild, SideWrite};
pub use catalog::{IndexCatalog, IndexCatalogEntry};
pub use codec::{compare_keys, decode_key, encode_keys, encode_seek_key, EncodedKey, KeySet};
pub use cursor::{BtreeCursor, CursorStats, RestoreOutcome};
pub use descriptor::{
    Collation, IndexDescriptor, IndexDirection, IndexVersion, KeyPattern, KeyPatternField,
};
