//! Concrete execution stages

pub mod exchange;
pub mod filter;
pub mod group;
pub mod projection;
pub mod scan;
pub mod sort;
pub mod write;

pub use exchange::{exchange, ExchangeConsumer, ExchangePolicy};
pub use filter::{FilterStage, LimitStage, OrStage, SkipStage};
pub use group::{AccumulatorOp, AccumulatorSpec, GroupStage};
pub use projection::ProjectionStage;
pub use scan::{CollectionScanStage, FetchStage, IndexScanStage};
pub use sort::{cmp_sort_keys, SortKeyGeneratorStage, SortStage};
pub use write::{DeleteStage, InsertStage, OutMode, OutStage, UpdateSpec, UpdateStage};
