pub mod ready;
pub mod reorder;

pub use ready::PublishedCount;
pub use reorder::{CacheStats, GapReason, Lookup, OverflowPolicy, ReorderCache, MAX_GAP_MARKERS};
