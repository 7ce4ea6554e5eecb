//! Secondary indexes derived from the primary buckets: the shared slug index,
//! the per-namespace sorted index, and the debounced scheduler that keeps the
//! latter fresh.

pub mod scheduler;
pub mod slug;
pub mod sorted;

pub use scheduler::{DebounceTable, RefreshDecision, RefreshScheduler};
pub use slug::SlugIndex;
pub use sorted::{sorted_entry_key, SortIndexMaintainer};
