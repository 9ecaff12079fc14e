mod log_store;
mod stats;

pub use log_store::{LogStore, LogStoreError, RawLog};
pub use stats::{IndexStats, IndexingState, PassCounts, StatsTracker};
