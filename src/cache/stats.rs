use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Phase of the indexer, persisted as a numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexingState {
    Idle,
    CatchUp,
    LiveTail,
}

impl IndexingState {
    pub fn code(self) -> u8 {
        match self {
            IndexingState::Idle => 0,
            IndexingState::CatchUp => 1,
            IndexingState::LiveTail => 2,
        }
    }
}

/// Checkpoint document written to `stats.json`. Counters are cumulative
/// across passes; `last_synced_block` is where a restart resumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub state: u8,
    pub owners: u64,
    pub balances: u64,
    pub metadatas: u64,
    pub uris: u64,
    pub last_synced_block: u64,
    pub bad_uris: u64,
}

/// Counter deltas produced by one indexing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassCounts {
    pub owners: u64,
    pub balances: u64,
    pub metadatas: u64,
    pub uris: u64,
    pub bad_uris: u64,
}

/// Shared progress tracker. All fields are atomics so the scanner, live
/// tail, and upserter update it without a lock; `save` snapshots whatever
/// is current.
pub struct StatsTracker {
    path: PathBuf,
    state: AtomicU8,
    owners: AtomicU64,
    balances: AtomicU64,
    metadatas: AtomicU64,
    uris: AtomicU64,
    bad_uris: AtomicU64,
    last_synced_block: AtomicU64,
    /// Head height from the most recent poll. Not persisted; only meaningful
    /// while the live tail is running.
    chain_head: AtomicU64,
}

impl StatsTracker {
    /// Seeds the tracker from an existing `stats.json` under the chain's
    /// cache directory, or starts from zero.
    pub fn load(cache_dir: &Path, chain_name: &str) -> Self {
        let path = cache_dir.join(chain_name).join("stats.json");
        let stats = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let stats: IndexStats = serde_json::from_str(&content).unwrap_or_default();
                tracing::debug!(
                    "Read checkpoint from {}: last synced block {}",
                    path.display(),
                    stats.last_synced_block
                );
                stats
            }
            Err(e) => {
                tracing::debug!(
                    "No checkpoint at {} ({}), starting fresh",
                    path.display(),
                    e.kind()
                );
                IndexStats::default()
            }
        };

        StatsTracker {
            path,
            state: AtomicU8::new(stats.state),
            owners: AtomicU64::new(stats.owners),
            balances: AtomicU64::new(stats.balances),
            metadatas: AtomicU64::new(stats.metadatas),
            uris: AtomicU64::new(stats.uris),
            bad_uris: AtomicU64::new(stats.bad_uris),
            last_synced_block: AtomicU64::new(stats.last_synced_block),
            chain_head: AtomicU64::new(0),
        }
    }

    pub fn set_state(&self, state: IndexingState) {
        self.state.store(state.code(), Ordering::SeqCst);
    }

    pub fn record_pass(&self, counts: &PassCounts) {
        self.owners.fetch_add(counts.owners, Ordering::SeqCst);
        self.balances.fetch_add(counts.balances, Ordering::SeqCst);
        self.metadatas.fetch_add(counts.metadatas, Ordering::SeqCst);
        self.uris.fetch_add(counts.uris, Ordering::SeqCst);
        self.bad_uris.fetch_add(counts.bad_uris, Ordering::SeqCst);
    }

    /// Monotonic: a lagging window completing late never rewinds the
    /// checkpoint.
    pub fn advance_last_synced(&self, block: u64) {
        self.last_synced_block.fetch_max(block, Ordering::SeqCst);
    }

    pub fn last_synced_block(&self) -> u64 {
        self.last_synced_block.load(Ordering::SeqCst)
    }

    pub fn set_chain_head(&self, block: u64) {
        self.chain_head.store(block, Ordering::SeqCst);
    }

    pub fn chain_head(&self) -> u64 {
        self.chain_head.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> IndexStats {
        IndexStats {
            state: self.state.load(Ordering::SeqCst),
            owners: self.owners.load(Ordering::SeqCst),
            balances: self.balances.load(Ordering::SeqCst),
            metadatas: self.metadatas.load(Ordering::SeqCst),
            uris: self.uris.load(Ordering::SeqCst),
            last_synced_block: self.last_synced_block.load(Ordering::SeqCst),
            bad_uris: self.bad_uris.load(Ordering::SeqCst),
        }
    }

    pub fn save(&self) -> std::io::Result<()> {
        let stats = self.snapshot();
        let content = serde_json::to_string_pretty(&stats).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("JSON serialize error: {}", e),
            )
        })?;
        std::fs::write(&self.path, content)?;
        tracing::debug!(
            "Wrote checkpoint to {}: last synced block {}",
            self.path.display(),
            stats.last_synced_block
        );
        Ok(())
    }
}
