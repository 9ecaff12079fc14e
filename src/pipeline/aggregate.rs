use std::collections::HashMap;
use std::collections::hash_map::Entry;

use alloy::primitives::Address;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::PassError;
use super::plugins::{BalanceFact, OwnerFact, PluginOutputs, UriFact, UriOutcome};
use crate::types::token::{HolderBalance, OwnerAtBlock, TokenId, TokenMetadata};

/// Everything a pass learned, keyed by token. Built by four collector
/// tasks, each of which exclusively owns its maps until its result channel
/// closes; the maps only meet here, after the `JoinSet` barrier.
#[derive(Debug, Default)]
pub struct AggregatedMaps {
    pub owners: HashMap<TokenId, OwnerAtBlock>,
    /// Raw history entries as (transfer block, sender). Normalized into a
    /// deduplicated block-ascending address list at synthesis.
    pub previous_owners: HashMap<TokenId, Vec<(u64, Address)>>,
    pub balances: HashMap<TokenId, HashMap<Address, HolderBalance>>,
    pub uris: HashMap<TokenId, String>,
    pub metadata: HashMap<TokenId, TokenMetadata>,
    pub bad_uris: u64,
}

enum CollectorMaps {
    Owners {
        owners: HashMap<TokenId, OwnerAtBlock>,
        previous: HashMap<TokenId, Vec<(u64, Address)>>,
    },
    Balances(HashMap<TokenId, HashMap<Address, HolderBalance>>),
    Uris {
        uris: HashMap<TokenId, String>,
        metadata: HashMap<TokenId, TokenMetadata>,
        bad_uris: u64,
    },
    Refreshes {
        uris: HashMap<TokenId, String>,
        metadata: HashMap<TokenId, TokenMetadata>,
        bad_uris: u64,
    },
}

pub struct FieldAggregator {
    collectors: JoinSet<CollectorMaps>,
}

impl FieldAggregator {
    /// Spawns one collector per plugin result channel. Must run before the
    /// first dispatch so plugin sends never back up against a full channel
    /// with nobody draining it.
    pub fn spawn(outputs: PluginOutputs) -> Self {
        let mut collectors = JoinSet::new();
        collectors.spawn(async move { collect_owners(outputs.owner_rx).await });
        collectors.spawn(async move { collect_balances(outputs.balance_rx).await });
        collectors.spawn(async move { collect_uris(outputs.uri_rx).await });
        collectors.spawn(async move { collect_refreshes(outputs.refresh_rx).await });
        FieldAggregator { collectors }
    }

    /// Waits for every result channel to close and merges the collector
    /// maps. Refresh results land last, overwriting the URI plugin's
    /// first-write entries.
    pub async fn collect(mut self) -> Result<AggregatedMaps, PassError> {
        let mut maps = AggregatedMaps::default();
        let mut refreshed_uris = HashMap::new();
        let mut refreshed_metadata = HashMap::new();

        while let Some(result) = self.collectors.join_next().await {
            match result.map_err(|e| PassError::PluginPanic(e.to_string()))? {
                CollectorMaps::Owners { owners, previous } => {
                    maps.owners = owners;
                    maps.previous_owners = previous;
                }
                CollectorMaps::Balances(balances) => maps.balances = balances,
                CollectorMaps::Uris {
                    uris,
                    metadata,
                    bad_uris,
                } => {
                    maps.uris = uris;
                    maps.metadata = metadata;
                    maps.bad_uris += bad_uris;
                }
                CollectorMaps::Refreshes {
                    uris,
                    metadata,
                    bad_uris,
                } => {
                    refreshed_uris = uris;
                    refreshed_metadata = metadata;
                    maps.bad_uris += bad_uris;
                }
            }
        }

        maps.uris.extend(refreshed_uris);
        maps.metadata.extend(refreshed_metadata);
        Ok(maps)
    }
}

/// Owner facts can arrive in any order across windows; the stored entry is
/// replaced only by a fact at least as late in the log stream.
async fn collect_owners(mut rx: mpsc::Receiver<OwnerFact>) -> CollectorMaps {
    let mut owners: HashMap<TokenId, OwnerAtBlock> = HashMap::new();
    let mut previous: HashMap<TokenId, Vec<(u64, Address)>> = HashMap::new();

    while let Some(fact) = rx.recv().await {
        if let Some(prior) = fact.prior {
            previous
                .entry(fact.token.clone())
                .or_default()
                .push((fact.observed.block_number, prior));
        }
        match owners.entry(fact.token) {
            Entry::Occupied(mut entry) => {
                if fact.observed.supersedes(entry.get()) {
                    entry.insert(fact.observed);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(fact.observed);
            }
        }
    }

    CollectorMaps::Owners { owners, previous }
}

/// Per (token, holder): keep the balance from the latest block. A failed
/// query is logged and dropped; the holder's last good value stands.
async fn collect_balances(mut rx: mpsc::Receiver<BalanceFact>) -> CollectorMaps {
    let mut balances: HashMap<TokenId, HashMap<Address, HolderBalance>> = HashMap::new();

    while let Some(fact) = rx.recv().await {
        let amount = match fact.amount {
            Ok(amount) => amount,
            Err(e) => {
                tracing::warn!(
                    "Balance query failed for token {} holder {}: {}",
                    fact.token,
                    fact.holder,
                    e
                );
                continue;
            }
        };

        let holders = balances.entry(fact.token).or_default();
        match holders.entry(fact.holder) {
            Entry::Occupied(mut entry) => {
                if fact.block_number >= entry.get().block_number {
                    entry.insert(HolderBalance {
                        holder: fact.holder,
                        amount,
                        block_number: fact.block_number,
                    });
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(HolderBalance {
                    holder: fact.holder,
                    amount,
                    block_number: fact.block_number,
                });
            }
        }
    }

    CollectorMaps::Balances(balances)
}

/// First successful write wins; the plugin memoizes per token, so repeats
/// only occur when windows overlap after a restart.
async fn collect_uris(mut rx: mpsc::Receiver<UriFact>) -> CollectorMaps {
    let mut uris = HashMap::new();
    let mut metadata = HashMap::new();
    let mut bad_uris = 0u64;

    while let Some(fact) = rx.recv().await {
        match fact.outcome {
            UriOutcome::Resolved {
                uri,
                metadata: document,
            } => {
                uris.entry(fact.token.clone()).or_insert(uri);
                metadata.entry(fact.token).or_insert(document);
            }
            UriOutcome::DocumentFailed { uri, error } => {
                tracing::warn!("Metadata fetch failed for token {}: {}", fact.token, error);
                bad_uris += 1;
                // The URI itself is still worth keeping.
                uris.entry(fact.token).or_insert(uri);
            }
            UriOutcome::UriFailed { error } => {
                tracing::warn!("URI resolution failed for token {}: {}", fact.token, error);
                bad_uris += 1;
            }
        }
    }

    CollectorMaps::Uris {
        uris,
        metadata,
        bad_uris,
    }
}

/// Refresh results overwrite unconditionally.
async fn collect_refreshes(mut rx: mpsc::Receiver<UriFact>) -> CollectorMaps {
    let mut uris = HashMap::new();
    let mut metadata = HashMap::new();
    let mut bad_uris = 0u64;

    while let Some(fact) = rx.recv().await {
        match fact.outcome {
            UriOutcome::Resolved {
                uri,
                metadata: document,
            } => {
                uris.insert(fact.token.clone(), uri);
                metadata.insert(fact.token, document);
            }
            UriOutcome::DocumentFailed { uri, error } => {
                tracing::warn!("Refresh fetch failed for token {}: {}", fact.token, error);
                bad_uris += 1;
                uris.insert(fact.token, uri);
            }
            UriOutcome::UriFailed { error } => {
                tracing::warn!("Refresh failed for token {}: {}", fact.token, error);
                bad_uris += 1;
            }
        }
    }

    CollectorMaps::Refreshes {
        uris,
        metadata,
        bad_uris,
    }
}
