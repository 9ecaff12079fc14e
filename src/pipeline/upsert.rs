use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use super::PassError;
use crate::cache::LogStore;
use crate::db::{DbError, TokenRepository};
use crate::rpc::ChainReader;
use crate::types::token::{Contract, Token};

pub const UPSERT_BATCH_SIZE: usize = 500;

const DEADLOCK_BACKOFF: Duration = Duration::from_millis(500);
const ENRICHMENT_WORKERS: usize = 4;

/// Writes a pass's synthesized tokens, then the contracts they touched.
///
/// The `write_lock` is shared across every chain's upserter; bulk writes
/// from concurrent passes hitting overlapping rows are what produce the
/// deadlocks the retry exists for, so they are serialized instead.
pub struct Upserter {
    repo: Arc<dyn TokenRepository>,
    reader: Option<Arc<dyn ChainReader>>,
    store: Arc<LogStore>,
    write_lock: Arc<Mutex<()>>,
}

impl Upserter {
    pub fn new(
        repo: Arc<dyn TokenRepository>,
        reader: Option<Arc<dyn ChainReader>>,
        store: Arc<LogStore>,
        write_lock: Arc<Mutex<()>>,
    ) -> Self {
        Upserter {
            repo,
            reader,
            store,
            write_lock,
        }
    }

    pub async fn persist(&self, tokens: Vec<Token>) -> Result<(), PassError> {
        if tokens.is_empty() {
            return Ok(());
        }
        let contracts = touched_contracts(&tokens);

        {
            let _guard = self.write_lock.lock().await;
            for chunk in tokens.chunks(UPSERT_BATCH_SIZE) {
                if let Err(e) = self
                    .with_deadlock_retry(|| self.repo.bulk_upsert_tokens(chunk))
                    .await
                {
                    let keys: Vec<String> = chunk.iter().map(|t| t.id.to_string()).collect();
                    let diagnostic = self.store.record_failed_upsert(&keys);
                    tracing::error!(
                        "Token batch of {} failed, keys recorded under {}: {}",
                        chunk.len(),
                        diagnostic,
                        e
                    );
                    return Err(e.into());
                }
            }
        }

        let contracts = self.enrich(contracts).await;

        let _guard = self.write_lock.lock().await;
        if let Err(e) = self
            .with_deadlock_retry(|| self.repo.bulk_upsert_contracts(&contracts))
            .await
        {
            let keys: Vec<String> = contracts.iter().map(|c| c.address.to_string()).collect();
            let diagnostic = self.store.record_failed_upsert(&keys);
            tracing::error!(
                "Contract batch failed, addresses recorded under {}: {}",
                diagnostic,
                e
            );
            return Err(e.into());
        }
        Ok(())
    }

    /// One retry, only for write-write conflicts. Anything else, and a
    /// second conflict in a row, is final.
    async fn with_deadlock_retry<F, Fut>(&self, op: F) -> Result<(), DbError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), DbError>>,
    {
        match op().await {
            Err(e) if e.is_deadlock() => {
                tracing::warn!("Write conflict, retrying once: {}", e);
                tokio::time::sleep(DEADLOCK_BACKOFF).await;
                op().await
            }
            other => other,
        }
    }

    /// Fills in name, symbol, and owner from on-chain calls. Best-effort
    /// on every axis: no reader means the rows go out as derived, and the
    /// profile calls themselves never fail, only come back empty.
    async fn enrich(&self, contracts: Vec<Contract>) -> Vec<Contract> {
        let Some(reader) = self.reader.clone() else {
            return contracts;
        };

        let semaphore = Arc::new(Semaphore::new(ENRICHMENT_WORKERS));
        let mut join_set = JoinSet::new();
        for contract in contracts {
            let permit = semaphore.clone().acquire_owned().await.unwrap();
            let reader = reader.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let profile = reader.contract_profile(contract.address).await;
                Contract {
                    name: profile.name,
                    symbol: profile.symbol,
                    owner: profile.owner,
                    ..contract
                }
            });
        }

        let mut enriched = Vec::new();
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(contract) => enriched.push(contract),
                Err(e) => tracing::warn!("Contract enrichment task panicked: {}", e),
            }
        }
        enriched.sort_by_key(|c| c.address);
        enriched
    }
}

/// One row per contract seen this pass. Kind comes from the first token
/// observed for it; the block is the highest across its tokens.
fn touched_contracts(tokens: &[Token]) -> Vec<Contract> {
    let mut by_address: HashMap<Address, Contract> = HashMap::new();
    for token in tokens {
        let entry = by_address
            .entry(token.id.contract)
            .or_insert_with(|| Contract {
                chain_id: token.id.chain_id,
                address: token.id.contract,
                kind: token.kind,
                name: None,
                symbol: None,
                owner: None,
                block_number: token.block_number,
            });
        entry.block_number = entry.block_number.max(token.block_number);
    }

    let mut contracts: Vec<_> = by_address.into_values().collect();
    contracts.sort_by_key(|c| c.address);
    contracts
}
