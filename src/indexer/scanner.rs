use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::{IndexerContext, decode_window, dispatch_decoded, run_pass};
use crate::pipeline::{PassError, PluginHandle};

/// One catch-up pass over `[start, target]` inclusive. Windows are fetched
/// and decoded by a bounded pool; their transfers all feed the same plugin
/// pipeline, so aggregation and the upsert happen once for the whole pass.
pub async fn catch_up(ctx: &Arc<IndexerContext>, start: u64, target: u64) -> Result<(), PassError> {
    tracing::info!(
        "Catch-up pass on chain {}: blocks {} through {}",
        ctx.chain.name,
        start,
        target
    );
    run_pass(ctx, |handle| scan_windows(ctx.clone(), handle, start, target)).await
}

async fn scan_windows(
    ctx: Arc<IndexerContext>,
    handle: PluginHandle,
    start: u64,
    target: u64,
) -> Result<(), PassError> {
    let window = ctx.pipeline.catchup_window().max(1);
    let semaphore = Arc::new(Semaphore::new(ctx.pipeline.catchup_workers().max(1)));
    let mut windows: JoinSet<Result<(), PassError>> = JoinSet::new();

    let mut from = start;
    while from <= target {
        let to = from.saturating_add(window - 1).min(target);
        let permit = semaphore.clone().acquire_owned().await.unwrap();
        let task_ctx = ctx.clone();
        let handle = handle.clone();
        windows.spawn(async move {
            let _permit = permit;
            process_window(&task_ctx, &handle, from, to).await
        });
        // The checkpoint moves at submission. A window that later fails
        // leaves its gap in the errors bucket, not in the checkpoint.
        ctx.stats.advance_last_synced(to);
        from = to + 1;
    }
    drop(handle);

    let mut first_error = None;
    while let Some(result) = windows.join_next().await {
        let outcome = result
            .map_err(|e| PassError::Join(e.to_string()))
            .and_then(|r| r);
        if let Err(e) = outcome {
            tracing::error!("Window failed on chain {}: {}", ctx.chain.name, e);
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Fetches one window through the range cache and feeds the plugins. A log
/// that fails to decode abandons the whole window: the raw range stays
/// cached and the errors bucket records what happened, so a later replay
/// can fill the gap.
async fn process_window(
    ctx: &IndexerContext,
    handle: &PluginHandle,
    from: u64,
    to: u64,
) -> Result<(), PassError> {
    let logs = ctx.store.get(from, to).await;
    let (transfers, refreshes) = match decode_window(ctx.chain.chain_id, &logs) {
        Ok(decoded) => decoded,
        Err(e) => {
            ctx.store.record_fetch_error(from, to, &e.to_string());
            tracing::error!(
                "Abandoning window {}-{} on chain {}: {}",
                from,
                to,
                ctx.chain.name,
                e
            );
            return Ok(());
        }
    };
    dispatch_decoded(handle, ctx.pipeline.transfer_batch(), transfers, refreshes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{LogStore, RawLog, StatsTracker};
    use crate::db::{CountCategory, DbError, TokenRepository};
    use crate::metadata::MetadataClient;
    use crate::pipeline::Upserter;
    use crate::rpc::{ChainReader, ContractProfile, RpcError};
    use crate::types::config::{ChainConfig, PipelineConfig};
    use crate::types::erc::{IErc721, IErc1155};
    use crate::types::token::{Contract, Token, TokenId, TokenKind};
    use alloy::primitives::{Address, U256, address};
    use alloy::sol_types::{SolEvent, SolValue};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    const CHAIN_ID: u64 = 8453;

    fn alice() -> Address {
        address!("1111111111111111111111111111111111111111")
    }

    fn bob() -> Address {
        address!("2222222222222222222222222222222222222222")
    }

    fn address_topic(addr: Address) -> [u8; 32] {
        let mut topic = [0u8; 32];
        topic[12..].copy_from_slice(addr.as_slice());
        topic
    }

    fn u256_topic(value: u64) -> [u8; 32] {
        U256::from(value).to_be_bytes()
    }

    fn transfer_log(from: Address, to: Address, id: u64, block: u64, index: u32) -> RawLog {
        RawLog {
            block_number: block,
            transaction_hash: [0x11; 32],
            log_index: index,
            address: [0x42; 20],
            topics: vec![
                IErc721::Transfer::SIGNATURE_HASH.0,
                address_topic(from),
                address_topic(to),
                u256_topic(id),
            ],
            data: Vec::new(),
        }
    }

    fn malformed_batch_log(block: u64) -> RawLog {
        let data = (
            vec![U256::from(5u64), U256::from(7u64)],
            vec![U256::from(2u64)],
        )
            .abi_encode_params();
        RawLog {
            block_number: block,
            transaction_hash: [0x11; 32],
            log_index: 0,
            address: [0x42; 20],
            topics: vec![
                IErc1155::TransferBatch::SIGNATURE_HASH.0,
                address_topic(alice()),
                address_topic(Address::ZERO),
                address_topic(alice()),
            ],
            data,
        }
    }

    struct ScriptedReader {
        ranges: Vec<(u64, u64, Vec<RawLog>)>,
    }

    #[async_trait]
    impl ChainReader for ScriptedReader {
        async fn head_block(&self) -> Result<u64, RpcError> {
            Ok(self.ranges.iter().map(|(_, to, _)| *to).max().unwrap_or(0))
        }

        async fn logs(
            &self,
            from: u64,
            to: u64,
            _contracts: &[Address],
        ) -> Result<Vec<RawLog>, RpcError> {
            Ok(self
                .ranges
                .iter()
                .find(|(f, t, _)| *f == from && *t == to)
                .map(|(_, _, logs)| logs.clone())
                .unwrap_or_default())
        }

        async fn balance_of(
            &self,
            _contract: Address,
            _holder: Address,
            _id: U256,
            _block: u64,
        ) -> Result<U256, RpcError> {
            Ok(U256::from(1u64))
        }

        async fn token_uri(
            &self,
            _contract: Address,
            id: U256,
            _kind: TokenKind,
        ) -> Result<String, RpcError> {
            Ok(format!("data:application/json,{{\"name\":\"T{}\"}}", id))
        }

        async fn contract_profile(&self, _contract: Address) -> ContractProfile {
            ContractProfile::default()
        }
    }

    #[derive(Default)]
    struct CapturingRepo {
        tokens: Mutex<Vec<Token>>,
    }

    #[async_trait]
    impl TokenRepository for CapturingRepo {
        async fn bulk_upsert_tokens(&self, tokens: &[Token]) -> Result<(), DbError> {
            self.tokens.lock().unwrap().extend_from_slice(tokens);
            Ok(())
        }

        async fn bulk_upsert_contracts(&self, _contracts: &[Contract]) -> Result<(), DbError> {
            Ok(())
        }

        async fn most_recent_block(&self, _chain_id: u64) -> Result<u64, DbError> {
            Ok(0)
        }

        async fn count_by_category(
            &self,
            _chain_id: u64,
            _category: CountCategory,
        ) -> Result<i64, DbError> {
            Ok(0)
        }

        async fn tokens_by_owner(
            &self,
            _chain_id: u64,
            _owner: Address,
        ) -> Result<Vec<Token>, DbError> {
            Ok(Vec::new())
        }

        async fn token_by_key(&self, _key: &TokenId) -> Result<Option<Token>, DbError> {
            Ok(None)
        }

        async fn update_token_metadata(&self, _token: &Token) -> Result<(), DbError> {
            Ok(())
        }
    }

    fn test_context(
        dir: &tempfile::TempDir,
        reader: Arc<dyn ChainReader>,
        repo: Arc<CapturingRepo>,
    ) -> Arc<IndexerContext> {
        let chain = ChainConfig {
            name: "base".to_string(),
            chain_id: CHAIN_ID,
            rpc_url_env_var: "BASE_RPC_URL".to_string(),
            start_block: 1,
            contracts: Vec::new(),
            rpc_enabled: true,
        };
        let pipeline = PipelineConfig {
            catchup_window: Some(10),
            catchup_workers: Some(2),
            transfer_batch: Some(4),
            ..PipelineConfig::default()
        };
        let store = Arc::new(
            LogStore::new(dir.path(), &chain.name, Some(reader.clone()), Vec::new()).unwrap(),
        );
        let stats = Arc::new(StatsTracker::load(dir.path(), &chain.name));
        let metadata = Arc::new(
            MetadataClient::new(Duration::from_secs(5), "https://ipfs.io/ipfs/").unwrap(),
        );
        let upserter = Arc::new(Upserter::new(
            repo,
            None,
            store.clone(),
            Arc::new(tokio::sync::Mutex::new(())),
        ));
        Arc::new(IndexerContext {
            chain,
            pipeline,
            store,
            stats,
            reader: Some(reader),
            metadata,
            upserter,
        })
    }

    #[tokio::test]
    async fn catch_up_synthesizes_owners_across_windows() {
        let reader = Arc::new(ScriptedReader {
            ranges: vec![
                (1, 10, vec![transfer_log(Address::ZERO, alice(), 1, 5, 0)]),
                (11, 20, vec![transfer_log(alice(), bob(), 1, 15, 0)]),
            ],
        });
        let repo = Arc::new(CapturingRepo::default());
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir, reader, repo.clone());

        catch_up(&ctx, 1, 20).await.unwrap();

        assert_eq!(ctx.stats.last_synced_block(), 20);
        let persisted = repo.tokens.lock().unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].owner, Some(bob()));
        assert_eq!(persisted[0].previous_owners, vec![alice()]);
        assert_eq!(persisted[0].name.as_deref(), Some("T1"));
        // Fetched ranges landed in the cache on the way through.
        assert!(dir.path().join("base/logs/logs_1-10.parquet").exists());
        assert!(dir.path().join("base/logs/logs_11-20.parquet").exists());
    }

    #[tokio::test]
    async fn undecodable_window_is_abandoned_with_a_diagnostic() {
        let reader = Arc::new(ScriptedReader {
            ranges: vec![
                (1, 10, vec![malformed_batch_log(5)]),
                (11, 20, vec![transfer_log(Address::ZERO, alice(), 9, 15, 0)]),
            ],
        });
        let repo = Arc::new(CapturingRepo::default());
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir, reader, repo.clone());

        catch_up(&ctx, 1, 20).await.unwrap();

        // The bad window left a record; the good one still synthesized.
        assert!(dir.path().join("base/errors/ERR-1-10.json").exists());
        let persisted = repo.tokens.lock().unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].id.token_id, U256::from(9u64));
        assert_eq!(ctx.stats.last_synced_block(), 20);
    }
}
