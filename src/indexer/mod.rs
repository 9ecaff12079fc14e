pub mod live;
pub mod scanner;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{IndexingState, LogStore, RawLog, StatsTracker};
use crate::decode::{DecodeError, decode_transfers, decode_uri_refresh};
use crate::metadata::MetadataClient;
use crate::pipeline::{
    FieldAggregator, PassError, PluginHandle, PluginPipeline, Upserter, synthesize,
};
use crate::rpc::ChainReader;
use crate::types::config::{ChainConfig, PipelineConfig};
use crate::types::token::{RefreshRequest, Transfer};

const PASS_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Everything one chain's indexing loops share. Built once per chain in
/// `main` and handed to [`run`].
pub struct IndexerContext {
    pub chain: ChainConfig,
    pub pipeline: PipelineConfig,
    pub store: Arc<LogStore>,
    pub stats: Arc<StatsTracker>,
    pub reader: Option<Arc<dyn ChainReader>>,
    pub metadata: Arc<MetadataClient>,
    pub upserter: Arc<Upserter>,
}

/// Drives one chain: catch-up passes until the target stops moving, then
/// the live tail. Only replay-only chains ever return without an error.
pub async fn run(ctx: Arc<IndexerContext>) -> anyhow::Result<()> {
    ctx.stats.set_state(IndexingState::CatchUp);

    loop {
        let start = match ctx.stats.last_synced_block() {
            0 => ctx.chain.start_block,
            synced => synced + 1,
        };
        let target = match catch_up_target(&ctx).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                tracing::info!("No cached ranges to replay for chain {}", ctx.chain.name);
                break;
            }
            Err(e) => {
                tracing::error!("Head poll failed on chain {}: {}", ctx.chain.name, e);
                tokio::time::sleep(PASS_RETRY_BACKOFF).await;
                continue;
            }
        };
        if start > target {
            break;
        }

        if let Err(e) = scanner::catch_up(&ctx, start, target).await {
            tracing::error!("Catch-up pass failed on chain {}: {}", ctx.chain.name, e);
            tokio::time::sleep(PASS_RETRY_BACKOFF).await;
        }
    }

    live::run(ctx).await
}

/// The chain head when an endpoint is attached, else the top of the local
/// cache. `None` means a replay-only chain with nothing cached.
async fn catch_up_target(ctx: &IndexerContext) -> anyhow::Result<Option<u64>> {
    match &ctx.reader {
        Some(reader) => {
            let head = reader.head_block().await?;
            ctx.stats.set_chain_head(head);
            Ok(Some(head))
        }
        None => Ok(ctx.store.latest_cached_range_end()),
    }
}

/// One pass, bracketed: plugins up, collectors up, scan, drain, synthesize,
/// persist. The collectors are spawned before the first dispatch so plugin
/// sends always have a consumer.
pub(crate) async fn run_pass<F, Fut>(ctx: &IndexerContext, scan: F) -> Result<(), PassError>
where
    F: FnOnce(PluginHandle) -> Fut,
    Fut: Future<Output = Result<(), PassError>>,
{
    let (pipeline, outputs) = PluginPipeline::spawn(
        ctx.reader.clone(),
        ctx.metadata.clone(),
        ctx.pipeline.channel_capacity(),
    );
    let aggregator = FieldAggregator::spawn(outputs);

    let scanned = scan(pipeline.handle()).await;
    pipeline.finish().await?;
    let maps = aggregator.collect().await?;
    scanned?;

    let (tokens, counts) = synthesize(maps)?;
    ctx.upserter.persist(tokens).await?;
    ctx.stats.record_pass(&counts);
    if let Err(e) = ctx.stats.save() {
        tracing::warn!("Failed to persist stats for chain {}: {}", ctx.chain.name, e);
    }
    Ok(())
}

pub(crate) fn decode_window(
    chain_id: u64,
    logs: &[RawLog],
) -> Result<(Vec<Transfer>, Vec<RefreshRequest>), DecodeError> {
    let mut transfers = Vec::new();
    let mut refreshes = Vec::new();
    for log in logs {
        transfers.extend(decode_transfers(chain_id, log)?);
        if let Some(request) = decode_uri_refresh(chain_id, log) {
            refreshes.push(request);
        }
    }
    Ok((transfers, refreshes))
}

pub(crate) async fn dispatch_decoded(
    handle: &PluginHandle,
    batch_size: usize,
    transfers: Vec<Transfer>,
    refreshes: Vec<RefreshRequest>,
) -> Result<(), PassError> {
    for chunk in transfers.chunks(batch_size.max(1)) {
        handle.dispatch(chunk.to_vec()).await?;
    }
    for request in refreshes {
        handle.refresh(request).await?;
    }
    Ok(())
}
