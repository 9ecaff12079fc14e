use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::{IndexerContext, decode_window, dispatch_decoded, run_pass};
use crate::cache::{IndexingState, LogStoreError, RawLog};
use crate::rpc::ChainReader;

const CYCLE_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Follows the chain head until shutdown. Each cycle indexes everything
/// between the checkpoint and the current head, then sleeps out the poll
/// interval. Replay-only chains return immediately.
pub async fn run(ctx: Arc<IndexerContext>) -> anyhow::Result<()> {
    let Some(reader) = ctx.reader.clone() else {
        tracing::info!("Chain {} has no RPC endpoint; replay finished", ctx.chain.name);
        return Ok(());
    };
    ctx.stats.set_state(IndexingState::LiveTail);
    tracing::info!("Live tail started on chain {}", ctx.chain.name);

    // Raw logs wait here until a full cache-range width behind the
    // checkpoint is complete, then flush as ordinary range objects.
    let mut buffer: Vec<RawLog> = Vec::new();
    let mut flushed_through = ctx.stats.last_synced_block();

    loop {
        match live_cycle(&ctx, &reader, &mut buffer, &mut flushed_through).await {
            Ok(()) => tokio::time::sleep(ctx.pipeline.live_poll_interval()).await,
            Err(e) => {
                tracing::error!("Live cycle failed on chain {}: {}", ctx.chain.name, e);
                tokio::time::sleep(CYCLE_RETRY_BACKOFF).await;
            }
        }
    }
}

async fn live_cycle(
    ctx: &Arc<IndexerContext>,
    reader: &Arc<dyn ChainReader>,
    buffer: &mut Vec<RawLog>,
    flushed_through: &mut u64,
) -> anyhow::Result<()> {
    let head = reader.head_block().await?;
    ctx.stats.set_chain_head(head);
    let last_synced = ctx.stats.last_synced_block();
    if head <= last_synced {
        return Ok(());
    }
    let from = last_synced + 1;
    tracing::debug!(
        "Live cycle on chain {}: blocks {} through {}",
        ctx.chain.name,
        from,
        head
    );

    let logs = collect_live_logs(ctx, reader, from, head).await;
    let decoded = match decode_window(ctx.chain.chain_id, &logs) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            // The raw logs still reach the cache; only this cycle's decode
            // is lost and the gap is recorded for a later replay.
            ctx.store.record_fetch_error(from, head, &e.to_string());
            tracing::error!(
                "Live decode failed on chain {} for {}-{}: {}",
                ctx.chain.name,
                from,
                head,
                e
            );
            None
        }
    };

    if let Some((transfers, refreshes)) = decoded {
        if !transfers.is_empty() || !refreshes.is_empty() {
            let batch = ctx.pipeline.transfer_batch();
            run_pass(ctx, |handle| async move {
                dispatch_decoded(&handle, batch, transfers, refreshes).await
            })
            .await?;
        }
    }

    ctx.stats.advance_last_synced(head);
    buffer.extend(logs);
    flush_full_ranges(ctx, buffer, flushed_through).await?;
    if let Err(e) = ctx.stats.save() {
        tracing::warn!("Failed to persist stats for chain {}: {}", ctx.chain.name, e);
    }
    Ok(())
}

/// Fetches `[from, to]` in sub-ranges through a bounded pool. A sub-range
/// that fails is recorded and skipped; the cycle carries on with what it
/// got.
async fn collect_live_logs(
    ctx: &Arc<IndexerContext>,
    reader: &Arc<dyn ChainReader>,
    from: u64,
    to: u64,
) -> Vec<RawLog> {
    let batch = ctx.pipeline.live_batch().max(1);
    let semaphore = Arc::new(Semaphore::new(ctx.pipeline.live_workers().max(1)));
    let mut fetches = JoinSet::new();

    let mut cursor = from;
    while cursor <= to {
        let end = cursor.saturating_add(batch - 1).min(to);
        let permit = semaphore.clone().acquire_owned().await.unwrap();
        let ctx = ctx.clone();
        let reader = reader.clone();
        fetches.spawn(async move {
            let _permit = permit;
            match reader.logs(cursor, end, &ctx.chain.contracts).await {
                Ok(logs) => logs,
                Err(e) => {
                    tracing::warn!(
                        "Live fetch {}-{} failed on chain {}: {}",
                        cursor,
                        end,
                        ctx.chain.name,
                        e
                    );
                    ctx.store.record_fetch_error(cursor, end, &e.to_string());
                    Vec::new()
                }
            }
        });
        cursor = end + 1;
    }

    let mut logs = Vec::new();
    while let Some(result) = fetches.join_next().await {
        match result {
            Ok(chunk) => logs.extend(chunk),
            Err(e) => tracing::error!("Live fetch task panicked: {}", e),
        }
    }
    logs.sort_by_key(|l| (l.block_number, l.log_index));
    logs
}

/// Writes every completed range width out of the buffer and drops the
/// flushed span. Live ranges continue from wherever catch-up stopped, so
/// they are width-consistent but not boundary-aligned.
async fn flush_full_ranges(
    ctx: &IndexerContext,
    buffer: &mut Vec<RawLog>,
    flushed_through: &mut u64,
) -> Result<(), LogStoreError> {
    let width = ctx.pipeline.catchup_window().max(1);
    let last_synced = ctx.stats.last_synced_block();

    while flushed_through.saturating_add(width) <= last_synced {
        let from = *flushed_through + 1;
        let to = *flushed_through + width;
        let chunk: Vec<RawLog> = buffer
            .iter()
            .filter(|l| l.block_number >= from && l.block_number <= to)
            .cloned()
            .collect();
        ctx.store.put(from, to, chunk).await?;
        *flushed_through = to;
    }
    buffer.retain(|l| l.block_number > *flushed_through);
    Ok(())
}
