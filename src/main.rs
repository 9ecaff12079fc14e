mod cache;
mod db;
mod decode;
mod indexer;
mod metadata;
mod pipeline;
mod refresh;
mod rpc;
mod status;
mod types;

use std::env;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::Address;
use anyhow::Context;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;
use url::Url;

use cache::{LogStore, StatsTracker};
use db::{DbPool, PostgresTokenRepository, TokenRepository};
use indexer::IndexerContext;
use metadata::MetadataClient;
use pipeline::Upserter;
use refresh::{RefreshRunner, RefreshSelector};
use rpc::{ChainReader, OnChainReader, RateLimitConfig, RpcClient, RpcClientConfig};
use types::config::{ChainConfig, IndexerConfig, PipelineConfig};
use types::token::TokenId;

struct ChainTask {
    name: String,
    chain_id: u64,
    stats: Arc<StatsTracker>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = IndexerConfig::load(Path::new("config/config.json"))?;
    load_required_env_vars(&config)?;
    tracing::info!("Loaded config with {} chain(s)", config.chains.len());

    let database_url = env::var(&config.database_url_env_var).with_context(|| {
        format!("env var {} not set", config.database_url_env_var)
    })?;
    let pool = DbPool::new(&database_url)
        .await
        .context("failed to create database pool")?;
    pool.run_migrations()
        .await
        .context("failed to run database migrations")?;
    tracing::info!("Database pool initialized and migrations complete");
    let repo: Arc<dyn TokenRepository> = Arc::new(PostgresTokenRepository::new(Arc::new(pool)));

    let mut pipeline_config = config.pipeline.clone();
    apply_env_overrides(&mut pipeline_config);

    let args: Vec<String> = env::args().collect();
    if args.get(1).map(String::as_str) == Some("refresh") {
        return run_refresh(&config, &pipeline_config, repo, &args[2..]).await;
    }

    // One write lock for every chain; concurrent bulk upserts against the
    // same tables are what the deadlock retry exists for.
    let write_lock = Arc::new(tokio::sync::Mutex::new(()));
    let cache_dir = Path::new(&config.cache_dir);

    let mut chain_tasks: Vec<ChainTask> = Vec::new();
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    for chain in &config.chains {
        let ctx = build_context(
            chain,
            &pipeline_config,
            cache_dir,
            repo.clone(),
            write_lock.clone(),
        )?;
        chain_tasks.push(ChainTask {
            name: chain.name.clone(),
            chain_id: chain.chain_id,
            stats: ctx.stats.clone(),
        });
        tasks.spawn({
            let ctx = ctx.clone();
            async move {
                indexer::run(ctx)
                    .await
                    .context("chain indexing failed")
            }
        });
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                break;
            }
            result = tasks.join_next() => {
                match result {
                    Some(result) => result.context("indexer task panicked")??,
                    // Every chain ran to completion (replay-only configs).
                    None => break,
                }
            }
        }
    }

    tasks.shutdown().await;

    for task in &chain_tasks {
        if let Err(e) = task.stats.save() {
            tracing::warn!("Final checkpoint write failed for {}: {}", task.name, e);
        }
        match status::snapshot(task.chain_id, repo.as_ref(), &task.stats).await {
            Ok(snapshot) => tracing::info!(
                "Chain {} final status: {}",
                task.name,
                serde_json::to_string(&snapshot).unwrap_or_default()
            ),
            Err(e) => tracing::warn!("Status snapshot failed for {}: {}", task.name, e),
        }
    }
    Ok(())
}

/// Ensures the database URL and every RPC-enabled chain's URL var are set,
/// loading .env if needed.
fn load_required_env_vars(config: &IndexerConfig) -> anyhow::Result<()> {
    let mut required: Vec<&str> = config
        .chains
        .iter()
        .filter(|c| c.rpc_enabled)
        .map(|c| c.rpc_url_env_var.as_str())
        .collect();
    required.push(config.database_url_env_var.as_str());

    let missing: Vec<&&str> = required
        .iter()
        .filter(|var| env::var(var).is_err())
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    dotenvy::dotenv().with_context(|| {
        format!(
            "Missing env vars {:?} and failed to load .env file",
            missing
        )
    })?;

    let still_missing: Vec<&str> = required
        .iter()
        .filter(|var| env::var(var).is_err())
        .copied()
        .collect();

    anyhow::ensure!(
        still_missing.is_empty(),
        "Missing required env vars after loading .env: {:?}",
        still_missing
    );

    Ok(())
}

fn apply_env_overrides(pipeline: &mut PipelineConfig) {
    if let Some(workers) = env_parse::<usize>("CATCHUP_WORKERS") {
        pipeline.catchup_workers = Some(workers);
    }
    if let Some(workers) = env_parse::<usize>("LIVE_WORKERS") {
        pipeline.live_workers = Some(workers);
    }
    if let Some(rps) = env_parse::<u32>("RPC_REQUESTS_PER_SECOND") {
        pipeline.requests_per_second = Some(rps);
    }
    tracing::info!(
        "Worker config: catchup={}, live={}, rps={}",
        pipeline.catchup_workers(),
        pipeline.live_workers(),
        pipeline.requests_per_second()
    );
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

fn build_reader(chain: &ChainConfig, pipeline: &PipelineConfig) -> anyhow::Result<Arc<dyn ChainReader>> {
    let rpc_url = env::var(&chain.rpc_url_env_var).with_context(|| {
        format!(
            "env var {} not set for chain {}",
            chain.rpc_url_env_var, chain.name
        )
    })?;
    let url = Url::parse(&rpc_url)
        .with_context(|| format!("invalid RPC URL for chain {}", chain.name))?;
    let client_config = RpcClientConfig::new(url)
        .with_rate_limit(RateLimitConfig::per_second(pipeline.requests_per_second()));
    let client = Arc::new(RpcClient::new(client_config)?);
    Ok(Arc::new(OnChainReader::new(client)))
}

fn build_context(
    chain: &ChainConfig,
    pipeline: &PipelineConfig,
    cache_dir: &Path,
    repo: Arc<dyn TokenRepository>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
) -> anyhow::Result<Arc<IndexerContext>> {
    let reader = if chain.rpc_enabled {
        Some(build_reader(chain, pipeline)?)
    } else {
        tracing::info!("Chain {} running in cache replay mode", chain.name);
        None
    };

    let store = Arc::new(LogStore::new(
        cache_dir,
        &chain.name,
        reader.clone(),
        chain.contracts.clone(),
    )?);
    let stats = Arc::new(StatsTracker::load(cache_dir, &chain.name));
    let metadata = Arc::new(MetadataClient::new(
        pipeline.metadata_timeout(),
        pipeline.ipfs_gateway(),
    )?);
    let upserter = Arc::new(Upserter::new(
        repo,
        reader.clone(),
        store.clone(),
        write_lock,
    ));

    Ok(Arc::new(IndexerContext {
        chain: chain.clone(),
        pipeline: pipeline.clone(),
        store,
        stats,
        reader,
        metadata,
        upserter,
    }))
}

/// `refresh <chain> owner <address>` or `refresh <chain> token <key>`,
/// where a token key is `{chain_id}-{contract}-{token_id}`.
async fn run_refresh(
    config: &IndexerConfig,
    pipeline: &PipelineConfig,
    repo: Arc<dyn TokenRepository>,
    args: &[String],
) -> anyhow::Result<()> {
    const USAGE: &str = "usage: refresh <chain> owner <address> | refresh <chain> token <key>";
    let [chain_name, mode, value] = args else {
        anyhow::bail!(USAGE);
    };
    let chain = config
        .chains
        .iter()
        .find(|c| &c.name == chain_name)
        .with_context(|| format!("chain {} not in config", chain_name))?;
    anyhow::ensure!(
        chain.rpc_enabled,
        "chain {} has no RPC endpoint configured",
        chain.name
    );

    let selector = match mode.as_str() {
        "owner" => RefreshSelector::Owner(
            Address::from_str(value).context("invalid owner address")?,
        ),
        "token" => RefreshSelector::Token(TokenId::from_str(value).context("invalid token key")?),
        _ => anyhow::bail!(USAGE),
    };

    let reader = build_reader(chain, pipeline)?;
    let metadata = Arc::new(MetadataClient::new(
        pipeline.metadata_timeout(),
        pipeline.ipfs_gateway(),
    )?);

    let runner = RefreshRunner::new(repo, reader, metadata, None);
    let updated = runner.run(chain.chain_id, selector).await?;
    tracing::info!("Refreshed {} token(s) on chain {}", updated, chain.name);
    Ok(())
}
