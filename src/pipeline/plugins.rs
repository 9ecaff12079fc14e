use std::collections::HashSet;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::PassError;
use crate::metadata::{MAX_URI_BYTES, MetadataClient, expand_id_placeholder};
use crate::rpc::ChainReader;
use crate::types::token::{OwnerAtBlock, RefreshRequest, TokenId, TokenKind, TokenMetadata, Transfer};

/// Ownership observation for a single-owner token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerFact {
    pub token: TokenId,
    pub observed: OwnerAtBlock,
    /// The sending side, kept as ownership history. `None` for mints.
    pub prior: Option<Address>,
}

/// A holder's balance of a multi-owner token, queried live at the transfer
/// block. Query failures ride the channel as `Err` so one unresponsive
/// contract never unwinds the plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceFact {
    pub token: TokenId,
    pub holder: Address,
    pub block_number: u64,
    pub amount: Result<U256, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UriOutcome {
    /// URI resolved and the metadata document parsed.
    Resolved { uri: String, metadata: TokenMetadata },
    /// URI resolved but the document could not be fetched or parsed.
    DocumentFailed { uri: String, error: String },
    /// The on-chain call failed or returned an unusable URI.
    UriFailed { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct UriFact {
    pub token: TokenId,
    pub outcome: UriOutcome,
}

/// Cloneable sender half of the plugin pipeline. Transfer batches fan out
/// to the owner, balance, and URI plugins; refresh requests go straight to
/// the refresh plugin.
#[derive(Clone)]
pub struct PluginHandle {
    owner_tx: mpsc::Sender<Vec<Transfer>>,
    balance_tx: mpsc::Sender<Vec<Transfer>>,
    uri_tx: mpsc::Sender<Vec<Transfer>>,
    refresh_tx: mpsc::Sender<RefreshRequest>,
}

impl PluginHandle {
    pub async fn dispatch(&self, batch: Vec<Transfer>) -> Result<(), PassError> {
        self.owner_tx
            .send(batch.clone())
            .await
            .map_err(|_| PassError::ChannelClosed("owner plugin"))?;
        self.balance_tx
            .send(batch.clone())
            .await
            .map_err(|_| PassError::ChannelClosed("balance plugin"))?;
        self.uri_tx
            .send(batch)
            .await
            .map_err(|_| PassError::ChannelClosed("uri plugin"))?;
        Ok(())
    }

    pub async fn refresh(&self, request: RefreshRequest) -> Result<(), PassError> {
        self.refresh_tx
            .send(request)
            .await
            .map_err(|_| PassError::ChannelClosed("refresh plugin"))
    }
}

/// Receiving ends of the plugin result channels, one per plugin. Each is
/// drained by its own collector task in the aggregator.
pub struct PluginOutputs {
    pub owner_rx: mpsc::Receiver<OwnerFact>,
    pub balance_rx: mpsc::Receiver<BalanceFact>,
    pub uri_rx: mpsc::Receiver<UriFact>,
    pub refresh_rx: mpsc::Receiver<UriFact>,
}

/// Four field-resolution plugins running as independent tasks for the
/// duration of one pass. Each consumes its own bounded input channel and
/// emits facts on its own result channel; completion propagates by channel
/// closure, so a pass finishes by dropping every `PluginHandle` and then
/// awaiting `finish`.
pub struct PluginPipeline {
    handle: PluginHandle,
    workers: JoinSet<()>,
}

impl PluginPipeline {
    pub fn spawn(
        reader: Option<Arc<dyn ChainReader>>,
        metadata: Arc<MetadataClient>,
        capacity: usize,
    ) -> (Self, PluginOutputs) {
        let (owner_tx, owner_in) = mpsc::channel::<Vec<Transfer>>(capacity);
        let (balance_tx, balance_in) = mpsc::channel::<Vec<Transfer>>(capacity);
        let (uri_tx, uri_in) = mpsc::channel::<Vec<Transfer>>(capacity);
        let (refresh_tx, refresh_in) = mpsc::channel::<RefreshRequest>(capacity);

        let (owner_out, owner_rx) = mpsc::channel::<OwnerFact>(capacity);
        let (balance_out, balance_rx) = mpsc::channel::<BalanceFact>(capacity);
        let (uri_out, uri_rx) = mpsc::channel::<UriFact>(capacity);
        let (refresh_out, refresh_rx) = mpsc::channel::<UriFact>(capacity);

        let mut workers = JoinSet::new();
        workers.spawn(owner_worker(owner_in, owner_out));
        workers.spawn(balance_worker(reader.clone(), balance_in, balance_out));
        workers.spawn(uri_worker(
            reader.clone(),
            metadata.clone(),
            uri_in,
            uri_out,
        ));
        workers.spawn(refresh_worker(reader, metadata, refresh_in, refresh_out));

        let pipeline = PluginPipeline {
            handle: PluginHandle {
                owner_tx,
                balance_tx,
                uri_tx,
                refresh_tx,
            },
            workers,
        };
        let outputs = PluginOutputs {
            owner_rx,
            balance_rx,
            uri_rx,
            refresh_rx,
        };
        (pipeline, outputs)
    }

    pub fn handle(&self) -> PluginHandle {
        self.handle.clone()
    }

    /// Closes the input channels and waits for every plugin to drain. Must
    /// run while the aggregator is consuming the result channels, or a full
    /// result channel would leave a plugin blocked mid-drain.
    pub async fn finish(mut self) -> Result<(), PassError> {
        drop(self.handle);
        while let Some(result) = self.workers.join_next().await {
            result.map_err(|e| PassError::PluginPanic(e.to_string()))?;
        }
        Ok(())
    }
}

/// Single-owner transfers only. Pure bookkeeping, no chain calls: the
/// receiving side is the candidate owner, the sending side is history.
async fn owner_worker(mut rx: mpsc::Receiver<Vec<Transfer>>, tx: mpsc::Sender<OwnerFact>) {
    while let Some(batch) = rx.recv().await {
        for transfer in batch {
            if transfer.kind != TokenKind::Erc721 {
                continue;
            }
            let fact = OwnerFact {
                observed: OwnerAtBlock {
                    owner: transfer.to,
                    block_number: transfer.block_number,
                    log_index: transfer.log_index,
                },
                prior: (transfer.from != Address::ZERO).then_some(transfer.from),
                token: transfer.token,
            };
            if tx.send(fact).await.is_err() {
                return;
            }
        }
    }
}

/// Multi-owner transfers only. Balances are read from the chain at the
/// transfer block rather than accumulated locally, so a missed or replayed
/// transfer cannot drift a holder's amount. Zero-address ends of mints and
/// burns have no balance to track.
async fn balance_worker(
    reader: Option<Arc<dyn ChainReader>>,
    mut rx: mpsc::Receiver<Vec<Transfer>>,
    tx: mpsc::Sender<BalanceFact>,
) {
    let Some(reader) = reader else {
        tracing::warn!("No RPC reader; multi-owner balances will not be resolved this pass");
        while rx.recv().await.is_some() {}
        return;
    };

    while let Some(batch) = rx.recv().await {
        for transfer in batch {
            if transfer.kind != TokenKind::Erc1155 {
                continue;
            }
            for holder in [transfer.from, transfer.to] {
                if holder == Address::ZERO {
                    continue;
                }
                let amount = reader
                    .balance_of(
                        transfer.token.contract,
                        holder,
                        transfer.token.token_id,
                        transfer.block_number,
                    )
                    .await
                    .map_err(|e| e.to_string());
                let fact = BalanceFact {
                    token: transfer.token.clone(),
                    holder,
                    block_number: transfer.block_number,
                    amount,
                };
                if tx.send(fact).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Resolves each token's URI and metadata document at most once per pass.
/// The memo covers failures too, so a token with a broken URI costs one
/// resolution attempt rather than one per transfer.
async fn uri_worker(
    reader: Option<Arc<dyn ChainReader>>,
    metadata: Arc<MetadataClient>,
    mut rx: mpsc::Receiver<Vec<Transfer>>,
    tx: mpsc::Sender<UriFact>,
) {
    let Some(reader) = reader else {
        while rx.recv().await.is_some() {}
        return;
    };

    let mut seen: HashSet<TokenId> = HashSet::new();
    while let Some(batch) = rx.recv().await {
        for transfer in batch {
            if !seen.insert(transfer.token.clone()) {
                continue;
            }
            let outcome =
                resolve_uri(reader.as_ref(), &metadata, &transfer.token, transfer.kind).await;
            let fact = UriFact {
                token: transfer.token,
                outcome,
            };
            if tx.send(fact).await.is_err() {
                return;
            }
        }
    }
}

/// Re-resolves on demand, bypassing the per-pass memo. Fed by on-chain URI
/// events; its results overwrite whatever the URI plugin produced.
async fn refresh_worker(
    reader: Option<Arc<dyn ChainReader>>,
    metadata: Arc<MetadataClient>,
    mut rx: mpsc::Receiver<RefreshRequest>,
    tx: mpsc::Sender<UriFact>,
) {
    let Some(reader) = reader else {
        while rx.recv().await.is_some() {}
        return;
    };

    while let Some(request) = rx.recv().await {
        let outcome = resolve_uri(reader.as_ref(), &metadata, &request.token, request.kind).await;
        let fact = UriFact {
            token: request.token,
            outcome,
        };
        if tx.send(fact).await.is_err() {
            return;
        }
    }
}

pub(crate) async fn resolve_uri(
    reader: &dyn ChainReader,
    metadata: &MetadataClient,
    token: &TokenId,
    kind: TokenKind,
) -> UriOutcome {
    let uri = match reader.token_uri(token.contract, token.token_id, kind).await {
        Ok(uri) => uri,
        Err(e) => return UriOutcome::UriFailed {
            error: e.to_string(),
        },
    };

    if uri.is_empty() {
        return UriOutcome::UriFailed {
            error: "empty uri".to_string(),
        };
    }
    if uri.len() > MAX_URI_BYTES {
        tracing::warn!(
            "Discarding oversized URI for token {} ({} bytes)",
            token,
            uri.len()
        );
        return UriOutcome::UriFailed {
            error: format!("uri of {} bytes exceeds cap", uri.len()),
        };
    }

    let expanded = expand_id_placeholder(&uri, token.token_id);
    match metadata.fetch(&expanded).await {
        Ok(document) => UriOutcome::Resolved {
            uri,
            metadata: document,
        },
        Err(e) => UriOutcome::DocumentFailed {
            uri,
            error: e.to_string(),
        },
    }
}
