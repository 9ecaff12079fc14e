use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::SolEvent;
use thiserror::Error;

use crate::cache::RawLog;
use crate::types::erc::{IErc721, IErc1155};
use crate::types::token::{RefreshRequest, TokenId, TokenKind, Transfer};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("undecodable event payload at block {block}, log {log_index}: {source}")]
    Abi {
        block: u64,
        log_index: u32,
        #[source]
        source: alloy::sol_types::Error,
    },

    #[error(
        "batch transfer arrays disagree at block {block}, log {log_index}: {ids} ids vs {values} values"
    )]
    BatchShape {
        block: u64,
        log_index: u32,
        ids: usize,
        values: usize,
    },
}

/// Maps one raw log to its transfer records, dispatching on the signature
/// topic.
///
/// Logs that merely do not concern us return an empty vec: unknown
/// signatures (warned once per log), fungible `Transfer` events that share
/// the non-fungible signature but carry only three topics, and `URI`
/// events (picked up separately by [`decode_uri_refresh`]). An error means
/// the payload itself is broken and the enclosing unit of work should
/// stop.
pub fn decode_transfers(chain_id: u64, log: &RawLog) -> Result<Vec<Transfer>, DecodeError> {
    let Some(signature) = log.topics.first().map(|t| B256::from(*t)) else {
        tracing::warn!(
            "Dropping log without topics at block {}, index {}",
            log.block_number,
            log.log_index
        );
        return Ok(Vec::new());
    };

    if signature == IErc721::Transfer::SIGNATURE_HASH {
        decode_erc721_transfer(chain_id, log)
    } else if signature == IErc1155::TransferSingle::SIGNATURE_HASH {
        decode_erc1155_single(chain_id, log)
    } else if signature == IErc1155::TransferBatch::SIGNATURE_HASH {
        decode_erc1155_batch(chain_id, log)
    } else if signature == IErc1155::URI::SIGNATURE_HASH {
        Ok(Vec::new())
    } else {
        tracing::warn!(
            "Dropping log with unknown signature {} at block {}, index {}",
            signature,
            log.block_number,
            log.log_index
        );
        Ok(Vec::new())
    }
}

/// `URI` events signal that a token's metadata changed and should be
/// re-resolved even if this pass already memoized it.
pub fn decode_uri_refresh(chain_id: u64, log: &RawLog) -> Option<RefreshRequest> {
    let signature = log.topics.first().map(|t| B256::from(*t))?;
    if signature != IErc1155::URI::SIGNATURE_HASH || log.topics.len() != 2 {
        return None;
    }

    Some(RefreshRequest {
        token: TokenId {
            chain_id,
            contract: Address::from(log.address),
            token_id: topic_u256(&log.topics[1]),
        },
        kind: TokenKind::Erc1155,
    })
}

fn decode_erc721_transfer(chain_id: u64, log: &RawLog) -> Result<Vec<Transfer>, DecodeError> {
    // The fungible standard emits the same signature with the amount in
    // the data section instead of a third indexed topic. Those are not
    // tokens we track.
    if log.topics.len() == 3 {
        tracing::debug!(
            "Skipping fungible transfer at block {}, index {}",
            log.block_number,
            log.log_index
        );
        return Ok(Vec::new());
    }
    if log.topics.len() != 4 {
        tracing::warn!(
            "Dropping transfer with {} topics at block {}, index {}",
            log.topics.len(),
            log.block_number,
            log.log_index
        );
        return Ok(Vec::new());
    }

    Ok(vec![Transfer {
        token: TokenId {
            chain_id,
            contract: Address::from(log.address),
            token_id: topic_u256(&log.topics[3]),
        },
        kind: TokenKind::Erc721,
        from: topic_address(&log.topics[1]),
        to: topic_address(&log.topics[2]),
        amount: U256::from(1u8),
        block_number: log.block_number,
        log_index: log.log_index as u64,
        transaction_hash: B256::from(log.transaction_hash),
    }])
}

fn decode_erc1155_single(chain_id: u64, log: &RawLog) -> Result<Vec<Transfer>, DecodeError> {
    if log.topics.len() != 4 {
        tracing::warn!(
            "Dropping single transfer with {} topics at block {}, index {}",
            log.topics.len(),
            log.block_number,
            log.log_index
        );
        return Ok(Vec::new());
    }

    let event = IErc1155::TransferSingle::decode_raw_log(topic_words(log), &log.data)
        .map_err(|source| DecodeError::Abi {
            block: log.block_number,
            log_index: log.log_index,
            source,
        })?;

    Ok(vec![Transfer {
        token: TokenId {
            chain_id,
            contract: Address::from(log.address),
            token_id: event.id,
        },
        kind: TokenKind::Erc1155,
        from: event.from,
        to: event.to,
        amount: event.value,
        block_number: log.block_number,
        log_index: log.log_index as u64,
        transaction_hash: B256::from(log.transaction_hash),
    }])
}

fn decode_erc1155_batch(chain_id: u64, log: &RawLog) -> Result<Vec<Transfer>, DecodeError> {
    if log.topics.len() != 4 {
        tracing::warn!(
            "Dropping batch transfer with {} topics at block {}, index {}",
            log.topics.len(),
            log.block_number,
            log.log_index
        );
        return Ok(Vec::new());
    }

    let event = IErc1155::TransferBatch::decode_raw_log(topic_words(log), &log.data).map_err(
        |source| DecodeError::Abi {
            block: log.block_number,
            log_index: log.log_index,
            source,
        },
    )?;

    if event.ids.len() != event.values.len() {
        return Err(DecodeError::BatchShape {
            block: log.block_number,
            log_index: log.log_index,
            ids: event.ids.len(),
            values: event.values.len(),
        });
    }

    let transfers = event
        .ids
        .iter()
        .zip(event.values.iter())
        .map(|(id, value)| Transfer {
            token: TokenId {
                chain_id,
                contract: Address::from(log.address),
                token_id: *id,
            },
            kind: TokenKind::Erc1155,
            from: event.from,
            to: event.to,
            amount: *value,
            block_number: log.block_number,
            log_index: log.log_index as u64,
            transaction_hash: B256::from(log.transaction_hash),
        })
        .collect();

    Ok(transfers)
}

fn topic_words(log: &RawLog) -> impl Iterator<Item = B256> + '_ {
    log.topics.iter().map(|t| B256::from(*t))
}

fn topic_address(topic: &[u8; 32]) -> Address {
    Address::from_slice(&topic[12..])
}

fn topic_u256(topic: &[u8; 32]) -> U256 {
    U256::from_be_bytes(*topic)
}
