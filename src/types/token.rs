use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which transfer standard a token follows. Single-owner tokens carry an
/// `owner` field on their record, multi-owner tokens carry per-holder
/// balances instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    Erc721,
    Erc1155,
}

impl TokenKind {
    /// Standard number as stored in the `kind` column.
    pub fn as_i16(&self) -> i16 {
        match self {
            TokenKind::Erc721 => 721,
            TokenKind::Erc1155 => 1155,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            721 => Some(TokenKind::Erc721),
            1155 => Some(TokenKind::Erc1155),
            _ => None,
        }
    }
}

/// Identity of a token: chain, contract, and on-contract id. The canonical
/// string form is `{chain_id}-{contract}-{token_id}` with the contract in
/// 0x-prefixed hex and the id in decimal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenId {
    pub chain_id: u64,
    pub contract: Address,
    pub token_id: U256,
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:#x}-{}", self.chain_id, self.contract, self.token_id)
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("malformed token key '{0}': expected chain-contract-id")]
    Shape(String),

    #[error("invalid chain id in token key: {0}")]
    ChainId(String),

    #[error("invalid contract address in token key: {0}")]
    Contract(String),

    #[error("invalid token id in token key: {0}")]
    TokenId(String),
}

impl FromStr for TokenId {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '-');
        let (chain, contract, id) = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), Some(c)) => (a, b, c),
            _ => return Err(KeyError::Shape(s.to_string())),
        };

        let chain_id = chain
            .parse::<u64>()
            .map_err(|_| KeyError::ChainId(chain.to_string()))?;
        let contract = Address::from_str(contract)
            .map_err(|_| KeyError::Contract(contract.to_string()))?;
        let token_id = U256::from_str(id).map_err(|_| KeyError::TokenId(id.to_string()))?;

        Ok(TokenId {
            chain_id,
            contract,
            token_id,
        })
    }
}

/// A single decoded transfer event. Batch events expand into one `Transfer`
/// per (id, value) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub token: TokenId,
    pub kind: TokenKind,
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: B256,
}

/// An ownership observation anchored to its position in the log stream.
/// Merge decisions compare (block_number, log_index), never arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerAtBlock {
    pub owner: Address,
    pub block_number: u64,
    pub log_index: u64,
}

impl OwnerAtBlock {
    /// True when `self` is at least as recent in the log stream as `other`.
    pub fn supersedes(&self, other: &OwnerAtBlock) -> bool {
        (self.block_number, self.log_index) >= (other.block_number, other.log_index)
    }
}

/// A holder's live-queried balance of a multi-owner token, as of a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderBalance {
    pub holder: Address,
    pub amount: U256,
    pub block_number: u64,
}

/// Parsed token metadata document. Field aliases cover the common
/// spellings seen in the wild.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(alias = "image_url", alias = "imageUrl")]
    pub image: Option<String>,
    #[serde(alias = "animation_url", alias = "animationUrl")]
    pub animation_url: Option<String>,
    #[serde(alias = "external_url", alias = "externalUrl")]
    pub external_url: Option<String>,
    pub attributes: Option<serde_json::Value>,
}

impl TokenMetadata {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.image.is_none()
            && self.animation_url.is_none()
            && self.external_url.is_none()
            && self.attributes.is_none()
    }
}

/// Media descriptor produced by an external resolver for a token's content
/// URI. This indexer only stores it; rendering and thumbnailing live
/// elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    pub uri: String,
    pub content_type: Option<String>,
    pub size_bytes: Option<u64>,
}

/// Fully synthesized token state, ready for a bulk upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub id: TokenId,
    pub kind: TokenKind,
    /// Current owner for single-owner tokens. `None` for multi-owner kinds.
    pub owner: Option<Address>,
    /// Prior owners in block-ascending order, deduplicated.
    pub previous_owners: Vec<Address>,
    /// Per-holder balances for multi-owner tokens, sorted by holder.
    pub balances: Vec<HolderBalance>,
    pub uri: Option<String>,
    /// Display fields lifted out of the metadata document and sanitized.
    pub name: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<TokenMetadata>,
    pub media: Option<Media>,
    /// Highest block this token was observed at during the pass.
    pub block_number: u64,
}

/// Contract-level record, enriched best-effort from on-chain calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    pub chain_id: u64,
    pub address: Address,
    pub kind: TokenKind,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub owner: Option<Address>,
    pub block_number: u64,
}

/// Request to re-resolve a token's URI and metadata, bypassing the per-pass
/// memo. Produced by on-chain URI events and by the manual refresh flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshRequest {
    pub token: TokenId,
    pub kind: TokenKind,
}
