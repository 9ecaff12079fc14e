use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use tokio_postgres::Row;

use super::error::DbError;
use super::pool::DbPool;
use super::types::{DbOperation, DbValue, WhereClause};
use crate::types::token::{Contract, HolderBalance, Media, Token, TokenId, TokenKind, TokenMetadata};

/// What to count. The status surface reports totals, per-standard splits,
/// and how many tokens still have no resolved metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountCategory {
    All,
    Kind(TokenKind),
    MissingMetadata,
}

/// Persistence boundary for synthesized state. The pipeline only ever
/// talks to this trait; tests substitute an in-memory double.
#[async_trait]
pub trait TokenRepository: Send + Sync + 'static {
    async fn bulk_upsert_tokens(&self, tokens: &[Token]) -> Result<(), DbError>;

    async fn bulk_upsert_contracts(&self, contracts: &[Contract]) -> Result<(), DbError>;

    /// Highest block any persisted token has been stamped with.
    async fn most_recent_block(&self, chain_id: u64) -> Result<u64, DbError>;

    async fn count_by_category(&self, chain_id: u64, category: CountCategory)
    -> Result<i64, DbError>;

    async fn tokens_by_owner(&self, chain_id: u64, owner: Address) -> Result<Vec<Token>, DbError>;

    async fn token_by_key(&self, id: &TokenId) -> Result<Option<Token>, DbError>;

    /// Writes back re-resolved uri/metadata/media for one token. Used by
    /// the manual refresh flow; ownership fields are left untouched.
    async fn update_token_metadata(&self, token: &Token) -> Result<(), DbError>;
}

const TOKEN_SELECT: &str = "SELECT chain_id, contract, token_id::text AS token_id, kind, owner, \
     previous_owners, balances, uri, name, description, metadata, media, block_number FROM tokens";

pub struct PostgresTokenRepository {
    pool: Arc<DbPool>,
}

impl PostgresTokenRepository {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenRepository for PostgresTokenRepository {
    async fn bulk_upsert_tokens(&self, tokens: &[Token]) -> Result<(), DbError> {
        let ops = tokens.iter().map(upsert_token).collect();
        self.pool.execute_transaction(ops).await
    }

    async fn bulk_upsert_contracts(&self, contracts: &[Contract]) -> Result<(), DbError> {
        let ops = contracts.iter().map(upsert_contract).collect();
        self.pool.execute_transaction(ops).await
    }

    async fn most_recent_block(&self, chain_id: u64) -> Result<u64, DbError> {
        let rows = self
            .pool
            .query(
                "SELECT COALESCE(MAX(block_number), 0) FROM tokens WHERE chain_id = $1",
                &[&(chain_id as i64)],
            )
            .await?;
        let max: i64 = rows
            .first()
            .map(|row| row.try_get(0))
            .transpose()?
            .unwrap_or(0);
        Ok(max as u64)
    }

    async fn count_by_category(
        &self,
        chain_id: u64,
        category: CountCategory,
    ) -> Result<i64, DbError> {
        let chain = chain_id as i64;
        let rows = match category {
            CountCategory::All => {
                self.pool
                    .query(
                        "SELECT COUNT(*) FROM tokens WHERE chain_id = $1",
                        &[&chain],
                    )
                    .await?
            }
            CountCategory::Kind(kind) => {
                self.pool
                    .query(
                        "SELECT COUNT(*) FROM tokens WHERE chain_id = $1 AND kind = $2",
                        &[&chain, &kind.as_i16()],
                    )
                    .await?
            }
            CountCategory::MissingMetadata => {
                self.pool
                    .query(
                        "SELECT COUNT(*) FROM tokens WHERE chain_id = $1 AND metadata IS NULL",
                        &[&chain],
                    )
                    .await?
            }
        };
        let count: i64 = rows
            .first()
            .map(|row| row.try_get(0))
            .transpose()?
            .unwrap_or(0);
        Ok(count)
    }

    async fn tokens_by_owner(&self, chain_id: u64, owner: Address) -> Result<Vec<Token>, DbError> {
        let query = format!("{} WHERE chain_id = $1 AND owner = $2", TOKEN_SELECT);
        let owner_bytes = owner.as_slice().to_vec();
        let rows = self
            .pool
            .query(&query, &[&(chain_id as i64), &owner_bytes])
            .await?;
        rows.iter().map(token_from_row).collect()
    }

    async fn token_by_key(&self, id: &TokenId) -> Result<Option<Token>, DbError> {
        let query = format!(
            "{} WHERE chain_id = $1 AND contract = $2 AND token_id = $3::text::numeric",
            TOKEN_SELECT
        );
        let contract_bytes = id.contract.as_slice().to_vec();
        let token_id_text = id.token_id.to_string();
        let rows = self
            .pool
            .query(
                &query,
                &[&(id.chain_id as i64), &contract_bytes, &token_id_text],
            )
            .await?;
        rows.first().map(token_from_row).transpose()
    }

    async fn update_token_metadata(&self, token: &Token) -> Result<(), DbError> {
        self.pool
            .execute_transaction(vec![update_metadata_op(token)])
            .await
    }
}

pub fn upsert_token(token: &Token) -> DbOperation {
    DbOperation::Upsert {
        table: "tokens".to_string(),
        columns: vec![
            "chain_id".to_string(),
            "contract".to_string(),
            "token_id".to_string(),
            "kind".to_string(),
            "owner".to_string(),
            "previous_owners".to_string(),
            "balances".to_string(),
            "uri".to_string(),
            "name".to_string(),
            "description".to_string(),
            "metadata".to_string(),
            "media".to_string(),
            "block_number".to_string(),
        ],
        values: vec![
            DbValue::Uint64(token.id.chain_id),
            DbValue::Address(token.id.contract.0.0),
            DbValue::Numeric(token.id.token_id.to_string()),
            DbValue::Int16(token.kind.as_i16()),
            match token.owner {
                Some(owner) => DbValue::Address(owner.0.0),
                None => DbValue::Null,
            },
            DbValue::jsonb(&token.previous_owners),
            DbValue::jsonb(&token.balances),
            DbValue::opt_text(token.uri.as_deref()),
            DbValue::opt_text(token.name.as_deref()),
            DbValue::opt_text(token.description.as_deref()),
            match &token.metadata {
                Some(metadata) => DbValue::jsonb(metadata),
                None => DbValue::Null,
            },
            match &token.media {
                Some(media) => DbValue::jsonb(media),
                None => DbValue::Null,
            },
            DbValue::Uint64(token.block_number),
        ],
        conflict_columns: vec![
            "chain_id".to_string(),
            "contract".to_string(),
            "token_id".to_string(),
        ],
        update_columns: vec![
            "kind".to_string(),
            "owner".to_string(),
            "previous_owners".to_string(),
            "balances".to_string(),
            "uri".to_string(),
            "name".to_string(),
            "description".to_string(),
            "metadata".to_string(),
            "media".to_string(),
            "block_number".to_string(),
        ],
    }
}

pub fn upsert_contract(contract: &Contract) -> DbOperation {
    DbOperation::Upsert {
        table: "contracts".to_string(),
        columns: vec![
            "chain_id".to_string(),
            "address".to_string(),
            "kind".to_string(),
            "name".to_string(),
            "symbol".to_string(),
            "owner".to_string(),
            "block_number".to_string(),
        ],
        values: vec![
            DbValue::Uint64(contract.chain_id),
            DbValue::Address(contract.address.0.0),
            DbValue::Int16(contract.kind.as_i16()),
            DbValue::opt_text(contract.name.as_deref()),
            DbValue::opt_text(contract.symbol.as_deref()),
            match contract.owner {
                Some(owner) => DbValue::Address(owner.0.0),
                None => DbValue::Null,
            },
            DbValue::Uint64(contract.block_number),
        ],
        conflict_columns: vec!["chain_id".to_string(), "address".to_string()],
        update_columns: vec![
            "kind".to_string(),
            "name".to_string(),
            "symbol".to_string(),
            "owner".to_string(),
            "block_number".to_string(),
        ],
    }
}

fn update_metadata_op(token: &Token) -> DbOperation {
    DbOperation::Update {
        table: "tokens".to_string(),
        set_columns: vec![
            ("uri".to_string(), DbValue::opt_text(token.uri.as_deref())),
            ("name".to_string(), DbValue::opt_text(token.name.as_deref())),
            (
                "description".to_string(),
                DbValue::opt_text(token.description.as_deref()),
            ),
            (
                "metadata".to_string(),
                match &token.metadata {
                    Some(metadata) => DbValue::jsonb(metadata),
                    None => DbValue::Null,
                },
            ),
            (
                "media".to_string(),
                match &token.media {
                    Some(media) => DbValue::jsonb(media),
                    None => DbValue::Null,
                },
            ),
        ],
        where_clause: WhereClause::And(vec![
            ("chain_id".to_string(), DbValue::Uint64(token.id.chain_id)),
            (
                "contract".to_string(),
                DbValue::Address(token.id.contract.0.0),
            ),
            (
                "token_id".to_string(),
                DbValue::Numeric(token.id.token_id.to_string()),
            ),
        ]),
    }
}

fn token_from_row(row: &Row) -> Result<Token, DbError> {
    let chain_id: i64 = row.try_get("chain_id")?;
    let contract_bytes: Vec<u8> = row.try_get("contract")?;
    let contract = address_from_bytes(&contract_bytes)?;

    let token_id_text: String = row.try_get("token_id")?;
    let token_id = U256::from_str(&token_id_text)
        .map_err(|e| DbError::MalformedRow(format!("token_id '{}': {}", token_id_text, e)))?;

    let kind_code: i16 = row.try_get("kind")?;
    let kind = TokenKind::from_i16(kind_code)
        .ok_or_else(|| DbError::MalformedRow(format!("unknown token kind {}", kind_code)))?;

    let owner: Option<Vec<u8>> = row.try_get("owner")?;
    let owner = owner.map(|bytes| address_from_bytes(&bytes)).transpose()?;

    let previous_owners: serde_json::Value = row.try_get("previous_owners")?;
    let previous_owners: Vec<Address> = serde_json::from_value(previous_owners)
        .map_err(|e| DbError::MalformedRow(format!("previous_owners: {}", e)))?;

    let balances: serde_json::Value = row.try_get("balances")?;
    let balances: Vec<HolderBalance> = serde_json::from_value(balances)
        .map_err(|e| DbError::MalformedRow(format!("balances: {}", e)))?;

    let metadata: Option<serde_json::Value> = row.try_get("metadata")?;
    let metadata: Option<TokenMetadata> = metadata
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| DbError::MalformedRow(format!("metadata: {}", e)))?;

    let media: Option<serde_json::Value> = row.try_get("media")?;
    let media: Option<Media> = media
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| DbError::MalformedRow(format!("media: {}", e)))?;

    let block_number: i64 = row.try_get("block_number")?;

    Ok(Token {
        id: TokenId {
            chain_id: chain_id as u64,
            contract,
            token_id,
        },
        kind,
        owner,
        previous_owners,
        balances,
        uri: row.try_get("uri")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        metadata,
        media,
        block_number: block_number as u64,
    })
}

fn address_from_bytes(bytes: &[u8]) -> Result<Address, DbError> {
    if bytes.len() != 20 {
        return Err(DbError::MalformedRow(format!(
            "expected 20 address bytes, got {}",
            bytes.len()
        )));
    }
    Ok(Address::from_slice(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    fn sample_token() -> Token {
        Token {
            id: TokenId {
                chain_id: 8453,
                contract: address!("4200000000000000000000000000000000000006"),
                token_id: U256::from(7u64),
            },
            kind: TokenKind::Erc721,
            owner: Some(address!("1111111111111111111111111111111111111111")),
            previous_owners: vec![address!("2222222222222222222222222222222222222222")],
            balances: Vec::new(),
            uri: Some("ipfs://QmHash/7.json".to_string()),
            name: Some("Plot #7".to_string()),
            description: None,
            metadata: None,
            media: None,
            block_number: 123,
        }
    }

    #[test]
    fn token_upsert_aligns_columns_and_values() {
        let DbOperation::Upsert {
            table,
            columns,
            values,
            conflict_columns,
            update_columns,
        } = upsert_token(&sample_token())
        else {
            panic!("expected an upsert");
        };

        assert_eq!(table, "tokens");
        assert_eq!(columns.len(), values.len());
        assert_eq!(
            conflict_columns,
            vec!["chain_id", "contract", "token_id"]
        );
        // Every non-key column is refreshed on conflict.
        for col in &columns {
            assert!(
                conflict_columns.contains(col) || update_columns.contains(col),
                "column {} neither key nor updated",
                col
            );
        }
    }

    #[test]
    fn multi_owner_tokens_upsert_with_null_owner() {
        let mut token = sample_token();
        token.kind = TokenKind::Erc1155;
        token.owner = None;
        token.balances = vec![HolderBalance {
            holder: address!("1111111111111111111111111111111111111111"),
            amount: U256::from(4u64),
            block_number: 100,
        }];

        let DbOperation::Upsert {
            columns, values, ..
        } = upsert_token(&token)
        else {
            panic!("expected an upsert");
        };

        let owner_idx = columns.iter().position(|c| c == "owner").unwrap();
        assert!(values[owner_idx].is_null());

        let balances_idx = columns.iter().position(|c| c == "balances").unwrap();
        assert!(matches!(&values[balances_idx], DbValue::JsonB(v) if v.is_array()));
    }

    #[test]
    fn metadata_update_targets_one_token() {
        let DbOperation::Update {
            table,
            set_columns,
            where_clause,
        } = update_metadata_op(&sample_token())
        else {
            panic!("expected an update");
        };

        assert_eq!(table, "tokens");
        assert!(set_columns.iter().any(|(c, _)| c == "uri"));
        assert!(set_columns.iter().all(|(c, _)| c != "owner"));

        let WhereClause::And(conditions) = where_clause else {
            panic!("expected a composite key match");
        };
        let cols: Vec<&str> = conditions.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(cols, vec!["chain_id", "contract", "token_id"]);
    }

    #[test]
    fn contract_upsert_keeps_address_as_key() {
        let contract = Contract {
            chain_id: 8453,
            address: address!("4200000000000000000000000000000000000006"),
            kind: TokenKind::Erc1155,
            name: None,
            symbol: None,
            owner: None,
            block_number: 55,
        };

        let DbOperation::Upsert {
            conflict_columns,
            update_columns,
            ..
        } = upsert_contract(&contract)
        else {
            panic!("expected an upsert");
        };
        assert_eq!(conflict_columns, vec!["chain_id", "address"]);
        assert!(!update_columns.contains(&"address".to_string()));
    }
}
