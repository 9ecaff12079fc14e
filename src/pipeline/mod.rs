pub mod aggregate;
pub mod plugins;
pub mod synthesize;
pub mod upsert;

pub use aggregate::{AggregatedMaps, FieldAggregator};
pub use plugins::{PluginHandle, PluginOutputs, PluginPipeline};
pub use synthesize::synthesize;
pub use upsert::Upserter;

use thiserror::Error;

use crate::db::DbError;
use crate::types::token::TokenId;

/// A pass either completes whole or reports why it could not. Partial
/// results are never persisted.
#[derive(Debug, Error)]
pub enum PassError {
    #[error("{0} channel closed before the pass finished")]
    ChannelClosed(&'static str),

    #[error("plugin task panicked: {0}")]
    PluginPanic(String),

    #[error("worker task panicked: {0}")]
    Join(String),

    #[error("token {token} carries both single-owner and multi-owner facts")]
    KindConflict { token: TokenId },

    #[error(transparent)]
    Db(#[from] DbError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataClient;
    use crate::rpc::{ChainReader, ContractProfile, RpcError};
    use crate::types::token::{Token, TokenKind, Transfer};
    use alloy::primitives::{Address, B256, U256, address};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    /// Answers balance queries by replaying a transfer ledger up to the
    /// queried block, the same way an archive node would.
    struct LedgerReader {
        ledger: Vec<(u64, Address, Address, u64)>,
    }

    #[async_trait]
    impl ChainReader for LedgerReader {
        async fn head_block(&self) -> Result<u64, RpcError> {
            Ok(self.ledger.iter().map(|(b, ..)| *b).max().unwrap_or(0))
        }

        async fn logs(
            &self,
            _from: u64,
            _to: u64,
            _contracts: &[Address],
        ) -> Result<Vec<crate::cache::RawLog>, RpcError> {
            Ok(Vec::new())
        }

        async fn balance_of(
            &self,
            _contract: Address,
            holder: Address,
            _id: U256,
            block: u64,
        ) -> Result<U256, RpcError> {
            let mut balance: i128 = 0;
            for (at, from, to, amount) in &self.ledger {
                if *at > block {
                    continue;
                }
                if *from == holder {
                    balance -= i128::from(*amount);
                }
                if *to == holder {
                    balance += i128::from(*amount);
                }
            }
            Ok(U256::from(balance.max(0) as u64))
        }

        async fn token_uri(
            &self,
            _contract: Address,
            id: U256,
            _kind: TokenKind,
        ) -> Result<String, RpcError> {
            Ok(format!(
                "data:application/json,{{\"name\":\"Ledger {}\"}}",
                id
            ))
        }

        async fn contract_profile(&self, _contract: Address) -> ContractProfile {
            ContractProfile::default()
        }
    }

    fn transfer(
        kind: TokenKind,
        id: u64,
        from: Address,
        to: Address,
        amount: u64,
        block: u64,
    ) -> Transfer {
        Transfer {
            token: crate::types::token::TokenId {
                chain_id: 8453,
                contract: address!("4200000000000000000000000000000000000006"),
                token_id: U256::from(id),
            },
            kind,
            from,
            to,
            amount: U256::from(amount),
            block_number: block,
            log_index: 0,
            transaction_hash: B256::ZERO,
        }
    }

    async fn run_pass(reader: Arc<dyn ChainReader>, batches: Vec<Vec<Transfer>>) -> Vec<Token> {
        let metadata = Arc::new(
            MetadataClient::new(Duration::from_secs(5), "https://ipfs.io/ipfs/").unwrap(),
        );
        let (pipeline, outputs) = PluginPipeline::spawn(Some(reader), metadata, 64);
        let aggregator = FieldAggregator::spawn(outputs);
        let handle = pipeline.handle();
        for batch in batches {
            handle.dispatch(batch).await.unwrap();
        }
        drop(handle);
        pipeline.finish().await.unwrap();
        let maps = aggregator.collect().await.unwrap();
        let (tokens, _) = synthesize(maps).unwrap();
        tokens
    }

    #[tokio::test]
    async fn multi_owner_balances_conserve_the_minted_supply() {
        let a = address!("1111111111111111111111111111111111111111");
        let b = address!("2222222222222222222222222222222222222222");
        let c = address!("3333333333333333333333333333333333333333");

        let ledger = vec![
            (10, Address::ZERO, a, 100),
            (20, a, b, 30),
            (30, b, c, 10),
        ];
        let batch: Vec<Transfer> = ledger
            .iter()
            .map(|&(block, from, to, amount)| {
                transfer(TokenKind::Erc1155, 7, from, to, amount, block)
            })
            .collect();
        let reader = Arc::new(LedgerReader { ledger });

        let tokens = run_pass(reader, vec![batch]).await;

        assert_eq!(tokens.len(), 1);
        let balances = &tokens[0].balances;
        assert_eq!(balances.len(), 3);
        let total = balances
            .iter()
            .fold(U256::ZERO, |acc, b| acc + b.amount);
        assert_eq!(total, U256::from(100u64));
        assert_eq!(tokens[0].owner, None);
        assert_eq!(tokens[0].block_number, 30);
    }

    #[tokio::test]
    async fn replaying_the_same_batches_synthesizes_identical_state() {
        let a = address!("1111111111111111111111111111111111111111");
        let b = address!("2222222222222222222222222222222222222222");

        let ledger = vec![(15, Address::ZERO, a, 50)];
        let batches = || {
            vec![
                vec![
                    transfer(TokenKind::Erc721, 1, Address::ZERO, a, 1, 10),
                    transfer(TokenKind::Erc721, 1, a, b, 1, 20),
                ],
                vec![transfer(TokenKind::Erc1155, 2, Address::ZERO, a, 50, 15)],
            ]
        };

        let first = run_pass(
            Arc::new(LedgerReader {
                ledger: ledger.clone(),
            }),
            batches(),
        )
        .await;
        let second = run_pass(Arc::new(LedgerReader { ledger }), batches()).await;

        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        let single = first.iter().find(|t| t.kind == TokenKind::Erc721).unwrap();
        assert_eq!(single.owner, Some(b));
        assert_eq!(single.previous_owners, vec![a]);
        assert_eq!(single.name.as_deref(), Some("Ledger 1"));
        let multi = first.iter().find(|t| t.kind == TokenKind::Erc1155).unwrap();
        assert_eq!(multi.balances.len(), 1);
        assert_eq!(multi.balances[0].amount, U256::from(50u64));
    }
}
