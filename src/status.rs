use serde::Serialize;

use crate::cache::StatsTracker;
use crate::db::{CountCategory, DbError, TokenRepository};
use crate::types::token::TokenKind;

/// Point-in-time view of one chain's progress, shaped for a status
/// endpoint or a shutdown log line. Token counts come from the database;
/// block positions and URI failures from the in-process tracker.
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub chain_id: u64,
    pub state: u8,
    pub total_tokens: i64,
    pub erc721_tokens: i64,
    pub erc1155_tokens: i64,
    pub missing_metadata: i64,
    pub most_recent_block: u64,
    pub last_synced_block: u64,
    pub chain_head: u64,
    pub bad_uris: u64,
}

pub async fn snapshot(
    chain_id: u64,
    repo: &dyn TokenRepository,
    stats: &StatsTracker,
) -> Result<StatusSnapshot, DbError> {
    let progress = stats.snapshot();
    Ok(StatusSnapshot {
        chain_id,
        state: progress.state,
        total_tokens: repo.count_by_category(chain_id, CountCategory::All).await?,
        erc721_tokens: repo
            .count_by_category(chain_id, CountCategory::Kind(TokenKind::Erc721))
            .await?,
        erc1155_tokens: repo
            .count_by_category(chain_id, CountCategory::Kind(TokenKind::Erc1155))
            .await?,
        missing_metadata: repo
            .count_by_category(chain_id, CountCategory::MissingMetadata)
            .await?,
        most_recent_block: repo.most_recent_block(chain_id).await?,
        last_synced_block: progress.last_synced_block,
        chain_head: stats.chain_head(),
        bad_uris: progress.bad_uris,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{IndexingState, PassCounts};
    use crate::types::token::{Contract, Token, TokenId};
    use alloy::primitives::Address;
    use async_trait::async_trait;

    struct CountingRepo;

    #[async_trait]
    impl TokenRepository for CountingRepo {
        async fn bulk_upsert_tokens(&self, _tokens: &[Token]) -> Result<(), DbError> {
            Ok(())
        }

        async fn bulk_upsert_contracts(&self, _contracts: &[Contract]) -> Result<(), DbError> {
            Ok(())
        }

        async fn most_recent_block(&self, _chain_id: u64) -> Result<u64, DbError> {
            Ok(123456)
        }

        async fn count_by_category(
            &self,
            _chain_id: u64,
            category: CountCategory,
        ) -> Result<i64, DbError> {
            Ok(match category {
                CountCategory::All => 10,
                CountCategory::Kind(TokenKind::Erc721) => 7,
                CountCategory::Kind(TokenKind::Erc1155) => 3,
                CountCategory::MissingMetadata => 2,
            })
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

    #[tokio::test]
    async fn snapshot_combines_database_counts_with_tracker_positions() {
        let dir = tempfile::tempdir().unwrap();
        let stats = StatsTracker::load(dir.path(), "base");
        stats.set_state(IndexingState::LiveTail);
        stats.advance_last_synced(900);
        stats.set_chain_head(950);
        stats.record_pass(&PassCounts {
            bad_uris: 4,
            ..PassCounts::default()
        });

        let snapshot = snapshot(8453, &CountingRepo, &stats).await.unwrap();

        assert_eq!(snapshot.chain_id, 8453);
        assert_eq!(snapshot.state, IndexingState::LiveTail.code());
        assert_eq!(snapshot.total_tokens, 10);
        assert_eq!(snapshot.erc721_tokens, 7);
        assert_eq!(snapshot.erc1155_tokens, 3);
        assert_eq!(snapshot.missing_metadata, 2);
        assert_eq!(snapshot.most_recent_block, 123456);
        assert_eq!(snapshot.last_synced_block, 900);
        assert_eq!(snapshot.chain_head, 950);
        assert_eq!(snapshot.bad_uris, 4);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["total_tokens"], 10);
        assert_eq!(json["chain_head"], 950);
    }
}
