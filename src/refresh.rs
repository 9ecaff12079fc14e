use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use async_trait::async_trait;
use thiserror::Error;

use crate::db::{DbError, TokenRepository};
use crate::metadata::{
    DESCRIPTION_MAX_CHARS, MAX_URI_BYTES, MetadataClient, NAME_MAX_CHARS, expand_id_placeholder,
    sanitize_text,
};
use crate::rpc::ChainReader;
use crate::types::token::{Media, Token, TokenId};

/// Ceiling on one media resolution. Resolvers may mirror or transcode, so
/// this is far looser than the metadata fetch timeout.
pub const MEDIA_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(600);

/// What to refresh: every token an owner holds, or a single token.
#[derive(Debug, Clone)]
pub enum RefreshSelector {
    Owner(Address),
    Token(TokenId),
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("token {0} is not indexed")]
    NotFound(TokenId),
}

/// External collaborator that turns a content URI into a stored media
/// descriptor. Mirroring, thumbnailing, and the like live behind it.
#[async_trait]
pub trait MediaResolver: Send + Sync + 'static {
    async fn resolve(&self, uri: &str) -> Result<Media, String>;
}

pub struct RefreshRunner {
    repo: Arc<dyn TokenRepository>,
    reader: Arc<dyn ChainReader>,
    metadata: Arc<MetadataClient>,
    media: Option<Arc<dyn MediaResolver>>,
}

impl RefreshRunner {
    pub fn new(
        repo: Arc<dyn TokenRepository>,
        reader: Arc<dyn ChainReader>,
        metadata: Arc<MetadataClient>,
        media: Option<Arc<dyn MediaResolver>>,
    ) -> Self {
        RefreshRunner {
            repo,
            reader,
            metadata,
            media,
        }
    }

    /// Re-resolves URI, metadata, and media for the selected tokens and
    /// writes the result back. Returns how many tokens were updated; a
    /// token whose URI call fails is logged and skipped, not fatal.
    pub async fn run(
        &self,
        chain_id: u64,
        selector: RefreshSelector,
    ) -> Result<usize, RefreshError> {
        let targets = match selector {
            RefreshSelector::Owner(owner) => self.repo.tokens_by_owner(chain_id, owner).await?,
            RefreshSelector::Token(key) => {
                let token = self
                    .repo
                    .token_by_key(&key)
                    .await?
                    .ok_or(RefreshError::NotFound(key))?;
                vec![token]
            }
        };
        tracing::info!("Refreshing {} token(s) on chain {}", targets.len(), chain_id);

        let mut updated = 0;
        for mut token in targets {
            match self.refresh_token(&mut token).await {
                Ok(()) => {
                    self.repo.update_token_metadata(&token).await?;
                    updated += 1;
                }
                Err(e) => tracing::warn!("Refresh skipped for {}: {}", token.id, e),
            }
        }
        Ok(updated)
    }

    async fn refresh_token(&self, token: &mut Token) -> Result<(), String> {
        let uri = self
            .reader
            .token_uri(token.id.contract, token.id.token_id, token.kind)
            .await
            .map_err(|e| e.to_string())?;
        if uri.is_empty() {
            return Err("contract returned an empty uri".to_string());
        }
        if uri.len() > MAX_URI_BYTES {
            return Err(format!("uri of {} bytes exceeds cap", uri.len()));
        }
        let uri = expand_id_placeholder(&uri, token.id.token_id);

        // A failed document fetch keeps whatever was stored before; a
        // refresh must never trade good metadata for a transient error.
        match self.metadata.fetch(&uri).await {
            Ok(document) => {
                let lift = |text: &Option<String>, cap: usize| {
                    text.as_deref()
                        .map(|t| sanitize_text(t, cap))
                        .filter(|t| !t.is_empty())
                };
                token.name = lift(&document.name, NAME_MAX_CHARS);
                token.description = lift(&document.description, DESCRIPTION_MAX_CHARS);
                token.metadata = (!document.is_empty()).then_some(document);
            }
            Err(e) => tracing::warn!("Metadata fetch failed for {}: {}", token.id, e),
        }
        token.uri = Some(uri);

        if let Some(resolver) = &self.media {
            let content = token
                .metadata
                .as_ref()
                .and_then(|m| m.image.clone().or_else(|| m.animation_url.clone()));
            if let Some(content) = content {
                match tokio::time::timeout(MEDIA_RESOLUTION_TIMEOUT, resolver.resolve(&content))
                    .await
                {
                    Ok(Ok(media)) => token.media = Some(media),
                    Ok(Err(e)) => {
                        tracing::warn!("Media resolution failed for {}: {}", token.id, e)
                    }
                    Err(_) => tracing::warn!("Media resolution timed out for {}", token.id),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CountCategory;
    use crate::rpc::{ContractProfile, RpcError};
    use crate::types::token::{Contract, TokenKind, TokenMetadata};
    use alloy::primitives::{U256, address};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn stored_token(id: u64) -> Token {
        Token {
            id: TokenId {
                chain_id: 8453,
                contract: address!("4200000000000000000000000000000000000006"),
                token_id: U256::from(id),
            },
            kind: TokenKind::Erc721,
            owner: Some(address!("1111111111111111111111111111111111111111")),
            previous_owners: Vec::new(),
            balances: Vec::new(),
            uri: Some("ipfs://old".to_string()),
            name: Some("Old Name".to_string()),
            description: None,
            metadata: Some(TokenMetadata {
                name: Some("Old Name".to_string()),
                ..TokenMetadata::default()
            }),
            media: None,
            block_number: 10,
        }
    }

    struct StoreRepo {
        tokens: Vec<Token>,
        updates: Mutex<Vec<Token>>,
    }

    impl StoreRepo {
        fn holding(tokens: Vec<Token>) -> Self {
            StoreRepo {
                tokens,
                updates: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TokenRepository for StoreRepo {
        async fn bulk_upsert_tokens(&self, _tokens: &[Token]) -> Result<(), DbError> {
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
            owner: Address,
        ) -> Result<Vec<Token>, DbError> {
            Ok(self
                .tokens
                .iter()
                .filter(|t| t.owner == Some(owner))
                .cloned()
                .collect())
        }

        async fn token_by_key(&self, key: &TokenId) -> Result<Option<Token>, DbError> {
            Ok(self.tokens.iter().find(|t| &t.id == key).cloned())
        }

        async fn update_token_metadata(&self, token: &Token) -> Result<(), DbError> {
            self.updates.lock().unwrap().push(token.clone());
            Ok(())
        }
    }

    struct UriReader {
        uri: String,
    }

    #[async_trait]
    impl ChainReader for UriReader {
        async fn head_block(&self) -> Result<u64, RpcError> {
            Ok(0)
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
            _holder: Address,
            _id: U256,
            _block: u64,
        ) -> Result<U256, RpcError> {
            Ok(U256::ZERO)
        }

        async fn token_uri(
            &self,
            _contract: Address,
            _id: U256,
            _kind: TokenKind,
        ) -> Result<String, RpcError> {
            Ok(self.uri.clone())
        }

        async fn contract_profile(&self, _contract: Address) -> ContractProfile {
            ContractProfile::default()
        }
    }

    struct CountingResolver {
        calls: AtomicU32,
    }

    #[async_trait]
    impl MediaResolver for CountingResolver {
        async fn resolve(&self, uri: &str) -> Result<Media, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Media {
                uri: format!("https://cdn.example/{}", uri.len()),
                content_type: Some("image/png".to_string()),
                size_bytes: Some(1024),
            })
        }
    }

    fn client() -> Arc<MetadataClient> {
        Arc::new(MetadataClient::new(Duration::from_secs(5), "https://ipfs.io/ipfs/").unwrap())
    }

    #[tokio::test]
    async fn single_token_refresh_rewrites_metadata_and_media() {
        let repo = Arc::new(StoreRepo::holding(vec![stored_token(1)]));
        let reader = Arc::new(UriReader {
            uri: "data:application/json,{\"name\":\"New Name\",\"image\":\"ipfs://img\"}"
                .to_string(),
        });
        let resolver = Arc::new(CountingResolver {
            calls: AtomicU32::new(0),
        });
        let runner = RefreshRunner::new(repo.clone(), reader, client(), Some(resolver.clone()));

        let updated = runner
            .run(8453, RefreshSelector::Token(stored_token(1).id))
            .await
            .unwrap();

        assert_eq!(updated, 1);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
        let updates = repo.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].name.as_deref(), Some("New Name"));
        assert!(updates[0].uri.as_deref().unwrap().starts_with("data:"));
        assert_eq!(
            updates[0].media.as_ref().unwrap().content_type.as_deref(),
            Some("image/png")
        );
    }

    #[tokio::test]
    async fn owner_refresh_covers_every_held_token() {
        let repo = Arc::new(StoreRepo::holding(vec![stored_token(1), stored_token(2)]));
        let reader = Arc::new(UriReader {
            uri: "data:application/json,{\"name\":\"Held\"}".to_string(),
        });
        let runner = RefreshRunner::new(repo.clone(), reader, client(), None);

        let updated = runner
            .run(
                8453,
                RefreshSelector::Owner(address!("1111111111111111111111111111111111111111")),
            )
            .await
            .unwrap();

        assert_eq!(updated, 2);
        assert_eq!(repo.updates.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_token_reports_not_found() {
        let repo = Arc::new(StoreRepo::holding(Vec::new()));
        let reader = Arc::new(UriReader {
            uri: String::new(),
        });
        let runner = RefreshRunner::new(repo, reader, client(), None);

        let result = runner
            .run(8453, RefreshSelector::Token(stored_token(9).id))
            .await;

        assert!(matches!(result, Err(RefreshError::NotFound(_))));
    }

    #[tokio::test]
    async fn failed_document_fetch_keeps_stored_metadata() {
        let repo = Arc::new(StoreRepo::holding(vec![stored_token(1)]));
        // An unsupported scheme makes the fetch fail without any network.
        let reader = Arc::new(UriReader {
            uri: "data:text/plain,not-json".to_string(),
        });
        let runner = RefreshRunner::new(repo.clone(), reader, client(), None);

        let updated = runner
            .run(8453, RefreshSelector::Token(stored_token(1).id))
            .await
            .unwrap();

        assert_eq!(updated, 1);
        let updates = repo.updates.lock().unwrap();
        assert_eq!(updates[0].name.as_deref(), Some("Old Name"));
        assert!(updates[0].metadata.is_some());
        assert_eq!(updates[0].uri.as_deref(), Some("data:text/plain,not-json"));
    }

    #[tokio::test]
    async fn empty_uri_skips_the_token_without_failing_the_run() {
        let repo = Arc::new(StoreRepo::holding(vec![stored_token(1)]));
        let reader = Arc::new(UriReader {
            uri: String::new(),
        });
        let runner = RefreshRunner::new(repo.clone(), reader, client(), None);

        let updated = runner
            .run(8453, RefreshSelector::Token(stored_token(1).id))
            .await
            .unwrap();

        assert_eq!(updated, 0);
        assert!(repo.updates.lock().unwrap().is_empty());
    }
}
