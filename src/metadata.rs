use std::time::Duration;

use thiserror::Error;

use crate::types::token::TokenMetadata;

/// URIs longer than this are discarded outright. Inline `data:` URIs can
/// embed whole documents, and storing megabytes in a URI column helps
/// nobody.
pub const MAX_URI_BYTES: usize = 100 * 1024;

pub const NAME_MAX_CHARS: usize = 512;
pub const DESCRIPTION_MAX_CHARS: usize = 4096;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("HTTP error fetching metadata: {0}")]
    Http(String),

    #[error("metadata document is not valid JSON: {0}")]
    Json(String),

    #[error("unsupported metadata URI scheme: {0}")]
    UnsupportedScheme(String),
}

/// Fetches and parses token metadata documents. One instance is shared by
/// the URI plugin and the manual refresh flow.
pub struct MetadataClient {
    http: reqwest::Client,
    ipfs_gateway: String,
}

impl MetadataClient {
    pub fn new(timeout: Duration, ipfs_gateway: &str) -> Result<Self, MetadataError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MetadataError::Http(e.to_string()))?;

        Ok(MetadataClient {
            http,
            ipfs_gateway: ipfs_gateway.to_string(),
        })
    }

    /// Rewrites non-HTTP schemes to something reqwest can reach. `ipfs://`
    /// paths go through the configured gateway, including the legacy
    /// `ipfs://ipfs/Qm...` double-prefix form.
    pub fn rewrite_uri(&self, uri: &str) -> String {
        if let Some(path) = uri.strip_prefix("ipfs://") {
            let path = path.strip_prefix("ipfs/").unwrap_or(path);
            return format!("{}{}", self.ipfs_gateway, path);
        }
        uri.to_string()
    }

    /// Resolves a token URI to its parsed metadata document. Inline
    /// `data:application/json` documents are parsed directly; anything
    /// else is fetched over HTTP.
    pub async fn fetch(&self, uri: &str) -> Result<TokenMetadata, MetadataError> {
        if let Some(rest) = uri.strip_prefix("data:application/json") {
            if let Some(doc) = rest.strip_prefix(",") {
                return serde_json::from_str(doc).map_err(|e| MetadataError::Json(e.to_string()));
            }
            // Other encodings (base64 and friends) are not worth carrying
            // a decoder for; the refresh flow can still pick these tokens
            // up later if the contract migrates to a fetchable URI.
            return Err(MetadataError::UnsupportedScheme(
                uri.chars().take(64).collect(),
            ));
        }
        if uri.starts_with("data:") {
            return Err(MetadataError::UnsupportedScheme(
                uri.chars().take(64).collect(),
            ));
        }

        let url = self.rewrite_uri(uri);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| MetadataError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            return Err(MetadataError::Http(format!("HTTP {} from {}", status, url)));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| MetadataError::Http(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| MetadataError::Json(e.to_string()))
    }
}

/// Substitutes the `{id}` template marker with the token id as 64 lowercase
/// hex digits, the substitution `uri(id)` contracts expect clients to make.
pub fn expand_id_placeholder(uri: &str, id: alloy::primitives::U256) -> String {
    if !uri.contains("{id}") {
        return uri.to_string();
    }
    uri.replace("{id}", &format!("{:064x}", id))
}

/// Strips control characters, trims, and truncates to `max_chars` on a
/// character boundary. Metadata names arrive with embedded nulls often
/// enough that the database rejects them otherwise.
pub fn sanitize_text(input: &str, max_chars: usize) -> String {
    input
        .chars()
        .filter(|c| !c.is_control())
        .take(max_chars)
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> MetadataClient {
        MetadataClient::new(Duration::from_secs(5), "https://ipfs.io/ipfs/").unwrap()
    }

    #[test]
    fn ipfs_uris_are_rewritten_through_the_gateway() {
        let client = client();
        assert_eq!(
            client.rewrite_uri("ipfs://QmHash/7.json"),
            "https://ipfs.io/ipfs/QmHash/7.json"
        );
        assert_eq!(
            client.rewrite_uri("ipfs://ipfs/QmHash"),
            "https://ipfs.io/ipfs/QmHash"
        );
        assert_eq!(
            client.rewrite_uri("https://example.com/7.json"),
            "https://example.com/7.json"
        );
    }

    #[tokio::test]
    async fn inline_json_uris_parse_without_network() {
        let client = client();
        let metadata = client
            .fetch(r#"data:application/json,{"name":"Plot #7","image":"ipfs://QmImg"}"#)
            .await
            .unwrap();
        assert_eq!(metadata.name.as_deref(), Some("Plot #7"));
        assert_eq!(metadata.image.as_deref(), Some("ipfs://QmImg"));
    }

    #[tokio::test]
    async fn base64_data_uris_are_rejected_as_unsupported() {
        let client = client();
        let err = client
            .fetch("data:application/json;base64,eyJuYW1lIjoiNyJ9")
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::UnsupportedScheme(_)));
    }

    #[tokio::test]
    async fn malformed_inline_json_is_a_json_error() {
        let client = client();
        let err = client
            .fetch("data:application/json,{not json")
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Json(_)));
    }

    #[test]
    fn id_placeholder_expands_to_zero_padded_hex() {
        use alloy::primitives::U256;

        assert_eq!(
            expand_id_placeholder("https://example.com/{id}.json", U256::from(7u64)),
            format!("https://example.com/{}.json", "0".repeat(63) + "7")
        );
        assert_eq!(
            expand_id_placeholder("https://example.com/7.json", U256::from(7u64)),
            "https://example.com/7.json"
        );
    }

    #[test]
    fn sanitize_strips_control_characters_and_trims() {
        assert_eq!(sanitize_text("  Plot\u{0}\u{7} #7\n", 512), "Plot #7");
    }

    #[test]
    fn sanitize_truncates_on_character_boundaries() {
        let long = "ノ".repeat(600);
        let out = sanitize_text(&long, 512);
        assert_eq!(out.chars().count(), 512);
    }
}
