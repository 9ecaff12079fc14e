use alloy::primitives::Address;

use super::PassError;
use super::aggregate::AggregatedMaps;
use crate::cache::PassCounts;
use crate::metadata::{DESCRIPTION_MAX_CHARS, NAME_MAX_CHARS, sanitize_text};
use crate::types::token::{Token, TokenId, TokenKind, TokenMetadata};

/// Folds the aggregated maps into one `Token` per id, in a single pass.
///
/// A token id appearing in both the owner map and the balance map means a
/// contract emitted both single-owner and multi-owner transfer events for
/// the same id; no consistent record exists for it, so the whole pass is
/// rejected rather than persisting a guess.
pub fn synthesize(mut maps: AggregatedMaps) -> Result<(Vec<Token>, PassCounts), PassError> {
    let mut counts = PassCounts {
        bad_uris: maps.bad_uris,
        ..PassCounts::default()
    };
    let mut tokens = Vec::with_capacity(maps.owners.len() + maps.balances.len());

    for (id, observed) in std::mem::take(&mut maps.owners) {
        if maps.balances.contains_key(&id) {
            return Err(PassError::KindConflict { token: id });
        }
        let history = maps.previous_owners.remove(&id).unwrap_or_default();
        counts.owners += 1;
        tokens.push(build_token(
            &mut maps,
            id,
            TokenKind::Erc721,
            Some(observed.owner),
            normalize_history(history),
            Vec::new(),
            observed.block_number,
            &mut counts,
        ));
    }

    for (id, holders) in std::mem::take(&mut maps.balances) {
        // The latest observation block counts even when it zeroed the
        // holder out; dropping the row must not rewind the token's block.
        let block_number = holders
            .values()
            .map(|b| b.block_number)
            .max()
            .unwrap_or_default();
        let mut balances: Vec<_> = holders
            .into_values()
            .filter(|b| !b.amount.is_zero())
            .collect();
        balances.sort_by_key(|b| b.holder);
        counts.balances += 1;
        tokens.push(build_token(
            &mut maps,
            id,
            TokenKind::Erc1155,
            None,
            Vec::new(),
            balances,
            block_number,
            &mut counts,
        ));
    }

    for id in maps.uris.keys().chain(maps.metadata.keys()) {
        tracing::debug!("Dropping URI result for {}: no transfer facts this pass", id);
    }

    // Stable output order keeps upsert batches deterministic across runs.
    tokens.sort_by(|a, b| {
        (a.id.contract, a.id.token_id).cmp(&(b.id.contract, b.id.token_id))
    });
    Ok((tokens, counts))
}

#[allow(clippy::too_many_arguments)]
fn build_token(
    maps: &mut AggregatedMaps,
    id: TokenId,
    kind: TokenKind,
    owner: Option<Address>,
    previous_owners: Vec<Address>,
    balances: Vec<crate::types::token::HolderBalance>,
    block_number: u64,
    counts: &mut PassCounts,
) -> Token {
    let uri = maps.uris.remove(&id);
    let metadata = maps.metadata.remove(&id).filter(|m| !m.is_empty());
    if uri.is_some() {
        counts.uris += 1;
    }
    if metadata.is_some() {
        counts.metadatas += 1;
    }
    let (name, description) = display_fields(metadata.as_ref());

    Token {
        id,
        kind,
        owner,
        previous_owners,
        balances,
        uri,
        name,
        description,
        metadata,
        media: None,
        block_number,
    }
}

/// Block-ascending, each address listed once at its earliest appearance.
fn normalize_history(mut history: Vec<(u64, Address)>) -> Vec<Address> {
    history.sort_by_key(|(block, _)| *block);
    let mut seen = std::collections::HashSet::new();
    history
        .into_iter()
        .filter_map(|(_, address)| seen.insert(address).then_some(address))
        .collect()
}

fn display_fields(metadata: Option<&TokenMetadata>) -> (Option<String>, Option<String>) {
    let Some(metadata) = metadata else {
        return (None, None);
    };
    let lift = |text: &Option<String>, cap: usize| {
        text.as_deref()
            .map(|t| sanitize_text(t, cap))
            .filter(|t| !t.is_empty())
    };
    (
        lift(&metadata.name, NAME_MAX_CHARS),
        lift(&metadata.description, DESCRIPTION_MAX_CHARS),
    )
}
