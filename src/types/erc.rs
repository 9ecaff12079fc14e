use alloy::primitives::B256;
use alloy::sol;
use alloy::sol_types::SolEvent;

sol! {
    #[derive(Debug, PartialEq, Eq)]
    contract IErc721 {
        event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);

        function tokenURI(uint256 tokenId) external view returns (string memory);
        function name() external view returns (string memory);
        function symbol() external view returns (string memory);
        function owner() external view returns (address);
    }

    #[derive(Debug, PartialEq, Eq)]
    contract IErc1155 {
        event TransferSingle(
            address indexed operator,
            address indexed from,
            address indexed to,
            uint256 id,
            uint256 value
        );
        event TransferBatch(
            address indexed operator,
            address indexed from,
            address indexed to,
            uint256[] ids,
            uint256[] values
        );
        event URI(string value, uint256 indexed id);

        function balanceOf(address account, uint256 id) external view returns (uint256);
        function uri(uint256 id) external view returns (string memory);
    }
}

/// The event signatures this indexer subscribes to. Used both for log
/// filter construction and for dispatch when decoding cached logs.
pub fn tracked_topics() -> [B256; 4] {
    [
        IErc721::Transfer::SIGNATURE_HASH,
        IErc1155::TransferSingle::SIGNATURE_HASH,
        IErc1155::TransferBatch::SIGNATURE_HASH,
        IErc1155::URI::SIGNATURE_HASH,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(hex_str: &str) -> B256 {
        let bytes = hex::decode(hex_str).expect("valid hex");
        B256::from_slice(&bytes)
    }

    #[test]
    fn transfer_topic_matches_canonical_hash() {
        assert_eq!(
            IErc721::Transfer::SIGNATURE_HASH,
            topic("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"),
        );
    }

    #[test]
    fn transfer_single_topic_matches_canonical_hash() {
        assert_eq!(
            IErc1155::TransferSingle::SIGNATURE_HASH,
            topic("c3d58168c5ae7397731d063d5bbf3d657854427343f4c083240f7aacaa2d0f62"),
        );
    }

    #[test]
    fn transfer_batch_topic_matches_canonical_hash() {
        assert_eq!(
            IErc1155::TransferBatch::SIGNATURE_HASH,
            topic("4a39dc06d4c0dbc64b70af90fd698a233a518aa5d07e595d983b8c0526c8f7fb"),
        );
    }

    #[test]
    fn uri_topic_matches_canonical_hash() {
        assert_eq!(
            IErc1155::URI::SIGNATURE_HASH,
            topic("6bb7ff708619ba0610cba295a58592e0451dee2622938c8755667688daf3529b"),
        );
    }

    #[test]
    fn tracked_topics_are_distinct() {
        let topics = tracked_topics();
        for (i, a) in topics.iter().enumerate() {
            for b in topics.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
