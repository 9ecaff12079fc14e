mod client;
mod reader;

pub use client::{
    RateLimitConfig, RetryConfig, RpcClient, RpcClientConfig, RpcError, StandardRateLimiter,
    with_retry,
};
pub use reader::{ChainReader, ContractProfile, OnChainReader};
