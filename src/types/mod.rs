pub mod config;
pub mod erc;
pub mod token;
