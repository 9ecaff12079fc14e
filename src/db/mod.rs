pub mod error;
pub mod migrations;
pub mod pool;
pub mod repo;
pub mod types;

pub use error::DbError;
pub use pool::DbPool;
pub use repo::{CountCategory, PostgresTokenRepository, TokenRepository};
pub use types::{DbOperation, DbValue, WhereClause};
