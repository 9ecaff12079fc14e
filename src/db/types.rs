use serde::Serialize;
use serde_json::Value as JsonValue;

/// A value bound into a SQL statement. Only the shapes the token and
/// contract tables actually use.
#[derive(Debug, Clone)]
pub enum DbValue {
    /// NULL value
    Null,
    /// SMALLINT, used for the token-standard kind
    Int16(i16),
    /// Unsigned 64-bit integer (stored as BIGINT)
    Uint64(u64),
    /// Text (unlimited length)
    Text(String),
    /// Ethereum address (20 bytes, stored as BYTEA)
    Address([u8; 20]),
    /// Decimal string for uint256 (stored as NUMERIC)
    Numeric(String),
    /// JSONB value
    JsonB(JsonValue),
}

impl DbValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DbValue::Null)
    }

    /// JSONB from any serializable type. Returns `Null` if serialization
    /// fails, which cannot happen for the plain data structs stored here.
    pub fn jsonb<T: Serialize>(value: &T) -> Self {
        serde_json::to_value(value)
            .map(DbValue::JsonB)
            .unwrap_or(DbValue::Null)
    }

    /// `Text` or `Null` from an optional string.
    pub fn opt_text(value: Option<&str>) -> Self {
        match value {
            Some(v) => DbValue::Text(v.to_string()),
            None => DbValue::Null,
        }
    }
}

/// A write the repository hands to the pool for execution inside a
/// transaction.
#[derive(Debug, Clone)]
pub enum DbOperation {
    /// INSERT with ON CONFLICT DO UPDATE (upsert)
    Upsert {
        table: String,
        columns: Vec<String>,
        values: Vec<DbValue>,
        /// Columns that form the unique constraint
        conflict_columns: Vec<String>,
        /// Columns to update on conflict
        update_columns: Vec<String>,
    },
    /// UPDATE with WHERE clause
    Update {
        table: String,
        set_columns: Vec<(String, DbValue)>,
        where_clause: WhereClause,
    },
}

/// WHERE clause for UPDATE operations.
#[derive(Debug, Clone)]
pub enum WhereClause {
    /// column = value
    Eq(String, DbValue),
    /// column1 = value1 AND column2 = value2 AND ...
    And(Vec<(String, DbValue)>),
}
