use thiserror::Error;

// Postgres SQLSTATE codes for deadlock and serialization conflicts.
const DEADLOCK_DETECTED: &str = "40P01";
const SERIALIZATION_FAILURE: &str = "40001";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Pool error: {0}")]
    PoolError(#[from] deadpool_postgres::PoolError),

    #[error("{}", format_pg_error(.0))]
    PostgresError(#[from] tokio_postgres::Error),

    #[error("Build error: {0}")]
    BuildError(#[from] deadpool_postgres::BuildError),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("Malformed row: {0}")]
    MalformedRow(String),

    /// Constructed directly only by test doubles; real deadlocks surface
    /// as `PostgresError` and are recognized by SQLSTATE.
    #[error("Deadlock: {0}")]
    Deadlock(String),
}

impl DbError {
    /// True for write-write conflicts worth one more attempt: an explicit
    /// deadlock or a serialization failure.
    pub fn is_deadlock(&self) -> bool {
        match self {
            DbError::Deadlock(_) => true,
            DbError::PostgresError(e) => e
                .as_db_error()
                .map(|db| matches!(db.code().code(), DEADLOCK_DETECTED | SERIALIZATION_FAILURE))
                .unwrap_or(false),
            _ => false,
        }
    }
}

fn format_pg_error(e: &tokio_postgres::Error) -> String {
    if let Some(db_err) = e.as_db_error() {
        let mut msg = format!(
            "PostgreSQL error [{}]: {}",
            db_err.code().code(),
            db_err.message()
        );
        if let Some(detail) = db_err.detail() {
            msg.push_str(&format!("\n  Detail: {}", detail));
        }
        if let Some(constraint) = db_err.constraint() {
            msg.push_str(&format!("\n  Constraint: {}", constraint));
        }
        msg
    } else {
        format!("PostgreSQL error: {}", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_deadlock_classifies_as_retryable() {
        assert!(DbError::Deadlock("deadlock detected".to_string()).is_deadlock());
    }

    #[test]
    fn other_errors_do_not() {
        assert!(!DbError::MigrationError("tokens.sql".to_string()).is_deadlock());
        assert!(!DbError::InvalidConnectionString("bad".to_string()).is_deadlock());
    }
}
