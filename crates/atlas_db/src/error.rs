//! Error types for the evidence store.

use thiserror::Error;

/// Evidence store result type.
pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    /// SQLx error (connection, query, etc.)
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO error (creating the database directory)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Rejected write (empty space or content)
    #[error("Constraint violation: {0}")]
    Constraint(String),
}

impl DbError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::Constraint(msg.into())
    }
}
