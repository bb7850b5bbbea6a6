//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt record: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

impl From<buildfarm_core::Error> for DbError {
    fn from(err: buildfarm_core::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

impl From<DbError> for buildfarm_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => buildfarm_core::Error::NotFound(what),
            DbError::Conflict(what) => buildfarm_core::Error::Conflict(what),
            other => buildfarm_core::Error::Internal(other.to_string()),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
