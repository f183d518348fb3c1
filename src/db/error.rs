use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum DbError {
    /// A pool could not be built from configuration, e.g. an unreadable
    /// password file.
    #[error("Database configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

pub type DbResult<T> = Result<T, DbError>;
