mod error;
pub mod repos;

#[cfg(test)]
pub mod tests;

use std::time::Duration;

pub use error::{DbError, DbResult};
pub use repos::*;

use crate::config::PostgresConfig;

/// Build a connection pool from configuration.
///
/// Check cycles call this at cycle start and drop the pool at cycle end, so
/// no connection is held across the long sleep between cycles and rotated
/// password files are re-read on the next cycle.
pub async fn connect(config: &PostgresConfig) -> DbResult<sqlx::PgPool> {
    let url = config.connect_url()?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(&url)
        .await?;

    Ok(pool)
}
