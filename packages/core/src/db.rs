//! SQLite pool construction.
//!
//! Migrations under `migrations/` are embedded at compile time and applied
//! every time a pool is created, so callers always get a ready schema.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Open (creating if needed) the database at `database_url` and migrate it.
///
/// Foreign keys are switched on for every connection; the cascade from
/// `metrics` to `data_points`/`notifications` depends on it.
///
/// An in-memory URL gets exactly one connection that is never recycled,
/// otherwise each pooled connection would see its own empty database.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = if database_url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?
    };

    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::debug!("Database ready at {}", database_url);

    Ok(pool)
}
