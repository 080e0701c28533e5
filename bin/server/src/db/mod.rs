//! Database access for the chatledger server.
//!
//! This module provides:
//! - Pool setup and schema migrations
//! - The SQLite-backed checkpoint store

pub mod checkpoint;

pub use checkpoint::SqliteSessionStore;

use sqlx::SqlitePool;
use sqlx::migrate::MigrateError;
use sqlx::sqlite::SqlitePoolOptions;

/// Opens a connection pool.
///
/// `sqlite::memory:` databases are private to one connection, so callers
/// using them should pass `max_connections = 1`.
///
/// # Errors
///
/// Returns an error if the database cannot be opened.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Applies pending schema migrations.
///
/// # Errors
///
/// Returns an error if a migration fails.
pub async fn migrate(pool: &SqlitePool) -> Result<(), MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
