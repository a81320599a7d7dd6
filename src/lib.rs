#![forbid(unsafe_code)]

pub mod advice;
pub mod api;
pub mod auth;
pub mod config;
pub mod extraction;
pub mod model;
pub mod models;
pub mod store;

use std::str::FromStr;

use log::debug;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};

pub use config::Config;

#[derive(Debug, thiserror::Error)]
pub enum OpenDatabaseError {
    #[error("Could not open database connection")]
    Connect(#[from] sqlx::Error),

    #[error("Could not migrate database")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Opens the connection pool at `url` and brings the schema up to date.
pub async fn db_pool(url: &str) -> Result<SqlitePool, OpenDatabaseError> {
    debug!("Opening database pool at {url}");
    let options = SqliteConnectOptions::from_str(url)?
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new().connect_with(options).await?;

    debug!("Running migrations");
    sqlx::migrate!().run(&pool).await?;

    Ok(pool)
}

/// A single-connection in-memory database, migrated. Each call gets a fresh one.
#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();

    sqlx::migrate!().run(&pool).await.unwrap();

    pool
}
