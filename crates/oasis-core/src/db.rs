//! SQLite connection setup

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;

use crate::config::OasisConfig;
use crate::error::OasisResult;
use crate::migrations;
use crate::services::DbPool;

/// Open the pool described by `config` and bring the schema up to date
pub async fn connect(config: &OasisConfig) -> OasisResult<DbPool> {
    let database_url = config.database_url.as_str();
    tracing::info!("Connecting to database: {}", database_url);

    ensure_parent_dir(database_url)?;

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(config.busy_timeout())
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.operation_timeout())
        .connect_with(options)
        .await?;

    tracing::info!("Running database migrations...");
    migrations::run_migration(&pool).await?;
    tracing::info!("Database migrations completed");

    Ok(Arc::new(pool))
}

// sqlite paths may carry a scheme prefix and a query string
fn ensure_parent_dir(database_url: &str) -> OasisResult<()> {
    if !database_url.starts_with("sqlite:") || database_url.contains(":memory:") {
        return Ok(());
    }
    let path = database_url.trim_start_matches("sqlite:");
    let path = path.trim_start_matches("//");
    let path = path.split('?').next().unwrap_or(path);
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::error::OasisError::Internal(e.to_string()))?;
        }
    }
    Ok(())
}
