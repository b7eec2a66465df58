use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::time::Duration;

use crate::config::Config;

/// Lock wait used when backend deadlines are disabled.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the node and vector database, creating the file and its parent
/// directory when missing.
///
/// A writer waits for a locked database at most as long as one backend call
/// may take, so lock contention surfaces as the same timeout the stores
/// report.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(config.timeouts.backend().unwrap_or(DEFAULT_BUSY_TIMEOUT));

    SqlitePoolOptions::new()
        .max_connections(config.db.max_connections)
        .acquire_timeout(config.timeouts.backend().unwrap_or(DEFAULT_BUSY_TIMEOUT))
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))
}
