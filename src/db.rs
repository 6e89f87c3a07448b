use crate::constants::{DB_BUSY_TIMEOUT_MS, DB_MAX_CONNECTIONS};
use crate::types::{RelayError, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::time::Duration;

pub type DbPool = SqlitePool;

/// Opens (creating if needed) the database at `path` and brings its schema
/// up to date. Every pooled connection gets WAL, foreign keys and a busy
/// timeout.
pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let options = SqliteConnectOptions::new()
        .filename(path.as_ref())
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(DB_BUSY_TIMEOUT_MS))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(DB_MAX_CONNECTIONS)
        .connect_with(options)
        .await?;

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        return Err(RelayError::Internal(
            format!("Migration failed: {}", e),
            tracing_error::SpanTrace::capture(),
        )
        .into());
    }

    match schema_version(&pool).await {
        Ok(version) => tracing::info!(
            "Database ready at {} (schema version {})",
            path.as_ref().display(),
            version
        ),
        Err(e) => tracing::warn!("Could not verify schema version: {}", e.inner),
    }

    Ok(pool)
}

pub async fn schema_version(pool: &DbPool) -> Result<String> {
    let version: String =
        sqlx::query_scalar("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await?;
    Ok(version)
}

/// Round trip to the database for the readiness check.
pub async fn ping(pool: &DbPool) -> Result<()> {
    sqlx::query("SELECT 1").fetch_one(pool).await?;
    Ok(())
}
