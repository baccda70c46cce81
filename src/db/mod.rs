//! SQLite storage: pool setup, schema, and the two table adapters.
//!
//! The pool is only ever used from the engine tasks on the single runtime
//! thread, never from parallel writers.

mod catalog;
mod segments;

pub use catalog::SqliteCatalog;
pub use segments::SqliteSegmentRepo;

use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use tracing::info;

use crate::error::Result;

/// Open (creating if needed) the database at `db_path`.
pub async fn open(db_path: &Path) -> Result<SqlitePool> {
    let full_path = if db_path.is_absolute() {
        db_path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(db_path)
    };

    if let Some(parent) = full_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
    }

    let url = format!("sqlite://{}", full_path.display());
    let opts = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(opts)
        .await?;
    info!(db_path = %full_path.display(), "Opened database");
    Ok(pool)
}

/// Create tables and indexes.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    let ddls = [
        r#"
      CREATE TABLE IF NOT EXISTS feed_segments(
        feed_id INTEGER PRIMARY KEY,
        title TEXT NOT NULL DEFAULT '',
        original_title TEXT NOT NULL DEFAULT '',
        segments TEXT NOT NULL DEFAULT '[]'
      )"#,
        r#"
      CREATE TABLE IF NOT EXISTS audio_files(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        feed_id INTEGER NOT NULL,
        message_id INTEGER NOT NULL,
        date_s INTEGER NOT NULL,
        file_id INTEGER NOT NULL,
        title TEXT NULL,
        performer TEXT NULL,
        file_name TEXT NULL,
        duration INTEGER NOT NULL,
        mime_type TEXT NULL,
        size INTEGER NOT NULL DEFAULT 0,
        local_path TEXT NULL,
        downloaded INTEGER NOT NULL DEFAULT 0,
        UNIQUE(feed_id, message_id)
      )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_audio_files_feed_date ON audio_files(feed_id, date_s)"#,
    ];

    for ddl in ddls {
        sqlx::query(ddl).execute(pool).await?;
    }

    info!("DB migrate done");
    Ok(())
}

/// Single-connection in-memory database with the schema applied.
#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    // One connection: every new in-memory connection is a separate database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    migrate(&pool).await.unwrap();
    pool
}
