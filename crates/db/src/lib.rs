pub mod migrate;
pub mod state;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

pub use state::{CommitSummary, KindCounts, StateStore};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Insert called on an entity that already carries a surrogate id.
    #[error("trying to insert already saved entity #{0}")]
    DuplicateInsert(i64),
    /// Update called on an entity that was never persisted.
    #[error("trying to update unsaved entity")]
    UnsavedUpdate,
    #[error("database error: {0}")]
    Driver(#[from] sqlx::Error),
    #[error("migration failure: {0}")]
    Migration(String),
}

impl StorageError {
    /// Storage-constraint failures (unique/check violations) are counted
    /// and contained during a batch commit; anything else is fatal there.
    pub fn is_constraint(&self) -> bool {
        match self {
            Self::Driver(sqlx::Error::Database(db)) => {
                !matches!(db.kind(), sqlx::error::ErrorKind::Other)
            }
            _ => false,
        }
    }
}

/// Create a SQLite connection pool with WAL mode enabled.
pub async fn connect(db_path: &str) -> Result<SqlitePool, sqlx::Error> {
    // Ensure parent directory exists
    if let Some(parent) = Path::new(db_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let opts = SqliteConnectOptions::from_str(db_path)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await?;

    Ok(pool)
}
