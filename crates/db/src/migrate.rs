//! Schema migrations for the `state` table.
//!
//! The schema version lives in SQLite's `user_version` pragma. Each step is
//! independently idempotent (several process starts may race through
//! `is_migrated`), the guid index build always runs, and a one-time data
//! pass handles the layout change from the detected prior version.

use crosswatch_core::GuidNamespace;
use sqlx::SqlitePool;
use tracing::info;

use crate::StorageError;

/// Current schema version.
pub const LATEST: i64 = 2;

pub async fn is_migrated(pool: &SqlitePool) -> Result<bool, StorageError> {
    Ok(user_version(pool).await? >= LATEST)
}

/// Run all pending up steps, build indexes, and apply the data pass for
/// the detected prior version. Failure here is fatal at startup.
pub async fn run(pool: &SqlitePool) -> Result<(), StorageError> {
    let from = user_version(pool).await?;
    if from >= LATEST {
        return Ok(());
    }

    info!(from, to = LATEST, "migrating schema");

    up_v1_state_table(pool).await?;
    up_v2_split_meta(pool).await?;
    build_indexes(pool).await?;
    migrate_data(pool, from).await?;
    set_user_version(pool, LATEST).await?;

    info!(version = LATEST, "migrations complete");
    Ok(())
}

/// Roll the schema back one version.
pub async fn down(pool: &SqlitePool) -> Result<(), StorageError> {
    let version = user_version(pool).await?;
    match version {
        0 => Ok(()),
        1 => {
            exec(pool, "DROP TABLE IF EXISTS state").await?;
            set_user_version(pool, 0).await
        }
        _ => {
            // v2 -> v1: rebuild with the legacy meta-blob layout.
            exec(pool, v1_table_sql("state_down")).await?;
            exec(
                pool,
                "INSERT INTO state_down (id, type, updated, watched, meta, \
                 guid_imdb, guid_tmdb, guid_tvdb, guid_tvmaze, guid_tvrage, guid_anidb, \
                 guid_plex, guid_jellyfin, guid_emby) \
                 SELECT id, type, updated, watched, \
                 json_object('via', via, 'title', title, 'year', year, \
                             'season', season, 'episode', episode, \
                             'parent', json(parent), 'metadata', json(metadata), \
                             'extra', json(extra)), \
                 guid_imdb, guid_tmdb, guid_tvdb, guid_tvmaze, guid_tvrage, guid_anidb, \
                 guid_plex, guid_jellyfin, guid_emby FROM state",
            )
            .await?;
            exec(pool, "DROP TABLE state").await?;
            exec(pool, "ALTER TABLE state_down RENAME TO state").await?;
            set_user_version(pool, 1).await
        }
    }
}

fn v1_table_sql(name: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {name} (\
           id INTEGER PRIMARY KEY AUTOINCREMENT, \
           type TEXT NOT NULL CHECK(type IN ('movie','episode')), \
           updated INTEGER NOT NULL, \
           watched INTEGER NOT NULL CHECK(watched IN (0,1)), \
           meta TEXT NOT NULL DEFAULT '{{}}', \
           guid_imdb TEXT, \
           guid_tmdb INTEGER, \
           guid_tvdb INTEGER, \
           guid_tvmaze INTEGER, \
           guid_tvrage INTEGER, \
           guid_anidb INTEGER, \
           guid_plex TEXT, \
           guid_jellyfin TEXT, \
           guid_emby TEXT\
         )"
    )
}

/// v1: the original layout, descriptive fields inside a `meta` blob.
async fn up_v1_state_table(pool: &SqlitePool) -> Result<(), StorageError> {
    exec(pool, v1_table_sql("state")).await
}

/// v2: descriptive fields and the nested blobs become real columns.
/// ADD COLUMN is not idempotent in SQLite, so existing columns are checked
/// first.
async fn up_v2_split_meta(pool: &SqlitePool) -> Result<(), StorageError> {
    const ADDED: &[(&str, &str)] = &[
        ("via", "TEXT NOT NULL DEFAULT ''"),
        ("title", "TEXT NOT NULL DEFAULT ''"),
        ("year", "INTEGER"),
        ("season", "INTEGER"),
        ("episode", "INTEGER"),
        ("parent", "TEXT NOT NULL DEFAULT '{}'"),
        ("metadata", "TEXT NOT NULL DEFAULT '{}'"),
        ("extra", "TEXT NOT NULL DEFAULT '{}'"),
    ];

    let existing = column_names(pool).await?;
    for (column, decl) in ADDED {
        if existing.iter().any(|c| c == column) {
            continue;
        }
        exec(pool, format!("ALTER TABLE state ADD COLUMN {column} {decl}")).await?;
    }
    Ok(())
}

/// Required index build. One index per guid namespace; unique within a
/// kind so a colliding import surfaces as a constraint failure instead of
/// silently merging two titles.
async fn build_indexes(pool: &SqlitePool) -> Result<(), StorageError> {
    for ns in GuidNamespace::ALL {
        let column = ns.column();
        exec(
            pool,
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS state_{column} \
                 ON state (type, {column}) WHERE {column} IS NOT NULL"
            ),
        )
        .await?;
    }
    exec(
        pool,
        "CREATE INDEX IF NOT EXISTS state_updated ON state (updated)",
    )
    .await?;
    exec(
        pool,
        "CREATE INDEX IF NOT EXISTS state_relative \
         ON state (type, season, episode)",
    )
    .await?;
    Ok(())
}

/// One-time data pass, keyed on the version found at startup.
async fn migrate_data(pool: &SqlitePool, from: i64) -> Result<(), StorageError> {
    if from != 1 {
        return Ok(());
    }

    info!("migrating v1 meta blobs into split columns");
    exec(
        pool,
        "UPDATE state SET \
           via = COALESCE(json_extract(meta, '$.via'), via), \
           title = COALESCE(json_extract(meta, '$.title'), title), \
           year = COALESCE(json_extract(meta, '$.year'), year), \
           season = COALESCE(json_extract(meta, '$.season'), season), \
           episode = COALESCE(json_extract(meta, '$.episode'), episode), \
           parent = COALESCE(json_extract(meta, '$.parent'), parent), \
           metadata = COALESCE(json_extract(meta, '$.metadata'), metadata), \
           extra = COALESCE(json_extract(meta, '$.extra'), extra) \
         WHERE meta != '{}'",
    )
    .await
}

async fn user_version(pool: &SqlitePool) -> Result<i64, StorageError> {
    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await
        .map_err(|e| StorageError::Migration(e.to_string()))?;
    Ok(version)
}

async fn set_user_version(pool: &SqlitePool, version: i64) -> Result<(), StorageError> {
    exec(pool, format!("PRAGMA user_version = {version}")).await
}

async fn exec(pool: &SqlitePool, sql: impl AsRef<str>) -> Result<(), StorageError> {
    sqlx::query(sql.as_ref())
        .execute(pool)
        .await
        .map_err(|e| StorageError::Migration(format!("{}: {e}", sql.as_ref())))?;
    Ok(())
}

async fn column_names(pool: &SqlitePool) -> Result<Vec<String>, StorageError> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM pragma_table_info('state')")
        .fetch_all(pool)
        .await
        .map_err(|e| StorageError::Migration(e.to_string()))?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}
