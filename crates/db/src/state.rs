//! Guid-indexed storage for canonical state entities.
//!
//! One row per entity in the `state` table: scalar fields as columns, one
//! indexed column per guid namespace, the nested maps as JSON blobs.
//! Writes go through [`StateStore::commit`] in batches; a per-row
//! constraint failure never aborts the batch, a fatal driver error rolls
//! the whole batch back.

use crosswatch_core::guid::{self, GuidValue};
use crosswatch_core::{GuidNamespace, MediaKind, StateEntity};
use sqlx::sqlite::{SqliteArguments, SqliteQueryResult, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{error, info, warn};

use crate::StorageError;

type Query<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

const INSERT_SQL: &str = "INSERT INTO state \
    (type, updated, watched, via, title, year, season, episode, parent, metadata, extra, \
     guid_imdb, guid_tmdb, guid_tvdb, guid_tvmaze, guid_tvrage, guid_anidb, \
     guid_plex, guid_jellyfin, guid_emby) \
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const UPDATE_SQL: &str = "UPDATE state SET \
    type = ?, updated = ?, watched = ?, via = ?, title = ?, year = ?, season = ?, \
    episode = ?, parent = ?, metadata = ?, extra = ?, \
    guid_imdb = ?, guid_tmdb = ?, guid_tvdb = ?, guid_tvmaze = ?, guid_tvrage = ?, \
    guid_anidb = ?, guid_plex = ?, guid_jellyfin = ?, guid_emby = ? \
    WHERE id = ?";

/// Per-kind counters returned by a batch commit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KindCounts {
    pub added: u64,
    pub updated: u64,
    pub failed: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommitSummary {
    pub movie: KindCounts,
    pub episode: KindCounts,
}

impl CommitSummary {
    pub fn for_kind(&mut self, kind: MediaKind) -> &mut KindCounts {
        match kind {
            MediaKind::Movie => &mut self.movie,
            MediaKind::Episode => &mut self.episode,
        }
    }

    pub fn failed(&self) -> u64 {
        self.movie.failed + self.episode.failed
    }
}

/// Storage adapter over one SQLite pool plus an optional long-lived
/// transaction (single-transaction mode for long batch runs).
///
/// Dropping the store with an open long transaction rolls it back; callers
/// that opted in must call [`StateStore::finalize`] on every exit path.
pub struct StateStore {
    pool: SqlitePool,
    tx: Option<Transaction<'static, Sqlite>>,
}

impl StateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, tx: None }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Find the stored entity matching a candidate. Resolution precedence:
    /// exact id, then any direct guid column (narrowed by kind), then the
    /// relative-guid fallback for episodes.
    pub async fn get(&mut self, entity: &StateEntity) -> Result<Option<StateEntity>, StorageError> {
        if let Some(found) = self.find_by_guid(entity).await? {
            return Ok(Some(found));
        }
        if entity.has_relative_guid() {
            if let Some(found) = self.find_by_relative(entity).await? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// All stored entities, optionally only those updated after `since`.
    pub async fn get_all(&mut self, since: Option<i64>) -> Result<Vec<StateEntity>, StorageError> {
        let rows = match since {
            Some(ts) => {
                let q = sqlx::query("SELECT * FROM state WHERE updated > ?").bind(ts);
                self.fetch_all(q).await?
            }
            None => self.fetch_all(sqlx::query("SELECT * FROM state")).await?,
        };
        rows.iter().map(entity_from_row).collect()
    }

    /// Persist a new entity and assign its surrogate id.
    ///
    /// Outside a transaction a driver failure is soft: logged, entity
    /// returned unchanged. Inside one it propagates and aborts the batch.
    pub async fn insert(&mut self, entity: &mut StateEntity) -> Result<(), StorageError> {
        match self.insert_row(entity).await {
            Err(e @ StorageError::Driver(_)) if self.tx.is_none() => {
                error!(error = %e, name = %entity.name(), "insert failed");
                Ok(())
            }
            other => other,
        }
    }

    /// Persist changes to an already-saved entity. Same soft/hard failure
    /// split as [`StateStore::insert`].
    pub async fn update(&mut self, entity: &mut StateEntity) -> Result<(), StorageError> {
        match self.update_row(entity).await {
            Err(e @ StorageError::Driver(_)) if self.tx.is_none() => {
                error!(error = %e, name = %entity.name(), "update failed");
                Ok(())
            }
            other => other,
        }
    }

    /// Delete by id, resolving it via [`StateStore::get`] when absent.
    /// Returns `false` when the entity cannot be resolved. No cascade.
    pub async fn remove(&mut self, entity: &StateEntity) -> Result<bool, StorageError> {
        let id = match entity.id {
            Some(id) => id,
            None => {
                let Some(found) = self.get(entity).await? else {
                    return Ok(false);
                };
                let Some(id) = found.id else {
                    return Ok(false);
                };
                id
            }
        };
        self.execute(sqlx::query("DELETE FROM state WHERE id = ?").bind(id))
            .await?;
        Ok(true)
    }

    /// Batch entry point. Inserts entities without an id, updates the
    /// rest, in caller order, inside one transaction. When a transaction
    /// is already open (single-transaction mode) the batch runs inline.
    pub async fn commit(
        &mut self,
        entities: &mut [StateEntity],
    ) -> Result<CommitSummary, StorageError> {
        let owns_tx = self.tx.is_none();
        if owns_tx {
            self.tx = Some(self.pool.begin().await?);
        }

        let result = self.commit_inner(entities).await;

        match result {
            Ok(summary) => {
                if owns_tx {
                    if let Some(tx) = self.tx.take() {
                        tx.commit().await?;
                    }
                }
                Ok(summary)
            }
            Err(e) => {
                if owns_tx {
                    if let Some(tx) = self.tx.take() {
                        let _ = tx.rollback().await;
                    }
                }
                Err(e)
            }
        }
    }

    /// Keep one transaction open across the store's lifetime, committed by
    /// [`StateStore::finalize`]. Avoids per-statement commit overhead in
    /// long batch runs.
    pub async fn begin_long_transaction(&mut self) -> Result<(), StorageError> {
        if self.tx.is_none() {
            self.tx = Some(self.pool.begin().await?);
            info!("single transaction mode");
        }
        Ok(())
    }

    /// Commit the long-lived transaction, if one is open.
    pub async fn finalize(&mut self) -> Result<(), StorageError> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn commit_inner(
        &mut self,
        entities: &mut [StateEntity],
    ) -> Result<CommitSummary, StorageError> {
        let mut summary = CommitSummary::default();

        if entities.is_empty() {
            info!("no changes detected");
        } else {
            info!(changes = entities.len(), "updating database");
        }

        for entity in entities.iter_mut() {
            let kind = entity.kind;
            let is_insert = entity.id.is_none();
            let result = if is_insert {
                info!(kind = %kind, name = %entity.name(), "adding");
                self.insert_row(entity).await
            } else {
                info!(
                    kind = %kind,
                    id = entity.id,
                    name = %entity.name(),
                    diff = %serde_json::Value::Object(entity.diff()),
                    "updating"
                );
                self.update_row(entity).await
            };

            let counts = summary.for_kind(kind);
            match result {
                Ok(()) => {
                    if is_insert {
                        counts.added += 1;
                    } else {
                        counts.updated += 1;
                    }
                }
                Err(e) if e.is_constraint() => {
                    counts.failed += 1;
                    error!(error = %e, name = %entity.name(), "row failed, batch continues");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(summary)
    }

    async fn insert_row(&mut self, entity: &mut StateEntity) -> Result<(), StorageError> {
        if let Some(id) = entity.id {
            return Err(StorageError::DuplicateInsert(id));
        }

        let parent = serialize_blobs(entity);
        let result = self
            .execute(bind_entity(sqlx::query(INSERT_SQL), entity, &parent, None))
            .await?;

        entity.id = Some(result.last_insert_rowid());
        entity.mark_saved();
        Ok(())
    }

    async fn update_row(&mut self, entity: &mut StateEntity) -> Result<(), StorageError> {
        let Some(id) = entity.id else {
            return Err(StorageError::UnsavedUpdate);
        };

        let parent = serialize_blobs(entity);
        self.execute(bind_entity(sqlx::query(UPDATE_SQL), entity, &parent, Some(id)))
            .await?;

        entity.mark_saved();
        Ok(())
    }

    async fn find_by_guid(
        &mut self,
        entity: &StateEntity,
    ) -> Result<Option<StateEntity>, StorageError> {
        if let Some(id) = entity.id {
            let rows = self
                .fetch_all(sqlx::query("SELECT * FROM state WHERE id = ?").bind(id))
                .await?;
            return rows.first().map(entity_from_row).transpose();
        }

        if !entity.has_guids() {
            return Ok(None);
        }

        let present: Vec<GuidNamespace> = GuidNamespace::ALL
            .into_iter()
            .filter(|ns| entity.guids.contains_key(ns))
            .collect();
        let clauses: Vec<String> = present
            .iter()
            .map(|ns| format!("{} = ?", ns.column()))
            .collect();
        let sql = format!(
            "SELECT * FROM state WHERE type = ? AND ({})",
            clauses.join(" OR ")
        );

        let mut q = sqlx::query(&sql).bind(entity.kind.as_str());
        for ns in &present {
            q = bind_guid(q, entity.guids.get(ns));
        }

        let rows = self.fetch_all(q).await?;
        if rows.len() > 1 {
            // Anomaly, not an error: two rows answered the same probe.
            warn!(
                name = %entity.name(),
                matches = rows.len(),
                "multiple rows matched guid lookup, taking first"
            );
        }
        rows.first().map(entity_from_row).transpose()
    }

    /// Relative lookup for episodes without direct guids: same kind,
    /// season and episode, sharing at least one parent namespace:value
    /// pair with the candidate.
    async fn find_by_relative(
        &mut self,
        entity: &StateEntity,
    ) -> Result<Option<StateEntity>, StorageError> {
        let pairs: Vec<(GuidNamespace, &GuidValue)> =
            entity.parent.iter().map(|(ns, val)| (*ns, val)).collect();
        if pairs.is_empty() {
            return Ok(None);
        }

        let clauses: Vec<String> = pairs
            .iter()
            .map(|(ns, _)| format!("json_extract(parent, '$.{}') = ?", ns.as_str()))
            .collect();
        let sql = format!(
            "SELECT * FROM state WHERE type = ? AND season = ? AND episode = ? AND ({})",
            clauses.join(" OR ")
        );

        let mut q = sqlx::query(&sql)
            .bind(entity.kind.as_str())
            .bind(entity.season)
            .bind(entity.episode);
        for (_, val) in &pairs {
            q = bind_guid(q, Some(val));
        }

        let rows = self.fetch_all(q).await?;
        rows.first().map(entity_from_row).transpose()
    }

    async fn fetch_all(&mut self, q: Query<'_>) -> Result<Vec<SqliteRow>, StorageError> {
        let rows = match self.tx.as_mut() {
            Some(tx) => q.fetch_all(&mut **tx).await?,
            None => q.fetch_all(&self.pool).await?,
        };
        Ok(rows)
    }

    async fn execute(&mut self, q: Query<'_>) -> Result<SqliteQueryResult, StorageError> {
        let result = match self.tx.as_mut() {
            Some(tx) => q.execute(&mut **tx).await?,
            None => q.execute(&self.pool).await?,
        };
        Ok(result)
    }
}

struct SerializedBlobs {
    parent: String,
    metadata: String,
    extra: String,
}

fn serialize_blobs(entity: &StateEntity) -> SerializedBlobs {
    SerializedBlobs {
        parent: serde_json::to_string(&entity.parent).unwrap_or_else(|_| "{}".into()),
        metadata: serde_json::Value::Object(entity.metadata.clone()).to_string(),
        extra: serde_json::Value::Object(entity.extra.clone()).to_string(),
    }
}

fn bind_entity<'q>(
    q: Query<'q>,
    entity: &'q StateEntity,
    blobs: &'q SerializedBlobs,
    update_id: Option<i64>,
) -> Query<'q> {
    let mut q = q
        .bind(entity.kind.as_str())
        .bind(entity.updated)
        .bind(entity.watched as i64)
        .bind(entity.via.as_str())
        .bind(entity.title.as_str())
        .bind(entity.year)
        .bind(entity.season)
        .bind(entity.episode)
        .bind(blobs.parent.as_str())
        .bind(blobs.metadata.as_str())
        .bind(blobs.extra.as_str());

    for ns in GuidNamespace::ALL {
        q = bind_guid(q, entity.guids.get(&ns));
    }

    if let Some(id) = update_id {
        q = q.bind(id);
    }
    q
}

fn bind_guid<'q>(q: Query<'q>, value: Option<&'q GuidValue>) -> Query<'q> {
    match value {
        Some(GuidValue::Int(v)) => q.bind(*v),
        Some(GuidValue::Text(s)) => q.bind(s.as_str()),
        None => q.bind(None::<String>),
    }
}

fn entity_from_row(row: &SqliteRow) -> Result<StateEntity, StorageError> {
    let kind_raw: String = row.try_get("type")?;
    let kind = MediaKind::parse(&kind_raw).ok_or_else(|| {
        StorageError::Driver(sqlx::Error::ColumnDecode {
            index: "type".into(),
            source: format!("unexpected media kind '{kind_raw}'").into(),
        })
    })?;

    let mut entity = StateEntity::new(kind);
    entity.id = Some(row.try_get("id")?);
    entity.updated = row.try_get("updated")?;
    entity.watched = row.try_get::<i64, _>("watched")? != 0;
    entity.via = row.try_get("via")?;
    entity.title = row.try_get("title")?;
    entity.year = row.try_get("year")?;
    entity.season = row.try_get("season")?;
    entity.episode = row.try_get("episode")?;

    entity.parent = parse_guid_blob(&row.try_get::<String, _>("parent")?);
    entity.metadata = parse_json_blob(&row.try_get::<String, _>("metadata")?);
    entity.extra = parse_json_blob(&row.try_get::<String, _>("extra")?);

    for ns in GuidNamespace::ALL {
        let value = if ns.is_numeric() {
            row.try_get::<Option<i64>, _>(ns.column())?.map(GuidValue::Int)
        } else {
            row.try_get::<Option<String>, _>(ns.column())?.map(GuidValue::Text)
        };
        if let Some(value) = value {
            entity.guids.insert(ns, value);
        }
    }

    entity.mark_saved();
    Ok(entity)
}

fn parse_guid_blob(raw: &str) -> crosswatch_core::GuidMap {
    match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(raw) {
        Ok(map) => guid::from_raw(map),
        Err(_) => {
            warn!(blob = raw, "unparseable guid blob, treating as empty");
            Default::default()
        }
    }
}

fn parse_json_blob(raw: &str) -> serde_json::Map<String, serde_json::Value> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => {
            warn!(blob = raw, "unparseable json blob, treating as empty");
            Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> StateStore {
        let pool = crate::connect(":memory:").await.unwrap();
        crate::migrate::run(&pool).await.unwrap();
        StateStore::new(pool)
    }

    fn movie(title: &str, imdb: &str) -> StateEntity {
        let mut e = StateEntity::new(MediaKind::Movie);
        e.updated = 1000;
        e.via = "backend_a".into();
        e.title = title.into();
        e.year = Some(2020);
        e.guids
            .insert(GuidNamespace::Imdb, GuidValue::Text(imdb.into()));
        e
    }

    fn episode(parent_tvdb: i64, season: i64, ep: i64) -> StateEntity {
        let mut e = StateEntity::new(MediaKind::Episode);
        e.updated = 1000;
        e.via = "backend_a".into();
        e.title = "Pilot".into();
        e.season = Some(season);
        e.episode = Some(ep);
        e.parent
            .insert(GuidNamespace::Tvdb, GuidValue::Int(parent_tvdb));
        e
    }

    #[tokio::test]
    async fn insert_assigns_id_and_round_trips() {
        let mut store = store().await;
        let mut e = movie("X", "tt0000001");
        e.metadata
            .insert("backend_a".into(), json!({ "id": "11", "added_at": 900 }));

        store.insert(&mut e).await.unwrap();
        let id = e.id.expect("id assigned");

        let probe = movie("X", "tt0000001");
        let found = store.get(&probe).await.unwrap().expect("found by guid");
        assert_eq!(found.id, Some(id));
        assert_eq!(found.title, "X");
        assert_eq!(
            found.backend_metadata("backend_a").unwrap().get("added_at"),
            Some(&json!(900))
        );
        assert!(found.diff().is_empty());
    }

    #[tokio::test]
    async fn insert_with_id_is_rejected() {
        let mut store = store().await;
        let mut e = movie("X", "tt0000002");
        e.id = Some(5);
        let err = store.insert(&mut e).await.unwrap_err();
        assert!(matches!(err, StorageError::DuplicateInsert(5)));
    }

    #[tokio::test]
    async fn colliding_insert_outside_transaction_is_soft() {
        let mut store = store().await;
        let mut first = movie("X", "tt0000007");
        store.insert(&mut first).await.unwrap();

        // Same imdb guid trips the partial unique index. Outside a
        // transaction the driver error is swallowed and the entity is
        // left unsaved.
        let mut dup = movie("X again", "tt0000007");
        store.insert(&mut dup).await.unwrap();
        assert_eq!(dup.id, None);
        assert_eq!(store.get_all(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_without_id_is_rejected() {
        let mut store = store().await;
        let mut e = movie("X", "tt0000003");
        let err = store.update(&mut e).await.unwrap_err();
        assert!(matches!(err, StorageError::UnsavedUpdate));
    }

    #[tokio::test]
    async fn guid_lookup_is_narrowed_by_kind() {
        let mut store = store().await;
        let mut m = movie("X", "tt0000004");
        m.guids.insert(GuidNamespace::Tvdb, GuidValue::Int(77));
        store.insert(&mut m).await.unwrap();

        let mut probe = StateEntity::new(MediaKind::Episode);
        probe.guids.insert(GuidNamespace::Tvdb, GuidValue::Int(77));
        assert!(store.get(&probe).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn relative_guid_fallback_matches_episode() {
        let mut store = store().await;
        let mut stored = episode(100, 2, 5);
        store.insert(&mut stored).await.unwrap();

        // Candidate with empty direct guids, same parent/season/episode.
        let probe = episode(100, 2, 5);
        let found = store.get(&probe).await.unwrap().expect("relative match");
        assert_eq!(found.id, stored.id);

        // Different episode number: no match.
        assert!(store.get(&episode(100, 2, 6)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_contains_constraint_failures() {
        let mut store = store().await;
        let mut seeded = movie("Seeded", "tt0000005");
        store.insert(&mut seeded).await.unwrap();

        let mut batch = vec![
            movie("A", "tt0000006"),
            movie("Duplicate", "tt0000005"), // unique (type, guid_imdb) violation
            movie("B", "tt0000007"),
        ];
        let summary = store.commit(&mut batch).await.unwrap();
        assert_eq!(summary.movie.added, 2);
        assert_eq!(summary.movie.failed, 1);
        assert_eq!(summary.failed(), 1);

        // 1 seeded + 2 committed rows persisted.
        let all = store.get_all(None).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn commit_mixes_inserts_and_updates() {
        let mut store = store().await;
        let mut existing = movie("Old title", "tt0000008");
        store.insert(&mut existing).await.unwrap();

        existing.title = "New title".into();
        let mut batch = vec![existing, movie("Fresh", "tt0000009")];
        let summary = store.commit(&mut batch).await.unwrap();
        assert_eq!(summary.movie.added, 1);
        assert_eq!(summary.movie.updated, 1);

        let found = store
            .get(&movie("probe", "tt0000008"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.title, "New title");
    }

    #[tokio::test]
    async fn long_transaction_commits_inline_and_finalizes() {
        let mut store = store().await;
        store.begin_long_transaction().await.unwrap();

        let mut batch = vec![movie("A", "tt0000010")];
        store.commit(&mut batch).await.unwrap();

        // Visible through the open transaction, persisted on finalize.
        assert_eq!(store.get_all(None).await.unwrap().len(), 1);
        store.finalize().await.unwrap();
        assert_eq!(store.get_all(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_resolves_id_via_lookup() {
        let mut store = store().await;
        let mut e = movie("X", "tt0000011");
        store.insert(&mut e).await.unwrap();

        let probe = movie("X", "tt0000011");
        assert!(store.remove(&probe).await.unwrap());
        assert!(!store.remove(&probe).await.unwrap());
        assert!(store.get(&probe).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_all_filters_by_updated() {
        let mut store = store().await;
        let mut old = movie("Old", "tt0000012");
        old.updated = 500;
        let mut new = movie("New", "tt0000013");
        new.updated = 1500;
        store.insert(&mut old).await.unwrap();
        store.insert(&mut new).await.unwrap();

        let recent = store.get_all(Some(1000)).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].title, "New");
    }
}
