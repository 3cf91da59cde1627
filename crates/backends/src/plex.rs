//! Plex Media Server adapter.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use crosswatch_core::{entity, GuidNamespace, MediaKind, StateEntity};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use crate::{
    cache::GuidCache, common, AdapterOptions, BackendAdapter, BackendError, BackendKind,
    ExportAction, ImportOpts, ImportSink, Parsed, PullSummary, PushRequest,
};

/// Namespaces Plex can report. Virtual identities from other backends are
/// never accepted here.
const NAMESPACES: [GuidNamespace; 7] = [
    GuidNamespace::Imdb,
    GuidNamespace::Tmdb,
    GuidNamespace::Tvdb,
    GuidNamespace::Tvmaze,
    GuidNamespace::Tvrage,
    GuidNamespace::Anidb,
    GuidNamespace::Plex,
];

/// Webhook events that may flip the watch flag on their own authority.
const WEBHOOK_EVENTS: [&str; 7] = [
    "library.new",
    "library.on.deck",
    "media.play",
    "media.stop",
    "media.resume",
    "media.pause",
    "media.scrobble",
];

/// Events fired by ongoing playback rather than a completed state change.
const TAINTED_EVENTS: [&str; 4] = ["media.play", "media.stop", "media.resume", "media.pause"];

const SCROBBLE_IDENTIFIER: &str = "com.plexapp.plugins.library";

/// Library sections pulled concurrently.
const SECTION_CONCURRENCY: usize = 4;

pub struct PlexAdapter {
    name: String,
    base_url: String,
    token: String,
    client: reqwest::Client,
    cache: Mutex<GuidCache>,
    options: AdapterOptions,
}

impl PlexAdapter {
    pub fn new(
        name: String,
        base_url: String,
        token: String,
        cache_dir: Option<&Path>,
        options: AdapterOptions,
    ) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        let cache = GuidCache::load(cache_dir, "plex", &name, &base_url);
        Self {
            name,
            base_url,
            token,
            client: reqwest::Client::new(),
            cache: Mutex::new(cache),
            options,
        }
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            ("X-Plex-Token".to_string(), self.token.clone()),
            ("Accept".to_string(), "application/json".to_string()),
        ]
    }

    async fn get_json(&self, path_and_query: &str) -> Result<Value, BackendError> {
        let url = format!("{}{}", self.base_url, path_and_query);
        debug!(backend = %self.name, url = %url, "plex request");

        let resp = self
            .client
            .get(&url)
            .header("X-Plex-Token", &self.token)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(BackendError::Decode(format!(
                "plex returned {} for {}",
                resp.status(),
                path_and_query
            )));
        }

        resp.json()
            .await
            .map_err(|e| BackendError::Decode(format!("parse JSON: {e}")))
    }

    /// List library sections worth pulling: `(key, title, media kind)`.
    async fn sections(&self) -> Result<Vec<(String, String, MediaKind)>, BackendError> {
        let data = self.get_json("/library/sections").await?;
        let dirs = data["MediaContainer"]["Directory"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::new();
        for dir in &dirs {
            let title = dir["title"].as_str().unwrap_or("??").to_string();
            if self.options.ignore_sections.contains(&title) {
                info!(backend = %self.name, section = %title, "ignoring section");
                continue;
            }
            let kind = match dir["type"].as_str() {
                Some("movie") => MediaKind::Movie,
                Some("show") => MediaKind::Episode,
                _ => continue,
            };
            let Some(key) = dir["key"].as_str() else {
                continue;
            };
            out.push((key.to_string(), title, kind));
        }
        Ok(out)
    }

    /// Record every pointer of a pulled item against its library guid so a
    /// later export can find it without a scan.
    async fn remember(&self, candidate: &StateEntity, library_guid: &str) {
        let mut cache = self.cache.lock().await;
        for pointer in candidate.pointers() {
            cache.set(pointer, library_guid.to_string());
        }
    }

    /// Resolve the Plex library guid for a stored entity, from its own
    /// `plex` guid or the pull cache.
    async fn library_guid(&self, item: &StateEntity) -> Option<String> {
        if let Some(value) = item.guids.get(&GuidNamespace::Plex) {
            return Some(format!(
                "plex://{}/{}",
                if item.is_movie() { "movie" } else { "episode" },
                value
            ));
        }
        let cache = self.cache.lock().await;
        item.pointers()
            .iter()
            .find_map(|p| cache.get(p).map(str::to_string))
    }
}

#[async_trait]
impl BackendAdapter for PlexAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Plex
    }

    fn produce(&self, payload: &Value) -> Result<Parsed, BackendError> {
        let event = payload["event"]
            .as_str()
            .ok_or_else(|| BackendError::MalformedPayload("missing event".into()))?;

        if !WEBHOOK_EVENTS.contains(&event) {
            return Ok(Parsed::Skipped {
                reason: format!("unsupported event '{event}'"),
            });
        }

        let item = payload
            .get("Metadata")
            .ok_or_else(|| BackendError::MalformedPayload("missing Metadata".into()))?;

        let kind = match item["type"].as_str() {
            Some("movie") => MediaKind::Movie,
            Some("episode") => MediaKind::Episode,
            other => {
                return Ok(Parsed::Skipped {
                    reason: format!("unsupported media type '{}'", other.unwrap_or("?")),
                })
            }
        };

        let tainted = TAINTED_EVENTS.contains(&event);
        let mut candidate = parse_webhook_item(&self.name, kind, event, tainted, item)?;
        candidate.tainted = tainted;

        if !candidate.has_guids() && !candidate.has_relative_guid() {
            return Ok(Parsed::Skipped {
                reason: format!("'{}' has no supported guid", candidate.name()),
            });
        }

        Ok(Parsed::Candidate(Box::new(candidate)))
    }

    async fn pull(
        &self,
        sink: &mut dyn ImportSink,
        after: Option<i64>,
    ) -> Result<PullSummary, BackendError> {
        let sections = self.sections().await?;
        info!(backend = %self.name, sections = sections.len(), "starting pull");

        let (tx, mut rx) = mpsc::channel::<(MediaKind, Value)>(64);
        let semaphore = Arc::new(Semaphore::new(SECTION_CONCURRENCY));

        for (key, title, kind) in sections {
            let tx = tx.clone();
            let semaphore = semaphore.clone();
            let client = self.client.clone();
            let token = self.token.clone();
            let backend = self.name.clone();
            let media_type = match kind {
                MediaKind::Movie => 1,
                MediaKind::Episode => 4,
            };
            let url = format!(
                "{}/library/sections/{key}/all?type={media_type}&includeGuids=1",
                self.base_url
            );

            tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                let resp = client
                    .get(&url)
                    .header("X-Plex-Token", &token)
                    .header("Accept", "application/json")
                    .send()
                    .await;
                let body: Value = match resp {
                    Ok(resp) if resp.status().is_success() => match resp.json().await {
                        Ok(body) => body,
                        Err(e) => {
                            error!(backend = %backend, section = %title, error = %e, "section body unreadable");
                            return;
                        }
                    },
                    Ok(resp) => {
                        error!(backend = %backend, section = %title, status = %resp.status(), "section pull failed");
                        return;
                    }
                    Err(e) => {
                        error!(backend = %backend, section = %title, error = %e, "section pull failed");
                        return;
                    }
                };
                let items = body["MediaContainer"]["Metadata"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default();
                debug!(backend = %backend, section = %title, items = items.len(), "section loaded");
                for item in items {
                    if tx.send((kind, item)).await.is_err() {
                        return;
                    }
                }
            });
        }
        drop(tx);

        let opts = ImportOpts {
            after,
            import_unwatched: self.options.import_unwatched,
            force: false,
        };
        let mut summary = PullSummary::default();

        while let Some((kind, item)) = rx.recv().await {
            match parse_pull_item(&self.name, kind, &item) {
                Ok(candidate) => {
                    if let Some(library_guid) = item["guid"].as_str() {
                        self.remember(&candidate, library_guid).await;
                    }
                    summary.items += 1;
                    let item_name = candidate.name();
                    if let Err(e) = sink.add(&self.name, &item_name, candidate, &opts).await {
                        error!(backend = %self.name, item = %item_name, error = %e, "sink rejected item");
                    }
                }
                Err(reason) => {
                    debug!(backend = %self.name, reason = %reason, "skipping item");
                    summary.skipped += 1;
                }
            }
        }

        self.cache.lock().await.persist();
        info!(backend = %self.name, items = summary.items, skipped = summary.skipped, "pull finished");
        Ok(summary)
    }

    async fn compare(
        &self,
        item: &StateEntity,
        after: Option<i64>,
    ) -> Result<ExportAction, BackendError> {
        let Some(library_guid) = self.library_guid(item).await else {
            return Ok(ExportAction::NoRemoteMatch);
        };

        let data = self
            .get_json(&format!("/library/all?guid={library_guid}&includeGuids=1"))
            .await?;
        let Some(remote) = data["MediaContainer"]["Metadata"]
            .as_array()
            .and_then(|a| a.first())
        else {
            return Ok(ExportAction::NoRemoteMatch);
        };

        let remote_watched = common::json_i64(remote, &["viewCount"]).unwrap_or(0) > 0;
        if remote_watched == item.watched {
            return Ok(ExportAction::Consistent);
        }

        if !self.options.export_ignore_date {
            let remote_date =
                common::json_i64(remote, &["lastViewedAt", "updatedAt", "addedAt"]).unwrap_or(0);
            if remote_date >= item.updated || after.is_some_and(|a| item.updated < a) {
                debug!(backend = %self.name, item = %item.name(), "remote state is newer, skipping");
                return Ok(ExportAction::Consistent);
            }
        }

        let Some(key) = remote["ratingKey"].as_str() else {
            return Err(BackendError::Decode("remote item has no ratingKey".into()));
        };

        let (verb, description) = if item.watched {
            ("scrobble", "mark watched")
        } else {
            ("unscrobble", "mark unwatched")
        };
        Ok(ExportAction::Request(PushRequest {
            method: reqwest::Method::GET,
            url: format!(
                "{}/:/{verb}?identifier={SCROBBLE_IDENTIFIER}&key={key}",
                self.base_url
            ),
            headers: self.headers(),
            description: format!("{description} '{}'", item.name()),
        }))
    }

    fn persist(&self) {
        if let Ok(mut cache) = self.cache.try_lock() {
            cache.persist();
        } else {
            warn!(backend = %self.name, "guid cache busy, skipping persist");
        }
    }
}

/// Turn one pulled library item into a state candidate. Returns the skip
/// reason when the item cannot be reconciled.
fn parse_pull_item(backend: &str, kind: MediaKind, item: &Value) -> Result<StateEntity, String> {
    let name = || {
        common::raw_name(
            kind,
            common::json_str(item, &["title", "originalTitle"]),
            common::json_i64(item, &["year"]),
            common::json_str(item, &["grandparentTitle"]),
            common::json_i64(item, &["parentIndex"]),
            common::json_i64(item, &["index"]),
        )
    };

    let Some(updated) = common::json_i64(item, &["lastViewedAt", "updatedAt", "addedAt"]) else {
        return Err(format!("'{}' has no change date", name()));
    };

    let guid_strings = common::plex_guid_strings(item);
    let guids = common::plex_guids(&guid_strings, &NAMESPACES);

    let mut entity = StateEntity::new(kind);
    entity.via = backend.to_string();
    entity.updated = updated;
    entity.watched = common::json_i64(item, &["viewCount"]).unwrap_or(0) > 0;
    entity.title = common::json_str(item, &["title", "originalTitle"])
        .unwrap_or("??")
        .to_string();
    entity.year = common::json_i64(item, &["year"]);
    entity.guids = guids;

    if kind == MediaKind::Episode {
        entity.season = common::json_i64(item, &["parentIndex"]);
        entity.episode = common::json_i64(item, &["index"]);
        if entity.season.is_none() || entity.episode.is_none() {
            return Err(format!("'{}' has no season or episode number", name()));
        }
        if let Some(parent) = common::json_str(item, &["grandparentGuid"]) {
            entity.parent = common::plex_guids(&[parent.to_string()], &NAMESPACES);
        }
    }

    if !entity.has_guids() && !entity.has_relative_guid() {
        return Err(format!("'{}' has no supported guid", name()));
    }

    let mut meta = serde_json::Map::new();
    if let Some(key) = item["ratingKey"].as_str() {
        meta.insert(entity::META_ID.into(), json!(key));
    }
    if let Some(added) = common::json_i64(item, &["addedAt"]) {
        meta.insert(entity::META_ADDED_AT.into(), json!(added));
    }
    if let Some(played) = common::json_i64(item, &["lastViewedAt"]) {
        meta.insert(entity::META_PLAYED_AT.into(), json!(played));
    }
    meta.insert(
        entity::META_WATCHED.into(),
        json!(if entity.watched { "1" } else { "0" }),
    );
    meta.insert(entity::META_GUIDS.into(), json!(guid_strings));
    entity.metadata.insert(backend.to_string(), Value::Object(meta));

    Ok(entity)
}

/// Build a candidate from a webhook's `Metadata` block. Webhooks carry no
/// reliable change date, so the arrival time is used.
fn parse_webhook_item(
    backend: &str,
    kind: MediaKind,
    event: &str,
    tainted: bool,
    item: &Value,
) -> Result<StateEntity, BackendError> {
    let now = Utc::now().timestamp();

    let mut entity = StateEntity::new(kind);
    entity.via = backend.to_string();
    entity.updated = now;
    entity.watched = match event {
        "media.scrobble" => true,
        _ => common::json_i64(item, &["viewCount"]).unwrap_or(0) > 0,
    };
    entity.title = common::json_str(item, &["title", "originalTitle"])
        .unwrap_or("??")
        .to_string();
    entity.year = common::json_i64(item, &["year"]);
    entity.guids = common::plex_guids(&common::plex_guid_strings(item), &NAMESPACES);

    if kind == MediaKind::Episode {
        entity.season = common::json_i64(item, &["parentIndex"]);
        entity.episode = common::json_i64(item, &["index"]);
        if let Some(parent) = common::json_str(item, &["grandparentGuid"]) {
            entity.parent = common::plex_guids(&[parent.to_string()], &NAMESPACES);
        }
    }

    let mut meta = serde_json::Map::new();
    if let Some(key) = item["ratingKey"].as_str() {
        meta.insert(entity::META_ID.into(), json!(key));
    }
    // A playback heartbeat proves nothing about completion, so it never
    // records a played date that would later corroborate a flip.
    if entity.watched && !tainted {
        meta.insert(entity::META_PLAYED_AT.into(), json!(now));
    }
    meta.insert(
        entity::META_WATCHED.into(),
        json!(if entity.watched { "1" } else { "0" }),
    );
    entity.metadata.insert(backend.to_string(), Value::Object(meta));

    let mut extra = serde_json::Map::new();
    extra.insert(entity::EXTRA_EVENT.into(), json!(event));
    extra.insert(entity::EXTRA_DATE.into(), json!(Utc::now().to_rfc3339()));
    entity.extra.insert(backend.to_string(), Value::Object(extra));

    Ok(entity)
}
