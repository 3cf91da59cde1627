//! Jellyfin adapter. Emby speaks the same API with different webhook
//! events and auth header, so [`crate::emby::EmbyAdapter`] wraps this
//! adapter with its kind switched.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use crosswatch_core::{entity, guid, GuidNamespace, MediaKind, StateEntity};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use crate::{
    cache::GuidCache, common, AdapterOptions, BackendAdapter, BackendError, BackendKind,
    ExportAction, ImportOpts, ImportSink, Parsed, PullSummary, PushRequest,
};

/// Third-party namespaces accepted from `ProviderIds`.
const PROVIDER_NAMESPACES: [GuidNamespace; 6] = [
    GuidNamespace::Imdb,
    GuidNamespace::Tmdb,
    GuidNamespace::Tvdb,
    GuidNamespace::Tvmaze,
    GuidNamespace::Tvrage,
    GuidNamespace::Anidb,
];

const JELLYFIN_EVENTS: [&str; 4] = ["ItemAdded", "UserDataSaved", "PlaybackStart", "PlaybackStop"];
const JELLYFIN_TAINTED: [&str; 3] = ["ItemAdded", "PlaybackStart", "PlaybackStop"];

const EMBY_EVENTS: [&str; 6] = [
    "item.markplayed",
    "item.markunplayed",
    "playback.scrobble",
    "playback.pause",
    "playback.start",
    "playback.stop",
];
const EMBY_TAINTED: [&str; 3] = ["playback.pause", "playback.start", "playback.stop"];

const VIEW_CONCURRENCY: usize = 4;

pub struct JellyfinAdapter {
    kind: BackendKind,
    name: String,
    base_url: String,
    token: String,
    user_id: String,
    client: reqwest::Client,
    cache: Mutex<GuidCache>,
    options: AdapterOptions,
}

impl JellyfinAdapter {
    pub fn new(
        name: String,
        base_url: String,
        token: String,
        user_id: String,
        cache_dir: Option<&Path>,
        options: AdapterOptions,
    ) -> Self {
        Self::with_kind(BackendKind::Jellyfin, name, base_url, token, user_id, cache_dir, options)
    }

    pub(crate) fn with_kind(
        kind: BackendKind,
        name: String,
        base_url: String,
        token: String,
        user_id: String,
        cache_dir: Option<&Path>,
        options: AdapterOptions,
    ) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        let cache = GuidCache::load(cache_dir, kind.as_str(), &name, &base_url);
        Self {
            kind,
            name,
            base_url,
            token,
            user_id,
            client: reqwest::Client::new(),
            cache: Mutex::new(cache),
            options,
        }
    }

    fn auth_header(&self) -> (String, String) {
        match self.kind {
            BackendKind::Emby => ("X-Emby-Token".to_string(), self.token.clone()),
            _ => (
                "Authorization".to_string(),
                format!("MediaBrowser Token=\"{}\"", self.token),
            ),
        }
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            self.auth_header(),
            ("Accept".to_string(), "application/json".to_string()),
        ]
    }

    async fn get_json(&self, path_and_query: &str) -> Result<Value, BackendError> {
        let url = format!("{}{}", self.base_url, path_and_query);
        debug!(backend = %self.name, url = %url, "request");

        let (header, value) = self.auth_header();
        let resp = self
            .client
            .get(&url)
            .header(header, value)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(BackendError::Decode(format!(
                "{} returned {} for {}",
                self.kind,
                resp.status(),
                path_and_query
            )));
        }

        resp.json()
            .await
            .map_err(|e| BackendError::Decode(format!("parse JSON: {e}")))
    }

    /// Library views worth pulling: `(id, name)`.
    async fn views(&self) -> Result<Vec<(String, String)>, BackendError> {
        let data = self
            .get_json(&format!("/Users/{}/Views", self.user_id))
            .await?;
        let items = data["Items"].as_array().cloned().unwrap_or_default();

        let mut out = Vec::new();
        for view in &items {
            let name = view["Name"].as_str().unwrap_or("??").to_string();
            if self.options.ignore_sections.contains(&name) {
                info!(backend = %self.name, section = %name, "ignoring section");
                continue;
            }
            match view["CollectionType"].as_str() {
                Some("movies") | Some("tvshows") => {}
                _ => continue,
            }
            let Some(id) = view["Id"].as_str() else {
                continue;
            };
            out.push((id.to_string(), name));
        }
        Ok(out)
    }

    async fn remember(&self, candidate: &StateEntity, native_id: &str) {
        let mut cache = self.cache.lock().await;
        for pointer in candidate.pointers() {
            cache.set(pointer, native_id.to_string());
        }
    }

    /// Resolve the backend's native item id for a stored entity.
    async fn native_id(&self, item: &StateEntity) -> Option<String> {
        if let Some(value) = item.guids.get(&self.kind.namespace()) {
            return Some(value.to_string());
        }
        let cache = self.cache.lock().await;
        item.pointers()
            .iter()
            .find_map(|p| cache.get(p).map(str::to_string))
    }
}

#[async_trait]
impl BackendAdapter for JellyfinAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn produce(&self, payload: &Value) -> Result<Parsed, BackendError> {
        let event = payload["Event"]
            .as_str()
            .ok_or_else(|| BackendError::MalformedPayload("missing Event".into()))?;

        let (allowed, tainted): (&[&str], &[&str]) = match self.kind {
            BackendKind::Emby => (&EMBY_EVENTS, &EMBY_TAINTED),
            _ => (&JELLYFIN_EVENTS, &JELLYFIN_TAINTED),
        };
        if !allowed.contains(&event) {
            return Ok(Parsed::Skipped {
                reason: format!("unsupported event '{event}'"),
            });
        }

        let item = payload
            .get("Item")
            .ok_or_else(|| BackendError::MalformedPayload("missing Item".into()))?;

        let kind = match item["Type"].as_str() {
            Some("Movie") => MediaKind::Movie,
            Some("Episode") => MediaKind::Episode,
            other => {
                return Ok(Parsed::Skipped {
                    reason: format!("unsupported media type '{}'", other.unwrap_or("?")),
                })
            }
        };

        let is_tainted = tainted.contains(&event);
        let mut candidate = parse_webhook_item(self.kind, &self.name, kind, event, is_tainted, item)?;
        candidate.tainted = is_tainted;

        if !candidate.has_guids() && !candidate.has_relative_guid() {
            return Ok(Parsed::Skipped {
                reason: format!("'{}' has no usable identity", candidate.name()),
            });
        }

        Ok(Parsed::Candidate(Box::new(candidate)))
    }

    async fn pull(
        &self,
        sink: &mut dyn ImportSink,
        after: Option<i64>,
    ) -> Result<PullSummary, BackendError> {
        let views = self.views().await?;
        info!(backend = %self.name, sections = views.len(), "starting pull");

        let (tx, mut rx) = mpsc::channel::<Value>(64);
        let semaphore = Arc::new(Semaphore::new(VIEW_CONCURRENCY));

        for (view_id, view_name) in views {
            let tx = tx.clone();
            let semaphore = semaphore.clone();
            let client = self.client.clone();
            let (header, header_value) = self.auth_header();
            let backend = self.name.clone();
            let url = format!(
                "{}/Users/{}/Items?ParentId={view_id}&Recursive=true\
                 &IncludeItemTypes=Movie,Episode\
                 &Fields=ProviderIds,DateCreated&EnableUserData=true",
                self.base_url, self.user_id
            );

            tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                let resp = client
                    .get(&url)
                    .header(header, header_value)
                    .header("Accept", "application/json")
                    .send()
                    .await;
                let body: Value = match resp {
                    Ok(resp) if resp.status().is_success() => match resp.json().await {
                        Ok(body) => body,
                        Err(e) => {
                            error!(backend = %backend, section = %view_name, error = %e, "section body unreadable");
                            return;
                        }
                    },
                    Ok(resp) => {
                        error!(backend = %backend, section = %view_name, status = %resp.status(), "section pull failed");
                        return;
                    }
                    Err(e) => {
                        error!(backend = %backend, section = %view_name, error = %e, "section pull failed");
                        return;
                    }
                };
                let items = body["Items"].as_array().cloned().unwrap_or_default();
                debug!(backend = %backend, section = %view_name, items = items.len(), "section loaded");
                for item in items {
                    if tx.send(item).await.is_err() {
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

        while let Some(item) = rx.recv().await {
            match parse_pull_item(self.kind, &self.name, &item) {
                Ok(candidate) => {
                    if let Some(id) = item["Id"].as_str() {
                        self.remember(&candidate, id).await;
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
        let Some(native_id) = self.native_id(item).await else {
            return Ok(ExportAction::NoRemoteMatch);
        };

        let remote = self
            .get_json(&format!("/Users/{}/Items/{native_id}", self.user_id))
            .await?;
        if remote.get("Id").is_none() {
            return Ok(ExportAction::NoRemoteMatch);
        }

        let remote_watched = remote["UserData"]["Played"].as_bool().unwrap_or(false);
        if remote_watched == item.watched {
            return Ok(ExportAction::Consistent);
        }

        if !self.options.export_ignore_date {
            let remote_date = common::json_str(&remote["UserData"], &["LastPlayedDate"])
                .or_else(|| common::json_str(&remote, &["DateCreated"]))
                .and_then(common::iso_epoch)
                .unwrap_or(0);
            if remote_date >= item.updated || after.is_some_and(|a| item.updated < a) {
                debug!(backend = %self.name, item = %item.name(), "remote state is newer, skipping");
                return Ok(ExportAction::Consistent);
            }
        }

        let (method, description) = if item.watched {
            (reqwest::Method::POST, "mark watched")
        } else {
            (reqwest::Method::DELETE, "mark unwatched")
        };
        Ok(ExportAction::Request(PushRequest {
            method,
            url: format!(
                "{}/Users/{}/PlayedItems/{native_id}",
                self.base_url, self.user_id
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

fn parse_pull_item(
    backend_kind: BackendKind,
    backend: &str,
    item: &Value,
) -> Result<StateEntity, String> {
    let kind = match item["Type"].as_str() {
        Some("Movie") => MediaKind::Movie,
        Some("Episode") => MediaKind::Episode,
        other => return Err(format!("unsupported media type '{}'", other.unwrap_or("?"))),
    };

    let name = || {
        common::raw_name(
            kind,
            common::json_str(item, &["Name"]),
            common::json_i64(item, &["ProductionYear"]),
            common::json_str(item, &["SeriesName"]),
            common::json_i64(item, &["ParentIndexNumber"]),
            common::json_i64(item, &["IndexNumber"]),
        )
    };

    let played_at = common::json_str(&item["UserData"], &["LastPlayedDate"])
        .and_then(common::iso_epoch);
    let added_at = common::json_str(item, &["DateCreated"]).and_then(common::iso_epoch);
    let Some(updated) = played_at.or(added_at) else {
        return Err(format!("'{}' has no change date", name()));
    };

    let mut entity = StateEntity::new(kind);
    entity.via = backend.to_string();
    entity.updated = updated;
    entity.watched = item["UserData"]["Played"].as_bool().unwrap_or(false);
    entity.title = common::json_str(item, &["Name"]).unwrap_or("??").to_string();
    entity.year = common::json_i64(item, &["ProductionYear"]);

    let provider_ids = item["ProviderIds"].as_object().cloned().unwrap_or_default();
    entity.guids = common::provider_guids(&provider_ids, &PROVIDER_NAMESPACES);

    let native_id = item["Id"].as_str();
    if let Some(id) = native_id {
        let (ns, value) = guid::make_virtual(backend_kind.namespace(), id);
        entity.guids.insert(ns, value);
    }

    if kind == MediaKind::Episode {
        entity.season = common::json_i64(item, &["ParentIndexNumber"]);
        entity.episode = common::json_i64(item, &["IndexNumber"]);
        if entity.season.is_none() || entity.episode.is_none() {
            return Err(format!("'{}' has no season or episode number", name()));
        }
        if let Some(series_id) = common::json_str(item, &["SeriesId"]) {
            let (ns, value) = guid::make_virtual(backend_kind.namespace(), series_id);
            entity.parent.insert(ns, value);
        }
    }

    if !entity.has_guids() && !entity.has_relative_guid() {
        return Err(format!("'{}' has no usable identity", name()));
    }

    let mut meta = serde_json::Map::new();
    if let Some(id) = native_id {
        meta.insert(entity::META_ID.into(), json!(id));
    }
    if let Some(added) = added_at {
        meta.insert(entity::META_ADDED_AT.into(), json!(added));
    }
    if let Some(played) = played_at {
        meta.insert(entity::META_PLAYED_AT.into(), json!(played));
    }
    meta.insert(
        entity::META_WATCHED.into(),
        json!(if entity.watched { "1" } else { "0" }),
    );
    meta.insert(entity::META_GUIDS.into(), Value::Object(provider_ids));
    entity.metadata.insert(backend.to_string(), Value::Object(meta));

    Ok(entity)
}

fn parse_webhook_item(
    backend_kind: BackendKind,
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
        "item.markplayed" | "playback.scrobble" => true,
        "item.markunplayed" => false,
        _ => item["Played"]
            .as_bool()
            .or_else(|| item["UserData"]["Played"].as_bool())
            .unwrap_or(false),
    };
    entity.title = common::json_str(item, &["Name"]).unwrap_or("??").to_string();
    entity.year = common::json_i64(item, &["ProductionYear"]);

    let provider_ids = item["ProviderIds"].as_object().cloned().unwrap_or_default();
    entity.guids = common::provider_guids(&provider_ids, &PROVIDER_NAMESPACES);

    let native_id = item["Id"].as_str();
    if let Some(id) = native_id {
        let (ns, value) = guid::make_virtual(backend_kind.namespace(), id);
        entity.guids.insert(ns, value);
    }

    if kind == MediaKind::Episode {
        entity.season = common::json_i64(item, &["ParentIndexNumber"]);
        entity.episode = common::json_i64(item, &["IndexNumber"]);
        if let Some(series_id) = common::json_str(item, &["SeriesId"]) {
            let (ns, value) = guid::make_virtual(backend_kind.namespace(), series_id);
            entity.parent.insert(ns, value);
        }
    }

    let mut meta = serde_json::Map::new();
    if let Some(id) = native_id {
        meta.insert(entity::META_ID.into(), json!(id));
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

#[cfg(test)]
mod tests {
    use super::*;
    use crosswatch_core::{policy, GuidValue};

    fn movie_item() -> Value {
        json!({
            "Id": "4c0f8e2a",
            "Type": "Movie",
            "Name": "Fight Club",
            "ProductionYear": 1999,
            "ProviderIds": {"Imdb": "tt0137523", "Tmdb": "550"},
            "DateCreated": "2023-01-01T00:00:00Z",
            "UserData": {"Played": true, "LastPlayedDate": "2023-06-01T12:00:00Z"}
        })
    }

    #[test]
    fn pull_item_prefers_played_date() {
        let entity = parse_pull_item(BackendKind::Jellyfin, "jf_home", &movie_item()).unwrap();
        assert!(entity.watched);
        assert_eq!(entity.updated, common::iso_epoch("2023-06-01T12:00:00Z").unwrap());
        assert_eq!(
            entity.guids.get(&GuidNamespace::Imdb),
            Some(&GuidValue::Text("tt0137523".into()))
        );
    }

    #[test]
    fn item_without_provider_ids_gets_virtual_guid() {
        let mut item = movie_item();
        item.as_object_mut().unwrap().remove("ProviderIds");
        let entity = parse_pull_item(BackendKind::Jellyfin, "jf_home", &item).unwrap();
        assert_eq!(
            entity.guids.get(&GuidNamespace::Jellyfin),
            Some(&GuidValue::Text("4c0f8e2a".into()))
        );
    }

    #[test]
    fn episode_without_numbers_is_skipped() {
        let item = json!({
            "Id": "ep1",
            "Type": "Episode",
            "Name": "Pilot",
            "SeriesName": "Some Show",
            "SeriesId": "show9",
            "DateCreated": "2023-01-01T00:00:00Z",
            "UserData": {"Played": false}
        });
        let err = parse_pull_item(BackendKind::Jellyfin, "jf_home", &item).unwrap_err();
        assert!(err.contains("season or episode"), "{err}");
    }

    #[test]
    fn episode_parent_is_virtual_series_identity() {
        let item = json!({
            "Id": "ep1",
            "Type": "Episode",
            "Name": "Ozymandias",
            "SeriesName": "Breaking Bad",
            "SeriesId": "show9",
            "ParentIndexNumber": 5,
            "IndexNumber": 14,
            "DateCreated": "2023-01-01T00:00:00Z",
            "UserData": {"Played": true, "LastPlayedDate": "2023-02-01T00:00:00Z"}
        });
        let entity = parse_pull_item(BackendKind::Jellyfin, "jf_home", &item).unwrap();
        assert_eq!(
            entity.parent.get(&GuidNamespace::Jellyfin),
            Some(&GuidValue::Text("show9".into()))
        );
        assert!(entity.has_relative_guid());
    }

    fn adapter(kind: BackendKind) -> JellyfinAdapter {
        JellyfinAdapter::with_kind(
            kind,
            "media".into(),
            "http://media:8096".into(),
            "t".into(),
            "u1".into(),
            None,
            AdapterOptions::default(),
        )
    }

    #[test]
    fn jellyfin_playback_stop_is_tainted() {
        let payload = json!({"Event": "PlaybackStop", "Item": movie_item()});
        match adapter(BackendKind::Jellyfin).produce(&payload).unwrap() {
            Parsed::Candidate(entity) => {
                assert!(entity.tainted);
                // Watched still reflects the nested UserData flag.
                assert!(entity.watched);
                assert!(!policy::can_flip_watched(&entity));
            }
            other => panic!("expected candidate, got {other:?}"),
        }
    }

    #[test]
    fn emby_markplayed_is_authoritative() {
        let payload = json!({"Event": "item.markplayed", "Item": movie_item()});
        match adapter(BackendKind::Emby).produce(&payload).unwrap() {
            Parsed::Candidate(entity) => {
                assert!(entity.watched);
                assert!(!entity.tainted);
                assert!(policy::can_flip_watched(&entity));
            }
            other => panic!("expected candidate, got {other:?}"),
        }
    }

    #[test]
    fn emby_scrobble_corroborates_played_date() {
        let payload = json!({"Event": "playback.scrobble", "Item": movie_item()});
        match adapter(BackendKind::Emby).produce(&payload).unwrap() {
            Parsed::Candidate(entity) => {
                let meta = entity.backend_metadata("media").unwrap();
                assert_eq!(meta[entity::META_PLAYED_AT], json!(entity.updated));
            }
            other => panic!("expected candidate, got {other:?}"),
        }
    }

    #[test]
    fn jellyfin_event_is_rejected_by_emby_tables() {
        let payload = json!({"Event": "UserDataSaved", "Item": movie_item()});
        assert!(matches!(
            adapter(BackendKind::Emby).produce(&payload).unwrap(),
            Parsed::Skipped { .. }
        ));
    }
}
