//! Canonical watch-state record and its merge/diff algorithm.
//!
//! One `StateEntity` exists per title/episode regardless of how many
//! backends report it. Merging is deterministic: the `updated`/`watched`
//! pair moves only together and only on a real state transition, all other
//! scalars are last-writer-set, and the nested maps union by key.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::guid::{self, GuidMap, GuidValue};
use crate::types::MediaKind;

/// Keys used inside per-backend `metadata` blobs.
pub const META_ID: &str = "id";
pub const META_ADDED_AT: &str = "added_at";
pub const META_PLAYED_AT: &str = "played_at";
pub const META_WATCHED: &str = "watched";
pub const META_GUIDS: &str = "guids";

/// Keys used inside per-backend `extra` blobs.
pub const EXTRA_EVENT: &str = "event";
pub const EXTRA_DATE: &str = "date";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntity {
    /// Surrogate id. Assigned by storage on first insert, never by merge.
    pub id: Option<i64>,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    /// Epoch of the most recent trusted playback-state change.
    pub updated: i64,
    pub watched: bool,
    /// Backend that produced the last authoritative write.
    pub via: String,
    pub title: String,
    pub year: Option<i64>,
    pub season: Option<i64>,
    pub episode: Option<i64>,
    /// Parent show identity per namespace, for relative episode matching.
    #[serde(default)]
    pub parent: GuidMap,
    #[serde(default)]
    pub guids: GuidMap,
    /// Backend name -> backend-scoped facts. Audit trail, not merge input.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Backend name -> last seen event name/date.
    #[serde(default)]
    pub extra: Map<String, Value>,
    /// Set when the candidate came from an inconclusive signal, e.g. a
    /// playback heartbeat. Transient, never persisted.
    #[serde(skip)]
    pub tainted: bool,
    #[serde(skip)]
    baseline: Option<Box<StateEntity>>,
}

impl StateEntity {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            id: None,
            kind,
            updated: 0,
            watched: false,
            via: String::new(),
            title: String::new(),
            year: None,
            season: None,
            episode: None,
            parent: GuidMap::new(),
            guids: GuidMap::new(),
            metadata: Map::new(),
            extra: Map::new(),
            tainted: false,
            baseline: None,
        }
    }

    pub fn is_movie(&self) -> bool {
        self.kind == MediaKind::Movie
    }

    pub fn is_episode(&self) -> bool {
        self.kind == MediaKind::Episode
    }

    pub fn has_guids(&self) -> bool {
        !self.guids.is_empty()
    }

    pub fn has_parent(&self) -> bool {
        !self.parent.is_empty()
    }

    /// An episode can be identified relative to its parent show when it has
    /// parent guids plus season and episode numbers.
    pub fn has_relative_guid(&self) -> bool {
        self.is_episode() && self.has_parent() && self.season.is_some() && self.episode.is_some()
    }

    /// Lookup pointers for the direct guids, used as index probe keys.
    /// Order is not significant, only membership.
    pub fn pointers(&self) -> Vec<String> {
        self.guids
            .iter()
            .map(|(ns, val)| guid::pointer(*ns, val))
            .collect()
    }

    /// One derived identity per namespace present on the parent show:
    /// `<ns>://<parent>/<season>/<episode>`.
    pub fn relative_guids(&self) -> GuidMap {
        if !self.is_episode() {
            return GuidMap::new();
        }
        let season = self.season.unwrap_or(0);
        let episode = self.episode.unwrap_or(0);
        self.parent
            .iter()
            .map(|(ns, val)| (*ns, GuidValue::Text(format!("{val}/{season}/{episode}"))))
            .collect()
    }

    /// Relative pointers carry an `r` prefix so they can never collide with
    /// a direct or virtual pointer of the same raw value.
    pub fn relative_pointers(&self) -> Vec<String> {
        self.relative_guids()
            .iter()
            .map(|(ns, val)| format!("r{}", guid::pointer(*ns, val)))
            .collect()
    }

    /// Backend-scoped metadata facts for one backend.
    pub fn backend_metadata(&self, via: &str) -> Option<&Map<String, Value>> {
        self.metadata.get(via).and_then(Value::as_object)
    }

    /// Display name: `Title (year)` for movies, `Title (year) - SSxEEE`
    /// for episodes.
    pub fn name(&self) -> String {
        let year = self.year.map_or_else(|| "0000".to_string(), |y| y.to_string());
        if self.is_movie() {
            return format!("{} ({year})", self.title);
        }
        format!(
            "{} ({year}) - {:02}x{:03}",
            self.title,
            self.season.unwrap_or(0),
            self.episode.unwrap_or(0)
        )
    }

    /// Merge a remote candidate onto this entity, field by field.
    ///
    /// `updated` and `watched` move only together, and only when the remote
    /// carries both a newer timestamp and an actual flag transition. `id`
    /// is always preserved. Map fields union by key with remote leaves
    /// winning; unrelated existing keys survive.
    pub fn apply(&mut self, remote: &StateEntity) {
        if remote.updated > self.updated && remote.watched != self.watched {
            self.updated = remote.updated;
            self.watched = remote.watched;
        }

        if remote.kind != self.kind {
            self.kind = remote.kind;
        }
        if !remote.via.is_empty() && remote.via != self.via {
            self.via = remote.via.clone();
        }
        if !remote.title.is_empty() && remote.title != self.title {
            self.title = remote.title.clone();
        }
        if let Some(year) = remote.year {
            if self.year != Some(year) {
                self.year = Some(year);
            }
        }
        if let Some(season) = remote.season {
            if self.season != Some(season) {
                self.season = Some(season);
            }
        }
        if let Some(episode) = remote.episode {
            if self.episode != Some(episode) {
                self.episode = Some(episode);
            }
        }

        for (ns, val) in &remote.parent {
            self.parent.insert(*ns, val.clone());
        }
        for (ns, val) in &remote.guids {
            self.guids.insert(*ns, val.clone());
        }
        merge_json_map(&mut self.metadata, &remote.metadata);
        merge_json_map(&mut self.extra, &remote.extra);
    }

    /// Snapshot the current field values as the diff baseline. Called by
    /// storage after load and after every successful write.
    pub fn mark_saved(&mut self) {
        let mut snapshot = self.clone();
        snapshot.baseline = None;
        snapshot.tainted = false;
        self.baseline = Some(Box::new(snapshot));
    }

    /// Change map against the baseline: `{field: {old, new}}` for scalars,
    /// nested change maps for the map fields. Observability only; merge
    /// decisions never consult it.
    pub fn diff(&self) -> Map<String, Value> {
        let empty = StateEntity::new(self.kind);
        let base = self.baseline.as_deref().unwrap_or(&empty);
        let mut changed = Map::new();

        scalar_diff(&mut changed, "id", &base.id, &self.id);
        scalar_diff(
            &mut changed,
            "type",
            &base.kind.as_str(),
            &self.kind.as_str(),
        );
        scalar_diff(&mut changed, "updated", &base.updated, &self.updated);
        scalar_diff(&mut changed, "watched", &base.watched, &self.watched);
        scalar_diff(&mut changed, "via", &base.via, &self.via);
        scalar_diff(&mut changed, "title", &base.title, &self.title);
        scalar_diff(&mut changed, "year", &base.year, &self.year);
        scalar_diff(&mut changed, "season", &base.season, &self.season);
        scalar_diff(&mut changed, "episode", &base.episode, &self.episode);

        map_diff(&mut changed, "parent", &to_json(&base.parent), &to_json(&self.parent));
        map_diff(&mut changed, "guids", &to_json(&base.guids), &to_json(&self.guids));
        map_diff(
            &mut changed,
            "metadata",
            &Value::Object(base.metadata.clone()),
            &Value::Object(self.metadata.clone()),
        );
        map_diff(
            &mut changed,
            "extra",
            &Value::Object(base.extra.clone()),
            &Value::Object(self.extra.clone()),
        );

        changed
    }

    pub fn is_changed(&self) -> bool {
        !self.diff().is_empty()
    }

    /// A backend reporting this item unwatched may only flip it when its
    /// recorded `added_at` matches the remote `updated`, i.e. the backend
    /// database actually tracks play dates for the item.
    pub fn should_mark_unplayed(&self, remote: &StateEntity) -> bool {
        if remote.watched || !self.watched {
            return false;
        }
        let Some(meta) = self.backend_metadata(&remote.via) else {
            return false;
        };
        let added = meta.get(META_ADDED_AT).and_then(value_as_i64);
        let played = meta.get(META_PLAYED_AT).and_then(value_as_i64);
        played.is_some() && added == Some(remote.updated)
    }

    pub fn mark_unplayed(&mut self, remote: &StateEntity) {
        self.watched = false;
        self.via = remote.via.clone();
        self.updated = chrono::Utc::now().timestamp();
    }
}

/// Read an i64 out of a json value that may be a number or numeric string.
pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Recursive deep merge: branches union, leaves replace, existing keys the
/// remote does not mention survive.
pub fn merge_json_map(local: &mut Map<String, Value>, remote: &Map<String, Value>) {
    for (key, value) in remote {
        match (local.get_mut(key), value) {
            (Some(Value::Object(l)), Value::Object(r)) => merge_json_map(l, r),
            _ => {
                local.insert(key.clone(), value.clone());
            }
        }
    }
}

fn to_json(map: &GuidMap) -> Value {
    serde_json::to_value(map).unwrap_or_else(|_| Value::Object(Map::new()))
}

fn scalar_diff<T: Serialize + PartialEq>(
    changed: &mut Map<String, Value>,
    field: &str,
    old: &T,
    new: &T,
) {
    if old != new {
        changed.insert(
            field.to_string(),
            json!({
                "old": serde_json::to_value(old).unwrap_or(Value::Null),
                "new": serde_json::to_value(new).unwrap_or(Value::Null),
            }),
        );
    }
}

fn map_diff(changed: &mut Map<String, Value>, field: &str, old: &Value, new: &Value) {
    if let (Value::Object(old), Value::Object(new)) = (old, new) {
        let nested = object_diff(old, new);
        if !nested.is_empty() {
            changed.insert(field.to_string(), Value::Object(nested));
        }
    }
}

fn object_diff(old: &Map<String, Value>, new: &Map<String, Value>) -> Map<String, Value> {
    let mut difference = Map::new();
    for (key, value) in new {
        match (old.get(key), value) {
            (Some(Value::Object(o)), Value::Object(n)) => {
                let nested = object_diff(o, n);
                if !nested.is_empty() {
                    difference.insert(key.clone(), Value::Object(nested));
                }
            }
            (Some(o), n) if o == n => {}
            (o, n) => {
                difference.insert(
                    key.clone(),
                    json!({
                        "old": o.cloned().unwrap_or(Value::Null),
                        "new": n.clone(),
                    }),
                );
            }
        }
    }
    difference
}
