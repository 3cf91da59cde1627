//! External identifier (GUID) namespaces and value coercion.
//!
//! Every backend reports third-party ids under its own field names; this
//! module maps them into the fixed namespace set and coerces each value to
//! the namespace's declared kind. Unknown namespaces are dropped, never
//! errors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Fixed set of supported guid namespaces. One storage column exists per
/// member; the resolver rejects anything else before it reaches storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuidNamespace {
    Imdb,
    Tmdb,
    Tvdb,
    Tvmaze,
    Tvrage,
    Anidb,
    Plex,
    Jellyfin,
    Emby,
}

impl GuidNamespace {
    pub const ALL: [GuidNamespace; 9] = [
        Self::Imdb,
        Self::Tmdb,
        Self::Tvdb,
        Self::Tvmaze,
        Self::Tvrage,
        Self::Anidb,
        Self::Plex,
        Self::Jellyfin,
        Self::Emby,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Imdb => "imdb",
            Self::Tmdb => "tmdb",
            Self::Tvdb => "tvdb",
            Self::Tvmaze => "tvmaze",
            Self::Tvrage => "tvrage",
            Self::Anidb => "anidb",
            Self::Plex => "plex",
            Self::Jellyfin => "jellyfin",
            Self::Emby => "emby",
        }
    }

    /// Accepts both the bare name (`imdb`) and the column form (`guid_imdb`).
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.strip_prefix("guid_").unwrap_or(s);
        match s {
            "imdb" => Some(Self::Imdb),
            "tmdb" => Some(Self::Tmdb),
            "tvdb" => Some(Self::Tvdb),
            "tvmaze" => Some(Self::Tvmaze),
            "tvrage" => Some(Self::Tvrage),
            "anidb" => Some(Self::Anidb),
            "plex" => Some(Self::Plex),
            "jellyfin" => Some(Self::Jellyfin),
            "emby" => Some(Self::Emby),
            _ => None,
        }
    }

    /// Numeric namespaces carry integer values; the rest stay text.
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::Tmdb | Self::Tvdb | Self::Tvmaze | Self::Tvrage | Self::Anidb
        )
    }

    /// Storage column name for this namespace.
    pub fn column(self) -> &'static str {
        match self {
            Self::Imdb => "guid_imdb",
            Self::Tmdb => "guid_tmdb",
            Self::Tvdb => "guid_tvdb",
            Self::Tvmaze => "guid_tvmaze",
            Self::Tvrage => "guid_tvrage",
            Self::Anidb => "guid_anidb",
            Self::Plex => "guid_plex",
            Self::Jellyfin => "guid_jellyfin",
            Self::Emby => "guid_emby",
        }
    }
}

impl std::fmt::Display for GuidNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A guid value, typed per namespace declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GuidValue {
    Int(i64),
    Text(String),
}

impl std::fmt::Display for GuidValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

pub type GuidMap = BTreeMap<GuidNamespace, GuidValue>;

/// Coerce a raw value to the namespace's declared kind. Returns `None`
/// when the value cannot be represented (dropped by the caller).
pub fn coerce(ns: GuidNamespace, value: &serde_json::Value) -> Option<GuidValue> {
    if ns.is_numeric() {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(GuidValue::Int),
            serde_json::Value::String(s) => s.trim().parse::<i64>().ok().map(GuidValue::Int),
            _ => None,
        }
    } else {
        match value {
            serde_json::Value::String(s) if !s.is_empty() => Some(GuidValue::Text(s.clone())),
            serde_json::Value::Number(n) => Some(GuidValue::Text(n.to_string())),
            _ => None,
        }
    }
}

/// Build a guid map from raw `(namespace, value)` pairs. Unknown namespaces
/// and uncoercible values are dropped with a debug log.
pub fn from_raw<I>(raw: I) -> GuidMap
where
    I: IntoIterator<Item = (String, serde_json::Value)>,
{
    let mut map = GuidMap::new();
    for (key, value) in raw {
        let Some(ns) = GuidNamespace::parse(&key) else {
            debug!(namespace = %key, "dropping unknown guid namespace");
            continue;
        };
        match coerce(ns, &value) {
            Some(v) => {
                map.insert(ns, v);
            }
            None => debug!(namespace = %key, ?value, "dropping uncoercible guid value"),
        }
    }
    map
}

/// Synthesize an identity from a backend's native item id for items that
/// carry no third-party guid. Same `(backend, id)` always yields the same
/// value.
pub fn make_virtual(backend: GuidNamespace, native_id: &str) -> (GuidNamespace, GuidValue) {
    (backend, GuidValue::Text(native_id.to_string()))
}

/// Lookup pointer for a guid pair, e.g. `guid_imdb://tt0111161`.
pub fn pointer(ns: GuidNamespace, value: &GuidValue) -> String {
    format!("{}://{}", ns.column(), value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_namespaces_coerce_strings() {
        assert_eq!(
            coerce(GuidNamespace::Tvdb, &json!("100")),
            Some(GuidValue::Int(100))
        );
        assert_eq!(
            coerce(GuidNamespace::Tmdb, &json!(550)),
            Some(GuidValue::Int(550))
        );
        assert_eq!(coerce(GuidNamespace::Tvdb, &json!("not-a-number")), None);
    }

    #[test]
    fn text_namespaces_keep_strings() {
        assert_eq!(
            coerce(GuidNamespace::Imdb, &json!("tt0111161")),
            Some(GuidValue::Text("tt0111161".into()))
        );
        assert_eq!(coerce(GuidNamespace::Imdb, &json!("")), None);
    }

    #[test]
    fn unknown_namespaces_are_dropped() {
        let map = from_raw([
            ("imdb".to_string(), json!("tt0111161")),
            ("youtube".to_string(), json!("abc")),
            ("guid_tvdb".to_string(), json!("100")),
        ]);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&GuidNamespace::Tvdb), Some(&GuidValue::Int(100)));
    }

    #[test]
    fn virtual_guid_is_stable() {
        let a = make_virtual(GuidNamespace::Jellyfin, "4c0f");
        let b = make_virtual(GuidNamespace::Jellyfin, "4c0f");
        assert_eq!(a, b);
        assert_eq!(pointer(a.0, &a.1), "guid_jellyfin://4c0f");
    }
}
