//! Payload helpers shared by the three adapters.

use chrono::DateTime;
use crosswatch_core::{guid, GuidMap, GuidNamespace, MediaKind};
use serde_json::Value;

/// First present string among several alternative field names.
pub fn json_str<'a>(item: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| item.get(*k).and_then(Value::as_str))
}

/// First present integer among several alternative field names. Accepts
/// numeric strings since some payloads quote their numbers.
pub fn json_i64(item: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| match item.get(*k) {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Parse an ISO-8601 timestamp into a unix epoch. Jellyfin and Emby report
/// dates in this shape, sometimes with sub-second precision.
pub fn iso_epoch(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp())
}

/// Map a `ProviderIds` style object into guids, lowercasing the keys.
/// Only the listed namespaces are considered.
pub fn provider_guids(ids: &serde_json::Map<String, Value>, allowed: &[GuidNamespace]) -> GuidMap {
    guid::from_raw(
        ids.iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone()))
            .filter(|(k, _)| {
                GuidNamespace::parse(k).is_some_and(|ns| allowed.contains(&ns))
            }),
    )
}

/// Map Plex style `scheme://value` guid strings into guids. The `plex://`
/// scheme carries a `kind/hash` payload; only the hash is kept.
pub fn plex_guids(raw: &[String], allowed: &[GuidNamespace]) -> GuidMap {
    guid::from_raw(raw.iter().filter_map(|s| {
        let (scheme, rest) = s.split_once("://")?;
        let ns = GuidNamespace::parse(scheme)?;
        if !allowed.contains(&ns) {
            return None;
        }
        let value = if ns == GuidNamespace::Plex {
            rest.split_once('/').map(|(_, hash)| hash).unwrap_or(rest)
        } else {
            rest
        };
        Some((scheme.to_string(), Value::String(value.to_string())))
    }))
}

/// Collect guid strings from a Plex item: the `Guid` array of `{id}` objects
/// plus the legacy top level `guid` field.
pub fn plex_guid_strings(item: &Value) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(list) = item.get("Guid").and_then(Value::as_array) {
        for entry in list {
            if let Some(id) = entry.get("id").and_then(Value::as_str) {
                out.push(id.to_string());
            }
        }
    }
    if let Some(g) = item.get("guid").and_then(Value::as_str) {
        out.push(g.to_string());
    }
    out
}

/// Display name for items that never became an entity, built from raw
/// payload fields.
pub fn raw_name(
    kind: MediaKind,
    title: Option<&str>,
    year: Option<i64>,
    series: Option<&str>,
    season: Option<i64>,
    episode: Option<i64>,
) -> String {
    match kind {
        MediaKind::Movie => match year {
            Some(y) => format!("{} ({y})", title.unwrap_or("??")),
            None => title.unwrap_or("??").to_string(),
        },
        MediaKind::Episode => format!(
            "{} - {:02}x{:03}",
            series.or(title).unwrap_or("??"),
            season.unwrap_or(0),
            episode.unwrap_or(0)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crosswatch_core::GuidValue;
    use serde_json::json;

    #[test]
    fn provider_ids_are_case_insensitive() {
        let ids = json!({"Imdb": "tt0137523", "Tmdb": "550", "CollectionFolder": "x"});
        let map = provider_guids(
            ids.as_object().unwrap(),
            &[GuidNamespace::Imdb, GuidNamespace::Tmdb],
        );
        assert_eq!(
            map.get(&GuidNamespace::Imdb),
            Some(&GuidValue::Text("tt0137523".into()))
        );
        assert_eq!(map.get(&GuidNamespace::Tmdb), Some(&GuidValue::Int(550)));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn plex_scheme_strings_are_mapped() {
        let raw = vec![
            "imdb://tt0137523".to_string(),
            "tmdb://550".to_string(),
            "plex://movie/5d7768258718ba001e312c87".to_string(),
            "youtube://nope".to_string(),
        ];
        let map = plex_guids(
            &raw,
            &[GuidNamespace::Imdb, GuidNamespace::Tmdb, GuidNamespace::Plex],
        );
        assert_eq!(map.len(), 3);
        assert_eq!(
            map.get(&GuidNamespace::Plex),
            Some(&GuidValue::Text("5d7768258718ba001e312c87".into()))
        );
    }

    #[test]
    fn iso_dates_become_epochs() {
        assert_eq!(iso_epoch("1970-01-01T00:00:10Z"), Some(10));
        assert_eq!(iso_epoch("2023-01-01T00:00:00.1234567Z"), Some(1672531200));
        assert_eq!(iso_epoch("garbage"), None);
    }
}
