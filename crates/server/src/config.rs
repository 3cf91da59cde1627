//! Backends configuration file.
//!
//! JSON array of backend definitions:
//!
//! ```json
//! [
//!   {"name": "plex_home", "kind": "plex", "url": "http://plex:32400",
//!    "token": "...", "options": {"import_unwatched": true}},
//!   {"name": "jf_den", "kind": "jellyfin", "url": "http://jf:8096",
//!    "token": "...", "user_id": "..."}
//! ]
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use crosswatch_backends::{
    AdapterOptions, BackendAdapter, BackendKind, EmbyAdapter, JellyfinAdapter, PlexAdapter,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub kind: String,
    pub url: String,
    pub token: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub options: BackendOptions,
}

#[derive(Debug, Default, Deserialize)]
pub struct BackendOptions {
    #[serde(default)]
    pub import_unwatched: bool,
    #[serde(default)]
    pub export_ignore_date: bool,
    #[serde(default)]
    pub ignore_sections: Vec<String>,
}

impl From<&BackendOptions> for AdapterOptions {
    fn from(o: &BackendOptions) -> Self {
        AdapterOptions {
            import_unwatched: o.import_unwatched,
            export_ignore_date: o.export_ignore_date,
            ignore_sections: o.ignore_sections.clone(),
        }
    }
}

pub fn load(path: &Path) -> anyhow::Result<Vec<BackendConfig>> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read backends config {}", path.display()))?;
    let backends: Vec<BackendConfig> = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse backends config {}", path.display()))?;
    if backends.is_empty() {
        bail!("backends config {} lists no backends", path.display());
    }
    Ok(backends)
}

pub fn build_adapters(
    backends: &[BackendConfig],
    cache_dir: Option<&Path>,
) -> anyhow::Result<HashMap<String, Arc<dyn BackendAdapter>>> {
    let mut adapters: HashMap<String, Arc<dyn BackendAdapter>> = HashMap::new();

    for backend in backends {
        let Some(kind) = BackendKind::parse(&backend.kind) else {
            bail!("backend '{}' has unknown kind '{}'", backend.name, backend.kind);
        };
        let options = AdapterOptions::from(&backend.options);

        let adapter: Arc<dyn BackendAdapter> = match kind {
            BackendKind::Plex => Arc::new(PlexAdapter::new(
                backend.name.clone(),
                backend.url.clone(),
                backend.token.clone(),
                cache_dir,
                options,
            )),
            BackendKind::Jellyfin | BackendKind::Emby => {
                let Some(user_id) = backend.user_id.clone() else {
                    bail!("backend '{}' requires a user_id", backend.name);
                };
                match kind {
                    BackendKind::Jellyfin => Arc::new(JellyfinAdapter::new(
                        backend.name.clone(),
                        backend.url.clone(),
                        backend.token.clone(),
                        user_id,
                        cache_dir,
                        options,
                    )),
                    _ => Arc::new(EmbyAdapter::new(
                        backend.name.clone(),
                        backend.url.clone(),
                        backend.token.clone(),
                        user_id,
                        cache_dir,
                        options,
                    )),
                }
            }
        };

        if adapters.insert(backend.name.clone(), adapter).is_some() {
            bail!("duplicate backend name '{}'", backend.name);
        }
    }

    Ok(adapters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapters_are_built_per_kind() {
        let backends = vec![
            BackendConfig {
                name: "plex_home".into(),
                kind: "plex".into(),
                url: "http://plex:32400".into(),
                token: "t".into(),
                user_id: None,
                options: BackendOptions::default(),
            },
            BackendConfig {
                name: "jf_den".into(),
                kind: "jellyfin".into(),
                url: "http://jf:8096".into(),
                token: "t".into(),
                user_id: Some("u1".into()),
                options: BackendOptions::default(),
            },
        ];
        let adapters = build_adapters(&backends, None).unwrap();
        assert_eq!(adapters.len(), 2);
        assert_eq!(adapters["plex_home"].kind(), BackendKind::Plex);
    }

    #[test]
    fn jellyfin_without_user_id_is_rejected() {
        let backends = vec![BackendConfig {
            name: "jf_den".into(),
            kind: "jellyfin".into(),
            url: "http://jf:8096".into(),
            token: "t".into(),
            user_id: None,
            options: BackendOptions::default(),
        }];
        assert!(build_adapters(&backends, None).is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let one = || BackendConfig {
            name: "plex_home".into(),
            kind: "plex".into(),
            url: "http://plex:32400".into(),
            token: "t".into(),
            user_id: None,
            options: BackendOptions::default(),
        };
        assert!(build_adapters(&[one(), one()], None).is_err());
    }
}
