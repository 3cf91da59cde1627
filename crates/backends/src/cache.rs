//! Pointer to native-id cache.
//!
//! Pulls record which backend item produced each guid pointer so that a
//! later export can address the item by its native id without re-walking
//! the library. The cache is a plain JSON file per backend, keyed by a
//! digest of the backend's identity so renaming the server url starts a
//! fresh cache.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct GuidCache {
    path: Option<PathBuf>,
    map: HashMap<String, String>,
    dirty: bool,
}

impl GuidCache {
    /// Stable file key for a backend identity.
    pub fn file_key(kind: &str, name: &str, url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        hasher.update(b"|");
        hasher.update(name.as_bytes());
        hasher.update(b"|");
        hasher.update(url.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Load the cache for a backend. A missing or unreadable file yields an
    /// empty cache; `dir == None` keeps the cache memory only.
    pub fn load(dir: Option<&Path>, kind: &str, name: &str, url: &str) -> Self {
        let Some(dir) = dir else {
            return Self::default();
        };
        let path = dir.join(format!("{}.json", Self::file_key(kind, name, url)));
        let map = match std::fs::read_to_string(&path) {
            Ok(body) => match serde_json::from_str(&body) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "discarding unreadable guid cache");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        debug!(backend = name, entries = map.len(), "loaded guid cache");
        Self {
            path: Some(path),
            map,
            dirty: false,
        }
    }

    pub fn get(&self, pointer: &str) -> Option<&str> {
        self.map.get(pointer).map(String::as_str)
    }

    pub fn set(&mut self, pointer: String, native_id: String) {
        if self.map.get(&pointer).map(String::as_str) != Some(native_id.as_str()) {
            self.map.insert(pointer, native_id);
            self.dirty = true;
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Write the cache back to disk if anything changed. Never called
    /// implicitly; a crashed pull simply loses its additions.
    pub fn persist(&mut self) {
        let Some(path) = &self.path else { return };
        if !self.dirty {
            return;
        }
        let body = match serde_json::to_string(&self.map) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to serialize guid cache");
                return;
            }
        };
        match std::fs::write(path, body) {
            Ok(()) => {
                self.dirty = false;
                debug!(path = %path.display(), entries = self.map.len(), "persisted guid cache");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to write guid cache"),
        }
    }
}
