//! Media server adapters.
//!
//! Each backend (Plex, Jellyfin, Emby) implements [`BackendAdapter`]: it can
//! pull a full library snapshot, turn a webhook payload into a state
//! candidate, and compare a stored entity against the remote play state to
//! produce a push request when the two disagree.

use async_trait::async_trait;
use crosswatch_core::{GuidNamespace, StateEntity};

pub mod cache;
pub mod common;
pub mod emby;
pub mod jellyfin;
pub mod plex;

pub use cache::GuidCache;
pub use emby::EmbyAdapter;
pub use jellyfin::JellyfinAdapter;
pub use plex::PlexAdapter;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response body: {0}")]
    Decode(String),
}

/// Which backend family an adapter speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Plex,
    Jellyfin,
    Emby,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Plex => "plex",
            BackendKind::Jellyfin => "jellyfin",
            BackendKind::Emby => "emby",
        }
    }

    /// The guid namespace used for this backend's virtual identities.
    pub fn namespace(&self) -> GuidNamespace {
        match self {
            BackendKind::Plex => GuidNamespace::Plex,
            BackendKind::Jellyfin => GuidNamespace::Jellyfin,
            BackendKind::Emby => GuidNamespace::Emby,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "plex" => Some(BackendKind::Plex),
            "jellyfin" => Some(BackendKind::Jellyfin),
            "emby" => Some(BackendKind::Emby),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-backend behaviour toggles, sourced from configuration.
#[derive(Debug, Clone, Default)]
pub struct AdapterOptions {
    /// Import items that have never been played.
    pub import_unwatched: bool,
    /// Push state even when the remote change date is newer than ours.
    pub export_ignore_date: bool,
    /// Library sections to skip during pulls, by name.
    pub ignore_sections: Vec<String>,
}

/// Outcome of parsing one webhook payload.
#[derive(Debug)]
pub enum Parsed {
    /// A state candidate worth reconciling.
    Candidate(Box<StateEntity>),
    /// Payload was understood but carries nothing to reconcile.
    Skipped { reason: String },
}

/// A fully described HTTP call that would align remote play state with ours.
///
/// Compare never mutates the remote server. The caller decides when to
/// actually dispatch the request.
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Human readable description for logs, e.g. "mark watched".
    pub description: String,
}

/// Result of comparing one stored entity against a backend.
#[derive(Debug)]
pub enum ExportAction {
    /// The backend does not know this item.
    NoRemoteMatch,
    /// Remote and local play state already agree, or remote is newer.
    Consistent,
    /// Remote disagrees and should be updated.
    Request(PushRequest),
}

/// Knobs passed alongside each pulled candidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOpts {
    /// Only consider items whose change date is at or after this epoch.
    pub after: Option<i64>,
    pub import_unwatched: bool,
    /// Accept the candidate even when the merge rules would reject it.
    pub force: bool,
}

/// Totals reported by a completed pull.
#[derive(Debug, Default, Clone, Copy)]
pub struct PullSummary {
    pub items: u64,
    pub skipped: u64,
}

/// Receives candidates produced by a pull, one at a time.
#[async_trait]
pub trait ImportSink: Send {
    async fn add(
        &mut self,
        backend: &str,
        item_name: &str,
        candidate: StateEntity,
        opts: &ImportOpts,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// User assigned backend name, unique across the configuration.
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// Parse a webhook payload into a state candidate.
    fn produce(&self, payload: &serde_json::Value) -> Result<Parsed, BackendError>;

    /// Walk the backend's libraries and feed every playable item to `sink`.
    async fn pull(
        &self,
        sink: &mut dyn ImportSink,
        after: Option<i64>,
    ) -> Result<PullSummary, BackendError>;

    /// Compare a stored entity against the backend's current play state.
    async fn compare(
        &self,
        entity: &StateEntity,
        after: Option<i64>,
    ) -> Result<ExportAction, BackendError>;

    /// Flush any adapter-local caches to disk.
    fn persist(&self);
}

/// Dispatch a previously built push request.
pub async fn dispatch(client: &reqwest::Client, req: &PushRequest) -> Result<(), BackendError> {
    let mut builder = client.request(req.method.clone(), &req.url);
    for (k, v) in &req.headers {
        builder = builder.header(k.as_str(), v.as_str());
    }
    let resp = builder.send().await?;
    if !resp.status().is_success() {
        return Err(BackendError::Decode(format!(
            "push '{}' returned {}",
            req.description,
            resp.status()
        )));
    }
    Ok(())
}
