//! Emby adapter.
//!
//! Emby exposes the same HTTP surface as Jellyfin but names its webhook
//! events differently and authenticates with `X-Emby-Token`. The adapter
//! is the Jellyfin one with its kind switched.

use std::path::Path;

use async_trait::async_trait;
use crosswatch_core::StateEntity;
use serde_json::Value;

use crate::{
    jellyfin::JellyfinAdapter, AdapterOptions, BackendAdapter, BackendError, BackendKind,
    ExportAction, ImportSink, Parsed, PullSummary,
};

pub struct EmbyAdapter(JellyfinAdapter);

impl EmbyAdapter {
    pub fn new(
        name: String,
        base_url: String,
        token: String,
        user_id: String,
        cache_dir: Option<&Path>,
        options: AdapterOptions,
    ) -> Self {
        Self(JellyfinAdapter::with_kind(
            BackendKind::Emby,
            name,
            base_url,
            token,
            user_id,
            cache_dir,
            options,
        ))
    }
}

#[async_trait]
impl BackendAdapter for EmbyAdapter {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Emby
    }

    fn produce(&self, payload: &Value) -> Result<Parsed, BackendError> {
        self.0.produce(payload)
    }

    async fn pull(
        &self,
        sink: &mut dyn ImportSink,
        after: Option<i64>,
    ) -> Result<PullSummary, BackendError> {
        self.0.pull(sink, after).await
    }

    async fn compare(
        &self,
        entity: &StateEntity,
        after: Option<i64>,
    ) -> Result<ExportAction, BackendError> {
        self.0.compare(entity, after).await
    }

    fn persist(&self) {
        self.0.persist()
    }
}
