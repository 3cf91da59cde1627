//! Export queue: finds stored state the backends do not reflect yet.

use std::sync::Arc;

use crosswatch_backends::{BackendAdapter, ExportAction, PushRequest};
use crosswatch_db::{StateStore, StorageError};
use tracing::{debug, info, warn};

pub struct Exporter;

impl Exporter {
    /// Compare every entity changed after `since` against every backend
    /// except the one that produced the change, and collect the push
    /// requests that would close the gaps. Nothing is dispatched here;
    /// each request names the backend it belongs to.
    pub async fn queue_changes(
        store: &mut StateStore,
        adapters: &[Arc<dyn BackendAdapter>],
        since: Option<i64>,
    ) -> Result<Vec<(String, PushRequest)>, StorageError> {
        let entities = store.get_all(since).await?;
        info!(items = entities.len(), "comparing changed state against backends");

        let mut queue = Vec::new();
        for entity in &entities {
            for adapter in adapters {
                if adapter.name() == entity.via {
                    continue;
                }
                match adapter.compare(entity, since).await {
                    Ok(ExportAction::Request(request)) => {
                        debug!(
                            backend = adapter.name(),
                            item = %entity.name(),
                            action = %request.description,
                            "queueing push"
                        );
                        queue.push((adapter.name().to_string(), request));
                    }
                    Ok(ExportAction::Consistent) => {}
                    Ok(ExportAction::NoRemoteMatch) => {
                        debug!(backend = adapter.name(), item = %entity.name(), "no remote match");
                    }
                    Err(e) => {
                        warn!(
                            backend = adapter.name(),
                            item = %entity.name(),
                            error = %e,
                            "compare failed"
                        );
                    }
                }
            }
        }
        info!(requests = queue.len(), "export queue built");
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crosswatch_backends::{
        BackendError, BackendKind, ImportSink, Parsed, PullSummary,
    };
    use crosswatch_core::{GuidNamespace, GuidValue, MediaKind, StateEntity};
    use crosswatch_db::StateStore;

    /// Claims every watched entity is unwatched remotely.
    struct DisagreeingBackend {
        name: String,
    }

    #[async_trait]
    impl BackendAdapter for DisagreeingBackend {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Jellyfin
        }

        fn produce(&self, _payload: &serde_json::Value) -> Result<Parsed, BackendError> {
            unimplemented!("not used by the exporter")
        }

        async fn pull(
            &self,
            _sink: &mut dyn ImportSink,
            _after: Option<i64>,
        ) -> Result<PullSummary, BackendError> {
            unimplemented!("not used by the exporter")
        }

        async fn compare(
            &self,
            entity: &StateEntity,
            _after: Option<i64>,
        ) -> Result<ExportAction, BackendError> {
            if !entity.watched {
                return Ok(ExportAction::Consistent);
            }
            Ok(ExportAction::Request(PushRequest {
                method: reqwest::Method::POST,
                url: format!("http://media/PlayedItems/{}", entity.title),
                headers: Vec::new(),
                description: format!("mark watched '{}'", entity.name()),
            }))
        }

        fn persist(&self) {}
    }

    async fn seeded_store() -> StateStore {
        let pool = crosswatch_db::connect(":memory:").await.unwrap();
        crosswatch_db::migrate::run(&pool).await.unwrap();
        let mut store = StateStore::new(pool);

        let mut watched = StateEntity::new(MediaKind::Movie);
        watched.via = "backend_a".into();
        watched.title = "Seen".into();
        watched.watched = true;
        watched.updated = 2_000;
        watched.guids.insert(GuidNamespace::Tmdb, GuidValue::Int(1));
        store.insert(&mut watched).await.unwrap();

        let mut unwatched = StateEntity::new(MediaKind::Movie);
        unwatched.via = "backend_a".into();
        unwatched.title = "Unseen".into();
        unwatched.updated = 500;
        unwatched.guids.insert(GuidNamespace::Tmdb, GuidValue::Int(2));
        store.insert(&mut unwatched).await.unwrap();

        store
    }

    #[tokio::test]
    async fn only_disagreements_are_queued() {
        let mut store = seeded_store().await;
        let adapters: Vec<Arc<dyn BackendAdapter>> = vec![Arc::new(DisagreeingBackend {
            name: "backend_b".into(),
        })];

        let queue = Exporter::queue_changes(&mut store, &adapters, None).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].0, "backend_b");
        assert!(queue[0].1.description.contains("Seen"));
    }

    #[tokio::test]
    async fn originating_backend_is_not_compared() {
        let mut store = seeded_store().await;
        let adapters: Vec<Arc<dyn BackendAdapter>> = vec![Arc::new(DisagreeingBackend {
            name: "backend_a".into(),
        })];

        let queue = Exporter::queue_changes(&mut store, &adapters, None).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn since_checkpoint_limits_the_scan() {
        let mut store = seeded_store().await;
        let adapters: Vec<Arc<dyn BackendAdapter>> = vec![Arc::new(DisagreeingBackend {
            name: "backend_b".into(),
        })];

        let queue = Exporter::queue_changes(&mut store, &adapters, Some(5_000))
            .await
            .unwrap();
        assert!(queue.is_empty());
    }
}
