use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use crosswatch_backends::BackendAdapter;
use crosswatch_db::StateStore;
use crosswatch_server::config;
use crosswatch_server::state::AppState;
use crosswatch_sync::{Exporter, IgnoreList, Mapper};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let db_path = std::env::var("CROSSWATCH_DB").unwrap_or_else(|_| "crosswatch.db".to_string());
    info!(db_path = %db_path, "connecting to database");

    let pool = crosswatch_db::connect(&db_path)
        .await
        .context("failed to connect to database")?;
    crosswatch_db::migrate::run(&pool)
        .await
        .context("failed to run migrations")?;
    info!("migrations complete");

    let config_path: PathBuf = std::env::var("CROSSWATCH_CONFIG")
        .unwrap_or_else(|_| "backends.json".to_string())
        .into();
    let backends = config::load(&config_path)?;

    let cache_dir: PathBuf = std::env::var("CROSSWATCH_CACHE_DIR")
        .unwrap_or_else(|_| "/tmp/crosswatch_cache".to_string())
        .into();
    std::fs::create_dir_all(&cache_dir).context("failed to create cache dir")?;

    let adapters = Arc::new(config::build_adapters(&backends, Some(&cache_dir))?);
    info!(backends = adapters.len(), "adapters ready");

    let ignore = match std::env::var("CROSSWATCH_IGNORE") {
        Ok(path) => IgnoreList::load(std::path::Path::new(&path))
            .context("failed to load ignore list")?,
        Err(_) => IgnoreList::empty(),
    };

    let mapper = Arc::new(Mutex::new(Mapper::new(StateStore::new(pool), ignore)));

    let sync_interval: Option<u64> = std::env::var("CROSSWATCH_SYNC_INTERVAL")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|secs| *secs > 0);
    if let Some(secs) = sync_interval {
        tokio::spawn(sync_loop(adapters.clone(), mapper.clone(), secs));
    } else {
        info!("periodic sync disabled, webhooks only");
    }

    let app_state = AppState {
        adapters: adapters.clone(),
        mapper,
    };
    let app = crosswatch_server::routes::build_router(app_state);

    let bind_addr = std::env::var("CROSSWATCH_BIND").unwrap_or_else(|_| "0.0.0.0:8787".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .context("failed to bind")?;
    info!(addr = %bind_addr, "server listening");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Pull every backend, commit the merged state, then push the resulting
/// disagreements back out. Failures are logged and retried next round.
async fn sync_loop(
    adapters: Arc<HashMap<String, Arc<dyn BackendAdapter>>>,
    mapper: Arc<Mutex<Mapper>>,
    interval_secs: u64,
) {
    let adapter_list: Vec<Arc<dyn BackendAdapter>> = adapters.values().cloned().collect();
    let client = reqwest::Client::new();
    let mut checkpoint: Option<i64> = None;

    loop {
        tokio::time::sleep(std::time::Duration::from_secs(interval_secs)).await;
        let started = chrono::Utc::now().timestamp();
        info!("starting sync round");

        for adapter in &adapter_list {
            let mut mapper = mapper.lock().await;
            match adapter.pull(&mut *mapper, checkpoint).await {
                Ok(summary) => {
                    info!(
                        backend = adapter.name(),
                        items = summary.items,
                        skipped = summary.skipped,
                        "pull complete"
                    );
                }
                Err(e) => error!(backend = adapter.name(), error = %e, "pull failed"),
            }
            if let Err(e) = mapper.commit().await {
                error!(backend = adapter.name(), error = %e, "commit failed");
            }
        }

        let queue = {
            let mut mapper = mapper.lock().await;
            match Exporter::queue_changes(mapper.store_mut(), &adapter_list, checkpoint).await {
                Ok(queue) => queue,
                Err(e) => {
                    error!(error = %e, "export scan failed");
                    Vec::new()
                }
            }
        };
        for (backend, request) in &queue {
            if let Err(e) = crosswatch_backends::dispatch(&client, request).await {
                warn!(backend = %backend, action = %request.description, error = %e, "push failed");
            } else {
                info!(backend = %backend, action = %request.description, "pushed");
            }
        }

        for adapter in &adapter_list {
            adapter.persist();
        }

        checkpoint = Some(started);
        info!("sync round finished");
    }
}
