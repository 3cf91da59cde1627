use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use crosswatch_backends::{BackendError, ImportOpts, ImportSink, Parsed};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/{backend}", post(webhook))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Receive one backend event, merge it and commit immediately. A payload
/// the adapter understands but will not act on is still a 200, so backends
/// do not retry or disable the hook.
async fn webhook(
    State(state): State<AppState>,
    Path(backend): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let Some(adapter) = state.adapters.get(&backend) else {
        return Err(ApiError::UnknownBackend(backend));
    };

    let candidate = match adapter.produce(&payload) {
        Ok(Parsed::Candidate(candidate)) => candidate,
        Ok(Parsed::Skipped { reason }) => {
            info!(backend = %backend, reason = %reason, "webhook skipped");
            return Ok(Json(json!({ "status": "skipped", "reason": reason })));
        }
        Err(BackendError::MalformedPayload(why)) => {
            warn!(backend = %backend, error = %why, "malformed webhook payload");
            return Err(ApiError::BadPayload(why));
        }
        Err(e) => return Err(ApiError::Internal(e.to_string())),
    };

    let item_name = candidate.name();
    let opts = ImportOpts {
        after: None,
        import_unwatched: true,
        force: false,
    };

    let mut mapper = state.mapper.lock().await;
    mapper
        .add(&backend, &item_name, *candidate, &opts)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let summary = mapper
        .commit()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    info!(backend = %backend, item = %item_name, "webhook accepted");
    Ok(Json(json!({
        "status": "accepted",
        "item": item_name,
        "added": summary.movie.added + summary.episode.added,
        "updated": summary.movie.updated + summary.episode.updated,
    })))
}
