use std::collections::HashMap;
use std::sync::Arc;

use axum_test::TestServer;
use crosswatch_backends::{AdapterOptions, BackendAdapter, PlexAdapter};
use crosswatch_db::StateStore;
use crosswatch_server::routes::build_router;
use crosswatch_server::state::AppState;
use crosswatch_sync::{IgnoreList, Mapper};
use serde_json::{json, Value};
use sqlx::SqlitePool;

/// Test server over an in-memory database with one Plex backend. The
/// adapter never talks to its url during webhook handling.
async fn test_app() -> (TestServer, SqlitePool) {
    let pool = crosswatch_db::connect(":memory:").await.unwrap();
    crosswatch_db::migrate::run(&pool).await.unwrap();

    let plex: Arc<dyn BackendAdapter> = Arc::new(PlexAdapter::new(
        "plex_home".into(),
        "http://plex:32400".into(),
        "test-token".into(),
        None,
        AdapterOptions::default(),
    ));
    let mut adapters: HashMap<String, Arc<dyn BackendAdapter>> = HashMap::new();
    adapters.insert("plex_home".into(), plex);

    let mapper = Mapper::new(StateStore::new(pool.clone()), IgnoreList::empty());
    let state = AppState {
        adapters: Arc::new(adapters),
        mapper: Arc::new(tokio::sync::Mutex::new(mapper)),
    };

    (TestServer::new(build_router(state)).unwrap(), pool)
}

fn scrobble_payload() -> Value {
    json!({
        "event": "media.scrobble",
        "Metadata": {
            "ratingKey": "101",
            "title": "Fight Club",
            "type": "movie",
            "year": 1999,
            "guid": "plex://movie/5d7768258718ba001e312c87",
            "Guid": [
                {"id": "imdb://tt0137523"},
                {"id": "tmdb://550"}
            ],
            "viewCount": 1
        }
    })
}

#[tokio::test]
async fn health_endpoint_returns_ok() {
    let (server, _pool) = test_app().await;
    let resp = server.get("/health").await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn unknown_backend_is_404() {
    let (server, _pool) = test_app().await;
    let resp = server
        .post("/webhook/nonexistent")
        .json(&scrobble_payload())
        .await;
    resp.assert_status(axum::http::StatusCode::NOT_FOUND);
    let body: Value = resp.json();
    assert_eq!(body["error"]["code"], "unknown_backend");
}

#[tokio::test]
async fn scrobble_event_is_persisted() {
    let (server, pool) = test_app().await;
    let resp = server
        .post("/webhook/plex_home")
        .json(&scrobble_payload())
        .await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["added"], 1);

    let mut store = StateStore::new(pool);
    let all = store.get_all(None).await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].watched);
    assert_eq!(all[0].title, "Fight Club");
    assert_eq!(all[0].via, "plex_home");
}

#[tokio::test]
async fn repeated_scrobble_is_a_single_row() {
    let (server, pool) = test_app().await;
    for _ in 0..2 {
        let resp = server
            .post("/webhook/plex_home")
            .json(&scrobble_payload())
            .await;
        resp.assert_status_ok();
    }

    let mut store = StateStore::new(pool);
    let all = store.get_all(None).await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn disallowed_event_is_skipped_with_200() {
    let (server, pool) = test_app().await;
    let mut payload = scrobble_payload();
    payload["event"] = json!("media.rate");

    let resp = server.post("/webhook/plex_home").json(&payload).await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    assert_eq!(body["status"], "skipped");
    assert!(body["reason"].as_str().unwrap().contains("media.rate"));

    let mut store = StateStore::new(pool);
    assert!(store.get_all(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn payload_without_event_is_400() {
    let (server, _pool) = test_app().await;
    let resp = server
        .post("/webhook/plex_home")
        .json(&json!({ "Metadata": {} }))
        .await;
    resp.assert_status(axum::http::StatusCode::BAD_REQUEST);
    let body: Value = resp.json();
    assert_eq!(body["error"]["code"], "bad_payload");
}
