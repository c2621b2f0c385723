//! Catalog HTTP connector tests against a local fake API.

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use purgeman::catalog::{CatalogConnector, CatalogEntry, CatalogSession, HttpCatalogConnector};
use purgeman::config::CatalogConfig;
use purgeman::PurgemanError;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const API_PATH: &str = "/irods-http-api/0.3.0";
const TOKEN: &str = "token-1234";

async fn authenticate(headers: HeaderMap) -> impl IntoResponse {
    // rods:rods
    match headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        Some("Basic cm9kczpyb2Rz") => (StatusCode::OK, TOKEN.to_string()),
        _ => (StatusCode::UNAUTHORIZED, String::new()),
    }
}

async fn query(headers: HeaderMap, Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some(format!("Bearer {}", TOKEN).as_str());
    if !authorized {
        return (StatusCode::UNAUTHORIZED, Json(json!({}))).into_response();
    }

    let query = params.get("query").cloned().unwrap_or_default();
    if params.get("op").map(String::as_str) != Some("execute_genquery")
        || params.get("zone").map(String::as_str) != Some("tempZone")
    {
        return (StatusCode::BAD_REQUEST, Json(json!({}))).into_response();
    }

    let ok = |rows: serde_json::Value| {
        Json(json!({
            "irods_response": {"status_code": 0},
            "rows": rows,
        }))
        .into_response()
    };

    if query.contains("'broken'") {
        return Json(json!({
            "irods_response": {"status_code": -808000, "status_message": "CAT_NO_ROWS_FOUND"}
        }))
        .into_response();
    }

    match (query.contains("DATA_NAME"), query.contains("'u1'"), query.contains("'u2'")) {
        (true, true, _) => ok(json!([["/tempZone/home/alice", "file.txt"]])),
        (false, _, true) => ok(json!([["/tempZone/home/alice/dir"]])),
        _ => ok(json!([])),
    }
}

async fn spawn_catalog_api() -> SocketAddr {
    let app = Router::new()
        .route(&format!("{}/authenticate", API_PATH), post(authenticate))
        .route(&format!("{}/query", API_PATH), get(query));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Fake API whose tokens each allow `queries_per_token` queries.
struct ExpiringTokens {
    issued: AtomicUsize,
    used: AtomicUsize,
    queries_per_token: usize,
}

async fn authenticate_expiring(State(api): State<Arc<ExpiringTokens>>) -> String {
    let n = api.issued.fetch_add(1, Ordering::SeqCst) + 1;
    api.used.store(0, Ordering::SeqCst);
    format!("token-{}", n)
}

async fn query_expiring(State(api): State<Arc<ExpiringTokens>>, headers: HeaderMap) -> impl IntoResponse {
    let current = format!("Bearer token-{}", api.issued.load(Ordering::SeqCst));
    let presented = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    if presented != Some(current.as_str())
        || api.used.fetch_add(1, Ordering::SeqCst) >= api.queries_per_token
    {
        return (StatusCode::UNAUTHORIZED, Json(json!({}))).into_response();
    }

    Json(json!({
        "irods_response": {"status_code": 0},
        "rows": [],
    }))
    .into_response()
}

async fn spawn_expiring_catalog_api(queries_per_token: usize) -> (SocketAddr, Arc<ExpiringTokens>) {
    let api = Arc::new(ExpiringTokens {
        issued: AtomicUsize::new(0),
        used: AtomicUsize::new(0),
        queries_per_token,
    });
    let app = Router::new()
        .route(&format!("{}/authenticate", API_PATH), post(authenticate_expiring))
        .route(&format!("{}/query", API_PATH), get(query_expiring))
        .with_state(Arc::clone(&api));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, api)
}

fn catalog_config(addr: SocketAddr, password: &str) -> CatalogConfig {
    CatalogConfig {
        host: "127.0.0.1".to_string(),
        zone: "tempZone".to_string(),
        username: "rods".to_string(),
        password: password.to_string(),
        api_url: Some(format!("http://{}{}/", addr, API_PATH)),
        ..CatalogConfig::default()
    }
}

fn connector() -> HttpCatalogConnector {
    HttpCatalogConnector::new(Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_search_finds_data_objects_and_collections() {
    let addr = spawn_catalog_api().await;
    let session = connector().connect(&catalog_config(addr, "rods")).await.unwrap();

    let objects = session.search_by_attribute("ipc_UUID", "u1").await.unwrap();
    assert_eq!(objects, vec![CatalogEntry::new("/tempZone/home/alice/file.txt")]);

    let collections = session.search_by_attribute("ipc_UUID", "u2").await.unwrap();
    assert_eq!(collections, vec![CatalogEntry::new("/tempZone/home/alice/dir")]);

    assert!(session
        .search_by_attribute("ipc_UUID", "unknown")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_rejected_credentials() {
    let addr = spawn_catalog_api().await;
    let err = connector()
        .connect(&catalog_config(addr, "wrong"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PurgemanError::Catalog(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_unreachable_catalog() {
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let err = connector()
        .connect(&catalog_config(addr, "rods"))
        .await
        .err()
        .unwrap();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_query_error_status() {
    let addr = spawn_catalog_api().await;
    let session = connector().connect(&catalog_config(addr, "rods")).await.unwrap();

    let err = session
        .search_by_attribute("ipc_UUID", "broken")
        .await
        .unwrap_err();
    assert!(matches!(err, PurgemanError::Catalog(_)));
}

#[tokio::test]
async fn test_released_session_refuses_queries() {
    let addr = spawn_catalog_api().await;
    let session = connector().connect(&catalog_config(addr, "rods")).await.unwrap();

    session.release().await;
    let err = session.search_by_attribute("ipc_UUID", "u1").await.unwrap_err();
    assert!(matches!(err, PurgemanError::NotConnected(_)));
}

#[tokio::test]
async fn test_expired_token_is_renewed() {
    // One search runs two queries, so every token covers exactly one search.
    let (addr, api) = spawn_expiring_catalog_api(2).await;
    let session = connector().connect(&catalog_config(addr, "rods")).await.unwrap();
    assert_eq!(api.issued.load(Ordering::SeqCst), 1);

    for _ in 0..4 {
        assert!(session
            .search_by_attribute("ipc_UUID", "u1")
            .await
            .unwrap()
            .is_empty());
    }
    assert_eq!(api.issued.load(Ordering::SeqCst), 4);

    // A released session stays released.
    session.release().await;
    let err = session.search_by_attribute("ipc_UUID", "u1").await.unwrap_err();
    assert!(matches!(err, PurgemanError::NotConnected(_)));
    assert_eq!(api.issued.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_token_rejected_again_after_renewal() {
    let (addr, api) = spawn_expiring_catalog_api(0).await;
    let session = connector().connect(&catalog_config(addr, "rods")).await.unwrap();

    let err = session.search_by_attribute("ipc_UUID", "u1").await.unwrap_err();
    assert!(matches!(err, PurgemanError::Catalog(_)));
    // Renewed once for the failed query, not in a loop.
    assert_eq!(api.issued.load(Ordering::SeqCst), 2);
}
