//! Recording HTTP server standing in for a cache front-end.

use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::Router;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// One request as seen by a [`CacheNode`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub host: Option<String>,
    pub authorization: Option<String>,
}

/// A running fake cache front-end.
pub struct CacheNode {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl CacheNode {
    /// URL prefix to configure for this node.
    pub fn url_prefix(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

/// Start a node that answers every request with `status`.
pub async fn spawn_cache_node(status: StatusCode) -> CacheNode {
    spawn_slow_cache_node(status, Duration::ZERO).await
}

/// Start a node that records each request on arrival and answers after `delay`.
pub async fn spawn_slow_cache_node(status: StatusCode, delay: Duration) -> CacheNode {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&requests);

    let app = Router::new().fallback(move |method: Method, uri: Uri, headers: HeaderMap| {
        let recorded = Arc::clone(&recorded);
        async move {
            let header_value = |name: header::HeaderName| {
                headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            recorded.lock().push(RecordedRequest {
                method: method.to_string(),
                path: uri.path().to_string(),
                host: header_value(header::HOST),
                authorization: header_value(header::AUTHORIZATION),
            });
            tokio::time::sleep(delay).await;
            status
        }
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    CacheNode { addr, requests }
}

/// An address nothing listens on.
pub fn closed_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}
