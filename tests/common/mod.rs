use axum::Router;
use axum::body::Body;
use axum::http::Request;
use rill::api::{AppState, ChunkUploadRequest};
use rill::auth::TokenStore;
use rill::build_router;
use rill::chunker::sha256_hex;
use rill::config::Config;
use rill::engine::UploadEngine;
use rill::session::SessionStore;
use rill::storage::{BlobStore, LocalStore};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Build an app over explicit storage and metadata directories, so tests
/// can "restart the server" by building a second app over the same dirs.
pub async fn build_app_at(
    storage_dir: &Path,
    meta_dir: &Path,
    tokens: Option<TokenStore>,
) -> Router {
    let config = Config::default();

    let storage: Arc<dyn BlobStore> = Arc::new(LocalStore::new(storage_dir));
    let sessions = SessionStore::open(meta_dir).await.unwrap();
    let engine = UploadEngine::new(sessions.clone(), Arc::clone(&storage));

    let state = Arc::new(AppState {
        engine,
        sessions,
        storage,
        config,
        tokens,
    });

    build_router(state)
}

pub async fn setup_test_app() -> Router {
    // Leak the temp dirs so they persist for the duration of the test
    let storage_dir = TempDir::new().unwrap();
    let meta_dir = TempDir::new().unwrap();
    let app = build_app_at(storage_dir.path(), meta_dir.path(), None).await;
    std::mem::forget(storage_dir);
    std::mem::forget(meta_dir);
    app
}

pub async fn setup_test_app_with_auth(tokens: TokenStore) -> Router {
    let storage_dir = TempDir::new().unwrap();
    let meta_dir = TempDir::new().unwrap();
    let app = build_app_at(storage_dir.path(), meta_dir.path(), Some(tokens)).await;
    std::mem::forget(storage_dir);
    std::mem::forget(meta_dir);
    app
}

/// POST /upload request for one chunk, with a correct checksum.
pub fn chunk_request(path: &str, chunk_id: usize, payload: &[u8], total: usize) -> Request<Body> {
    chunk_request_with_checksum(path, chunk_id, payload, &sha256_hex(payload), total)
}

pub fn chunk_request_with_checksum(
    path: &str,
    chunk_id: usize,
    payload: &[u8],
    checksum: &str,
    total: usize,
) -> Request<Body> {
    let body = ChunkUploadRequest {
        path: path.to_string(),
        chunk_id,
        data: payload.to_vec(),
        checksum: checksum.to_string(),
        total,
    };

    Request::builder()
        .method("POST")
        .uri("/upload")
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

pub fn status_request(path: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(format!("/upload/status?path={}", urlencode(path)))
        .body(Body::empty())
        .unwrap()
}

pub fn download_request(path: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(format!("/download?path={}", urlencode(path)))
        .body(Body::empty())
        .unwrap()
}

pub fn list_request(path: Option<&str>) -> Request<Body> {
    let uri = match path {
        Some(p) => format!("/list?path={}", urlencode(p)),
        None => "/list".to_string(),
    };
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

/// Percent-encode just enough for the path values used in tests.
fn urlencode(path: &str) -> String {
    path.replace('/', "%2F")
}

pub async fn read_body(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

pub async fn read_json(response: axum::response::Response) -> serde_json::Value {
    serde_json::from_slice(&read_body(response).await).unwrap()
}

/// Split `data` the way a client would: fixed chunk size, last chunk short.
pub fn split_payloads(data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    data.chunks(chunk_size).map(|c| c.to_vec()).collect()
}
