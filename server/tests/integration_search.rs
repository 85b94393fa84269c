use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use memdex_core::{MemoryConfig, MemoryService};
use serde_json::Value;
use std::fs;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use tower::ServiceExt;

fn workspace() -> (TempDir, Arc<MemoryService>) {
    let dir = tempdir().unwrap();
    let memory = dir.path().join("memory");
    fs::create_dir_all(&memory).unwrap();
    fs::write(memory.join("pets.md"), "# Cats\nthe cat sat on the mat\n\n# Dogs\ndogs bark loudly at night\n").unwrap();
    fs::write(memory.join("rust.md"), "# Rust\nrust ownership and borrowing rules\n").unwrap();

    let mut config = MemoryConfig::for_workspace(dir.path());
    config.watcher.enabled = false;
    let service = MemoryService::open(config).unwrap();
    service.rebuild().unwrap();
    (dir, Arc::new(service))
}

async fn call(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() { Value::Null } else { serde_json::from_slice(&body).unwrap() };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn search_returns_ranked_results() {
    let (_dir, service) = workspace();
    let app = memdex_server::build_app(service);

    let (status, json) = call(app, get("/search?q=cat&top_k=3")).await;
    assert_eq!(status, StatusCode::OK);
    let results = json["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["file"], "memory/pets.md");
    assert_eq!(results[0]["heading_path"][0], "Cats");
    assert_eq!(json["total_hits"], 1);
}

#[tokio::test]
async fn search_accepts_post_body_and_k_alias() {
    let (_dir, service) = workspace();
    let app = memdex_server::build_app(service);

    let (status, json) = call(app.clone(), post_json("/search", serde_json::json!({ "query": "rust borrowing" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["results"][0]["file"], "memory/rust.md");

    let (status, json) = call(app, get("/search?q=dogs&k=0")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["results"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn empty_query_is_bad_request() {
    let (_dir, service) = workspace();
    let app = memdex_server::build_app(service);

    let (status, json) = call(app.clone(), get("/search?q=")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "invalid_query");

    let (status, _) = call(app, get("/search")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn update_then_stats_and_check() {
    let (dir, service) = workspace();
    let app = memdex_server::build_app(service);

    let (status, json) = call(app.clone(), get("/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["file_count"], 2);
    assert_eq!(json["document_count"], 3);

    fs::write(dir.path().join("memory/notes.md"), "# Notes\nremember the milk\n").unwrap();
    let (status, json) = call(app.clone(), get("/check")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["changed"], 1);
    assert_eq!(json["changes"][0]["kind"], "added");

    let (status, json) = call(app.clone(), Request::post("/update").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["files_added"], 1);

    let (_, json) = call(app.clone(), get("/stats")).await;
    assert_eq!(json["file_count"], 3);

    let (status, json) = call(app, post_json("/update", serde_json::json!({ "incremental": false }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["files_added"], 0);
}

#[tokio::test]
async fn health_reports_ready_index() {
    let (_dir, service) = workspace();
    let app = memdex_server::build_app(service);

    let (status, json) = call(app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["index"]["state"], "ready");
    assert_eq!(json["document_count"], 3);
}
