use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use memdex_core::{FileChange, HealthReport, IndexStats, MemoryError, MemoryService, SearchHit, UpdateSummary};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
    #[serde(default, alias = "k")]
    pub top_k: Option<usize>,
}

#[derive(Deserialize)]
pub struct SearchBody {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Deserialize)]
pub struct UpdateBody {
    #[serde(default = "default_incremental")]
    pub incremental: bool,
}

fn default_incremental() -> bool {
    true
}

#[derive(Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub took_s: f64,
    pub total_hits: usize,
    pub results: Vec<SearchHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Serialize)]
pub struct CheckResponse {
    pub changed: usize,
    pub changes: Vec<FileChange>,
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<MemoryService>,
}

/// Maps service errors onto HTTP status codes with a JSON body.
pub struct ApiError(MemoryError);

impl From<MemoryError> for ApiError {
    fn from(e: MemoryError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MemoryError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            MemoryError::ConcurrentUpdateConflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = Json(serde_json::json!({ "error": self.0.to_string(), "kind": self.0.kind() }));
        let mut response = (status, body).into_response();
        if let MemoryError::ConcurrentUpdateConflict { retry_after } = &self.0 {
            let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub fn build_app(service: Arc<MemoryService>) -> Router {
    // CORS: read CORS_ALLOW_ORIGIN (comma-separated) or allow Any by default
    let cors = match std::env::var("CORS_ALLOW_ORIGIN") {
        Ok(val) => {
            let origins: Vec<_> = val.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            if origins.is_empty() {
                CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
            } else {
                CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods(Any).allow_headers(Any)
            }
        }
        Err(_) => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
    };

    Router::new()
        .route("/health", get(health_handler))
        .route("/search", get(search_handler).post(search_post_handler))
        .route("/update", post(update_handler))
        .route("/stats", get(stats_handler))
        .route("/check", get(check_handler))
        .route("/synonyms/reload", post(reload_synonyms_handler))
        .with_state(AppState { service })
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Run a service call on the blocking pool; index work touches the filesystem.
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&MemoryService) -> Result<T, MemoryError> + Send + 'static,
{
    let service = state.service.clone();
    tokio::task::spawn_blocking(move || f(&service))
        .await
        .map_err(|e| ApiError(MemoryError::Io(std::io::Error::other(e.to_string()))))?
        .map_err(ApiError)
}

pub async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.service.health())
}

pub async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    run_search(state, params.q, params.top_k).await
}

pub async fn search_post_handler(
    State(state): State<AppState>,
    Json(body): Json<SearchBody>,
) -> Result<Json<SearchResponse>, ApiError> {
    run_search(state, body.query, body.top_k).await
}

async fn run_search(state: AppState, query: String, top_k: Option<usize>) -> Result<Json<SearchResponse>, ApiError> {
    let start = Instant::now();
    let top_k = top_k.unwrap_or(state.service.config().search.default_top_k);
    let warning = state.service.health().warning;
    let q = query.clone();
    let results = blocking(&state, move |service| service.search(&q, top_k)).await?;
    Ok(Json(SearchResponse {
        query,
        took_s: start.elapsed().as_secs_f64(),
        total_hits: results.len(),
        results,
        warning,
    }))
}

pub async fn update_handler(
    State(state): State<AppState>,
    body: Option<Json<UpdateBody>>,
) -> Result<Json<UpdateSummary>, ApiError> {
    let incremental = body.map(|Json(b)| b.incremental).unwrap_or(true);
    let summary = blocking(&state, move |service| service.update(incremental)).await?;
    Ok(Json(summary))
}

pub async fn stats_handler(State(state): State<AppState>) -> Result<Json<IndexStats>, ApiError> {
    let stats = blocking(&state, |service| Ok(service.stats())).await?;
    Ok(Json(stats))
}

pub async fn check_handler(State(state): State<AppState>) -> Result<Json<CheckResponse>, ApiError> {
    let changes = blocking(&state, |service| Ok(service.check())).await?;
    Ok(Json(CheckResponse { changed: changes.len(), changes }))
}

pub async fn reload_synonyms_handler(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let entries = blocking(&state, |service| service.reload_synonyms()).await?;
    Ok(Json(serde_json::json!({ "entries": entries })))
}
