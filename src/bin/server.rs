//! Dieah Recall Server
//!
//! HTTP API for the memory system.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use dieah_recall::{
    logging,
    memory::App,
    resync::{ResyncPipeline, ResyncStats},
    search::{SearchEngine, SearchResponse},
    store::{AddOutcome, DeleteOutcome, ListResponse, MemoryStore},
    Config, Error,
};

/// Application state shared across handlers
struct AppState {
    store: MemoryStore,
    search: SearchEngine,
    resync: Arc<ResyncPipeline>,
}

type SharedState = Arc<AppState>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env();
    logging::init(&config.log_level, config.log_json);

    tracing::info!("Starting Dieah Recall Server on port {}", config.server_port);
    tracing::info!("Data directory: {:?}", config.data_dir);

    // Initialize components
    let store = MemoryStore::open(config.clone())?;
    let (user, app) = store.ensure_default_identity()?;
    tracing::info!(user_id = %user.user_id, app = %app.name, "Default identity ready");

    let resync = Arc::new(ResyncPipeline::from_store(&store));
    let schedule = resync.clone().spawn_scheduled(config.resync.interval);
    tracing::info!(
        interval_secs = config.resync.interval.as_secs(),
        "Scheduled vector resync"
    );

    let state = Arc::new(AppState {
        store,
        search: SearchEngine::new(config.clone()),
        resync,
    });

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(health))
        // Memories
        .route(
            "/v1/apps/:app/users/:user/memories",
            get(list_memories).post(add_memory).delete(delete_all_memories),
        )
        .route("/v1/apps/:app/users/:user/search", post(search_memories))
        // App state
        .route("/v1/apps/:app/users/:user/pause", post(pause_app))
        .route("/v1/apps/:app/users/:user/resume", post(resume_app))
        // Maintenance
        .route("/sync", post(sync_vector_store))
        .layer(TraceLayer::new_for_http())
        // Add CORS
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state);

    let port = config.server_port;
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("Server listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    schedule.abort();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

// === Errors ===

/// Library error rendered as `{"error": ...}` with a matching status
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::AppPaused { .. } => StatusCode::CONFLICT,
            Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::CapabilityUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// === Handlers ===

async fn health() -> &'static str {
    "ok"
}

// --- Memory handlers ---

#[derive(Debug, Deserialize)]
struct AddMemoryRequest {
    text: String,
    metadata: Option<serde_json::Value>,
}

async fn add_memory(
    State(state): State<SharedState>,
    Path((app, user)): Path<(String, String)>,
    Json(req): Json<AddMemoryRequest>,
) -> ApiResult<AddOutcome> {
    let outcome = state.store.add(&user, &app, &req.text, req.metadata).await?;
    Ok(Json(outcome))
}

async fn list_memories(
    State(state): State<SharedState>,
    Path((app, user)): Path<(String, String)>,
) -> ApiResult<ListResponse> {
    Ok(Json(state.store.list(&user, &app).await?))
}

async fn delete_all_memories(
    State(state): State<SharedState>,
    Path((app, user)): Path<(String, String)>,
) -> ApiResult<DeleteOutcome> {
    Ok(Json(state.store.delete_all(&user, &app).await?))
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
    limit: Option<usize>,
}

async fn search_memories(
    State(state): State<SharedState>,
    Path((app, user)): Path<(String, String)>,
    Json(req): Json<SearchRequest>,
) -> ApiResult<SearchResponse> {
    let response = state
        .search
        .search(&state.store, &user, &app, &req.query, req.limit)
        .await?;
    Ok(Json(response))
}

// --- App handlers ---

#[derive(Debug, Serialize)]
struct AppResponse {
    id: String,
    name: String,
    is_active: bool,
    updated_at: String,
}

impl From<App> for AppResponse {
    fn from(a: App) -> Self {
        Self {
            id: a.id.to_string(),
            name: a.name,
            is_active: a.is_active,
            updated_at: a.updated_at.to_rfc3339(),
        }
    }
}

async fn pause_app(
    State(state): State<SharedState>,
    Path((app, user)): Path<(String, String)>,
) -> ApiResult<AppResponse> {
    Ok(Json(state.store.set_app_active(&user, &app, false)?.into()))
}

async fn resume_app(
    State(state): State<SharedState>,
    Path((app, user)): Path<(String, String)>,
) -> ApiResult<AppResponse> {
    Ok(Json(state.store.set_app_active(&user, &app, true)?.into()))
}

// --- Maintenance handlers ---

#[derive(Debug, Deserialize)]
struct SyncQuery {
    dry_run: Option<bool>,
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    status: &'static str,
    statistics: ResyncStats,
}

async fn sync_vector_store(
    State(state): State<SharedState>,
    Query(query): Query<SyncQuery>,
) -> ApiResult<SyncResponse> {
    tracing::info!("Manual vector resync triggered");
    let statistics = state.resync.run(query.dry_run.unwrap_or(false)).await?;
    Ok(Json(SyncResponse {
        status: if statistics.is_clean() { "success" } else { "partial" },
        statistics,
    }))
}
