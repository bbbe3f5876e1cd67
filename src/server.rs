//! Read-mostly HTTP API over an [`Index`].
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/api/files?type=&status=&owner=` | List document summaries |
//! | `GET`  | `/api/files/by-path/{*path}` | One document with its references and backlinks |
//! | `GET`  | `/api/files/by-id/{doc_type}/{id}` | Document owning an identifier |
//! | `GET`  | `/api/projects`, `/api/risks`, `/api/decisions` | Typed listings |
//! | `GET`  | `/api/search?q=&mode=&type=&limit=` | Keyword, semantic or hybrid search |
//! | `GET`  | `/api/diagnostics` | Conflicts, warnings and dangling references |
//! | `GET`  | `/api/stats` | Index counts |
//! | `POST` | `/api/apply` | Replace a file's content and re-index it |
//! | `POST` | `/api/reconcile` | Run a reconciliation sweep |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "unknown document type: widget" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `embeddings_disabled` (400),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use pmo_index_core::models::{DocType, Document, DocumentSummary};
use pmo_index_core::search::{SearchMode, SearchResultItem};
use pmo_index_core::store::{
    Backlink, Conflict, DanglingReference, IndexStats, ListFilter, ResolvedReference, WarningEntry,
};

use crate::index::Index;
use crate::sync::{ReconcileReport, SyncError, SyncOutcome};

type AppState = Arc<Index>;

pub fn router(index: Arc<Index>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/files", get(handle_list_files))
        .route("/api/files/by-path/{*path}", get(handle_get_by_path))
        .route("/api/files/by-id/{doc_type}/{id}", get(handle_get_by_id))
        .route("/api/projects", get(handle_list_projects))
        .route("/api/risks", get(handle_list_risks))
        .route("/api/decisions", get(handle_list_decisions))
        .route("/api/search", get(handle_search))
        .route("/api/diagnostics", get(handle_diagnostics))
        .route("/api/stats", get(handle_stats))
        .route("/api/apply", post(handle_apply))
        .route("/api/reconcile", post(handle_reconcile))
        .layer(cors)
        .with_state(index)
}

/// Bind `[server].bind` and serve until `cancel` fires.
pub async fn run_server(index: Arc<Index>, cancel: CancellationToken) -> anyhow::Result<()> {
    let bind_addr = index.config().server.bind.clone();
    let listener = TcpListener::bind(&bind_addr).await?;
    println!("pmo API listening on http://{}", bind_addr);
    serve(listener, index, cancel).await
}

pub async fn serve(
    listener: TcpListener,
    index: Arc<Index>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "http server started");
    axum::serve(listener, router(index))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("http server stopped");
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(err: impl std::fmt::Display) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: err.to_string(),
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let msg = format!("{:#}", err);
        if msg.contains("embedding provider is disabled") {
            AppError {
                status: StatusCode::BAD_REQUEST,
                code: "embeddings_disabled",
                message: msg,
            }
        } else {
            internal(msg)
        }
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::NotTracked(_) => bad_request(err.to_string()),
            other => internal(other),
        }
    }
}

fn parse_doc_type(raw: &str) -> Result<DocType, AppError> {
    DocType::from_str(raw).map_err(bad_request)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Listings ============

#[derive(Debug, Default, Deserialize)]
struct FilesQuery {
    #[serde(rename = "type")]
    doc_type: Option<String>,
    status: Option<String>,
    owner: Option<String>,
}

#[derive(Serialize)]
struct ListResponse {
    documents: Vec<DocumentSummary>,
}

impl FilesQuery {
    fn into_filter(self, fixed_type: Option<DocType>) -> Result<ListFilter, AppError> {
        let doc_type = match (fixed_type, self.doc_type.as_deref()) {
            (Some(t), _) => Some(t),
            (None, Some(raw)) if !raw.is_empty() => Some(parse_doc_type(raw)?),
            _ => None,
        };
        Ok(ListFilter {
            doc_type,
            status: self.status.filter(|s| !s.is_empty()),
            owner: self.owner.filter(|s| !s.is_empty()),
            ..ListFilter::default()
        })
    }
}

async fn list_with(
    index: &Index,
    query: FilesQuery,
    fixed_type: Option<DocType>,
) -> Result<Json<ListResponse>, AppError> {
    let filter = query.into_filter(fixed_type)?;
    let documents = index.list(&filter).await?;
    Ok(Json(ListResponse { documents }))
}

async fn handle_list_files(
    State(index): State<AppState>,
    Query(query): Query<FilesQuery>,
) -> Result<Json<ListResponse>, AppError> {
    list_with(&index, query, None).await
}

async fn handle_list_projects(
    State(index): State<AppState>,
    Query(query): Query<FilesQuery>,
) -> Result<Json<ListResponse>, AppError> {
    list_with(&index, query, Some(DocType::Project)).await
}

async fn handle_list_risks(
    State(index): State<AppState>,
    Query(query): Query<FilesQuery>,
) -> Result<Json<ListResponse>, AppError> {
    list_with(&index, query, Some(DocType::Risk)).await
}

async fn handle_list_decisions(
    State(index): State<AppState>,
    Query(query): Query<FilesQuery>,
) -> Result<Json<ListResponse>, AppError> {
    list_with(&index, query, Some(DocType::Decision)).await
}

// ============ Single documents ============

#[derive(Serialize)]
struct DocumentResponse {
    document: Document,
    references: Vec<ResolvedReference>,
    backlinks: Vec<Backlink>,
}

async fn document_response(index: &Index, doc: Document) -> Result<Json<DocumentResponse>, AppError> {
    let references = index.references_from(&doc.path).await?;
    let backlinks = index.backlinks(doc.doc_type, &doc.identifier).await?;
    Ok(Json(DocumentResponse {
        document: doc,
        references,
        backlinks,
    }))
}

async fn handle_get_by_path(
    State(index): State<AppState>,
    Path(path): Path<String>,
) -> Result<Json<DocumentResponse>, AppError> {
    let doc = index
        .get_by_path(&path)
        .await?
        .ok_or_else(|| not_found(format!("document not found: {}", path)))?;
    document_response(&index, doc).await
}

async fn handle_get_by_id(
    State(index): State<AppState>,
    Path((doc_type, id)): Path<(String, String)>,
) -> Result<Json<DocumentResponse>, AppError> {
    let doc_type = parse_doc_type(&doc_type)?;
    let doc = index
        .get_by_identifier(doc_type, &id)
        .await?
        .ok_or_else(|| not_found(format!("no {} owns identifier {}", doc_type, id)))?;
    document_response(&index, doc).await
}

// ============ GET /api/search ============

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: String,
    mode: Option<String>,
    #[serde(rename = "type")]
    doc_type: Option<String>,
    limit: Option<i64>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchResultItem>,
}

async fn handle_search(
    State(index): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResponse>, AppError> {
    if query.q.trim().is_empty() {
        return Err(bad_request("q must not be empty"));
    }
    let mode = match query.mode.as_deref() {
        Some(raw) if !raw.is_empty() => {
            SearchMode::from_str(raw).map_err(|e| bad_request(e.to_string()))?
        }
        _ => SearchMode::Keyword,
    };
    let doc_type = match query.doc_type.as_deref() {
        Some(raw) if !raw.is_empty() => Some(parse_doc_type(raw)?),
        _ => None,
    };
    if query.limit.is_some_and(|l| l < 1) {
        return Err(bad_request("limit must be >= 1"));
    }

    let results = index.search(&query.q, mode, doc_type, query.limit).await?;
    Ok(Json(SearchResponse { results }))
}

// ============ Diagnostics & stats ============

#[derive(Serialize)]
struct DiagnosticsResponse {
    conflicts: Vec<Conflict>,
    warnings: Vec<WarningEntry>,
    dangling_references: Vec<DanglingReference>,
}

async fn handle_diagnostics(
    State(index): State<AppState>,
) -> Result<Json<DiagnosticsResponse>, AppError> {
    Ok(Json(DiagnosticsResponse {
        conflicts: index.conflicts().await?,
        warnings: index.warnings().await?,
        dangling_references: index.dangling_references().await?,
    }))
}

async fn handle_stats(State(index): State<AppState>) -> Result<Json<IndexStats>, AppError> {
    Ok(Json(index.stats().await?))
}

// ============ Writes ============

#[derive(Debug, Deserialize)]
struct ApplyRequest {
    path: String,
    content: String,
    #[serde(default)]
    backup: bool,
}

async fn handle_apply(
    State(index): State<AppState>,
    Json(req): Json<ApplyRequest>,
) -> Result<Json<SyncOutcome>, AppError> {
    let outcome = index.apply_patch(&req.path, &req.content, req.backup).await?;
    Ok(Json(outcome))
}

async fn handle_reconcile(State(index): State<AppState>) -> Result<Json<ReconcileReport>, AppError> {
    let report = index.reconcile(&CancellationToken::new()).await?;
    Ok(Json(report))
}
