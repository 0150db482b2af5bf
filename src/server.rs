//! HTTP trigger server.
//!
//! Scheduled jobs and the web front end reach the pipeline through these
//! endpoints:
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ingest` | Run due connectors (`{town?, schedule?, force?, generate?}`) |
//! | `POST` | `/monitor` | Run change detection (`{town?, trigger?}`) |
//! | `POST` | `/ask` | Answer a query through the cache (`{town, query}`) |
//! | `GET`  | `/sources` | Source status with due flags |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! Errors are returned as
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use town_hub_core::models::Schedule;
use town_hub_core::{ErrorKind, PipelineError};

use crate::hub::Hub;
use crate::ingest::{self, IngestSummary, RunOptions};
use crate::monitor::{self, MonitorResponse};
use crate::search::{self, Answer};
use crate::sources::{self, SourceStatus};

/// Start the trigger server on `[server].bind`. Runs until the process is
/// terminated.
pub async fn run_server(hub: Arc<Hub>) -> anyhow::Result<()> {
    let bind_addr = hub.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    println!("Trigger server listening on http://{}", bind_addr);
    axum::serve(listener, router(hub)).await?;
    Ok(())
}

/// Routes with CORS applied, for serving or for in-process tests.
pub fn router(hub: Arc<Hub>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ingest", post(handle_ingest))
        .route("/monitor", post(handle_monitor))
        .route("/ask", post(handle_ask))
        .route("/sources", get(handle_sources))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(hub)
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
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

/// Map a pipeline failure to a response, keeping the typed kind when one
/// is attached.
fn internal(err: anyhow::Error) -> AppError {
    error!(error = %format!("{:#}", err), "trigger failed");
    match err.downcast_ref::<PipelineError>().map(PipelineError::kind) {
        Some(ErrorKind::Config) => AppError {
            status: StatusCode::BAD_REQUEST,
            code: "config".to_string(),
            message: format!("{:#}", err),
        },
        Some(ErrorKind::DeadlineExceeded) => AppError {
            status: StatusCode::GATEWAY_TIMEOUT,
            code: "timeout".to_string(),
            message: format!("{:#}", err),
        },
        _ => AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal".to_string(),
            message: format!("{:#}", err),
        },
    }
}

// ============ POST /ingest ============

#[derive(Debug, Default, Deserialize)]
struct IngestRequest {
    town: Option<String>,
    schedule: Option<String>,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    generate: bool,
}

async fn handle_ingest(
    State(hub): State<Arc<Hub>>,
    body: Option<Json<IngestRequest>>,
) -> Result<Json<IngestSummary>, AppError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let schedule = match req.schedule.as_deref() {
        None => None,
        Some(s) => Some(Schedule::parse(s).ok_or_else(|| {
            bad_request(format!(
                "unknown schedule '{}'. Must be hourly, daily, or weekly.",
                s
            ))
        })?),
    };
    let options = RunOptions {
        town_id: req.town,
        schedule,
        force: req.force,
    };
    info!(town = ?options.town_id, schedule = ?options.schedule, "ingest triggered over http");

    let summary = ingest::run_trigger(&hub, &options, req.generate)
        .await
        .map_err(internal)?;
    Ok(Json(summary))
}

// ============ POST /monitor ============

#[derive(Debug, Default, Deserialize)]
struct MonitorRequest {
    town: Option<String>,
    trigger: Option<String>,
}

async fn handle_monitor(
    State(hub): State<Arc<Hub>>,
    body: Option<Json<MonitorRequest>>,
) -> Result<Json<MonitorResponse>, AppError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let trigger = req.trigger.as_deref().unwrap_or("http");

    let report = match req.town.as_deref() {
        Some(town) if town.trim().is_empty() => return Err(bad_request("town must not be empty")),
        Some(town) => monitor::run_change_detection(&hub, town, trigger).await,
        None => monitor::run_all_towns(&hub, trigger).await,
    }
    .map_err(internal)?;

    Ok(Json(MonitorResponse::from_report(report)))
}

// ============ POST /ask ============

#[derive(Debug, Deserialize)]
struct AskRequest {
    town: String,
    query: String,
}

async fn handle_ask(
    State(hub): State<Arc<Hub>>,
    Json(req): Json<AskRequest>,
) -> Result<Json<Answer>, AppError> {
    if req.town.trim().is_empty() {
        return Err(bad_request("town must not be empty"));
    }
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let answer = search::answer_query(&hub, &req.town, &req.query)
        .await
        .map_err(internal)?;
    Ok(Json(answer))
}

// ============ GET /sources ============

#[derive(Debug, Deserialize)]
struct SourcesParams {
    town: Option<String>,
}

#[derive(Serialize)]
struct SourcesResponse {
    sources: Vec<SourceStatus>,
}

async fn handle_sources(
    State(hub): State<Arc<Hub>>,
    Query(params): Query<SourcesParams>,
) -> Result<Json<SourcesResponse>, AppError> {
    let sources = sources::get_sources(&hub, params.town.as_deref())
        .await
        .map_err(internal)?;
    Ok(Json(SourcesResponse { sources }))
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
