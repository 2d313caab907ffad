//! HTTP routes.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::types::*;
use crate::agent::{parse_content, AnalysisError, Analyst, RunContext, RunFailure, RunOutcome};
use crate::catalog::{CatalogEntry, CatalogError, DirCatalog, LoadError};
use crate::config::Config;
use crate::history::{HistoryError, HistoryStore, RunRecord, RunStatus};
use crate::template::{self, check_bindings, BindError, PromptDefinition};

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub catalog: DirCatalog,
    pub history: HistoryStore,
    pub analyst: Arc<Analyst>,
    /// Cancellation handles of in-flight runs, by run id.
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl AppState {
    pub fn new(config: Config, analyst: Arc<Analyst>) -> Self {
        Self {
            catalog: DirCatalog::new(&config.context_dir),
            history: HistoryStore::new(&config.history_dir),
            config,
            analyst,
            running: Mutex::new(HashMap::new()),
        }
    }
}

/// Error rendered as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<CatalogError> for ApiError {
    fn from(e: CatalogError) -> Self {
        let status = match &e {
            CatalogError::NotFound(_) => StatusCode::NOT_FOUND,
            CatalogError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, e.to_string())
    }
}

impl From<LoadError> for ApiError {
    fn from(e: LoadError) -> Self {
        match e {
            LoadError::Catalog(e) => e.into(),
            parse @ LoadError::Parse { .. } => Self::new(StatusCode::BAD_REQUEST, parse.to_string()),
        }
    }
}

impl From<AnalysisError> for ApiError {
    fn from(e: AnalysisError) -> Self {
        match e {
            AnalysisError::Load(e) => e.into(),
            other => Self::new(StatusCode::BAD_REQUEST, other.to_string()),
        }
    }
}

impl From<BindError> for ApiError {
    fn from(e: BindError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, e.to_string())
    }
}

impl From<HistoryError> for ApiError {
    fn from(e: HistoryError) -> Self {
        let status = match &e {
            HistoryError::NotFound(_) => StatusCode::NOT_FOUND,
            HistoryError::InvalidId(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/prompts", get(list_prompts).post(save_prompt))
        .route("/api/prompts/:id", get(get_prompt))
        .route("/api/prompts/:id/preview", post(preview_prompt))
        .route("/api/runs", get(list_runs).post(create_run).delete(clear_runs))
        .route("/api/runs/:id", get(get_run))
        .route("/api/runs/:id/cancel", post(cancel_run))
        .route("/api/runs/:id/save-prompt", post(save_generated_prompt))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until Ctrl-C.
pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model: state.config.default_model.clone(),
    })
}

async fn list_prompts(State(state): State<Arc<AppState>>) -> ApiResult<Json<PromptListResponse>> {
    Ok(Json(PromptListResponse {
        prompts: state.catalog.list_definitions()?,
    }))
}

async fn get_prompt(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<PromptDetail>> {
    let definition = state.catalog.load(&id)?;
    let raw = state.catalog.load_definition(&id)?;
    Ok(Json(PromptDetail { definition, raw }))
}

async fn preview_prompt(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<PreviewRequest>,
) -> ApiResult<Json<PreviewResponse>> {
    let definition = state.catalog.load(&id)?;
    let missing = definition
        .variables()
        .iter()
        .filter(|v| req.variables.get(&v.name).map_or(true, |s| s.trim().is_empty()))
        .map(|v| v.name.clone())
        .collect();
    Ok(Json(PreviewResponse {
        preview: template::preview(&definition, &req.variables),
        missing,
    }))
}

async fn save_prompt(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SavePromptRequest>,
) -> ApiResult<(StatusCode, Json<CatalogEntry>)> {
    let entry =
        state
            .catalog
            .save_custom(&req.name, &req.content, req.id.as_deref(), &req.description)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

enum RunJob {
    Definition(PromptDefinition),
    Content(String),
    Freeform(String),
}

async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRunRequest>,
) -> ApiResult<(StatusCode, Json<CreateRunResponse>)> {
    // Everything that can be refused is checked before the run is recorded.
    let (job, label, prompt_id) = match (&req.prompt_id, &req.content, &req.question) {
        (Some(id), None, None) => {
            let definition = state.catalog.load(id)?;
            check_bindings(&definition, &req.variables)?;
            let label = definition.name().to_string();
            (RunJob::Definition(definition), label, Some(id.clone()))
        }
        (None, Some(content), None) => {
            let definition = parse_content(content)
                .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid prompt: {}", e)))?;
            check_bindings(&definition, &req.variables)?;
            let label = definition.name().to_string();
            (RunJob::Content(content.clone()), label, None)
        }
        (None, None, Some(question)) if !question.trim().is_empty() => {
            (RunJob::Freeform(question.clone()), question.clone(), None)
        }
        _ => {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                "provide exactly one of prompt_id, content or a non-empty question",
            ))
        }
    };

    let id = state.history.save_run(&label, prompt_id.as_deref())?;
    let model = req
        .model
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| state.config.default_model.clone());
    let ctx = RunContext::new(model);
    state
        .running
        .lock()
        .await
        .insert(id.clone(), ctx.cancel.clone());

    tracing::info!(run = %id, label = %label, "Starting run");
    let run_id = id.clone();
    let variables = req.variables;
    tokio::spawn(async move {
        let outcome = match job {
            RunJob::Definition(definition) => {
                state.analyst.run_definition(&definition, &variables, &ctx).await
            }
            RunJob::Content(content) => state.analyst.run_content(&content, &variables, &ctx).await,
            RunJob::Freeform(question) => state.analyst.run_freeform(&question, &ctx).await,
        };
        state.running.lock().await.remove(&run_id);
        if let Err(e) = finish_run(&state.history, &run_id, outcome) {
            tracing::error!(run = %run_id, error = %e, "Failed to record run result");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateRunResponse {
            id,
            status: RunStatus::Running,
        }),
    ))
}

fn finish_run(
    history: &HistoryStore,
    id: &str,
    outcome: Result<RunOutcome, AnalysisError>,
) -> Result<RunRecord, HistoryError> {
    match outcome {
        Ok(RunOutcome { result, log, .. }) => {
            let (status, text) = match result {
                Ok(report) => (RunStatus::Completed, report),
                Err(RunFailure::Cancelled) => (RunStatus::Cancelled, "Run cancelled".to_string()),
                Err(failure) => (RunStatus::Failed, format!("Error: {}", failure)),
            };
            history.update_run(id, status, Some(text), Some(log))
        }
        Err(e) => history.update_run(id, RunStatus::Failed, Some(format!("Error: {}", e)), None),
    }
}

async fn list_runs(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<RunRecord>>> {
    Ok(Json(state.history.list_runs()?))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<RunRecord>> {
    Ok(Json(state.history.get_run(&id)?))
}

async fn clear_runs(State(state): State<Arc<AppState>>) -> ApiResult<Json<ClearRunsResponse>> {
    Ok(Json(ClearRunsResponse {
        deleted: state.history.clear()?,
    }))
}

/// Save the template a prompt-builder run generated as a custom prompt.
async fn save_generated_prompt(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SaveGeneratedRequest>,
) -> ApiResult<(StatusCode, Json<CatalogEntry>)> {
    let record = state.history.get_run(&id)?;
    let output = match (record.status, record.result) {
        (RunStatus::Completed, Some(output)) => output,
        _ => {
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                format!("run '{}' has no completed result", id),
            ))
        }
    };
    let entry = state
        .catalog
        .save_generated(&output, req.name.as_deref(), req.id.as_deref())?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    match state.running.lock().await.get(&id) {
        Some(token) => {
            token.cancel();
            tracing::info!(run = %id, "Run cancellation requested");
            Ok(Json(json!({ "id": id, "cancelled": true })))
        }
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("run '{}' is not in progress", id),
        )),
    }
}
