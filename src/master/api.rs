use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::MasterConfig;
use crate::error::{CronError, Result};
use crate::logstore::{LogQuery, LogStore};
use crate::master::jobs::JobManager;
use crate::master::workers::WorkerManager;
use crate::scheduler::Job;
use crate::store::CoordinationClient;

#[derive(Clone)]
pub struct ApiState {
    pub jobs: Arc<JobManager>,
    pub workers: Arc<WorkerManager>,
    pub logs: Arc<dyn LogStore>,
    pub default_log_limit: usize,
}

impl ApiState {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        logs: Arc<dyn LogStore>,
        config: &MasterConfig,
    ) -> Self {
        Self {
            jobs: Arc::new(JobManager::new(Arc::clone(&client), config.kill_ttl_secs)),
            workers: Arc::new(WorkerManager::new(client)),
            logs,
            default_log_limit: config.default_log_limit,
        }
    }
}

/// Envelope of every API response. `errno` is 0 on success and -1 on
/// failure, in which case `msg` carries the reason and `data` is null.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub errno: i32,
    pub msg: String,
    pub data: Value,
}

#[derive(Debug, Deserialize)]
pub struct NameRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct LogParams {
    pub name: String,
    #[serde(default)]
    pub skip: usize,
    pub limit: Option<usize>,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/job/save", post(save_job_handler))
        .route("/job/delete", post(delete_job_handler))
        .route("/job/list", get(list_jobs_handler))
        .route("/job/kill", post(kill_job_handler))
        .route("/job/log", get(job_log_handler))
        .route("/worker/list", get(list_workers_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until `shutdown` fires.
pub async fn run_api(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
        CronError::Io(e)
    })?;
    serve(listener, state, shutdown).await
}

/// Serve the API on an already bound listener.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: ApiState,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "Starting API server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("API server stopped");
    Ok(())
}

fn ok(data: impl Serialize) -> Response {
    match serde_json::to_value(data) {
        Ok(data) => (
            StatusCode::OK,
            Json(ApiResponse {
                errno: 0,
                msg: "success".to_string(),
                data,
            }),
        )
            .into_response(),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn fail(status: StatusCode, msg: String) -> Response {
    (
        status,
        Json(ApiResponse {
            errno: -1,
            msg,
            data: Value::Null,
        }),
    )
        .into_response()
}

fn error_response(e: CronError) -> Response {
    let status = match e {
        CronError::InvalidJob(_) | CronError::InvalidCron(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %e, "API request failed");
    }
    fail(status, e.to_string())
}

async fn save_job_handler(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<Job>, JsonRejection>,
) -> Response {
    let Json(job) = match payload {
        Ok(job) => job,
        Err(rejection) => return fail(rejection.status(), rejection.body_text()),
    };
    match state.jobs.save_job(&job).await {
        Ok(previous) => ok(previous),
        Err(e) => error_response(e),
    }
}

async fn delete_job_handler(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<NameRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(request) => request,
        Err(rejection) => return fail(rejection.status(), rejection.body_text()),
    };
    match state.jobs.delete_job(&request.name).await {
        Ok(removed) => ok(removed),
        Err(e) => error_response(e),
    }
}

async fn list_jobs_handler(State(state): State<ApiState>) -> Response {
    match state.jobs.list_jobs().await {
        Ok(jobs) => ok(jobs),
        Err(e) => error_response(e),
    }
}

async fn kill_job_handler(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<NameRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(request) => request,
        Err(rejection) => return fail(rejection.status(), rejection.body_text()),
    };
    if request.name.is_empty() {
        return fail(StatusCode::BAD_REQUEST, "name must not be empty".to_string());
    }
    match state.jobs.kill_job(&request.name).await {
        Ok(()) => ok(Value::Null),
        Err(e) => error_response(e),
    }
}

async fn job_log_handler(
    State(state): State<ApiState>,
    params: std::result::Result<Query<LogParams>, QueryRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => return fail(rejection.status(), rejection.body_text()),
    };
    let query = LogQuery::new(
        params.name,
        params.skip,
        params.limit.unwrap_or(state.default_log_limit),
    );
    match state.logs.query(&query).await {
        Ok(entries) => ok(entries),
        Err(e) => error_response(e),
    }
}

async fn list_workers_handler(State(state): State<ApiState>) -> Response {
    match state.workers.list_workers().await {
        Ok(workers) => ok(workers),
        Err(e) => error_response(e),
    }
}
