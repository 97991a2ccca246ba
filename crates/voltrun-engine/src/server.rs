// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! REST API over the function registry and the execution coordinator.
//!
//! | Route | Method | Description |
//! |-------|--------|-------------|
//! | `/health` | GET | Store health and pool stats |
//! | `/functions` | POST, GET | Register or list functions |
//! | `/functions/{id}` | GET, PUT, DELETE | Read, partially update or delete a function |
//! | `/functions/{id}/execute` | POST | Run a function and wait for the result |
//! | `/executions` | GET | List executions (`function_id`, `status`, `limit`, `offset`) |
//! | `/executions/{id}` | GET | Read one execution |
//! | `/executions/{id}/logs` | GET | Read the captured logs of one execution |
//!
//! Errors are returned as `{ "error": <message>, "kind": <kind> }`.

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};
use voltrun_core::StoreError;
use voltrun_core::model::{
    ErrorKind, ExecutionFilter, ExecutionRecord, ExecutionStatus, Function, FunctionUpdate,
    FunctionValidationError, NewFunction,
};

use crate::coordinator::{Coordinator, InvokeError, ValidationError};
use crate::sandbox::pool::ClassStats;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 500;

/// Error returned by every handler.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    kind: &'a str,
}

impl ApiError {
    fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: ErrorKind::ValidationError.as_str(),
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "NotFound",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: ErrorKind::InternalError.as_str(),
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(kind = self.kind, error = %self.message, "Request failed");
        }
        let body = ErrorBody {
            error: &self.message,
            kind: self.kind,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ExecutionNotFound { .. } | StoreError::FunctionNotFound { .. } => {
                ApiError::not_found(e.to_string())
            }
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<FunctionValidationError> for ApiError {
    fn from(e: FunctionValidationError) -> Self {
        ApiError::validation(e.to_string())
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::validation(e.to_string())
    }
}

impl From<InvokeError> for ApiError {
    fn from(e: InvokeError) -> Self {
        match e {
            InvokeError::Validation(e) => e.into(),
            InvokeError::FunctionNotFound(id) => {
                ApiError::not_found(format!("Function '{id}' not found"))
            }
            InvokeError::Store(e) => e.into(),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the REST router.
pub fn router(coordinator: Coordinator) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/functions", post(create_function).get(list_functions))
        .route(
            "/functions/{id}",
            get(get_function).put(update_function).delete(delete_function),
        )
        .route("/functions/{id}/execute", post(execute_function))
        .route("/executions", get(list_executions))
        .route("/executions/{id}", get(get_execution))
        .route("/executions/{id}/logs", get(get_execution_logs))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

/// Serve the router on `listener` until `shutdown_rx` flips to `true`.
pub async fn serve_with_shutdown(
    listener: TcpListener,
    coordinator: Coordinator,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, router(coordinator))
        .with_graceful_shutdown(async move {
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
            debug!("HTTP server received shutdown signal");
        })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

// ==================== Health ====================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    store: bool,
    pool: Vec<ClassStats>,
}

async fn health(State(coordinator): State<Coordinator>) -> Response {
    let store = coordinator.store().health_check().await.unwrap_or(false);
    let body = HealthResponse {
        status: if store { "ok" } else { "degraded" },
        store,
        pool: coordinator.pool().stats(),
    };
    let status = if store {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

// ==================== Functions ====================

#[derive(Debug, Default, Deserialize)]
struct Page {
    limit: Option<i64>,
    offset: Option<i64>,
}

impl Page {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> ApiResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::validation(format!("invalid request body: {e}")))
}

async fn create_function(
    State(coordinator): State<Coordinator>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Function>)> {
    let function = parse_body::<NewFunction>(&body)?.into_function()?;
    coordinator.store().create_function(&function).await?;
    info!(function_id = %function.id, runtime = %function.runtime, "Function registered");
    Ok((StatusCode::CREATED, Json(function)))
}

async fn list_functions(
    State(coordinator): State<Coordinator>,
    Query(page): Query<Page>,
) -> ApiResult<Json<Vec<Function>>> {
    let functions = coordinator
        .store()
        .list_functions(page.limit(), page.offset())
        .await?;
    Ok(Json(functions))
}

async fn load_function(coordinator: &Coordinator, id: &str) -> ApiResult<Function> {
    coordinator
        .store()
        .get_function(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Function '{id}' not found")))
}

async fn get_function(
    State(coordinator): State<Coordinator>,
    Path(id): Path<String>,
) -> ApiResult<Json<Function>> {
    Ok(Json(load_function(&coordinator, &id).await?))
}

async fn update_function(
    State(coordinator): State<Coordinator>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Function>> {
    let update: FunctionUpdate = parse_body(&body)?;
    let function = update.apply(load_function(&coordinator, &id).await?)?;
    coordinator.store().update_function(&function).await?;
    info!(function_id = %id, "Function updated");
    Ok(Json(function))
}

async fn delete_function(
    State(coordinator): State<Coordinator>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if coordinator.store().delete_function(&id).await? {
        info!(function_id = %id, "Function deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("Function '{id}' not found")))
    }
}

// ==================== Executions ====================

#[derive(Debug, Default, Deserialize)]
struct ExecuteRequest {
    #[serde(default)]
    input: Option<Value>,
}

/// Missing or empty bodies run with `{}`.
fn parse_execute_body(body: &[u8]) -> ApiResult<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    let request: ExecuteRequest = parse_body(body)?;
    Ok(request.input.unwrap_or_else(|| json!({})))
}

async fn execute_function(
    State(coordinator): State<Coordinator>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<ExecutionRecord>> {
    let input = parse_execute_body(&body)?;
    let record = coordinator.invoke_by_id(&id, input).await?;
    Ok(Json(record))
}

#[derive(Debug, Default, Deserialize)]
struct ExecutionQuery {
    function_id: Option<String>,
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Serialize)]
struct ExecutionList {
    executions: Vec<ExecutionRecord>,
    total: i64,
    limit: i64,
    offset: i64,
}

async fn list_executions(
    State(coordinator): State<Coordinator>,
    Query(query): Query<ExecutionQuery>,
) -> ApiResult<Json<ExecutionList>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<ExecutionStatus>)
        .transpose()
        .map_err(ApiError::validation)?;
    let filter = ExecutionFilter {
        function_id: query.function_id,
        status,
    };
    let page = Page {
        limit: query.limit,
        offset: query.offset,
    };
    let (limit, offset) = (page.limit(), page.offset());

    let store = coordinator.store();
    let executions = store.list_executions(&filter, limit, offset).await?;
    let total = store.count_executions(&filter).await?;
    Ok(Json(ExecutionList {
        executions,
        total,
        limit,
        offset,
    }))
}

async fn load_execution(coordinator: &Coordinator, id: &str) -> ApiResult<ExecutionRecord> {
    coordinator
        .store()
        .get_execution(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Execution '{id}' not found")))
}

async fn get_execution(
    State(coordinator): State<Coordinator>,
    Path(id): Path<String>,
) -> ApiResult<Json<ExecutionRecord>> {
    Ok(Json(load_execution(&coordinator, &id).await?))
}

#[derive(Serialize)]
struct ExecutionLogs {
    execution_id: String,
    logs: String,
    status: ExecutionStatus,
}

async fn get_execution_logs(
    State(coordinator): State<Coordinator>,
    Path(id): Path<String>,
) -> ApiResult<Json<ExecutionLogs>> {
    let record = load_execution(&coordinator, &id).await?;
    Ok(Json(ExecutionLogs {
        execution_id: record.id,
        logs: record.logs,
        status: record.status,
    }))
}
