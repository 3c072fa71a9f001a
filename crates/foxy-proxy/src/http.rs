use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::Json;
use axum::Router;
use axum::routing::{get, post};
use foxy_protocol::service::{ServiceRequest, ServiceResponse};
use libfoxy::codec::{service_error, service_response, service_work_item};
use libfoxy::{Dispatcher, Origin, Routing, WorkItem};
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, warn};

const DEFAULT_SELECT_LIMIT: usize = 1;

struct AppState {
    dispatcher: Arc<Dispatcher>,
}

type HttpError = (StatusCode, String);

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/", get(endpoints))
        .route("/api/v1.0/command", post(command))
        .route("/api/v1.0/select", get(select_current))
        .route("/api/v1.0/select/{name}", get(select_default))
        .route("/api/v1.0/select/{name}/{limit}", get(select_limited))
        .route("/api/v1.0/hello", get(hello).post(hello))
        .layer(cors)
        .with_state(Arc::new(AppState { dispatcher }))
}

async fn endpoints() -> Json<Value> {
    Json(json!({
        "endpoints": [
            "/api/v1.0/command (POST)",
            "/api/v1.0/select/{name}[/{limit}] (GET)",
            "/api/v1.0/select (GET)",
            "/api/v1.0/hello (GET, POST)",
        ]
    }))
}

async fn hello() -> Json<Value> {
    Json(json!({ "result": true }))
}

async fn command(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<Json<ServiceResponse>, HttpError> {
    let batch = ServiceRequest::from_json(&body)
        .and_then(ServiceRequest::into_batch)
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;
    debug!(reader = %batch.reader, commands = batch.commands.len(), "service request");

    let fallback = batch.clone();
    match state.dispatcher.submit_and_wait(service_work_item(batch)).await {
        Ok(result) => Ok(Json(service_response(result))),
        Err(rejected) => {
            warn!(reader = %fallback.reader, "service request rejected: {}", rejected.error);
            Ok(Json(service_error(&fallback, rejected.error.to_error_code())))
        }
    }
}

async fn select_current(State(state): State<Arc<AppState>>) -> Result<String, HttpError> {
    select(&state, String::new(), 0).await
}

async fn select_default(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<String, HttpError> {
    select(&state, name, DEFAULT_SELECT_LIMIT).await
}

async fn select_limited(
    State(state): State<Arc<AppState>>,
    Path((name, limit)): Path<(String, String)>,
) -> Result<String, HttpError> {
    let limit = limit.trim().parse::<i64>().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            "Request has an incorrect parameter 'limit'".to_string(),
        )
    })?;
    select(&state, name, usize::try_from(limit).unwrap_or(0)).await
}

async fn select(state: &AppState, name: String, limit: usize) -> Result<String, HttpError> {
    let item = WorkItem::select_terminal(name.trim(), limit, Origin::Service, Routing::Alternate);
    match state.dispatcher.submit_and_wait(item).await {
        Ok(result) => Ok(result
            .lines
            .into_iter()
            .map(|line| line.line)
            .collect::<Vec<_>>()
            .join("\n")),
        Err(rejected) => Err((StatusCode::INTERNAL_SERVER_ERROR, rejected.error.to_string())),
    }
}
