//! HTTP route definitions and handlers.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::error;

use rsaccum_domain::{extract_control, parse_request_payload, DomainError};
use rsaccum_server::ServerError;
use rsaccum_storage::{Backend, CounterField, StorageError};

use super::state::AppState;

/// Default request body size limit (10 KiB) for the accumulate and counter
/// routes. The memoize and flow routes read the full body.
pub const DEFAULT_BODY_LIMIT: usize = 10 * 1024;

/// Creates the HTTP router with the default body size limit.
pub fn create_router<S: Backend>(state: AppState<S>) -> Router {
    create_router_with_body_limit(state, DEFAULT_BODY_LIMIT)
}

/// Creates the HTTP router with a custom body size limit on the capped
/// routes.
pub fn create_router_with_body_limit<S: Backend>(state: AppState<S>, body_limit: usize) -> Router {
    let shared_state = Arc::new(state);

    // Size-capped producer routes
    let limited = Router::new()
        .route("/request", post(missing_window))
        .route(
            "/request/:window",
            post(accumulate::<S>).delete(purge_buffer::<S>),
        )
        .route("/updateMinutos", post(update_minutos::<S>))
        .route("/addResponse", post(add_response::<S>))
        .route("/countImage", post(count_image::<S>))
        .layer(RequestBodyLimitLayer::new(body_limit));

    // Full-body routes plus health
    let unlimited = Router::new()
        .route("/process", post(flow_process::<S>))
        .route("/requisicao", post(memoize_request::<S>))
        .route("/health", get(health_check));

    limited.merge(unlimited).with_state(shared_state)
}

// ============================================================
// Error Handling
// ============================================================

/// API error response format.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new("validation_error", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("unauthorized", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.code.as_str() {
            "validation_error" => StatusCode::BAD_REQUEST,
            "unauthorized" => StatusCode::UNAUTHORIZED,
            "not_found" => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        ApiError::invalid_input(err.to_string())
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match &err {
            StorageError::InvalidInput { message } => ApiError::invalid_input(message),
            StorageError::BufferNotFound { user_ns } => {
                ApiError::not_found(format!("no buffered data for userNs: {user_ns}"))
            }
            _ => {
                error!("Storage error: {}", err);
                ApiError::internal_error(err.to_string())
            }
        }
    }
}

impl From<ServerError> for ApiError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Domain(inner) => inner.into(),
            ServerError::Storage(inner) => inner.into(),
            other => {
                error!("Dispatch error: {}", other);
                ApiError::internal_error(other.to_string())
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Decodes a JSON body, mapping any failure to a 400.
fn decode_json<T: DeserializeOwned>(bytes: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|_| ApiError::invalid_input("request body is not valid JSON"))
}

// ============================================================
// Health
// ============================================================

/// Liveness probe: the process is up. Dependencies are not checked.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// ============================================================
// Accumulate
// ============================================================

/// `/request` without a window segment.
async fn missing_window() -> ApiError {
    ApiError::invalid_input("accumulation window not specified in the URL")
}

/// POST /request/{W} - accept one producer payload.
///
/// For each RequestData in the payload: validate the control item, count the
/// request for its workspace, and hand the items to the scheduler (immediate
/// dispatch when W is zero, buffered otherwise).
async fn accumulate<S: Backend>(
    State(state): State<Arc<AppState<S>>>,
    Path(window): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let window: u64 = window
        .parse()
        .map_err(|_| ApiError::invalid_input("accumulation window must be a non-negative integer"))?;

    if state.require_access_token {
        let token = headers
            .get("access_token")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if token.is_empty() {
            return Err(ApiError::unauthorized("access token is missing"));
        }
        if !state.check_access_token(token).await? {
            return Err(ApiError::unauthorized("access token is invalid"));
        }
    }

    let requests = parse_request_payload(&body)?;
    let today = Utc::now().format("%Y-%m-%d").to_string();

    for request in requests {
        let (user_ns, url) = {
            let control = extract_control(&request.body)?;
            (control.user_ns.to_string(), control.url.to_string())
        };

        let workspace = request
            .body
            .first()
            .and_then(|item| item.workspace.clone())
            .unwrap_or_default();
        state
            .storage
            .increment(&workspace, &today, CounterField::RequestsReceived, 1)
            .await?;

        state
            .scheduler
            .submit(&user_ns, request.body, &url, window)
            .await?;
    }

    Ok(StatusCode::OK)
}

/// DELETE /request/{userNs} - operator purge of a stuck buffer.
async fn purge_buffer<S: Backend>(
    State(state): State<Arc<AppState<S>>>,
    Path(user_ns): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.scheduler.purge(&user_ns).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================
// Counters
// ============================================================

#[derive(Debug, Deserialize)]
struct MinutesUpdateBody {
    #[serde(rename = "nomeWorkspace", default)]
    workspace: String,
    #[serde(rename = "data", default)]
    date: String,
    #[serde(rename = "minutos", default)]
    minutes: f64,
}

#[derive(Debug, Deserialize)]
struct CountBody {
    #[serde(rename = "nomeWorkspace", default)]
    workspace: String,
    #[serde(rename = "data", default)]
    date: String,
    #[serde(default)]
    count: i64,
}

fn require_workspace_and_date(workspace: &str, date: &str) -> ApiResult<()> {
    if workspace.is_empty() || date.is_empty() {
        return Err(ApiError::invalid_input(
            "nomeWorkspace and data are required",
        ));
    }
    Ok(())
}

async fn update_minutos<S: Backend>(
    State(state): State<Arc<AppState<S>>>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let update: MinutesUpdateBody = decode_json(&body)?;
    require_workspace_and_date(&update.workspace, &update.date)?;

    state
        .storage
        .add_minutes(&update.workspace, &update.date, update.minutes)
        .await?;
    Ok(StatusCode::OK)
}

async fn add_response<S: Backend>(
    State(state): State<Arc<AppState<S>>>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let count: CountBody = decode_json(&body)?;
    require_workspace_and_date(&count.workspace, &count.date)?;

    state
        .storage
        .increment(
            &count.workspace,
            &count.date,
            CounterField::RequestsForwarded,
            count.count,
        )
        .await?;
    Ok(StatusCode::OK)
}

async fn count_image<S: Backend>(
    State(state): State<Arc<AppState<S>>>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let count: CountBody = decode_json(&body)?;
    require_workspace_and_date(&count.workspace, &count.date)?;

    state
        .storage
        .increment(
            &count.workspace,
            &count.date,
            CounterField::ImagesReceived,
            count.count,
        )
        .await?;
    Ok(StatusCode::OK)
}

// ============================================================
// Flow queue
// ============================================================

#[derive(Debug, Deserialize)]
struct FlowRequestBody {
    #[serde(default)]
    body: serde_json::Map<String, Value>,
    #[serde(rename = "userNs", default)]
    user_ns: String,
    #[serde(rename = "urlFlowise", default)]
    url: String,
}

/// POST /process - serialized upstream call for one namespace.
async fn flow_process<S: Backend>(
    State(state): State<Arc<AppState<S>>>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let request: FlowRequestBody = decode_json(&body)?;
    if request.user_ns.is_empty() {
        return Err(ApiError::invalid_input("userNs is required"));
    }
    if request.url.is_empty() {
        return Err(ApiError::invalid_input("urlFlowise is required"));
    }

    let response = state
        .flow
        .run(&request.user_ns, request.body, &request.url)
        .await?;
    Ok(Json(response))
}

// ============================================================
// Memoize
// ============================================================

#[derive(Debug, Deserialize)]
struct MemoizeRequestBody {
    #[serde(rename = "userNs", default)]
    user_ns: String,
    #[serde(rename = "apiExternaURL", default)]
    api_url: String,
    #[serde(default)]
    dados: serde_json::Map<String, Value>,
    #[serde(rename = "expiracaoSegundos", default)]
    ttl_secs: Option<u64>,
}

/// POST /requisicao - memoize-and-merge proxy call.
///
/// The upstream body bytes are passed through verbatim.
async fn memoize_request<S: Backend>(
    State(state): State<Arc<AppState<S>>>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let request: MemoizeRequestBody = decode_json(&body)?;
    if request.user_ns.is_empty() {
        return Err(ApiError::invalid_input("userNs is required"));
    }

    let api_url = if !request.api_url.is_empty() {
        request.api_url
    } else {
        state
            .upstream_fallback
            .clone()
            .ok_or_else(|| ApiError::invalid_input("apiExternaURL is required"))?
    };

    let response = state
        .memoize
        .process(&request.user_ns, &api_url, request.dados, request.ttl_secs)
        .await?;

    Ok(([(header::CONTENT_TYPE, "application/json")], response))
}
