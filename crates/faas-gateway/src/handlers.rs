//! Gateway HTTP routes.

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get, post};
use axum::Router;
use faas_common::{
    DeleteFunctionRequest, ExecutionResult, FaasError, FunctionDeployment, FunctionName,
    FunctionSummary, Headers, Invocation, InvocationMode,
};
use faas_orchestrator::FunctionResolver;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::alerts::{handle_alerts, AlertRequest};
use crate::async_client::AsyncQueueClient;
use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::proxy::SyncProxy;
use crate::queue::QueueBroker;
use crate::worker::CALL_ID_HEADER;

pub const FUNCTION_HEADER: &str = "x-function";
pub const CALLBACK_HEADER: &str = "x-callback-url";
pub const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Everything a request handler needs, built once at startup.
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub resolver: Arc<FunctionResolver>,
    pub proxy: Arc<SyncProxy>,
    pub queue: Arc<AsyncQueueClient>,
    pub metrics: Arc<Metrics>,
}

impl GatewayState {
    pub fn new(
        config: Arc<GatewayConfig>,
        resolver: Arc<FunctionResolver>,
        broker: Arc<dyn QueueBroker>,
        metrics: Arc<Metrics>,
    ) -> faas_common::Result<Self> {
        let proxy = Arc::new(SyncProxy::new(
            resolver.clone(),
            metrics.clone(),
            config.upstream_timeout,
        )?
        .with_max_response_bytes(config.max_body_bytes));
        let queue = Arc::new(AsyncQueueClient::new(broker, config.max_message_bytes));
        Ok(Self {
            config,
            resolver,
            proxy,
            queue,
            metrics,
        })
    }
}

type SharedState = Arc<GatewayState>;

pub fn create_app(state: SharedState) -> Router {
    Router::new()
        // Invocation
        .route("/function/*target", any(sync_invoke))
        .route("/async-function/*target", post(async_invoke))
        .route("/", post(header_invoke))
        // Function lifecycle
        .route(
            "/system/functions",
            get(list_functions)
                .post(deploy_function)
                .delete(delete_function),
        )
        .route("/system/alert", post(scale_alert))
        .route("/system/async-report", post(async_report))
        // Telemetry
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "OK" }))
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Request read timed out")]
    ReadTimeout,
    #[error(transparent)]
    Faas(#[from] FaasError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::ReadTimeout => (StatusCode::REQUEST_TIMEOUT, "request read timed out".into()),
            ApiError::Faas(e) => (
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                e.public_message().to_string(),
            ),
        };
        if status.is_server_error() {
            warn!(error = %self, %status, "Request failed");
        } else {
            debug!(error = %self, %status, "Request rejected");
        }

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Invocation
// ============================================================================

async fn sync_invoke(State(state): State<SharedState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let result = async {
        let (function, path) = split_target(parts.uri.path(), "/function/")?;
        let body = read_body(body, &parts.headers, &state.config).await?;
        let invocation = build_invocation(function, InvocationMode::Sync, &parts, path, body);
        Ok::<_, ApiError>(state.proxy.invoke(&invocation).await?)
    }
    .await;
    match result {
        Ok(result) => relay(result),
        Err(e) => e.into_response(),
    }
}

async fn header_invoke(State(state): State<SharedState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let result = async {
        let name = parts
            .headers
            .get(FUNCTION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::BadRequest("missing X-Function header".into()))?;
        let function = FunctionName::parse(name)?;
        let body = read_body(body, &parts.headers, &state.config).await?;
        let invocation =
            build_invocation(function, InvocationMode::Sync, &parts, "/".to_string(), body);
        Ok::<_, ApiError>(state.proxy.invoke(&invocation).await?)
    }
    .await;
    match result {
        Ok(result) => relay(result),
        Err(e) => e.into_response(),
    }
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
async fn async_invoke(
    State(state): State<SharedState>,
    request: Request,
) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();
    let (function, path) = split_target(parts.uri.path(), "/async-function/")?;
    let callback = parts
        .headers
        .get(CALLBACK_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    if let Some(url) = &callback {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ApiError::BadRequest(format!("callback url {url} is not http(s)")));
        }
    }
    let body = read_body(body, &parts.headers, &state.config).await?;
    let invocation = build_invocation(function, InvocationMode::Async, &parts, path, body)
        .with_callback(callback);

    let call_id = state.queue.enqueue(&invocation).await?;
    let mut response = StatusCode::ACCEPTED.into_response();
    if let Ok(value) = HeaderValue::from_str(&call_id) {
        response.headers_mut().insert(CALL_ID_HEADER, value);
    }
    Ok(response)
}

/// Split `/function/{name}/{rest}` into the function name and `/{rest}`.
fn split_target(path: &str, prefix: &str) -> Result<(FunctionName, String), ApiError> {
    let target = path
        .strip_prefix(prefix)
        .ok_or_else(|| ApiError::BadRequest(format!("path {path} outside {prefix}")))?;
    let (name, rest) = match target.split_once('/') {
        Some((name, rest)) => (name, format!("/{rest}")),
        None => (target, "/".to_string()),
    };
    Ok((FunctionName::parse(name)?, rest))
}

fn build_invocation(
    function: FunctionName,
    mode: InvocationMode,
    parts: &Parts,
    path: String,
    body: Bytes,
) -> Invocation {
    let headers: Headers = parts
        .headers
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_bytes().to_vec()))
        .collect();
    Invocation::new(function, mode, parts.method.as_str(), headers, body.to_vec())
        .with_path(path, parts.uri.query().map(str::to_string))
}

async fn read_body(body: Body, headers: &HeaderMap, config: &GatewayConfig) -> Result<Bytes, ApiError> {
    let limit = config.max_body_bytes;
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if let Some(declared) = declared {
        if declared > limit {
            return Err(FaasError::PayloadTooLarge {
                limit,
                actual: declared,
            }
            .into());
        }
    }

    match tokio::time::timeout(config.read_timeout, Limited::new(body, limit).collect()).await {
        Err(_) => Err(ApiError::ReadTimeout),
        Ok(Err(e)) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(FaasError::PayloadTooLarge {
                limit,
                actual: limit + 1,
            }
            .into())
        }
        Ok(Err(e)) => Err(ApiError::BadRequest(format!("unable to read body: {e}"))),
        Ok(Ok(collected)) => Ok(collected.to_bytes()),
    }
}

/// Turn a function's answer back into a response, status and headers intact.
fn relay(result: ExecutionResult) -> Response {
    let status = StatusCode::from_u16(result.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(Body::from(result.body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in result.headers.iter() {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => debug!(header = name, "Dropping unrepresentable response header"),
        }
    }
    response
}

// ============================================================================
// Function lifecycle
// ============================================================================

async fn list_functions(
    State(state): State<SharedState>,
) -> Result<Json<Vec<FunctionSummary>>, ApiError> {
    let mut functions = state.resolver.list_functions().await?;
    for function in &mut functions {
        function.invocation_count = state.metrics.invocation_count(&function.name);
    }
    Ok(Json(functions))
}

#[instrument(skip_all, fields(service = %deployment.service))]
async fn deploy_function(
    State(state): State<SharedState>,
    Json(deployment): Json<FunctionDeployment>,
) -> Result<StatusCode, ApiError> {
    FunctionName::parse(deployment.service.as_str())?;
    if deployment.image.trim().is_empty() {
        return Err(ApiError::BadRequest("image is required".into()));
    }
    state.resolver.deploy(deployment).await?;
    info!("Function deployed");
    Ok(StatusCode::ACCEPTED)
}

async fn delete_function(
    State(state): State<SharedState>,
    Json(request): Json<DeleteFunctionRequest>,
) -> Result<StatusCode, ApiError> {
    let name = FunctionName::parse(request.function_name)?;
    state.resolver.remove(&name).await?;
    state.metrics.forget_function(name.as_str());
    info!(function = %name, "Function removed");
    Ok(StatusCode::OK)
}

async fn scale_alert(
    State(state): State<SharedState>,
    Json(request): Json<AlertRequest>,
) -> Result<StatusCode, ApiError> {
    let outcome = handle_alerts(&state.resolver, &state.config.scaling, &request).await;
    if outcome.failed > 0 {
        return Err(FaasError::BackendUnavailable(format!(
            "{} of {} scale requests failed",
            outcome.failed,
            request.alerts.len()
        ))
        .into());
    }
    Ok(StatusCode::OK)
}

// ============================================================================
// Telemetry
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncReport {
    pub function_name: String,
    pub status_code: u16,
    /// Seconds.
    pub time_taken: f64,
}

async fn async_report(
    State(state): State<SharedState>,
    Json(report): Json<AsyncReport>,
) -> Result<StatusCode, ApiError> {
    let name = FunctionName::parse(report.function_name)?;
    // Only deployed functions get a series.
    state.resolver.resolve(&name).await?;
    state
        .metrics
        .record_async_report(name.as_str(), report.status_code, report.time_taken);
    Ok(StatusCode::ACCEPTED)
}

async fn metrics_handler(State(state): State<SharedState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)],
        state.metrics.render(),
    )
}
