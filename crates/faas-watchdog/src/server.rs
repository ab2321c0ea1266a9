use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use faas_common::FaasError;
use faas_executor::{ExecutionMode, ExecutionRequest, ProcessExecutor, ProcessOutput};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::config::WatchdogConfig;
use crate::lifecycle::Lifecycle;
use crate::readiness::{ReadinessMarker, INSTANCE_HEADER};

pub const DURATION_HEADER: &str = "x-duration-seconds";

#[derive(Clone)]
pub struct WatchdogApp {
    config: Arc<WatchdogConfig>,
    executor: Arc<dyn ProcessExecutor>,
    lifecycle: Lifecycle,
    limiter: Option<Arc<Semaphore>>,
    marker: Option<ReadinessMarker>,
    instance: Arc<str>,
}

impl WatchdogApp {
    pub fn new(
        config: WatchdogConfig,
        executor: Arc<dyn ProcessExecutor>,
        lifecycle: Lifecycle,
    ) -> Self {
        let limiter = config.max_inflight.map(|n| Arc::new(Semaphore::new(n)));
        let marker =
            (!config.suppress_lock).then(|| ReadinessMarker::new(config.lock_path.clone()));
        Self {
            config: Arc::new(config),
            executor,
            lifecycle,
            limiter,
            marker,
            instance: uuid::Uuid::new_v4().to_string().into(),
        }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn marker(&self) -> Option<&ReadinessMarker> {
        self.marker.as_ref()
    }

    /// Identifies this watchdog in its health answers.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn executor(&self) -> &Arc<dyn ProcessExecutor> {
        &self.executor
    }
}

pub fn router(app: WatchdogApp) -> Router {
    Router::new()
        .route("/_/health", get(health_handler))
        .fallback(invoke_handler)
        .with_state(app)
}

async fn health_handler(State(app): State<WatchdogApp>) -> Response {
    let marker_in_place = app.marker.as_ref().map_or(true, ReadinessMarker::exists);
    let status = if app.lifecycle.state().is_ready() && marker_in_place {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, [(INSTANCE_HEADER, app.instance.to_string())]).into_response()
}

#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
async fn invoke_handler(State(app): State<WatchdogApp>, request: Request) -> Response {
    let Some(_inflight) = app.lifecycle.begin_request() else {
        return plain(StatusCode::SERVICE_UNAVAILABLE, "watchdog shutting down");
    };
    let _permit = match &app.limiter {
        Some(limiter) => match limiter.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                warn!("Concurrency limit reached, rejecting request");
                return plain(StatusCode::TOO_MANY_REQUESTS, "concurrency limit reached");
            }
        },
        None => None,
    };

    let (parts, body) = request.into_parts();
    let input = match read_body(body, &parts.headers, &app.config).await {
        Ok(input) => input,
        Err(rejection) => return rejection,
    };
    if app.config.write_debug {
        debug!(input_bytes = input.len(), "Request body read");
    }

    let mut execution = ExecutionRequest::new(input.to_vec());
    if app.config.mode == ExecutionMode::ForkPerRequest {
        execution.env = request_env(&parts);
    }

    let started = Instant::now();
    // Dropping the execute future on write timeout kills the process.
    let outcome =
        tokio::time::timeout(app.config.write_timeout, app.executor.execute(execution)).await;
    let elapsed = started.elapsed();

    match outcome {
        Err(_) => {
            warn!(limit = ?app.config.write_timeout, "Write timeout exceeded, process killed");
            error_response(&FaasError::Timeout("write timeout".into()), elapsed)
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Function execution failed");
            error_response(&FaasError::from(e), elapsed)
        }
        Ok(Ok(output)) => render_output(&app.config, &parts.headers, output, elapsed),
    }
}

async fn read_body(
    body: Body,
    headers: &HeaderMap,
    config: &WatchdogConfig,
) -> Result<Bytes, Response> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if let Some(declared) = declared {
        if declared > config.max_body_bytes {
            warn!(declared, limit = config.max_body_bytes, "Request body too large");
            return Err(plain(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"));
        }
    }

    let limited = Limited::new(body, config.max_body_bytes);
    match tokio::time::timeout(config.read_timeout, limited.collect()).await {
        Err(_) => Err(plain(StatusCode::REQUEST_TIMEOUT, "request read timed out")),
        Ok(Err(e)) if e.downcast_ref::<LengthLimitError>().is_some() => {
            warn!(limit = config.max_body_bytes, "Request body too large");
            Err(plain(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"))
        }
        Ok(Err(e)) => {
            debug!(error = %e, "Failed to read request body");
            Err(plain(StatusCode::BAD_REQUEST, "unable to read request body"))
        }
        Ok(Ok(collected)) => Ok(collected.to_bytes()),
    }
}

fn render_output(
    config: &WatchdogConfig,
    request_headers: &HeaderMap,
    output: ProcessOutput,
    elapsed: Duration,
) -> Response {
    if config.write_debug && !output.stderr.is_empty() {
        info!(stderr = %String::from_utf8_lossy(&output.stderr), "Function stderr");
    }
    if !output.success() {
        warn!(exit_code = ?output.exit_code, "Function exited unsuccessfully");
        return error_response(&FaasError::ExecutionFailure("non-zero exit".into()), elapsed);
    }

    let mut body = output.stdout;
    if config.combine_output {
        body.extend_from_slice(&output.stderr);
    }
    if config.write_debug {
        info!(stdout = %String::from_utf8_lossy(&body), "Function stdout");
    }

    let mut response = (StatusCode::OK, body).into_response();
    let content_type = config
        .content_type
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
        .or_else(|| request_headers.get(header::CONTENT_TYPE).cloned());
    let headers = response.headers_mut();
    match content_type {
        Some(value) => {
            headers.insert(header::CONTENT_TYPE, value);
        }
        None => {
            headers.remove(header::CONTENT_TYPE);
        }
    }
    insert_duration(headers, elapsed);
    response
}

fn error_response(err: &FaasError, elapsed: Duration) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = plain(status, err.public_message());
    insert_duration(response.headers_mut(), elapsed);
    response
}

fn plain(status: StatusCode, message: &'static str) -> Response {
    (status, message).into_response()
}

fn insert_duration(headers: &mut HeaderMap, elapsed: Duration) {
    if let Ok(value) = HeaderValue::from_str(&format!("{:.6}", elapsed.as_secs_f64())) {
        headers.insert(DURATION_HEADER, value);
    }
}

/// Request metadata handed to fork-mode processes as environment variables.
fn request_env(parts: &Parts) -> Vec<(String, String)> {
    let mut env = vec![
        ("Http_Method".to_string(), parts.method.to_string()),
        ("Http_Path".to_string(), parts.uri.path().to_string()),
    ];
    if let Some(query) = parts.uri.query() {
        env.push(("Http_Query".to_string(), query.to_string()));
    }
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            env.push((format!("Http_{}", env_header_name(name.as_str())), value.to_string()));
        }
    }
    env
}

/// `content-type` -> `Content_Type`
fn env_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use faas_executor::{build_executor, ProcessCommand};
    use tower::ServiceExt;

    fn sh(script: &str) -> ProcessCommand {
        ProcessCommand::new("sh").arg("-c").arg(script)
    }

    fn app_with(config: WatchdogConfig) -> WatchdogApp {
        let executor = build_executor(config.executor_config());
        let lifecycle = Lifecycle::new();
        lifecycle.mark_ready();
        WatchdogApp::new(config, executor, lifecycle)
    }

    fn test_config(process: ProcessCommand) -> WatchdogConfig {
        let mut config = WatchdogConfig::new(process);
        config.suppress_lock = true;
        config
    }

    fn post(uri: &str, body: impl Into<Body>) -> Request {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(body.into())
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_echoes_body_through_process() {
        let app = app_with(test_config(ProcessCommand::new("cat")));
        let response = router(app)
            .oneshot(post("/", "hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(DURATION_HEADER));
        assert_eq!(body_bytes(response).await, "hello");
    }

    #[tokio::test]
    async fn test_any_method_and_path_invokes() {
        let app = app_with(test_config(sh(
            "cat >/dev/null; printf '%s %s %s' \"$Http_Method\" \"$Http_Path\" \"$Http_Query\"",
        )));
        let request = Request::builder()
            .method("PUT")
            .uri("/orders/7?verbose=1")
            .body(Body::empty())
            .unwrap();
        let response = router(app).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, "PUT /orders/7 verbose=1");
    }

    #[tokio::test]
    async fn test_headers_become_env() {
        let app = app_with(test_config(sh("cat >/dev/null; printf %s \"$Http_X_Request_Tag\"")));
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header("x-request-tag", "blue")
            .body(Body::empty())
            .unwrap();
        let response = router(app).oneshot(request).await.unwrap();
        assert_eq!(body_bytes(response).await, "blue");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_generic_500() {
        let app = app_with(test_config(sh(
            "cat >/dev/null; echo 'db password is hunter2' >&2; exit 3",
        )));
        let response = router(app).oneshot(post("/", "x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_bytes(response).await;
        assert_eq!(body, "function execution failed");
    }

    #[tokio::test]
    async fn test_oversized_body_rejected_before_fork() {
        let mut config = test_config(ProcessCommand::new("cat"));
        config.max_body_bytes = 8;
        let app = app_with(config);

        let response = router(app.clone())
            .oneshot(post("/", "this body is far too long"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(app.executor().stats().starts, 0);
    }

    #[tokio::test]
    async fn test_oversized_streamed_body_rejected_before_fork() {
        let mut config = test_config(ProcessCommand::new("cat"));
        config.max_body_bytes = 8;
        let app = app_with(config);

        let chunks: Vec<Result<&'static str, std::io::Error>> =
            vec![Ok("0123"), Ok("4567"), Ok("89ab")];
        let body = Body::from_stream(futures::stream::iter(chunks));
        let response = router(app.clone()).oneshot(post("/", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(app.executor().stats().starts, 0);
    }

    #[tokio::test]
    async fn test_write_timeout_kills_slow_process() {
        let mut config = test_config(sh("cat >/dev/null; sleep 30"));
        config.write_timeout = Duration::from_millis(300);
        let app = app_with(config);

        let started = Instant::now();
        let response = router(app.clone()).oneshot(post("/", "x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(app.executor().stats().active, 0);
    }

    #[tokio::test]
    async fn test_concurrency_ceiling_returns_429() {
        let mut config = test_config(sh("cat >/dev/null; sleep 1; printf done"));
        config.max_inflight = Some(1);
        let app = app_with(config);
        let router = router(app);

        let slow = tokio::spawn(router.clone().oneshot(post("/", "first")));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let rejected = router.clone().oneshot(post("/", "second")).await.unwrap();
        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);

        let first = slow.await.unwrap().unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(body_bytes(first).await, "done");
    }

    #[tokio::test]
    async fn test_content_type_override_and_echo() {
        let mut config = test_config(ProcessCommand::new("cat"));
        config.content_type = Some("application/json".into());
        let app = app_with(config);
        let response = router(app).oneshot(post("/", "{}")).await.unwrap();
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let app = app_with(test_config(ProcessCommand::new("cat")));
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header(header::CONTENT_TYPE, "text/csv")
            .body(Body::from("a,b"))
            .unwrap();
        let response = router(app).oneshot(request).await.unwrap();
        assert_eq!(response.headers().get(header::CONTENT_TYPE).unwrap(), "text/csv");
    }

    #[tokio::test]
    async fn test_combine_output_appends_stderr() {
        let mut config = test_config(sh("cat; printf warn >&2"));
        config.combine_output = true;
        let app = app_with(config);
        let response = router(app).oneshot(post("/", "out-")).await.unwrap();
        assert_eq!(body_bytes(response).await, "out-warn");
    }

    #[tokio::test]
    async fn test_health_reflects_lifecycle_and_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WatchdogConfig::new(ProcessCommand::new("cat"));
        config.lock_path = dir.path().join(".lock");
        let executor = build_executor(config.executor_config());
        let lifecycle = Lifecycle::new();
        let app = WatchdogApp::new(config, executor, lifecycle.clone());
        let health = || {
            Request::builder()
                .uri("/_/health")
                .body(Body::empty())
                .unwrap()
        };

        let response = router(app.clone()).oneshot(health()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[INSTANCE_HEADER], app.instance());
        let other = WatchdogApp::new(
            WatchdogConfig::new(ProcessCommand::new("cat")),
            build_executor(WatchdogConfig::new(ProcessCommand::new("cat")).executor_config()),
            Lifecycle::new(),
        );
        assert_ne!(other.instance(), app.instance());

        lifecycle.mark_ready();
        let response = router(app.clone()).oneshot(health()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        std::fs::write(dir.path().join(".lock"), b"").unwrap();
        let response = router(app.clone()).oneshot(health()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        lifecycle.begin_shutdown();
        let response = router(app.clone()).oneshot(health()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let response = router(app).oneshot(post("/", "x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_env_header_name() {
        assert_eq!(env_header_name("content-type"), "Content_Type");
        assert_eq!(env_header_name("x-callback-url"), "X_Callback_Url");
        assert_eq!(env_header_name("accept"), "Accept");
    }
}
