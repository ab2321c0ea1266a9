use faas_common::{
    is_hop_by_hop, Endpoint, ExecutionResult, FaasError, Headers, Invocation, Result,
};
use faas_orchestrator::FunctionResolver;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use reqwest::Method;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::metrics::Metrics;

/// Metrics label for calls whose function name did not resolve. Callers pick
/// the name, so it never becomes a label of its own.
pub const UNRESOLVED_FUNCTION: &str = "_unresolved";

pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Forwards an invocation to its function and relays the answer verbatim.
///
/// Never retries: a retried call could run a non-idempotent function twice.
pub struct SyncProxy {
    client: reqwest::Client,
    resolver: Arc<FunctionResolver>,
    metrics: Arc<Metrics>,
    upstream_timeout: Duration,
    max_response_bytes: usize,
}

impl SyncProxy {
    pub fn new(
        resolver: Arc<FunctionResolver>,
        metrics: Arc<Metrics>,
        upstream_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| FaasError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            resolver,
            metrics,
            upstream_timeout,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        })
    }

    /// Largest function response relayed; bigger ones fail with
    /// `ResponseTooLarge`.
    pub fn with_max_response_bytes(mut self, limit: usize) -> Self {
        self.max_response_bytes = limit;
        self
    }

    pub fn resolver(&self) -> &Arc<FunctionResolver> {
        &self.resolver
    }

    /// Resolve, forward and record one sample whatever the outcome.
    #[instrument(skip(self, invocation), fields(function = %invocation.function, call_id = %invocation.call_id, mode = invocation.mode.as_str()))]
    pub async fn invoke(&self, invocation: &Invocation) -> Result<ExecutionResult> {
        let started = Instant::now();
        let endpoint = match self.resolver.resolve(&invocation.function).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.metrics.record_invocation(
                    UNRESOLVED_FUNCTION,
                    invocation.mode,
                    e.status_code(),
                    started.elapsed(),
                );
                return Err(e);
            }
        };
        let outcome = self.forward(invocation, &endpoint, started).await;
        let code = match &outcome {
            Ok(result) => result.status,
            Err(e) => e.status_code(),
        };
        self.metrics.record_invocation(
            invocation.function.as_str(),
            invocation.mode,
            code,
            started.elapsed(),
        );
        outcome
    }

    async fn forward(
        &self,
        invocation: &Invocation,
        endpoint: &Endpoint,
        started: Instant,
    ) -> Result<ExecutionResult> {
        let url = endpoint.url_for(&invocation.path, invocation.query.as_deref());
        let method = Method::from_bytes(invocation.method.as_bytes())
            .map_err(|_| FaasError::InvalidRequest(format!("method {}", invocation.method)))?;

        let mut request = self
            .client
            .request(method, &url)
            .timeout(self.upstream_timeout)
            .body(invocation.body.clone());
        for (name, value) in invocation.headers.end_to_end().iter() {
            request = request.header(name, value);
        }

        debug!(%url, "Forwarding invocation");
        let response = request
            .send()
            .await
            .map_err(|e| upstream_error(&url, e))?;
        let status = response.status().as_u16();
        let headers: Headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .map(|(name, value)| (name.as_str(), value.as_bytes().to_vec()))
            .collect();
        let body = self.read_response(&url, response).await?;

        Ok(ExecutionResult {
            status,
            headers,
            body,
            duration: started.elapsed(),
            error: None,
        })
    }

    async fn read_response(&self, url: &str, response: reqwest::Response) -> Result<Vec<u8>> {
        let limit = self.max_response_bytes;
        let too_large = || {
            warn!(%url, limit, "Function response too large");
            FaasError::ResponseTooLarge { limit }
        };
        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(too_large());
        }

        let body = axum::http::Response::from(response).into_body();
        match Limited::new(body, limit).collect().await {
            Ok(collected) => Ok(collected.to_bytes().to_vec()),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(too_large()),
            Err(e) => match e.downcast::<reqwest::Error>() {
                Ok(e) => Err(upstream_error(url, *e)),
                Err(e) => Err(FaasError::Unreachable(format!("{url}: {e}"))),
            },
        }
    }
}

fn upstream_error(url: &str, err: reqwest::Error) -> FaasError {
    if err.is_timeout() {
        warn!(%url, error = %err, "Function call timed out");
        FaasError::Timeout(format!("{url}: {err}"))
    } else {
        warn!(%url, error = %err, "Function unreachable");
        FaasError::Unreachable(format!("{url}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::any;
    use axum::Router;
    use faas_common::{FunctionBackend, FunctionName, InvocationMode};
    use faas_orchestrator::InMemoryBackend;
    use std::net::SocketAddr;

    async fn spawn_function(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn proxy_for(table: &str, timeout: Duration) -> (SyncProxy, Arc<Metrics>) {
        let backend: Arc<dyn FunctionBackend> =
            Arc::new(InMemoryBackend::from_table(table, 8080).unwrap());
        let resolver = Arc::new(FunctionResolver::new(backend, Duration::from_secs(1)));
        let metrics = Arc::new(Metrics::new());
        (
            SyncProxy::new(resolver, metrics.clone(), timeout).unwrap(),
            metrics,
        )
    }

    fn invocation(name: &str, body: &str) -> Invocation {
        Invocation::new(
            FunctionName::parse(name).unwrap(),
            InvocationMode::Sync,
            "POST",
            Headers::from_iter([("x-trace", "abc"), ("connection", "close")]),
            body.as_bytes().to_vec(),
        )
    }

    #[tokio::test]
    async fn test_relays_status_headers_and_body() {
        let addr = spawn_function(Router::new().route(
            "/",
            any(|headers: HeaderMap, body: Bytes| async move {
                let trace = headers
                    .get("x-trace")
                    .map(|v| v.to_str().unwrap().to_string())
                    .unwrap_or_default();
                let leaked = headers.contains_key("connection");
                (
                    StatusCode::CREATED,
                    [("x-echo-trace", trace), ("x-saw-connection", leaked.to_string())],
                    body,
                )
            }),
        ))
        .await;
        let (proxy, metrics) = proxy_for(&format!("echo=http://{addr}"), Duration::from_secs(5));

        let result = proxy.invoke(&invocation("echo", "hello")).await.unwrap();
        assert_eq!(result.status, 201);
        assert_eq!(result.body, b"hello");
        assert_eq!(result.headers.get_str("x-echo-trace"), Some("abc"));
        assert_eq!(result.headers.get_str("x-saw-connection"), Some("false"));
        assert_eq!(metrics.invocations("echo", 201, InvocationMode::Sync), 1);
    }

    #[tokio::test]
    async fn test_forwards_sub_path_and_query() {
        let addr = spawn_function(Router::new().route(
            "/orders/:id",
            any(|uri: axum::http::Uri| async move { uri.to_string() }),
        ))
        .await;
        let (proxy, _) = proxy_for(&format!("shop=http://{addr}"), Duration::from_secs(5));
        let call = invocation("shop", "").with_path("/orders/7", Some("full=1".into()));
        let result = proxy.invoke(&call).await.unwrap();
        assert_eq!(result.body, b"/orders/7?full=1");
    }

    #[tokio::test]
    async fn test_unknown_function_is_404_and_recorded() {
        let (proxy, metrics) = proxy_for("", Duration::from_secs(5));
        let err = proxy.invoke(&invocation("ghost", "x")).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
        assert_eq!(
            metrics.invocations(UNRESOLVED_FUNCTION, 404, InvocationMode::Sync),
            1
        );
        assert_eq!(metrics.invocation_count("ghost"), 0);
    }

    #[tokio::test]
    async fn test_unknown_names_share_one_series() {
        let (proxy, metrics) = proxy_for("", Duration::from_secs(5));
        for i in 0..50 {
            let name = format!("random-{i}");
            assert!(proxy.invoke(&invocation(&name, "x")).await.is_err());
        }
        assert_eq!(
            metrics.invocations(UNRESOLVED_FUNCTION, 404, InvocationMode::Sync),
            50
        );
        let text = metrics.render();
        assert!(!text.contains("random-"));
    }

    #[tokio::test]
    async fn test_no_hop_by_hop_header_crosses_the_gateway() {
        let sent = [
            ("connection", "x-caller"),
            ("keep-alive", "timeout=99"),
            ("proxy-authenticate", "Basic caller"),
            ("proxy-authorization", "Basic Y2FsbGVy"),
            ("te", "trailers"),
            ("trailer", "x-caller"),
            ("transfer-encoding", "gzip"),
            ("upgrade", "h2c"),
            ("host", "caller.invalid"),
            ("content-length", "999"),
        ];
        let addr = spawn_function(Router::new().route(
            "/",
            any(move |headers: HeaderMap| async move {
                let leaked: Vec<&str> = sent
                    .iter()
                    .filter(|(name, value)| {
                        headers.get(*name).and_then(|v| v.to_str().ok()) == Some(*value)
                    })
                    .map(|(name, _)| *name)
                    .collect();
                (
                    [
                        ("keep-alive", "timeout=5"),
                        ("proxy-authenticate", "Basic function"),
                        ("x-kept", "yes"),
                    ],
                    leaked.join(","),
                )
            }),
        ))
        .await;
        let (proxy, _) = proxy_for(&format!("echo=http://{addr}"), Duration::from_secs(5));

        let mut headers = Headers::from_iter(sent);
        headers.append("x-trace", "abc");
        let call = Invocation::new(
            FunctionName::parse("echo").unwrap(),
            InvocationMode::Sync,
            "POST",
            headers,
            b"hello".to_vec(),
        );
        let result = proxy.invoke(&call).await.unwrap();
        assert_eq!(result.status, 200);
        assert_eq!(String::from_utf8(result.body).unwrap(), "");
        for name in ["keep-alive", "proxy-authenticate"] {
            assert!(result.headers.get_str(name).is_none(), "{name} relayed");
        }
        assert_eq!(result.headers.get_str("x-kept"), Some("yes"));
    }

    #[tokio::test]
    async fn test_oversized_function_response_is_rejected() {
        let addr = spawn_function(Router::new().route("/", any(|| async { "x".repeat(64) })))
            .await;
        let (proxy, metrics) = proxy_for(&format!("big=http://{addr}"), Duration::from_secs(5));
        let proxy = proxy.with_max_response_bytes(16);

        let err = proxy.invoke(&invocation("big", "x")).await.unwrap_err();
        assert!(matches!(err, FaasError::ResponseTooLarge { limit: 16 }));
        assert_eq!(err.status_code(), 502);
        assert_eq!(metrics.invocations("big", 502, InvocationMode::Sync), 1);

        let roomy = proxy.with_max_response_bytes(64);
        let result = roomy.invoke(&invocation("big", "x")).await.unwrap();
        assert_eq!(result.body.len(), 64);
    }

    #[tokio::test]
    async fn test_refused_connection_is_502() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (proxy, _) = proxy_for(&format!("down=http://{addr}"), Duration::from_secs(5));
        let err = proxy.invoke(&invocation("down", "x")).await.unwrap_err();
        assert!(matches!(err, FaasError::Unreachable(_)));
        assert_eq!(err.status_code(), 502);
    }

    #[tokio::test]
    async fn test_slow_function_is_504() {
        let addr = spawn_function(Router::new().route(
            "/",
            any(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                "late"
            }),
        ))
        .await;
        let (proxy, metrics) = proxy_for(&format!("slow=http://{addr}"), Duration::from_millis(300));
        let err = proxy.invoke(&invocation("slow", "x")).await.unwrap_err();
        assert_eq!(err.status_code(), 504);
        assert_eq!(metrics.invocations("slow", 504, InvocationMode::Sync), 1);
    }
}
