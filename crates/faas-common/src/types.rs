use std::collections::HashMap;
use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::encoding::{base64_bytes, duration_millis};
use crate::{FaasError, Headers, Result};

/// Validated function identity. Only `[-a-zA-Z_0-9]` is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FunctionName(String);

impl FunctionName {
    pub fn parse(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(name))
        } else {
            Err(FaasError::InvalidFunctionName(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FunctionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for FunctionName {
    type Error = FaasError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<FunctionName> for String {
    fn from(name: FunctionName) -> Self {
        name.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationMode {
    Sync,
    Async,
}

impl InvocationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationMode::Sync => "sync",
            InvocationMode::Async => "async",
        }
    }
}

/// One admitted request to run a function. Fully described before dispatch
/// and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub call_id: String,
    pub function: FunctionName,
    pub method: String,
    /// Path forwarded to the function, always starting with `/`.
    pub path: String,
    pub query: Option<String>,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub received_at: DateTime<Utc>,
    pub mode: InvocationMode,
    pub callback_url: Option<String>,
}

impl Invocation {
    pub fn new(
        function: FunctionName,
        mode: InvocationMode,
        method: impl Into<String>,
        headers: Headers,
        body: Vec<u8>,
    ) -> Self {
        Self {
            call_id: uuid::Uuid::new_v4().to_string(),
            function,
            method: method.into(),
            path: "/".to_string(),
            query: None,
            headers,
            body,
            received_at: Utc::now(),
            mode,
            callback_url: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>, query: Option<String>) -> Self {
        let path = path.into();
        self.path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        self.query = query.filter(|q| !q.is_empty());
        self
    }

    pub fn with_callback(mut self, callback_url: Option<String>) -> Self {
        self.callback_url = callback_url;
        self
    }
}

/// Outcome of running a function once. Produced and consumed in-flight, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: u16,
    pub headers: Headers,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status)
    }

    /// Result standing in for a function that was never reached.
    pub fn from_error(err: &FaasError, duration: Duration) -> Self {
        Self {
            status: err.status_code(),
            headers: Headers::new(),
            body: Vec::new(),
            duration,
            error: Some(err.to_string()),
        }
    }
}

impl Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ExecutionResult(status: {}, body: {} bytes, duration: {:?}, error: {:?})",
            self.status,
            self.body.len(),
            self.duration,
            self.error
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicaCounts {
    pub current: u64,
    pub desired: u64,
}

/// Point-in-time replica reading, superseded by the next poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSample {
    pub function: FunctionName,
    pub current: u64,
    pub desired: u64,
    pub sampled_at: DateTime<Utc>,
}

impl ReplicaSample {
    pub fn new(function: FunctionName, counts: ReplicaCounts) -> Self {
        Self {
            function,
            current: counts.current,
            desired: counts.desired,
            sampled_at: Utc::now(),
        }
    }
}

/// Base URL of a reachable function replica, e.g. `http://echo:8080`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    base_url: String,
}

impl Endpoint {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_host(host: &str, port: u16) -> Self {
        Self::new(format!("http://{host}:{port}"))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url_for(&self, path: &str, query: Option<&str>) -> String {
        let mut url = format!("{}{}", self.base_url, path);
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

/// Function as listed by `GET /system/functions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSummary {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub invocation_count: u64,
    pub replicas: u64,
    pub available_replicas: u64,
    pub env_process: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Deployment request accepted by `POST /system/functions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDeployment {
    pub service: String,
    pub image: String,
    pub env_process: Option<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    pub network: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteFunctionRequest {
    pub function_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_name_validation() {
        assert!(FunctionName::parse("echo").is_ok());
        assert!(FunctionName::parse("nodeinfo-2_b").is_ok());
        assert!(FunctionName::parse("").is_err());
        assert!(FunctionName::parse("../etc").is_err());
        assert!(FunctionName::parse("a b").is_err());
        assert!(matches!(
            FunctionName::parse("a/b"),
            Err(FaasError::InvalidFunctionName(_))
        ));
    }

    #[test]
    fn test_function_name_rejected_on_deserialize() {
        let ok: FunctionName = serde_json::from_str("\"echo\"").unwrap();
        assert_eq!(ok.as_str(), "echo");
        assert!(serde_json::from_str::<FunctionName>("\"bad name\"").is_err());
    }

    #[test]
    fn test_endpoint_url_building() {
        let endpoint = Endpoint::new("http://echo:8080/");
        assert_eq!(endpoint.url_for("/", None), "http://echo:8080/");
        assert_eq!(
            endpoint.url_for("/sub/path", Some("a=1&b=2")),
            "http://echo:8080/sub/path?a=1&b=2"
        );
        assert_eq!(Endpoint::from_host("echo", 8080), Endpoint::new("http://echo:8080"));
    }

    #[test]
    fn test_invocation_path_is_normalised() {
        let name = FunctionName::parse("echo").unwrap();
        let inv = Invocation::new(name, InvocationMode::Sync, "POST", Headers::new(), vec![])
            .with_path("nested", Some(String::new()));
        assert_eq!(inv.path, "/nested");
        assert_eq!(inv.query, None);
    }

    #[test]
    fn test_result_from_error_carries_status() {
        let result = ExecutionResult::from_error(
            &FaasError::NotFound("echo".into()),
            Duration::from_millis(3),
        );
        assert_eq!(result.status, 404);
        assert!(!result.is_success());
        assert!(result.body.is_empty());
    }

    #[test]
    fn test_deployment_uses_camel_case() {
        let json = r#"{"service":"echo","image":"functions/echo","envProcess":"cat"}"#;
        let deployment: FunctionDeployment = serde_json::from_str(json).unwrap();
        assert_eq!(deployment.env_process.as_deref(), Some("cat"));
        assert!(deployment.env_vars.is_empty());
    }
}
