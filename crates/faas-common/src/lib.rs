// Re-export dependencies used in public interfaces of common types

use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid;

mod encoding;
pub mod env;
mod headers;
mod message;
mod types;

pub use headers::{is_hop_by_hop, Headers};
pub use message::QueueMessage;
pub use types::*;

#[derive(Error, Debug)]
pub enum FaasError {
    #[error("Function not found: {0}")]
    NotFound(String),

    #[error("Invalid function name: {0}")]
    InvalidFunctionName(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Function unreachable: {0}")]
    Unreachable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    #[error("Enqueue failed: {0}")]
    EnqueueFailure(String),

    #[error("Callback failed: {0}")]
    CallbackFailure(String),

    #[error("Payload of {actual} bytes exceeds the limit of {limit} bytes")]
    PayloadTooLarge { limit: usize, actual: usize },

    #[error("Function response exceeds the limit of {limit} bytes")]
    ResponseTooLarge { limit: usize },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl FaasError {
    /// HTTP status a caller sees for this kind of failure.
    pub fn status_code(&self) -> u16 {
        match self {
            FaasError::NotFound(_) => 404,
            FaasError::InvalidFunctionName(_) | FaasError::InvalidRequest(_) => 400,
            FaasError::PayloadTooLarge { .. } => 413,
            FaasError::BackendUnavailable(_) => 503,
            FaasError::Unreachable(_) | FaasError::ResponseTooLarge { .. } => 502,
            FaasError::Timeout(_) => 504,
            FaasError::ExecutionFailure(_)
            | FaasError::EnqueueFailure(_)
            | FaasError::CallbackFailure(_)
            | FaasError::Config(_)
            | FaasError::Io(_)
            | FaasError::Internal(_) => 500,
        }
    }

    /// Fixed message safe to hand back to callers. Internal detail stays in the logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            FaasError::NotFound(_) => "function not found",
            FaasError::InvalidFunctionName(_) => "invalid function name",
            FaasError::InvalidRequest(_) => "invalid request",
            FaasError::PayloadTooLarge { .. } => "request body too large",
            FaasError::BackendUnavailable(_) => "function backend unavailable",
            FaasError::Unreachable(_) => "function unreachable",
            FaasError::ResponseTooLarge { .. } => "function response too large",
            FaasError::Timeout(_) => "function timed out",
            FaasError::ExecutionFailure(_) => "function execution failed",
            FaasError::EnqueueFailure(_) => "unable to queue request",
            FaasError::CallbackFailure(_) => "callback failed",
            FaasError::Config(_) | FaasError::Io(_) | FaasError::Internal(_) => {
                "internal server error"
            }
        }
    }
}

// Define the primary Result type for FaaS operations
pub type Result<T> = std::result::Result<T, FaasError>;

/// Read/write view of the platform that places function containers.
///
/// Implementations only report and request; scheduling stays with the
/// orchestrator behind them.
#[async_trait]
pub trait FunctionBackend: Send + Sync {
    async fn list_functions(&self) -> Result<Vec<FunctionSummary>>;

    /// Network endpoint that reaches a live replica of `name`.
    async fn endpoint(&self, name: &FunctionName) -> Result<Endpoint>;

    async fn replicas(&self, name: &FunctionName) -> Result<ReplicaCounts>;

    async fn deploy(&self, deployment: FunctionDeployment) -> Result<()>;

    async fn remove(&self, name: &FunctionName) -> Result<()>;

    /// Request a new desired replica count.
    async fn scale(&self, name: &FunctionName, replicas: u64) -> Result<()>;
}
