use async_trait::async_trait;
use faas_common::FaasError;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

mod child;
pub mod command;
pub mod fork;
pub mod persistent;

pub use child::ExecutorStats;
pub use command::ProcessCommand;
pub use fork::ForkExecutor;
pub use persistent::PersistentExecutor;

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Process start failed: {0}")]
    StartFailure(#[source] std::io::Error),
    #[error("Process exceeded execution deadline of {0:?}")]
    Timeout(Duration),
    #[error("Writing process input failed: {0}")]
    WriteFailure(#[source] std::io::Error),
    #[error("Reading process output failed: {0}")]
    ReadFailure(#[source] std::io::Error),
    #[error("Input of {actual} bytes exceeds the limit of {limit} bytes")]
    InputTooLarge { limit: usize, actual: usize },
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

impl From<ExecutorError> for FaasError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Timeout(limit) => {
                FaasError::Timeout(format!("process killed after {limit:?}"))
            }
            ExecutorError::InputTooLarge { limit, actual } => {
                FaasError::PayloadTooLarge { limit, actual }
            }
            ExecutorError::InvalidCommand(msg) => FaasError::Config(msg),
            other => FaasError::ExecutionFailure(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// How the function process is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// A fresh process per request; input on stdin, output from stdout.
    #[default]
    ForkPerRequest,
    /// One long-lived process exchanging length-prefixed frames.
    Persistent,
}

impl FromStr for ExecutionMode {
    type Err = ExecutorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "fork" | "fork-per-request" => Ok(ExecutionMode::ForkPerRequest),
            "persistent" | "streaming" => Ok(ExecutionMode::Persistent),
            other => Err(ExecutorError::InvalidCommand(format!(
                "unknown execution mode '{other}'"
            ))),
        }
    }
}

/// Input for a single run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub input: Vec<u8>,
    /// Extra environment for this run. Ignored by the persistent executor.
    pub env: Vec<(String, String)>,
}

impl ExecutionRequest {
    pub fn new(input: impl Into<Vec<u8>>) -> Self {
        Self {
            input: input.into(),
            env: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub command: ProcessCommand,
    pub mode: ExecutionMode,
    /// Hard deadline per run. `None` disables it.
    pub exec_timeout: Option<Duration>,
    pub max_input_bytes: Option<usize>,
}

#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ProcessOutput>;

    fn stats(&self) -> ExecutorStats;
}

pub fn build_executor(config: ExecutorConfig) -> Arc<dyn ProcessExecutor> {
    match config.mode {
        ExecutionMode::ForkPerRequest => Arc::new(ForkExecutor::new(
            config.command,
            config.exec_timeout,
            config.max_input_bytes,
        )),
        ExecutionMode::Persistent => Arc::new(PersistentExecutor::new(
            config.command,
            config.exec_timeout,
            config.max_input_bytes,
        )),
    }
}

pub(crate) fn check_input_limit(limit: Option<usize>, actual: usize) -> Result<()> {
    match limit {
        Some(limit) if actual > limit => Err(ExecutorError::InputTooLarge { limit, actual }),
        _ => Ok(()),
    }
}
