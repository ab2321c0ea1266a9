use std::path::PathBuf;
use std::time::Duration;

use faas_common::env::EnvReader;
use faas_executor::{ExecutionMode, ExecutorConfig, ProcessCommand};

use crate::{Result, WatchdogError};

pub const DEFAULT_LOCK_PATH: &str = "/tmp/.lock";
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Watchdog settings, read from the environment the function container sets.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub process: ProcessCommand,
    pub port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Hard per-run deadline; `None` leaves only `write_timeout` in force.
    pub exec_timeout: Option<Duration>,
    pub suppress_lock: bool,
    pub lock_path: PathBuf,
    pub mode: ExecutionMode,
    /// `None` means unbounded.
    pub max_inflight: Option<usize>,
    pub max_body_bytes: usize,
    /// Log function stderr and request sizes.
    pub write_debug: bool,
    /// Fixed response content type. Otherwise the request's is echoed.
    pub content_type: Option<String>,
    /// Append stderr to the response body on success.
    pub combine_output: bool,
}

impl WatchdogConfig {
    /// Defaults for everything except the function command.
    pub fn new(process: ProcessCommand) -> Self {
        Self {
            process,
            port: 8080,
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            exec_timeout: None,
            suppress_lock: false,
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
            mode: ExecutionMode::ForkPerRequest,
            max_inflight: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            write_debug: false,
            content_type: None,
            combine_output: false,
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader::new(lookup);

        let fprocess = env
            .string("fprocess")
            .ok_or_else(|| WatchdogError::Config("missing required variable 'fprocess'".into()))?;
        let process = ProcessCommand::parse(&fprocess)
            .map_err(|e| WatchdogError::Config(format!("fprocess: {e}")))?;

        let defaults = Self::new(process);
        let exec_timeout = match env.string("exec_timeout").or_else(|| env.string("hard_timeout")) {
            None => None,
            Some(raw) => {
                let limit = faas_common::env::parse_duration(&raw).ok_or_else(|| {
                    WatchdogError::Config(format!("exec_timeout: invalid duration '{raw}'"))
                })?;
                (!limit.is_zero()).then_some(limit)
            }
        };
        let mode = match env.string("mode") {
            None => defaults.mode,
            Some(raw) => raw
                .parse()
                .map_err(|e| WatchdogError::Config(format!("mode: {e}")))?,
        };
        let max_inflight = match env.number("max_inflight", 0usize)? {
            0 => None,
            n => Some(n),
        };

        Ok(Self {
            port: env.number("port", defaults.port)?,
            read_timeout: env.duration("read_timeout", defaults.read_timeout)?,
            write_timeout: env.duration("write_timeout", defaults.write_timeout)?,
            exec_timeout,
            suppress_lock: env.bool("suppress_lock", defaults.suppress_lock)?,
            lock_path: env
                .string("lock_path")
                .map(PathBuf::from)
                .unwrap_or(defaults.lock_path),
            mode,
            max_inflight,
            max_body_bytes: env.number("max_body_bytes", defaults.max_body_bytes)?,
            write_debug: env.bool("write_debug", defaults.write_debug)?,
            content_type: env.string("content_type"),
            combine_output: env.bool("combine_output", defaults.combine_output)?,
            process: defaults.process,
        })
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            command: self.process.clone(),
            mode: self.mode,
            exec_timeout: self.exec_timeout,
            max_input_bytes: Some(self.max_body_bytes),
        }
    }
}
