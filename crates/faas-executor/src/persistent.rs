//! Long-lived process mode.
//!
//! Requests and responses travel over the process's stdin/stdout as frames:
//! a 4-byte big-endian length followed by that many bytes. One request is in
//! flight at a time. Any failure, timeout or cancellation mid-exchange leaves
//! the stream in an unknown position, so the process is killed and a fresh
//! one is started by the next request.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::child::{ChildGuard, ProcessCounters};
use crate::{
    check_input_limit, ExecutionRequest, ExecutorError, ExecutorStats, ProcessCommand,
    ProcessExecutor, ProcessOutput, Result,
};

const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

struct RunningProcess {
    guard: ChildGuard,
    stdin: ChildStdin,
    stdout: ChildStdout,
    /// Set while a frame exchange is underway.
    mid_exchange: bool,
}

pub struct PersistentExecutor {
    command: ProcessCommand,
    exec_timeout: Option<Duration>,
    max_input_bytes: Option<usize>,
    counters: Arc<ProcessCounters>,
    process: Mutex<Option<RunningProcess>>,
}

impl PersistentExecutor {
    pub fn new(
        command: ProcessCommand,
        exec_timeout: Option<Duration>,
        max_input_bytes: Option<usize>,
    ) -> Self {
        Self {
            command,
            exec_timeout,
            max_input_bytes,
            counters: Arc::new(ProcessCounters::default()),
            process: Mutex::new(None),
        }
    }

    /// Start the process ahead of the first request.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.process.lock().await;
        self.ensure_running(&mut slot).await?;
        Ok(())
    }

    /// Kill the process, if any. The next request starts a new one.
    pub async fn shutdown(&self) {
        let mut slot = self.process.lock().await;
        if let Some(mut running) = slot.take() {
            running.guard.kill().await;
        }
    }

    async fn ensure_running<'a>(
        &self,
        slot: &'a mut Option<RunningProcess>,
    ) -> Result<&'a mut RunningProcess> {
        if let Some(running) = slot.as_mut() {
            if running.mid_exchange {
                warn!("Previous exchange was interrupted, restarting process");
                running.guard.kill().await;
                *slot = None;
            }
        }

        if slot.is_none() {
            let mut command = self.command.to_command();
            command.stderr(Stdio::inherit());
            let mut guard = ChildGuard::spawn(&mut command, self.counters.clone())?;
            let stdin = guard.child_mut().stdin.take().ok_or_else(|| {
                ExecutorError::StartFailure(std::io::Error::other("stdin not captured"))
            })?;
            let stdout = guard.child_mut().stdout.take().ok_or_else(|| {
                ExecutorError::StartFailure(std::io::Error::other("stdout not captured"))
            })?;
            info!(command = %self.command, pid = ?guard.child_mut().id(), "Persistent process started");
            *slot = Some(RunningProcess {
                guard,
                stdin,
                stdout,
                mid_exchange: false,
            });
        }

        slot.as_mut()
            .ok_or_else(|| ExecutorError::StartFailure(std::io::Error::other("no process")))
    }
}

async fn exchange(running: &mut RunningProcess, input: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(input.len()).map_err(|_| ExecutorError::InputTooLarge {
        limit: u32::MAX as usize,
        actual: input.len(),
    })?;
    running
        .stdin
        .write_u32(len)
        .await
        .map_err(ExecutorError::WriteFailure)?;
    running
        .stdin
        .write_all(input)
        .await
        .map_err(ExecutorError::WriteFailure)?;
    running
        .stdin
        .flush()
        .await
        .map_err(ExecutorError::WriteFailure)?;

    let reply_len = running
        .stdout
        .read_u32()
        .await
        .map_err(ExecutorError::ReadFailure)? as usize;
    if reply_len > MAX_FRAME_BYTES {
        return Err(ExecutorError::ReadFailure(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("reply frame of {reply_len} bytes exceeds {MAX_FRAME_BYTES}"),
        )));
    }
    let mut reply = vec![0u8; reply_len];
    running
        .stdout
        .read_exact(&mut reply)
        .await
        .map_err(ExecutorError::ReadFailure)?;
    Ok(reply)
}

#[async_trait]
impl ProcessExecutor for PersistentExecutor {
    #[instrument(skip(self, request), fields(command = %self.command, input_bytes = request.input.len()))]
    async fn execute(&self, request: ExecutionRequest) -> Result<ProcessOutput> {
        check_input_limit(self.max_input_bytes, request.input.len())?;

        let mut slot = self.process.lock().await;
        let started = Instant::now();
        let running = self.ensure_running(&mut slot).await?;
        running.mid_exchange = true;

        let outcome = match self.exec_timeout {
            Some(limit) => {
                let timed = tokio::time::timeout(limit, exchange(running, &request.input)).await;
                timed.unwrap_or(Err(ExecutorError::Timeout(limit)))
            }
            None => exchange(running, &request.input).await,
        };

        match outcome {
            Ok(stdout) => {
                running.mid_exchange = false;
                Ok(ProcessOutput {
                    stdout,
                    stderr: Vec::new(),
                    exit_code: Some(0),
                    duration: started.elapsed(),
                })
            }
            Err(e) => {
                warn!(error = %e, "Persistent exchange failed, killing process");
                running.guard.kill().await;
                *slot = None;
                Err(e)
            }
        }
    }

    fn stats(&self) -> ExecutorStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `cat` copies frames back verbatim, which makes it a framed echo server.
    fn framed_echo() -> PersistentExecutor {
        PersistentExecutor::new(
            ProcessCommand::new("cat"),
            Some(Duration::from_secs(5)),
            None,
        )
    }

    #[tokio::test]
    async fn test_reuses_one_process() {
        let executor = framed_echo();
        for body in ["first", "second", ""] {
            let output = executor
                .execute(ExecutionRequest::new(body))
                .await
                .unwrap();
            assert_eq!(output.stdout, body.as_bytes());
        }
        assert_eq!(executor.stats(), ExecutorStats { starts: 1, active: 1 });
        executor.shutdown().await;
        assert_eq!(executor.stats().active, 0);
    }

    #[tokio::test]
    async fn test_timeout_replaces_process() {
        let executor = PersistentExecutor::new(
            ProcessCommand::new("sleep").arg("30"),
            Some(Duration::from_millis(200)),
            None,
        );
        let err = executor
            .execute(ExecutionRequest::new("ping"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout(_)));
        assert_eq!(executor.stats(), ExecutorStats { starts: 1, active: 0 });

        let _ = executor.execute(ExecutionRequest::new("ping")).await;
        assert_eq!(executor.stats().starts, 2);
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_exited_process_is_read_failure() {
        let executor = PersistentExecutor::new(
            ProcessCommand::new("true"),
            Some(Duration::from_secs(5)),
            None,
        );
        let err = executor
            .execute(ExecutionRequest::new("ping"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::ReadFailure(_) | ExecutorError::WriteFailure(_)
        ));
        assert_eq!(executor.stats().active, 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_serialised() {
        let executor = Arc::new(framed_echo());
        let mut handles = Vec::new();
        for i in 0..8 {
            let executor = executor.clone();
            handles.push(tokio::spawn(async move {
                let body = format!("request-{i}");
                let output = executor
                    .execute(ExecutionRequest::new(body.clone()))
                    .await
                    .unwrap();
                assert_eq!(output.stdout, body.as_bytes());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(executor.stats().starts, 1);
        executor.shutdown().await;
    }
}
