use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use crate::child::{ChildGuard, ProcessCounters};
use crate::{
    check_input_limit, ExecutionRequest, ExecutorError, ExecutorStats, ProcessCommand,
    ProcessExecutor, ProcessOutput, Result,
};

/// Spawns a fresh process for every request.
pub struct ForkExecutor {
    command: ProcessCommand,
    exec_timeout: Option<Duration>,
    max_input_bytes: Option<usize>,
    counters: Arc<ProcessCounters>,
}

impl ForkExecutor {
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
        }
    }
}

#[async_trait]
impl ProcessExecutor for ForkExecutor {
    #[instrument(skip(self, request), fields(command = %self.command, input_bytes = request.input.len()))]
    async fn execute(&self, request: ExecutionRequest) -> Result<ProcessOutput> {
        check_input_limit(self.max_input_bytes, request.input.len())?;

        let started = Instant::now();
        let mut command = self.command.to_command();
        command.envs(request.env);
        let mut guard = ChildGuard::spawn(&mut command, self.counters.clone())?;

        let stdin = guard.child_mut().stdin.take();
        let stdout = guard.child_mut().stdout.take();
        let stderr = guard.child_mut().stderr.take();
        let input = request.input;

        let run = async {
            let write = async move {
                let Some(mut stdin) = stdin else {
                    return Ok::<_, std::io::Error>(());
                };
                stdin.write_all(&input).await?;
                stdin.shutdown().await
                // stdin is dropped here, closing the pipe
            };
            let read_stdout = async move {
                let mut buf = Vec::new();
                if let Some(mut stdout) = stdout {
                    stdout.read_to_end(&mut buf).await?;
                }
                Ok::<_, std::io::Error>(buf)
            };
            let read_stderr = async move {
                let mut buf = Vec::new();
                if let Some(mut stderr) = stderr {
                    stderr.read_to_end(&mut buf).await?;
                }
                Ok::<_, std::io::Error>(buf)
            };

            let (written, out, err) = tokio::join!(write, read_stdout, read_stderr);
            let out = out.map_err(ExecutorError::ReadFailure)?;
            let err = err.map_err(ExecutorError::ReadFailure)?;
            let status = guard.wait().await.map_err(ExecutorError::ReadFailure)?;
            match written {
                Ok(()) => {}
                // A function may exit without reading its input; only its exit
                // status says whether it failed.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe && status.success() => {
                    debug!("Process exited before reading all of its input");
                }
                Err(e) => return Err(ExecutorError::WriteFailure(e)),
            }
            Ok::<_, ExecutorError>((out, err, status))
        };

        let outcome = match self.exec_timeout {
            Some(limit) => {
                let timed = tokio::time::timeout(limit, run).await;
                timed.unwrap_or(Err(ExecutorError::Timeout(limit)))
            }
            None => run.await,
        };

        match outcome {
            Ok((stdout, stderr, status)) => {
                debug!(exit_code = ?status.code(), stdout_bytes = stdout.len(), "Process finished");
                Ok(ProcessOutput {
                    stdout,
                    stderr,
                    exit_code: status.code(),
                    duration: started.elapsed(),
                })
            }
            Err(e) => {
                warn!(error = %e, "Process run failed, killing it");
                guard.kill().await;
                Err(e)
            }
        }
    }

    fn stats(&self) -> ExecutorStats {
        self.counters.snapshot()
    }
}
