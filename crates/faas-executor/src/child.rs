//! Spawned-process ownership with guaranteed reaping.

use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::{ExecutorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutorStats {
    /// Processes spawned since the executor was created.
    pub starts: u64,
    /// Processes spawned and not yet reaped.
    pub active: usize,
}

#[derive(Debug, Default)]
pub(crate) struct ProcessCounters {
    starts: AtomicU64,
    active: AtomicUsize,
}

impl ProcessCounters {
    pub(crate) fn snapshot(&self) -> ExecutorStats {
        ExecutorStats {
            starts: self.starts.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
        }
    }
}

/// Owns a running child. Every exit path ends with the process killed or
/// waited for; dropping the guard kills the whole process group.
pub(crate) struct ChildGuard {
    child: Child,
    reaped: bool,
    counters: Arc<ProcessCounters>,
}

impl ChildGuard {
    pub(crate) fn spawn(command: &mut Command, counters: Arc<ProcessCounters>) -> Result<Self> {
        command.kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(ExecutorError::StartFailure)?;
        counters.starts.fetch_add(1, Ordering::Relaxed);
        counters.active.fetch_add(1, Ordering::Relaxed);
        debug!(pid = ?child.id(), "Process spawned");
        Ok(Self {
            child,
            reaped: false,
            counters,
        })
    }

    pub(crate) fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    pub(crate) async fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.mark_reaped();
        Ok(status)
    }

    /// Kill the process group and wait until the leader is reaped.
    pub(crate) async fn kill(&mut self) {
        if self.reaped {
            return;
        }
        self.signal_group();
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "start_kill on child failed");
        }
        match self.child.wait().await {
            Ok(status) => debug!(?status, "Killed process reaped"),
            Err(e) => warn!(error = %e, "Waiting for killed process failed"),
        }
        self.mark_reaped();
    }

    fn signal_group(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // Negative pid addresses the process group created at spawn.
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }

    fn mark_reaped(&mut self) {
        if !self.reaped {
            self.reaped = true;
            self.counters.active.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        // Cancelled mid-run: kill now, tokio reaps the zombie in the background.
        self.signal_group();
        let _ = self.child.start_kill();
        let _ = self.child.try_wait();
        self.counters.active.fetch_sub(1, Ordering::Relaxed);
    }
}
