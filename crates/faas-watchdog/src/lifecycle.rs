//! Watchdog lifecycle: Starting -> Ready <-> Serving -> ShuttingDown -> Stopped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Starting,
    Ready,
    Serving,
    ShuttingDown,
    Stopped,
}

impl WatchdogState {
    pub fn accepts_requests(self) -> bool {
        matches!(
            self,
            WatchdogState::Starting | WatchdogState::Ready | WatchdogState::Serving
        )
    }

    pub fn is_ready(self) -> bool {
        matches!(self, WatchdogState::Ready | WatchdogState::Serving)
    }
}

#[derive(Clone)]
pub struct Lifecycle {
    state: Arc<watch::Sender<WatchdogState>>,
    inflight: Arc<AtomicUsize>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(WatchdogState::Starting);
        Self {
            state: Arc::new(state),
            inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn state(&self) -> WatchdogState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WatchdogState> {
        self.state.subscribe()
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Starting -> Ready. Returns false if that transition already happened
    /// or the watchdog is going away.
    pub fn mark_ready(&self) -> bool {
        let inflight = self.inflight.clone();
        let changed = self.state.send_if_modified(|state| {
            if *state != WatchdogState::Starting {
                return false;
            }
            *state = if inflight.load(Ordering::SeqCst) > 0 {
                WatchdogState::Serving
            } else {
                WatchdogState::Ready
            };
            true
        });
        if changed {
            info!("Watchdog ready");
        }
        changed
    }

    /// Register an in-flight request. `None` once shutdown has begun.
    pub fn begin_request(&self) -> Option<RequestGuard> {
        if !self.state().accepts_requests() {
            return None;
        }
        self.inflight.fetch_add(1, Ordering::SeqCst);
        self.state.send_if_modified(|state| {
            if *state == WatchdogState::Ready {
                *state = WatchdogState::Serving;
                true
            } else {
                false
            }
        });
        Some(RequestGuard {
            lifecycle: self.clone(),
        })
    }

    pub fn begin_shutdown(&self) {
        let changed = self.state.send_if_modified(|state| match state {
            WatchdogState::ShuttingDown | WatchdogState::Stopped => false,
            _ => {
                *state = WatchdogState::ShuttingDown;
                true
            }
        });
        if changed {
            info!(inflight = self.inflight(), "Watchdog shutting down");
        }
    }

    pub fn mark_stopped(&self) {
        self.state.send_replace(WatchdogState::Stopped);
    }

    fn finish_request(&self) {
        let remaining = self.inflight.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            self.state.send_if_modified(|state| {
                if *state == WatchdogState::Serving {
                    *state = WatchdogState::Ready;
                    true
                } else {
                    false
                }
            });
        }
    }
}

/// Held for the duration of a request.
pub struct RequestGuard {
    lifecycle: Lifecycle,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.lifecycle.finish_request();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_serving_cycle() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), WatchdogState::Starting);
        assert!(lifecycle.mark_ready());
        assert!(!lifecycle.mark_ready());

        let first = lifecycle.begin_request().unwrap();
        let second = lifecycle.begin_request().unwrap();
        assert_eq!(lifecycle.state(), WatchdogState::Serving);
        drop(first);
        assert_eq!(lifecycle.state(), WatchdogState::Serving);
        drop(second);
        assert_eq!(lifecycle.state(), WatchdogState::Ready);
    }

    #[test]
    fn test_requests_before_ready_stay_starting() {
        let lifecycle = Lifecycle::new();
        let guard = lifecycle.begin_request().unwrap();
        assert_eq!(lifecycle.state(), WatchdogState::Starting);
        assert!(lifecycle.mark_ready());
        assert_eq!(lifecycle.state(), WatchdogState::Serving);
        drop(guard);
        assert_eq!(lifecycle.state(), WatchdogState::Ready);
    }

    #[test]
    fn test_shutdown_rejects_new_requests() {
        let lifecycle = Lifecycle::new();
        lifecycle.mark_ready();
        let guard = lifecycle.begin_request().unwrap();
        lifecycle.begin_shutdown();
        assert!(lifecycle.begin_request().is_none());
        assert!(!lifecycle.mark_ready());
        drop(guard);
        assert_eq!(lifecycle.state(), WatchdogState::ShuttingDown);
        lifecycle.mark_stopped();
        assert_eq!(lifecycle.state(), WatchdogState::Stopped);
    }
}
