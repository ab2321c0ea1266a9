//! Exposes an arbitrary executable as an HTTP-invokable function.

use faas_common::FaasError;
use faas_executor::build_executor;
use std::future::{Future, IntoFuture};
use std::path::PathBuf;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

pub mod config;
pub mod lifecycle;
pub mod readiness;
pub mod server;

pub use config::WatchdogConfig;
pub use lifecycle::{Lifecycle, WatchdogState};
pub use readiness::ReadinessMarker;
pub use server::{router, WatchdogApp};

#[derive(Error, Debug)]
pub enum WatchdogError {
    #[error("Configuration Error: {0}")]
    Config(String),
    #[error("Failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),
    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),
    #[error("Listener never became live: {0}")]
    Readiness(String),
    #[error("Failed to write readiness marker {}: {source}", path.display())]
    LockFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<FaasError> for WatchdogError {
    fn from(err: FaasError) -> Self {
        match err {
            FaasError::Config(msg) => WatchdogError::Config(msg),
            other => WatchdogError::Config(other.to_string()),
        }
    }
}

impl From<WatchdogError> for FaasError {
    fn from(err: WatchdogError) -> Self {
        match err {
            WatchdogError::Config(msg) => FaasError::Config(msg),
            other => FaasError::Internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, WatchdogError>;

/// Bind the configured port and serve until SIGINT/SIGTERM.
pub async fn run(config: WatchdogConfig) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .map_err(WatchdogError::Bind)?;
    serve(listener, config, shutdown_signal()).await
}

/// Serve on `listener` until `shutdown` completes.
///
/// The readiness marker is written only after the listener has answered a
/// request; failing to write it ends the server with an error.
pub async fn serve<S>(listener: TcpListener, config: WatchdogConfig, shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().map_err(WatchdogError::Bind)?;
    info!(%addr, command = %config.process, mode = ?config.mode, "Starting watchdog");

    let executor = build_executor(config.executor_config());
    let lifecycle = Lifecycle::new();
    let app = WatchdogApp::new(config, executor, lifecycle.clone());
    let marker = app.marker().cloned();
    let instance = app.instance().to_string();

    let drain = lifecycle.clone();
    let server = axum::serve(listener, router(app)).with_graceful_shutdown(async move {
        shutdown.await;
        drain.begin_shutdown();
    });
    let mut server = std::pin::pin!(server.into_future());
    let mut readiness = tokio::spawn(readiness::signal_when_live(
        addr,
        instance,
        lifecycle.clone(),
        marker,
    ));

    let served = tokio::select! {
        served = &mut server => {
            readiness.abort();
            served
        }
        signalled = &mut readiness => {
            match signalled {
                Ok(Ok(())) => server.await,
                Ok(Err(e)) => {
                    error!(error = %e, "Readiness signalling failed, aborting");
                    lifecycle.begin_shutdown();
                    lifecycle.mark_stopped();
                    return Err(e);
                }
                Err(join) => {
                    lifecycle.mark_stopped();
                    return Err(WatchdogError::Readiness(join.to_string()));
                }
            }
        }
    };

    lifecycle.mark_stopped();
    info!("Watchdog stopped");
    served.map_err(WatchdogError::Serve)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
