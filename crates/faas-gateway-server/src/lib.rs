//! Top-level composition of the gateway process.
//!
//! Every shared client (backend, broker, metrics) is built here once and
//! handed to the components that need it.

use anyhow::Context;
use faas_common::FunctionBackend;
use faas_gateway::{
    create_app, record_samples, start_workers, AsyncWorker, BackendKind, GatewayConfig,
    GatewayState, Metrics, QueueBroker, RedisQueue, ScalingWatcher,
};
use faas_orchestrator::{FunctionResolver, InMemoryBackend, SwarmBackend};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const SAMPLE_BUFFER: usize = 64;

pub fn build_backend(config: &GatewayConfig) -> anyhow::Result<Arc<dyn FunctionBackend>> {
    Ok(match &config.backend {
        BackendKind::Docker => Arc::new(
            SwarmBackend::connect(config.function_port).context("connecting to Docker")?,
        ),
        BackendKind::Static(table) => {
            let backend = InMemoryBackend::from_table(table, config.function_port)
                .context("parsing static function table")?;
            if backend.is_empty() {
                warn!("Static backend started without functions");
            }
            Arc::new(backend)
        }
    })
}

pub fn build_broker(config: &GatewayConfig) -> anyhow::Result<Arc<dyn QueueBroker>> {
    let broker = RedisQueue::new(&config.queue_address, &config.queue_name, config.queue_timeout)
        .context("configuring queue broker")?;
    Ok(Arc::new(broker))
}

pub async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let backend = build_backend(&config)?;
    let broker = build_broker(&config)?;
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    serve(listener, config, backend, broker, shutdown_signal()).await
}

/// Serve the gateway on `listener` with its async workers and replica
/// watcher until `shutdown` completes, then stop the background tasks.
pub async fn serve<S>(
    listener: TcpListener,
    config: GatewayConfig,
    backend: Arc<dyn FunctionBackend>,
    broker: Arc<dyn QueueBroker>,
    shutdown: S,
) -> anyhow::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let config = Arc::new(config);
    let resolver = Arc::new(
        FunctionResolver::new(backend, config.backend_timeout)
            .with_cache_ttl(config.resolve_cache_ttl),
    );
    let metrics = Arc::new(Metrics::new());
    let state = GatewayState::new(config.clone(), resolver.clone(), broker.clone(), metrics.clone())
        .context("building gateway state")?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let template = AsyncWorker::new(
        0,
        broker,
        state.proxy.clone(),
        metrics.clone(),
        config.callback_timeout,
        config.queue_poll_interval,
    );
    let workers = start_workers(config.async_workers, template, stop_rx.clone()).await;

    let (sample_tx, sample_rx) = mpsc::channel(SAMPLE_BUFFER);
    let watcher = tokio::spawn(
        ScalingWatcher::new(resolver, config.scale_poll_interval).run(sample_tx, stop_rx),
    );
    let recorder = tokio::spawn(record_samples(sample_rx, metrics));

    let app = create_app(Arc::new(state)).layer(TraceLayer::new_for_http());
    let addr = listener.local_addr().context("reading listener address")?;
    info!(%addr, workers = workers.len(), "FaaS gateway listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    info!("Stopping background tasks");
    let _ = stop_tx.send(true);
    for handle in workers {
        if let Err(e) = handle.await {
            error!(error = %e, "Async worker panicked");
        }
    }
    if let Err(e) = watcher.await {
        error!(error = %e, "Scaling watcher panicked");
    }
    if let Err(e) = recorder.await {
        error!(error = %e, "Sample recorder panicked");
    }

    served.context("gateway server failed")
}

pub async fn shutdown_signal() {
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
