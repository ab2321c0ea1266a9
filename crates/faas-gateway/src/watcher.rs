//! Periodic replica sampling.
//!
//! The watcher only produces [`ReplicaSample`]s onto a channel; whoever holds
//! the receiving end decides what to do with them. The gateway drains them
//! into its metrics registry with [`record_samples`].

use faas_common::{FunctionName, ReplicaSample};
use faas_orchestrator::FunctionResolver;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;

pub struct ScalingWatcher {
    resolver: Arc<FunctionResolver>,
    interval: Duration,
}

impl ScalingWatcher {
    pub fn new(resolver: Arc<FunctionResolver>, interval: Duration) -> Self {
        Self { resolver, interval }
    }

    /// Sample every known function once. Functions that fail to answer are
    /// logged and left out; a failed listing yields no samples.
    pub async fn poll_once(&self) -> Vec<ReplicaSample> {
        let functions = match self.resolver.list_functions().await {
            Ok(functions) => functions,
            Err(e) => {
                warn!(error = %e, "Replica poll could not list functions");
                return Vec::new();
            }
        };

        let mut samples = Vec::with_capacity(functions.len());
        for summary in functions {
            let name = match FunctionName::parse(summary.name.as_str()) {
                Ok(name) => name,
                Err(e) => {
                    warn!(function = %summary.name, error = %e, "Skipping unnamed function");
                    continue;
                }
            };
            match self.resolver.replicas(&name).await {
                Ok(counts) => samples.push(ReplicaSample::new(name, counts)),
                Err(e) => warn!(function = %name, error = %e, "Replica query failed"),
            }
        }
        samples
    }

    /// Tick until `shutdown` flips or the sample receiver is gone.
    pub async fn run(self, sink: mpsc::Sender<ReplicaSample>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "Scaling watcher started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let samples = self.poll_once().await;
            debug!(count = samples.len(), "Replica poll finished");
            for sample in samples {
                if sink.send(sample).await.is_err() {
                    info!("Replica sample receiver closed");
                    return;
                }
            }
        }
        info!("Scaling watcher stopped");
    }
}

/// Feed samples into the metrics registry until the watcher goes away.
pub async fn record_samples(mut samples: mpsc::Receiver<ReplicaSample>, metrics: Arc<Metrics>) {
    while let Some(sample) = samples.recv().await {
        metrics.record_replicas(&sample);
    }
}
