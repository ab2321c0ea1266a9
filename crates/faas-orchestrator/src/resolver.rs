use dashmap::DashMap;
use faas_common::{
    Endpoint, FaasError, FunctionBackend, FunctionDeployment, FunctionName, FunctionSummary,
    ReplicaCounts, Result,
};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Read-mostly view of the backend used on the request path.
///
/// Every backend call is bounded by `backend_timeout`; running out of time
/// reports the backend as unavailable. Endpoints may be cached for a short
/// TTL to keep orchestrator queries off the hot path.
pub struct FunctionResolver {
    backend: Arc<dyn FunctionBackend>,
    backend_timeout: Duration,
    cache_ttl: Option<Duration>,
    cache: DashMap<FunctionName, (Endpoint, Instant)>,
}

impl FunctionResolver {
    pub fn new(backend: Arc<dyn FunctionBackend>, backend_timeout: Duration) -> Self {
        Self {
            backend,
            backend_timeout,
            cache_ttl: None,
            cache: DashMap::new(),
        }
    }

    /// Cache resolved endpoints for `ttl`. A zero TTL disables caching.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = (!ttl.is_zero()).then_some(ttl);
        self
    }

    pub fn backend(&self) -> &Arc<dyn FunctionBackend> {
        &self.backend
    }

    async fn bounded<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.backend_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout = ?self.backend_timeout, "Backend call timed out");
                Err(FaasError::BackendUnavailable(format!(
                    "{operation} exceeded {:?}",
                    self.backend_timeout
                )))
            }
        }
    }

    #[instrument(skip(self), fields(function = %name))]
    pub async fn resolve(&self, name: &FunctionName) -> Result<Endpoint> {
        if let Some(ttl) = self.cache_ttl {
            if let Some(entry) = self.cache.get(name) {
                let (endpoint, cached_at) = entry.value();
                if cached_at.elapsed() < ttl {
                    return Ok(endpoint.clone());
                }
            }
        }

        let endpoint = self.bounded("resolve", self.backend.endpoint(name)).await?;
        debug!(endpoint = endpoint.base_url(), "Resolved function");
        if self.cache_ttl.is_some() {
            self.cache
                .insert(name.clone(), (endpoint.clone(), Instant::now()));
        }
        Ok(endpoint)
    }

    pub async fn replicas(&self, name: &FunctionName) -> Result<ReplicaCounts> {
        self.bounded("replicas", self.backend.replicas(name)).await
    }

    pub async fn list_functions(&self) -> Result<Vec<FunctionSummary>> {
        self.bounded("list", self.backend.list_functions()).await
    }

    pub async fn deploy(&self, deployment: FunctionDeployment) -> Result<()> {
        if let Ok(name) = FunctionName::parse(deployment.service.clone()) {
            self.cache.remove(&name);
        }
        self.bounded("deploy", self.backend.deploy(deployment)).await
    }

    pub async fn remove(&self, name: &FunctionName) -> Result<()> {
        self.cache.remove(name);
        self.bounded("remove", self.backend.remove(name)).await
    }

    pub async fn scale(&self, name: &FunctionName, replicas: u64) -> Result<()> {
        self.bounded("scale", self.backend.scale(name, replicas)).await
    }

    pub fn invalidate(&self, name: &FunctionName) {
        self.cache.remove(name);
    }
}
