//! Backend held entirely in memory.
//!
//! Serves the `static` deployment mode, where function endpoints are listed
//! in configuration, and stands in for Swarm in tests.

use async_trait::async_trait;
use dashmap::DashMap;
use faas_common::{
    Endpoint, FaasError, FunctionBackend, FunctionDeployment, FunctionName, FunctionSummary,
    ReplicaCounts, Result,
};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::OrchestratorError;

#[derive(Debug, Clone)]
struct FunctionRecord {
    endpoint: Endpoint,
    image: String,
    env_process: Option<String>,
    labels: HashMap<String, String>,
    replicas: ReplicaCounts,
}

#[derive(Debug)]
pub struct InMemoryBackend {
    functions: DashMap<FunctionName, FunctionRecord>,
    function_port: u16,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(8080)
    }
}

impl InMemoryBackend {
    /// `function_port` is used for endpoints of functions deployed at runtime.
    pub fn new(function_port: u16) -> Self {
        Self {
            functions: DashMap::new(),
            function_port,
        }
    }

    /// Parse `name=http://host:port,other=http://host:port`.
    pub fn from_table(table: &str, function_port: u16) -> crate::Result<Self> {
        let backend = Self::new(function_port);
        for entry in table.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, url) = entry
                .split_once('=')
                .ok_or_else(|| OrchestratorError::InvalidTable(entry.to_string()))?;
            let name = FunctionName::parse(name.trim())
                .map_err(|_| OrchestratorError::InvalidTable(entry.to_string()))?;
            let url = url.trim();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(OrchestratorError::InvalidTable(entry.to_string()));
            }
            backend.register(name, Endpoint::new(url), ReplicaCounts {
                current: 1,
                desired: 1,
            });
        }
        Ok(backend)
    }

    pub fn register(&self, name: FunctionName, endpoint: Endpoint, replicas: ReplicaCounts) {
        debug!(function = %name, endpoint = endpoint.base_url(), "Registering static function");
        self.functions.insert(
            name,
            FunctionRecord {
                endpoint,
                image: String::new(),
                env_process: None,
                labels: HashMap::new(),
                replicas,
            },
        );
    }

    /// Overwrite the replica counts the backend reports.
    pub fn set_replicas(&self, name: &FunctionName, current: u64, desired: u64) -> Result<()> {
        let mut record = self
            .functions
            .get_mut(name)
            .ok_or_else(|| FaasError::NotFound(name.to_string()))?;
        record.replicas = ReplicaCounts { current, desired };
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    fn record(&self, name: &FunctionName) -> Result<FunctionRecord> {
        self.functions
            .get(name)
            .map(|r| r.value().clone())
            .ok_or_else(|| FaasError::NotFound(name.to_string()))
    }
}

#[async_trait]
impl FunctionBackend for InMemoryBackend {
    async fn list_functions(&self) -> Result<Vec<FunctionSummary>> {
        let mut functions: Vec<FunctionSummary> = self
            .functions
            .iter()
            .map(|entry| FunctionSummary {
                name: entry.key().to_string(),
                image: entry.image.clone(),
                invocation_count: 0,
                replicas: entry.replicas.desired,
                available_replicas: entry.replicas.current,
                env_process: entry.env_process.clone(),
                labels: entry.labels.clone(),
            })
            .collect();
        functions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(functions)
    }

    async fn endpoint(&self, name: &FunctionName) -> Result<Endpoint> {
        Ok(self.record(name)?.endpoint)
    }

    async fn replicas(&self, name: &FunctionName) -> Result<ReplicaCounts> {
        Ok(self.record(name)?.replicas)
    }

    async fn deploy(&self, deployment: FunctionDeployment) -> Result<()> {
        let name = FunctionName::parse(deployment.service)?;
        info!(function = %name, image = %deployment.image, "Deploying function");
        let record = FunctionRecord {
            endpoint: Endpoint::from_host(name.as_str(), self.function_port),
            image: deployment.image,
            env_process: deployment.env_process,
            labels: deployment.labels,
            replicas: ReplicaCounts {
                current: 1,
                desired: 1,
            },
        };
        self.functions.insert(name, record);
        Ok(())
    }

    async fn remove(&self, name: &FunctionName) -> Result<()> {
        self.functions
            .remove(name)
            .map(|_| info!(function = %name, "Removed function"))
            .ok_or_else(|| FaasError::NotFound(name.to_string()))
    }

    async fn scale(&self, name: &FunctionName, replicas: u64) -> Result<()> {
        let mut record = self
            .functions
            .get_mut(name)
            .ok_or_else(|| FaasError::NotFound(name.to_string()))?;
        info!(function = %name, from = record.replicas.desired, to = replicas, "Scaling function");
        // Nothing to converge here, so the current count follows immediately.
        record.replicas = ReplicaCounts {
            current: replicas,
            desired: replicas,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> FunctionName {
        FunctionName::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_table_parsing() {
        let backend =
            InMemoryBackend::from_table("echo=http://127.0.0.1:9001/, wc = http://wc:8080", 8080)
                .unwrap();
        assert_eq!(backend.len(), 2);
        assert_eq!(
            backend.endpoint(&name("echo")).await.unwrap().base_url(),
            "http://127.0.0.1:9001"
        );
        assert_eq!(
            backend.endpoint(&name("wc")).await.unwrap().base_url(),
            "http://wc:8080"
        );
        assert!(InMemoryBackend::from_table("", 8080).unwrap().is_empty());
    }

    #[test]
    fn test_table_rejects_bad_entries() {
        assert!(InMemoryBackend::from_table("echo", 8080).is_err());
        assert!(InMemoryBackend::from_table("bad name=http://x:1", 8080).is_err());
        assert!(InMemoryBackend::from_table("echo=ftp://x:1", 8080).is_err());
    }

    #[tokio::test]
    async fn test_unknown_function_is_not_found() {
        let backend = InMemoryBackend::default();
        let err = backend.endpoint(&name("ghost")).await.unwrap_err();
        assert!(matches!(err, FaasError::NotFound(_)));
        assert!(matches!(
            backend.scale(&name("ghost"), 3).await,
            Err(FaasError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deploy_scale_remove() {
        let backend = InMemoryBackend::new(8080);
        backend
            .deploy(FunctionDeployment {
                service: "resize".into(),
                image: "functions/resize:latest".into(),
                env_process: Some("convert - -resize 50% -".into()),
                env_vars: HashMap::new(),
                network: None,
                labels: HashMap::new(),
            })
            .await
            .unwrap();

        let listed = backend.list_functions().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].image, "functions/resize:latest");
        assert_eq!(
            backend.endpoint(&name("resize")).await.unwrap().base_url(),
            "http://resize:8080"
        );

        backend.scale(&name("resize"), 4).await.unwrap();
        assert_eq!(
            backend.replicas(&name("resize")).await.unwrap(),
            ReplicaCounts {
                current: 4,
                desired: 4
            }
        );

        backend.remove(&name("resize")).await.unwrap();
        assert!(backend.is_empty());
    }
}
