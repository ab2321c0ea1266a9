//! Docker Swarm backend. Each function is a replicated service carrying the
//! `function` label and reachable by service name on the function network.

use async_trait::async_trait;
use bollard::models::{
    NetworkAttachmentConfig, Service, ServiceSpec, ServiceSpecMode, ServiceSpecModeReplicated,
    TaskSpec, TaskSpecContainerSpec,
};
use bollard::service::{ListServicesOptions, UpdateServiceOptions};
use bollard::Docker;
use faas_common::{
    Endpoint, FaasError, FunctionBackend, FunctionDeployment, FunctionName, FunctionSummary,
    ReplicaCounts, Result,
};
use std::collections::HashMap;
use tracing::{debug, info, instrument};

use crate::OrchestratorError;

pub const FUNCTION_LABEL: &str = "function";
const FPROCESS_ENV: &str = "fprocess";

pub struct SwarmBackend {
    docker: Docker,
    function_port: u16,
}

impl SwarmBackend {
    pub fn new(docker: Docker, function_port: u16) -> Self {
        Self {
            docker,
            function_port,
        }
    }

    /// Connect through the local socket or `DOCKER_HOST`.
    pub fn connect(function_port: u16) -> crate::Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(docker, function_port))
    }

    async fn list_function_services(&self, name: Option<&str>) -> crate::Result<Vec<Service>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![FUNCTION_LABEL.to_string()]);
        if let Some(name) = name {
            filters.insert("name".to_string(), vec![name.to_string()]);
        }
        let services = self
            .docker
            .list_services(Some(ListServicesOptions {
                filters,
                status: true,
            }))
            .await?;
        Ok(services)
    }

    /// Swarm's name filter matches prefixes, so pick the exact service.
    async fn find_service(&self, name: &FunctionName) -> crate::Result<Service> {
        self.list_function_services(Some(name.as_str()))
            .await?
            .into_iter()
            .find(|service| service_name(service) == Some(name.as_str()))
            .ok_or_else(|| OrchestratorError::FunctionNotFound(name.to_string()))
    }
}

fn service_name(service: &Service) -> Option<&str> {
    service.spec.as_ref()?.name.as_deref()
}

fn container_spec(service: &Service) -> Option<&TaskSpecContainerSpec> {
    service.spec.as_ref()?.task_template.as_ref()?.container_spec.as_ref()
}

fn replica_counts(service: &Service) -> ReplicaCounts {
    let status = service.service_status.as_ref();
    let configured = service
        .spec
        .as_ref()
        .and_then(|spec| spec.mode.as_ref())
        .and_then(|mode| mode.replicated.as_ref())
        .and_then(|replicated| replicated.replicas)
        .map(|n| n.max(0) as u64);
    ReplicaCounts {
        current: status.and_then(|s| s.running_tasks).unwrap_or(0),
        desired: configured
            .or_else(|| status.and_then(|s| s.desired_tasks))
            .unwrap_or(0),
    }
}

fn summarize(service: &Service) -> Option<FunctionSummary> {
    let name = service_name(service)?.to_string();
    let container = container_spec(service);
    let image = container
        .and_then(|c| c.image.as_deref())
        .map(strip_digest)
        .unwrap_or_default()
        .to_string();
    let env_process = container
        .and_then(|c| c.env.as_ref())
        .and_then(|env| {
            env.iter().find_map(|kv| {
                kv.strip_prefix(FPROCESS_ENV)
                    .and_then(|rest| rest.strip_prefix('='))
                    .map(str::to_string)
            })
        });
    let counts = replica_counts(service);
    Some(FunctionSummary {
        name,
        image,
        invocation_count: 0,
        replicas: counts.desired,
        available_replicas: counts.current,
        env_process,
        labels: service
            .spec
            .as_ref()
            .and_then(|spec| spec.labels.clone())
            .unwrap_or_default(),
    })
}

/// `alpine:3.20@sha256:...` -> `alpine:3.20`
fn strip_digest(image: &str) -> &str {
    image.split('@').next().unwrap_or(image)
}

fn deployment_spec(deployment: FunctionDeployment) -> ServiceSpec {
    let mut env: Vec<String> = deployment
        .env_vars
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    env.sort();
    if let Some(process) = deployment.env_process {
        env.push(format!("{FPROCESS_ENV}={process}"));
    }

    let mut labels = deployment.labels;
    labels.insert(FUNCTION_LABEL.to_string(), "true".to_string());

    ServiceSpec {
        name: Some(deployment.service),
        labels: Some(labels),
        task_template: Some(TaskSpec {
            container_spec: Some(TaskSpecContainerSpec {
                image: Some(deployment.image),
                env: Some(env),
                ..Default::default()
            }),
            networks: deployment.network.map(|network| {
                vec![NetworkAttachmentConfig {
                    target: Some(network),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        }),
        mode: Some(ServiceSpecMode {
            replicated: Some(ServiceSpecModeReplicated { replicas: Some(1) }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl FunctionBackend for SwarmBackend {
    #[instrument(skip(self))]
    async fn list_functions(&self) -> Result<Vec<FunctionSummary>> {
        let services = self.list_function_services(None).await?;
        Ok(services.iter().filter_map(summarize).collect())
    }

    async fn endpoint(&self, name: &FunctionName) -> Result<Endpoint> {
        self.find_service(name).await?;
        Ok(Endpoint::from_host(name.as_str(), self.function_port))
    }

    async fn replicas(&self, name: &FunctionName) -> Result<ReplicaCounts> {
        let service = self.find_service(name).await?;
        let counts = replica_counts(&service);
        debug!(function = %name, current = counts.current, desired = counts.desired, "Read replicas");
        Ok(counts)
    }

    #[instrument(skip(self, deployment), fields(function = %deployment.service))]
    async fn deploy(&self, deployment: FunctionDeployment) -> Result<()> {
        FunctionName::parse(deployment.service.clone())?;
        let spec = deployment_spec(deployment);
        let created = self
            .docker
            .create_service(spec, None)
            .await
            .map_err(OrchestratorError::from)?;
        info!(id = ?created.id, "Created function service");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove(&self, name: &FunctionName) -> Result<()> {
        let service = self.find_service(name).await?;
        let id = service.id.unwrap_or_else(|| name.to_string());
        self.docker
            .delete_service(&id)
            .await
            .map_err(OrchestratorError::from)?;
        info!("Removed function service");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn scale(&self, name: &FunctionName, replicas: u64) -> Result<()> {
        let service = self.find_service(name).await?;
        let version = service
            .version
            .as_ref()
            .and_then(|v| v.index)
            .ok_or_else(|| FaasError::BackendUnavailable(format!("{name}: no service version")))?;
        let mut spec = service
            .spec
            .ok_or_else(|| FaasError::BackendUnavailable(format!("{name}: no service spec")))?;
        let replicated = spec
            .mode
            .as_mut()
            .and_then(|mode| mode.replicated.as_mut())
            .ok_or_else(|| OrchestratorError::NotReplicated(name.to_string()))?;
        replicated.replicas = Some(i64::try_from(replicas).unwrap_or(i64::MAX));

        self.docker
            .update_service(
                name.as_str(),
                spec,
                UpdateServiceOptions {
                    version,
                    ..Default::default()
                },
                None,
            )
            .await
            .map_err(OrchestratorError::from)?;
        info!(replicas, "Scaled function service");
        Ok(())
    }
}
