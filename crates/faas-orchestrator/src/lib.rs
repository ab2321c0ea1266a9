use faas_common::FaasError;
use thiserror::Error;

pub mod memory;
pub mod resolver;
pub mod swarm;

pub use memory::InMemoryBackend;
pub use resolver::FunctionResolver;
pub use swarm::SwarmBackend;

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("Function not found in orchestrator: {0}")]
    FunctionNotFound(String),
    #[error("Service {0} is not in replicated mode")]
    NotReplicated(String),
    #[error("Invalid function table entry: {0}")]
    InvalidTable(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl From<OrchestratorError> for FaasError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::FunctionNotFound(name) => FaasError::NotFound(name),
            OrchestratorError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            }) => FaasError::NotFound(message),
            OrchestratorError::Docker(e) => FaasError::BackendUnavailable(e.to_string()),
            OrchestratorError::NotReplicated(name) => {
                FaasError::InvalidRequest(format!("{name} cannot be scaled"))
            }
            OrchestratorError::InvalidTable(msg) => FaasError::Config(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_404_is_not_found() {
        let err: FaasError = OrchestratorError::Docker(
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message: "service echo not found".into(),
            },
        )
        .into();
        assert_eq!(err.status_code(), 404);

        let err: FaasError = OrchestratorError::Docker(
            bollard::errors::Error::DockerResponseServerError {
                status_code: 500,
                message: "swarm manager down".into(),
            },
        )
        .into();
        assert_eq!(err.status_code(), 503);
    }
}
