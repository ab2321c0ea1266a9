use std::time::Duration;

use faas_common::env::EnvReader;
use faas_common::{FaasError, Result};

/// Where function services live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    /// Docker Swarm services labelled `function`.
    Docker,
    /// Fixed table of `name=url` entries.
    Static(String),
}

/// Alert-driven scaling bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingPolicy {
    pub min_replicas: u64,
    pub max_replicas: u64,
    /// Percentage of `max_replicas` added per firing alert.
    pub factor: u64,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            min_replicas: 1,
            max_replicas: 20,
            factor: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Deadline for a single proxied call to a function.
    pub upstream_timeout: Duration,
    pub backend: BackendKind,
    pub function_port: u16,
    pub backend_timeout: Duration,
    pub resolve_cache_ttl: Duration,
    pub queue_address: String,
    pub queue_name: String,
    pub queue_timeout: Duration,
    pub max_message_bytes: usize,
    pub async_workers: usize,
    pub queue_poll_interval: Duration,
    pub callback_timeout: Duration,
    pub scale_poll_interval: Duration,
    pub max_body_bytes: usize,
    pub scaling: ScalingPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            read_timeout: Duration::from_secs(8),
            write_timeout: Duration::from_secs(8),
            upstream_timeout: Duration::from_secs(8),
            backend: BackendKind::Docker,
            function_port: 8080,
            backend_timeout: Duration::from_secs(5),
            resolve_cache_ttl: Duration::ZERO,
            queue_address: "redis://queue:6379".to_string(),
            queue_name: "faas-requests".to_string(),
            queue_timeout: Duration::from_secs(5),
            max_message_bytes: 1024 * 1024,
            async_workers: 1,
            queue_poll_interval: Duration::from_millis(250),
            callback_timeout: Duration::from_secs(10),
            scale_poll_interval: Duration::from_secs(5),
            max_body_bytes: 10 * 1024 * 1024,
            scaling: ScalingPolicy::default(),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader::new(lookup);
        let defaults = Self::default();

        let write_timeout = env.duration("write_timeout", defaults.write_timeout)?;
        let backend = match env.string("backend").as_deref().map(str::trim) {
            None | Some("docker") | Some("swarm") => BackendKind::Docker,
            Some("static") => BackendKind::Static(env.string("functions").unwrap_or_default()),
            Some(other) => {
                return Err(FaasError::Config(format!("backend: unknown kind '{other}'")))
            }
        };
        let scaling = ScalingPolicy {
            min_replicas: env.number("scale_min", defaults.scaling.min_replicas)?,
            max_replicas: env.number("scale_max", defaults.scaling.max_replicas)?,
            factor: env.number("scale_factor", defaults.scaling.factor)?,
        };
        if scaling.min_replicas > scaling.max_replicas {
            return Err(FaasError::Config(format!(
                "scale_min ({}) exceeds scale_max ({})",
                scaling.min_replicas, scaling.max_replicas
            )));
        }

        Ok(Self {
            port: env.number("port", defaults.port)?,
            read_timeout: env.duration("read_timeout", defaults.read_timeout)?,
            write_timeout,
            upstream_timeout: env.duration("upstream_timeout", write_timeout)?,
            backend,
            function_port: env.number("function_port", defaults.function_port)?,
            backend_timeout: env.duration("backend_timeout", defaults.backend_timeout)?,
            resolve_cache_ttl: env.duration("resolve_cache_ttl", defaults.resolve_cache_ttl)?,
            queue_address: env.string("queue_address").unwrap_or(defaults.queue_address),
            queue_name: env.string("queue_name").unwrap_or(defaults.queue_name),
            queue_timeout: env.duration("queue_timeout", defaults.queue_timeout)?,
            max_message_bytes: env.number("max_message_bytes", defaults.max_message_bytes)?,
            async_workers: env.number("async_workers", defaults.async_workers)?,
            queue_poll_interval: env.duration("queue_poll_interval", defaults.queue_poll_interval)?,
            callback_timeout: env.duration("callback_timeout", defaults.callback_timeout)?,
            scale_poll_interval: env.duration("scale_poll_interval", defaults.scale_poll_interval)?,
            max_body_bytes: env.number("max_body_bytes", defaults.max_body_bytes)?,
            scaling,
        })
    }
}
