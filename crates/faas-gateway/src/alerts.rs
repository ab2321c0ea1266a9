//! Alertmanager webhook handling for `POST /system/alert`.

use faas_common::{FaasError, FunctionName};
use faas_orchestrator::FunctionResolver;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::ScalingPolicy;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlertRequest {
    #[serde(default)]
    pub receiver: String,
    pub status: String,
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Alert {
    pub status: String,
    #[serde(default)]
    pub labels: AlertLabels,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AlertLabels {
    #[serde(default)]
    pub alertname: String,
    #[serde(default)]
    pub function_name: String,
}

/// Result of one webhook delivery.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AlertOutcome {
    /// `(function, new replica count)` for every scale request made.
    pub scaled: Vec<(String, u64)>,
    pub skipped: usize,
    pub failed: usize,
}

/// Replica count after an alert. Firing grows by `factor` percent of the
/// maximum, rounded up and capped; anything else falls back to the minimum.
pub fn next_replicas(policy: &ScalingPolicy, current: u64, firing: bool) -> u64 {
    if !firing {
        return policy.min_replicas;
    }
    let step = policy.max_replicas.saturating_mul(policy.factor).div_ceil(100);
    current.saturating_add(step).min(policy.max_replicas)
}

#[instrument(skip_all, fields(status = %request.status, alerts = request.alerts.len()))]
pub async fn handle_alerts(
    resolver: &FunctionResolver,
    policy: &ScalingPolicy,
    request: &AlertRequest,
) -> AlertOutcome {
    let mut outcome = AlertOutcome::default();
    for alert in &request.alerts {
        let Ok(name) = FunctionName::parse(alert.labels.function_name.as_str()) else {
            warn!(label = %alert.labels.function_name, "Alert without a usable function_name");
            outcome.skipped += 1;
            continue;
        };

        let counts = match resolver.replicas(&name).await {
            Ok(counts) => counts,
            Err(FaasError::NotFound(_)) => {
                warn!(function = %name, "Alert for unknown function");
                outcome.skipped += 1;
                continue;
            }
            Err(e) => {
                warn!(function = %name, error = %e, "Could not read replicas for alert");
                outcome.failed += 1;
                continue;
            }
        };

        let firing = alert.status.eq_ignore_ascii_case("firing");
        let target = next_replicas(policy, counts.desired, firing);
        if target == counts.desired {
            outcome.skipped += 1;
            continue;
        }
        match resolver.scale(&name, target).await {
            Ok(()) => {
                info!(function = %name, from = counts.desired, to = target, "Scaled function");
                outcome.scaled.push((name.to_string(), target));
            }
            Err(e) => {
                warn!(function = %name, error = %e, "Scale request failed");
                outcome.failed += 1;
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use faas_common::FunctionBackend;
    use faas_orchestrator::InMemoryBackend;
    use std::sync::Arc;
    use std::time::Duration;

    fn alert(status: &str, function: &str) -> Alert {
        Alert {
            status: status.to_string(),
            labels: AlertLabels {
                alertname: "APIHighInvocationRate".to_string(),
                function_name: function.to_string(),
            },
        }
    }

    #[test]
    fn test_next_replicas() {
        let policy = ScalingPolicy::default();
        assert_eq!(next_replicas(&policy, 2, true), 6);
        assert_eq!(next_replicas(&policy, 18, true), 20);
        assert_eq!(next_replicas(&policy, 20, true), 20);
        assert_eq!(next_replicas(&policy, 9, false), 1);

        let odd = ScalingPolicy {
            min_replicas: 1,
            max_replicas: 7,
            factor: 10,
        };
        // ceil(0.7) = 1
        assert_eq!(next_replicas(&odd, 1, true), 2);

        let huge = ScalingPolicy {
            min_replicas: 1,
            max_replicas: u64::MAX,
            factor: 20,
        };
        let scaled = next_replicas(&huge, 1, true);
        assert!(scaled > 1);
    }

    #[tokio::test]
    async fn test_firing_then_resolved() {
        let backend = Arc::new(InMemoryBackend::from_table("echo=http://echo:8080", 8080).unwrap());
        let echo = FunctionName::parse("echo").unwrap();
        backend.set_replicas(&echo, 2, 2).unwrap();
        let resolver = FunctionResolver::new(backend.clone(), Duration::from_secs(1));
        let policy = ScalingPolicy::default();

        let firing = AlertRequest {
            receiver: "scale-up".into(),
            status: "firing".into(),
            alerts: vec![alert("firing", "echo"), alert("firing", "ghost")],
        };
        let outcome = handle_alerts(&resolver, &policy, &firing).await;
        assert_eq!(outcome.scaled, vec![("echo".to_string(), 6)]);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.failed, 0);
        assert_eq!(backend.replicas(&echo).await.unwrap().desired, 6);

        let resolved = AlertRequest {
            receiver: "scale-up".into(),
            status: "resolved".into(),
            alerts: vec![alert("resolved", "echo")],
        };
        handle_alerts(&resolver, &policy, &resolved).await;
        assert_eq!(backend.replicas(&echo).await.unwrap().desired, 1);
    }

    #[tokio::test]
    async fn test_scale_up_steps_from_desired_count() {
        let backend = Arc::new(InMemoryBackend::from_table("echo=http://echo:8080", 8080).unwrap());
        let echo = FunctionName::parse("echo").unwrap();
        // Three requested, one running so far.
        backend.set_replicas(&echo, 1, 3).unwrap();
        let resolver = FunctionResolver::new(backend.clone(), Duration::from_secs(1));

        let firing = AlertRequest {
            receiver: "scale-up".into(),
            status: "firing".into(),
            alerts: vec![alert("firing", "echo")],
        };
        let outcome = handle_alerts(&resolver, &ScalingPolicy::default(), &firing).await;
        assert_eq!(outcome.scaled, vec![("echo".to_string(), 7)]);
        assert_eq!(backend.replicas(&echo).await.unwrap().desired, 7);
    }

    #[test]
    fn test_parses_alertmanager_body() {
        let body = r#"{
            "receiver": "scale-up",
            "status": "firing",
            "alerts": [{
                "status": "firing",
                "labels": {"alertname": "APIHighInvocationRate", "function_name": "echo", "code": "200"},
                "startsAt": "2017-03-15T15:52:57.805Z"
            }],
            "groupLabels": {"alertname": "APIHighInvocationRate"},
            "version": "3"
        }"#;
        let request: AlertRequest = serde_json::from_str(body).unwrap();
        assert_eq!(request.alerts[0].labels.function_name, "echo");
    }
}
