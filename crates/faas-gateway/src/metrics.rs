//! Gateway metrics registry and Prometheus text exposition.

use dashmap::DashMap;
use faas_common::{InvocationMode, ReplicaSample};
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bounds, in seconds, of the invocation latency histogram.
pub const LATENCY_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct InvocationKey {
    function: String,
    code: u16,
    mode: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct SeriesKey {
    function: String,
    mode: &'static str,
}

#[derive(Debug, Default, Clone)]
struct Histogram {
    buckets: [u64; LATENCY_BUCKETS.len()],
    count: u64,
    sum: f64,
}

impl Histogram {
    fn observe(&mut self, seconds: f64) {
        for (bound, bucket) in LATENCY_BUCKETS.iter().zip(self.buckets.iter_mut()) {
            if seconds <= *bound {
                *bucket += 1;
            }
        }
        self.count += 1;
        self.sum += seconds;
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ReplicaGauge {
    current: u64,
    desired: u64,
}

#[derive(Debug, Default, Clone)]
struct AsyncReport {
    by_code: Vec<(u16, u64)>,
    seconds_sum: f64,
}

/// Registry shared by the router, the async workers and the scaling watcher.
#[derive(Debug, Default)]
pub struct Metrics {
    invocations: DashMap<InvocationKey, AtomicU64>,
    latency: DashMap<SeriesKey, Histogram>,
    replicas: DashMap<String, ReplicaGauge>,
    async_reports: DashMap<String, AsyncReport>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_invocation(
        &self,
        function: &str,
        mode: InvocationMode,
        code: u16,
        duration: Duration,
    ) {
        let key = InvocationKey {
            function: function.to_string(),
            code,
            mode: mode.as_str(),
        };
        self.invocations
            .entry(key)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
        self.latency
            .entry(SeriesKey {
                function: function.to_string(),
                mode: mode.as_str(),
            })
            .or_default()
            .observe(duration.as_secs_f64());
    }

    pub fn record_replicas(&self, sample: &ReplicaSample) {
        self.replicas.insert(
            sample.function.to_string(),
            ReplicaGauge {
                current: sample.current,
                desired: sample.desired,
            },
        );
    }

    pub fn record_async_report(&self, function: &str, code: u16, seconds: f64) {
        let mut report = self.async_reports.entry(function.to_string()).or_default();
        match report.by_code.iter_mut().find(|(c, _)| *c == code) {
            Some((_, count)) => *count += 1,
            None => report.by_code.push((code, 1)),
        }
        report.seconds_sum += seconds.max(0.0);
    }

    /// Drop the replica gauges of a removed function.
    pub fn forget_function(&self, function: &str) {
        self.replicas.remove(function);
    }

    /// Invocations of `function` across every code and mode.
    pub fn invocation_count(&self, function: &str) -> u64 {
        self.invocations
            .iter()
            .filter(|entry| entry.key().function == function)
            .map(|entry| entry.value().load(Ordering::Relaxed))
            .sum()
    }

    pub fn invocations(&self, function: &str, code: u16, mode: InvocationMode) -> u64 {
        let key = InvocationKey {
            function: function.to_string(),
            code,
            mode: mode.as_str(),
        };
        self.invocations
            .get(&key)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Last `(current, desired)` reading for `function`.
    pub fn replicas(&self, function: &str) -> Option<(u64, u64)> {
        self.replicas
            .get(function)
            .map(|gauge| (gauge.current, gauge.desired))
    }

    pub fn render(&self) -> String {
        let mut out = String::new();

        let mut invocations: Vec<(InvocationKey, u64)> = self
            .invocations
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        invocations.sort();
        out.push_str("# HELP gateway_function_invocation_total Function invocations.\n");
        out.push_str("# TYPE gateway_function_invocation_total counter\n");
        for (key, count) in invocations {
            let _ = writeln!(
                out,
                "gateway_function_invocation_total{{function_name=\"{}\",code=\"{}\",mode=\"{}\"}} {}",
                escape(&key.function),
                key.code,
                key.mode,
                count
            );
        }

        let mut latency: Vec<(SeriesKey, Histogram)> = self
            .latency
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        latency.sort_by(|a, b| a.0.cmp(&b.0));
        out.push_str("# HELP gateway_functions_seconds Function invocation time taken.\n");
        out.push_str("# TYPE gateway_functions_seconds histogram\n");
        for (key, histogram) in latency {
            let labels = format!(
                "function_name=\"{}\",mode=\"{}\"",
                escape(&key.function),
                key.mode
            );
            for (bound, count) in LATENCY_BUCKETS.iter().zip(histogram.buckets.iter()) {
                let _ = writeln!(
                    out,
                    "gateway_functions_seconds_bucket{{{labels},le=\"{bound}\"}} {count}"
                );
            }
            let _ = writeln!(
                out,
                "gateway_functions_seconds_bucket{{{labels},le=\"+Inf\"}} {}",
                histogram.count
            );
            let _ = writeln!(
                out,
                "gateway_functions_seconds_sum{{{labels}}} {:.6}",
                histogram.sum
            );
            let _ = writeln!(
                out,
                "gateway_functions_seconds_count{{{labels}}} {}",
                histogram.count
            );
        }

        let mut replicas: Vec<(String, ReplicaGauge)> = self
            .replicas
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        replicas.sort_by(|a, b| a.0.cmp(&b.0));
        out.push_str("# HELP gateway_service_count Current function replicas.\n");
        out.push_str("# TYPE gateway_service_count gauge\n");
        for (function, gauge) in &replicas {
            let _ = writeln!(
                out,
                "gateway_service_count{{function_name=\"{}\"}} {}",
                escape(function),
                gauge.current
            );
        }
        out.push_str("# HELP gateway_service_desired_count Desired function replicas.\n");
        out.push_str("# TYPE gateway_service_desired_count gauge\n");
        for (function, gauge) in &replicas {
            let _ = writeln!(
                out,
                "gateway_service_desired_count{{function_name=\"{}\"}} {}",
                escape(function),
                gauge.desired
            );
        }

        let mut reports: Vec<(String, AsyncReport)> = self
            .async_reports
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        reports.sort_by(|a, b| a.0.cmp(&b.0));
        out.push_str("# HELP gateway_async_report_total Reported async invocation results.\n");
        out.push_str("# TYPE gateway_async_report_total counter\n");
        for (function, report) in &reports {
            let mut codes = report.by_code.clone();
            codes.sort();
            for (code, count) in codes {
                let _ = writeln!(
                    out,
                    "gateway_async_report_total{{function_name=\"{}\",code=\"{}\"}} {}",
                    escape(function),
                    code,
                    count
                );
            }
        }
        out.push_str(
            "# HELP gateway_async_report_seconds_sum Reported async invocation time taken.\n",
        );
        out.push_str("# TYPE gateway_async_report_seconds_sum counter\n");
        for (function, report) in &reports {
            let _ = writeln!(
                out,
                "gateway_async_report_seconds_sum{{function_name=\"{}\"}} {:.6}",
                escape(function),
                report.seconds_sum
            );
        }

        out
    }
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use faas_common::{FunctionName, ReplicaCounts};

    #[test]
    fn test_render_empty_still_declares_types() {
        let output = Metrics::new().render();
        assert!(output.contains("# TYPE gateway_function_invocation_total counter"));
        assert!(output.contains("# TYPE gateway_functions_seconds histogram"));
        assert!(output.contains("# TYPE gateway_service_count gauge"));
    }

    #[test]
    fn test_mode_is_a_label() {
        let metrics = Metrics::new();
        metrics.record_invocation("echo", InvocationMode::Sync, 200, Duration::from_millis(20));
        metrics.record_invocation("echo", InvocationMode::Async, 200, Duration::from_millis(20));
        metrics.record_invocation("echo", InvocationMode::Sync, 502, Duration::from_millis(3));

        assert_eq!(metrics.invocations("echo", 200, InvocationMode::Sync), 1);
        assert_eq!(metrics.invocations("echo", 200, InvocationMode::Async), 1);
        assert_eq!(metrics.invocation_count("echo"), 3);

        let output = metrics.render();
        assert!(output.contains(
            "gateway_function_invocation_total{function_name=\"echo\",code=\"200\",mode=\"sync\"} 1"
        ));
        assert!(output.contains(
            "gateway_function_invocation_total{function_name=\"echo\",code=\"502\",mode=\"sync\"} 1"
        ));
        assert!(output.contains(
            "gateway_functions_seconds_count{function_name=\"echo\",mode=\"async\"} 1"
        ));
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let metrics = Metrics::new();
        metrics.record_invocation("wc", InvocationMode::Sync, 200, Duration::from_millis(30));
        metrics.record_invocation("wc", InvocationMode::Sync, 200, Duration::from_secs(3));
        let output = metrics.render();
        assert!(output.contains(
            "gateway_functions_seconds_bucket{function_name=\"wc\",mode=\"sync\",le=\"0.025\"} 0"
        ));
        assert!(output.contains(
            "gateway_functions_seconds_bucket{function_name=\"wc\",mode=\"sync\",le=\"0.05\"} 1"
        ));
        assert!(output.contains(
            "gateway_functions_seconds_bucket{function_name=\"wc\",mode=\"sync\",le=\"5\"} 2"
        ));
        assert!(output.contains(
            "gateway_functions_seconds_bucket{function_name=\"wc\",mode=\"sync\",le=\"+Inf\"} 2"
        ));
    }

    #[test]
    fn test_replica_gauges_follow_latest_sample() {
        let metrics = Metrics::new();
        let echo = FunctionName::parse("echo").unwrap();
        metrics.record_replicas(&ReplicaSample::new(
            echo.clone(),
            ReplicaCounts {
                current: 1,
                desired: 1,
            },
        ));
        metrics.record_replicas(&ReplicaSample::new(
            echo,
            ReplicaCounts {
                current: 2,
                desired: 3,
            },
        ));
        assert_eq!(metrics.replicas("echo"), Some((2, 3)));
        let output = metrics.render();
        assert!(output.contains("gateway_service_count{function_name=\"echo\"} 2"));
        assert!(output.contains("gateway_service_desired_count{function_name=\"echo\"} 3"));

        metrics.forget_function("echo");
        assert_eq!(metrics.replicas("echo"), None);
    }

    #[test]
    fn test_async_reports() {
        let metrics = Metrics::new();
        metrics.record_async_report("echo", 200, 0.5);
        metrics.record_async_report("echo", 200, 0.25);
        metrics.record_async_report("echo", 500, 1.0);
        let output = metrics.render();
        assert!(output.contains("gateway_async_report_total{function_name=\"echo\",code=\"200\"} 2"));
        assert!(output.contains("gateway_async_report_total{function_name=\"echo\",code=\"500\"} 1"));
        assert!(output.contains("gateway_async_report_seconds_sum{function_name=\"echo\"} 1.750000"));
    }
}
