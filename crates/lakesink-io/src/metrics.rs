//! Prometheus-backed `Metrics` implementation (§4.13). Registers the
//! connector's counters and histograms up front so `/metrics` always
//! exposes a stable set of series, even before the first event of a
//! given kind occurs.

use std::sync::Arc;

use metrics::{counter, describe_counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use lakesink_core::Metrics;

/// Series names this connector reports. Registered eagerly in
/// [`PrometheusMetrics::install`] so dashboards don't show gaps for
/// counters that simply haven't fired yet.
pub const COUNTERS: &[&str] = &[
    "records_consumed_total",
    "records_written_total",
    "records_dlq_total",
    "files_created_total",
    "write_errors_total",
    "batches_flushed_total",
    "circuit_open_total",
    "retry_attempts_total",
    "compactions_total",
    "vacuums_total",
];

pub struct PrometheusMetrics {
    handle: PrometheusHandle,
}

impl PrometheusMetrics {
    /// Installs the global Prometheus recorder and pre-registers the
    /// connector's known series. Must be called once, before any
    /// `metrics::counter!`/`histogram!`/`gauge!` call is made.
    pub fn install() -> Result<Arc<Self>, lakesink_core::ConnectorError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| lakesink_core::ConnectorError::Configuration(format!("installing metrics recorder: {e}")))?;
        for name in COUNTERS {
            describe_counter!(name.to_string(), metrics::Unit::Count, "lakesink connector counter");
            counter!(name.to_string()).increment(0);
        }
        Ok(Arc::new(Self { handle }))
    }

    /// Renders the current state in Prometheus text exposition format,
    /// for the `/metrics` HTTP handler.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl Metrics for PrometheusMetrics {
    fn incr_counter(&self, name: &'static str, labels: &[(&'static str, &str)]) {
        let owned: Vec<(&'static str, String)> = labels.iter().map(|(k, v)| (*k, v.to_string())).collect();
        counter!(name, &owned).increment(1);
    }

    fn observe_histogram(&self, name: &'static str, value: f64, labels: &[(&'static str, &str)]) {
        let owned: Vec<(&'static str, String)> = labels.iter().map(|(k, v)| (*k, v.to_string())).collect();
        histogram!(name, &owned).record(value);
    }

    fn set_gauge(&self, name: &'static str, value: f64, labels: &[(&'static str, &str)]) {
        let owned: Vec<(&'static str, String)> = labels.iter().map(|(k, v)| (*k, v.to_string())).collect();
        gauge!(name, &owned).set(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_list_is_non_empty() {
        assert!(!COUNTERS.is_empty());
    }
}
