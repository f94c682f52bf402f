//! Metrics facade (§4.13). The core crate depends only on this trait;
//! the Prometheus-backed implementation and its HTTP exposition server
//! live in `lakesink-io` so the ingest path never pulls in the HTTP
//! stack.

/// Injected collaborator for reporting counters, gauges, and histograms.
/// Implementations must be cheap to call from the hot path — no
/// blocking I/O.
pub trait Metrics: Send + Sync {
    fn incr_counter(&self, name: &'static str, labels: &[(&'static str, &str)]);
    fn observe_histogram(&self, name: &'static str, value: f64, labels: &[(&'static str, &str)]);
    fn set_gauge(&self, name: &'static str, value: f64, labels: &[(&'static str, &str)]);
}

/// No-op implementation used in tests and anywhere a `Metrics` handle is
/// required but not exercised.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn incr_counter(&self, _name: &'static str, _labels: &[(&'static str, &str)]) {}
    fn observe_histogram(&self, _name: &'static str, _value: f64, _labels: &[(&'static str, &str)]) {}
    fn set_gauge(&self, _name: &'static str, _value: f64, _labels: &[(&'static str, &str)]) {}
}
