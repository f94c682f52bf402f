//! Shared types, configuration, error classification, retry and
//! circuit-breaker primitives for the lakesink connector.
//!
//! This crate has no Kafka, object-store, or schema-registry dependency
//! of its own — those live in `lakesink-schema` and `lakesink-io`, which
//! depend on the data model and error taxonomy defined here.

pub mod circuit;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod retry;

pub use circuit::{CircuitBreakerRegistry, CircuitState};
pub use config::{ConnectorConfig, ConnectorDefaults};
pub use error::{ConnectorError, ConnectorResult, ErrorClass};
pub use metrics::Metrics;
pub use model::{
    Batch, BufferCounters, DeltaTuning, Destination, DlqEnvelope, FieldMap, ParsedRecord,
    PartitionerClass, ProcessingPolicy, RawMessage, SchemaCompatibility, SourceMeta,
    TableMaintenanceState, TopicBinding, DLQ_ENVELOPE_VERSION,
};
pub use retry::{run_with_retry, RetryPolicy, RetryState};
