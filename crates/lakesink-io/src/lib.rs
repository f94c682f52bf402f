pub mod buffer;
pub mod dlq;
pub mod enrich;
pub mod health;
pub mod kafka_source;
pub mod maintenance;
pub mod metrics;
pub mod table_writer;

pub use buffer::BatchBuffer;
pub use dlq::{DeadLetter, DeadLetterSink, DlqChannel};
pub use enrich::enrich;
pub use health::HealthState;
pub use kafka_source::{build_consumer, commit_offset, to_raw_message, LakesinkConsumer, RebalanceEvent};
pub use maintenance::MaintenanceScheduler;
pub use metrics::PrometheusMetrics;
pub use table_writer::{CommitOutcome, StoreCredentials, TableWriter};
