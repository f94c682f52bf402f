//! Data model shared by every pipeline stage: raw Kafka records, parsed
//! records in canonical field space, buffered batches, and the
//! configuration-derived `TopicBinding` that ties a Kafka topic to its
//! destination table and processing policy.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A Kafka record as delivered by the consumer, before parsing.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub kafka_timestamp_ms: Option<i64>,
    pub headers: Vec<(String, Vec<u8>)>,
}

/// Kafka coordinates for a single record, carried alongside the parsed
/// fields so the Enricher and Table Writer can attribute a row to its
/// source offset without re-deriving it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceMeta {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub kafka_timestamp_ms: Option<i64>,
    pub key: Option<String>,
}

/// A record in canonical field space, conforming to the schema resolved
/// for its topic. Fields are kept in an order-preserving JSON object
/// (`serde_json`'s `preserve_order` feature) because several destinations
/// care about column order in the written parquet file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedRecord {
    pub fields: Map<String, Value>,
    pub source: SourceMeta,
    pub correlation_id: Uuid,
    /// Business COB date, if the record carried `cob`/`cob_date`; drives
    /// partition-column derivation ahead of wall-clock enrichment (B3).
    pub cob_date: Option<chrono::NaiveDate>,
}

impl ParsedRecord {
    pub fn new(fields: Map<String, Value>, source: SourceMeta) -> Self {
        let cob_date = extract_cob_date(&fields);
        Self {
            fields,
            source,
            correlation_id: Uuid::new_v4(),
            cob_date,
        }
    }
}

fn extract_cob_date(fields: &Map<String, Value>) -> Option<chrono::NaiveDate> {
    let raw = fields.get("cob").or_else(|| fields.get("cob_date"))?;
    match raw {
        Value::String(s) => chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok(),
        _ => None,
    }
}

/// An ordered, bounded group of enriched records flushed together to the
/// table writer. Immutable once handed off by the Batch Buffer (I2).
#[derive(Debug, Clone)]
pub struct Batch {
    pub destination_key: String,
    pub records: Vec<ParsedRecord>,
    pub oldest_enqueue: Instant,
    pub byte_size_estimate: usize,
    pub binding: Arc<TopicBinding>,
}

impl Batch {
    pub fn new(destination_key: String, binding: Arc<TopicBinding>) -> Self {
        Self {
            destination_key,
            records: Vec::new(),
            oldest_enqueue: Instant::now(),
            byte_size_estimate: 0,
            binding,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Immutable, per-topic binding created from configuration at startup
/// (§3 TopicBinding).
#[derive(Debug, Clone)]
pub struct TopicBinding {
    pub kafka_topic: String,
    pub schema_subject: String,
    pub destination: Destination,
    pub processing: ProcessingPolicy,
}

impl TopicBinding {
    /// `{topic}:{table}` — the destination key the Batch Buffer groups on
    /// before any partition-derived suffix is appended (§4.9).
    pub fn destination_key(&self) -> String {
        format!("{}:{}", self.kafka_topic, self.destination.table_name)
    }
}

#[derive(Debug, Clone)]
pub struct Destination {
    pub bucket: String,
    pub path: String,
    pub table_name: String,
    pub partition_columns: Vec<String>,
    pub delta: DeltaTuning,
}

#[derive(Debug, Clone, Copy)]
pub struct DeltaTuning {
    pub enable_optimize: bool,
    pub optimize_interval: u64,
    pub enable_vacuum: bool,
    pub vacuum_retention_hours: u64,
    pub enable_schema_evolution: bool,
    pub checkpoint_interval: u64,
}

impl Default for DeltaTuning {
    fn default() -> Self {
        Self {
            enable_optimize: false,
            optimize_interval: 10,
            enable_vacuum: false,
            vacuum_retention_hours: 168,
            enable_schema_evolution: false,
            checkpoint_interval: 10,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessingPolicy {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_retries: u32,
}

impl Default for ProcessingPolicy {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

/// Compatibility policy used when evaluating schema evolution (§6, §4.10
/// step 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchemaCompatibility {
    Backward,
    Forward,
    Full,
    #[default]
    None,
}

/// Partitioner strategy selecting how the destination-partition suffix is
/// derived for a record (§6 `partitioner.class`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionerClass {
    #[default]
    Default,
    TimeBased,
    TopicPartition,
}

/// Envelope written to the DLQ topic for a terminally failed record
/// (§3 DLQEnvelope, §6 DLQ).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEnvelope {
    pub original_topic: String,
    pub original_partition: i32,
    pub original_offset: i64,
    pub original_key: Option<String>,
    pub original_value_base64: String,
    pub original_timestamp_ms: Option<i64>,
    pub error_reason: String,
    pub error_class: String,
    pub short_stack: Option<String>,
    pub dlq_timestamp_ms: i64,
    pub envelope_version: u32,
}

pub const DLQ_ENVELOPE_VERSION: u32 = 1;

/// A snapshot of per-destination progress: the Batch Buffer accumulator.
/// Not persisted; rebuilt on restart from an empty state (at-least-once
/// replay covers the gap).
#[derive(Debug, Default, Clone, Copy)]
pub struct BufferCounters {
    pub flush_count: u64,
    pub records_buffered: u64,
}

/// Table-level maintenance bookkeeping (§3 TableSnapshotState, I4).
#[derive(Debug, Clone, Default)]
pub struct TableMaintenanceState {
    pub batches_since_optimize: u64,
    pub last_optimize_ms: Option<i64>,
    pub last_vacuum_ms: Option<i64>,
}

pub type FieldMap = BTreeMap<String, Value>;
