//! Configuration Loader (§4.0, §6): parses the on-disk YAML connector
//! configuration, applies environment variable overrides, validates it,
//! and produces the immutable [`TopicBinding`] values the Consumer Loop
//! wires up before consuming a single record.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConnectorError, ConnectorResult};
use crate::model::{DeltaTuning, Destination, PartitionerClass, ProcessingPolicy, SchemaCompatibility, TopicBinding};

/// On-disk shape of the YAML configuration file. Field names match the
/// dotted keys from §6's configuration-options table, expressed as a
/// nested YAML document rather than flat dotted keys.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    connector: RawConnectorDefaults,
    topics: HashMap<String, RawTopicBinding>,
}

#[derive(Debug, Default, Deserialize)]
struct RawConnectorDefaults {
    #[serde(rename = "s3.bucket")]
    s3_bucket: Option<String>,
    #[serde(rename = "s3.region")]
    s3_region: Option<String>,
    #[serde(rename = "s3.endpoint")]
    s3_endpoint: Option<String>,
    #[serde(rename = "s3.accessKeyId")]
    s3_access_key_id: Option<String>,
    #[serde(rename = "s3.secretAccessKey")]
    s3_secret_access_key: Option<String>,
    #[serde(rename = "broker.bootstrapServers")]
    broker_bootstrap_servers: Option<String>,
    #[serde(rename = "broker.groupId")]
    broker_group_id: Option<String>,
    #[serde(rename = "registry.url")]
    registry_url: Option<String>,
    #[serde(rename = "schema.compatibility")]
    schema_compatibility: Option<SchemaCompatibility>,
    #[serde(rename = "partitioner.class")]
    partitioner_class: Option<PartitionerClass>,
    #[serde(rename = "maxRetries")]
    max_retries: Option<u32>,
    #[serde(rename = "retryBackoffMs")]
    retry_backoff_ms: Option<u64>,
    #[serde(rename = "metrics.port")]
    metrics_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawTopicBinding {
    #[serde(rename = "kafkaTopic")]
    kafka_topic: Option<String>,
    #[serde(rename = "subject")]
    schema_subject: String,
    destination: RawDestination,
    #[serde(default)]
    processing: RawProcessing,
}

#[derive(Debug, Deserialize)]
struct RawDestination {
    bucket: String,
    path: String,
    #[serde(rename = "tableName")]
    table_name: String,
    #[serde(default, rename = "partitionColumns")]
    partition_columns: Vec<String>,
    #[serde(default)]
    delta: RawDeltaTuning,
}

#[derive(Debug, Default, Deserialize)]
struct RawDeltaTuning {
    #[serde(default, rename = "enableOptimize")]
    enable_optimize: bool,
    #[serde(rename = "optimizeInterval")]
    optimize_interval: Option<u64>,
    #[serde(default, rename = "enableVacuum")]
    enable_vacuum: bool,
    #[serde(rename = "vacuumRetentionHours")]
    vacuum_retention_hours: Option<u64>,
    #[serde(default, rename = "enableSchemaEvolution")]
    enable_schema_evolution: bool,
    #[serde(rename = "checkpointInterval")]
    checkpoint_interval: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawProcessing {
    #[serde(rename = "batchSize")]
    batch_size: Option<usize>,
    #[serde(rename = "flushIntervalSeconds")]
    flush_interval_seconds: Option<u64>,
    #[serde(rename = "maxRetries")]
    max_retries: Option<u32>,
}

/// Validated, in-memory connector-level defaults (§6).
#[derive(Debug, Clone, Default)]
pub struct ConnectorDefaults {
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key_id: Option<String>,
    pub s3_secret_access_key: Option<String>,
    pub broker_bootstrap_servers: String,
    pub broker_group_id: String,
    pub registry_url: String,
    pub schema_compatibility: SchemaCompatibility,
    pub partitioner_class: PartitionerClass,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub metrics_port: u16,
}

/// Fully validated configuration. Immutable for the lifetime of the
/// process; the Consumer Loop rebuilds this (and re-runs subscription) on
/// a config-triggered restart rather than hot-reloading it in place.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub defaults: ConnectorDefaults,
    pub topics: HashMap<String, Arc<TopicBinding>>,
}

impl ConnectorConfig {
    /// Loads `path`, applies environment variable overrides, validates,
    /// and returns the ready-to-use configuration. Any parse or
    /// validation failure is a [`ConnectorError::Configuration`] —
    /// always terminal (§4.0).
    pub fn load(path: &Path) -> ConnectorResult<ConnectorConfig> {
        let raw_text = std::fs::read_to_string(path)
            .map_err(|e| ConnectorError::Configuration(format!("reading {}: {e}", path.display())))?;
        let raw: RawConfig = serde_yaml::from_str(&raw_text)
            .map_err(|e| ConnectorError::Configuration(format!("parsing {}: {e}", path.display())))?;
        let defaults = build_defaults(raw.connector)?;
        let topics = build_topics(raw.topics)?;
        let config = ConnectorConfig { defaults, topics };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ConnectorResult<()> {
        if self.topics.is_empty() {
            return Err(ConnectorError::Configuration(
                "at least one entry is required under `topics`".into(),
            ));
        }
        for (name, binding) in &self.topics {
            if binding.processing.batch_size < 1 {
                return Err(ConnectorError::Configuration(format!(
                    "topics.{name}.processing.batchSize must be >= 1"
                )));
            }
            if binding.processing.flush_interval.as_secs() < 1 {
                return Err(ConnectorError::Configuration(format!(
                    "topics.{name}.processing.flushIntervalSeconds must be >= 1"
                )));
            }
        }
        if self.defaults.broker_bootstrap_servers.is_empty() {
            return Err(ConnectorError::Configuration(
                "connector.broker.bootstrapServers (or BROKER_BOOTSTRAP) must be set".into(),
            ));
        }
        Ok(())
    }
}

fn build_defaults(raw: RawConnectorDefaults) -> ConnectorResult<ConnectorDefaults> {
    let mut defaults = ConnectorDefaults {
        s3_bucket: raw.s3_bucket,
        s3_region: raw.s3_region,
        s3_endpoint: raw.s3_endpoint,
        s3_access_key_id: raw.s3_access_key_id,
        s3_secret_access_key: raw.s3_secret_access_key,
        broker_bootstrap_servers: raw.broker_bootstrap_servers.unwrap_or_default(),
        broker_group_id: raw.broker_group_id.unwrap_or_else(|| "lakesink".to_string()),
        registry_url: raw.registry_url.unwrap_or_default(),
        schema_compatibility: raw.schema_compatibility.unwrap_or_default(),
        partitioner_class: raw.partitioner_class.unwrap_or_default(),
        max_retries: raw.max_retries.unwrap_or(3),
        retry_backoff_ms: raw.retry_backoff_ms.unwrap_or(1000),
        metrics_port: raw.metrics_port.unwrap_or(9090),
    };
    apply_env_overrides(&mut defaults);
    if defaults.max_retries > 100 {
        return Err(ConnectorError::Configuration(
            "connector.maxRetries must be <= 100".into(),
        ));
    }
    Ok(defaults)
}

/// Environment variable overrides, applied on top of file values
/// (SPEC_FULL.md §4.0).
fn apply_env_overrides(defaults: &mut ConnectorDefaults) {
    if let Ok(v) = std::env::var("BROKER_BOOTSTRAP") {
        defaults.broker_bootstrap_servers = v;
    }
    if let Ok(v) = std::env::var("REGISTRY_URL") {
        defaults.registry_url = v;
    }
    if let Ok(v) = std::env::var("STORE_ENDPOINT") {
        defaults.s3_endpoint = Some(v);
    }
    if let Ok(v) = std::env::var("STORE_ACCESS_KEY_ID") {
        defaults.s3_access_key_id = Some(v);
    }
    if let Ok(v) = std::env::var("STORE_SECRET_ACCESS_KEY") {
        defaults.s3_secret_access_key = Some(v);
    }
    if let Ok(v) = std::env::var("STORE_REGION") {
        defaults.s3_region = Some(v);
    }
}

fn build_topics(raw: HashMap<String, RawTopicBinding>) -> ConnectorResult<HashMap<String, Arc<TopicBinding>>> {
    let mut out = HashMap::with_capacity(raw.len());
    for (name, t) in raw {
        let delta = DeltaTuning {
            enable_optimize: t.destination.delta.enable_optimize,
            optimize_interval: t.destination.delta.optimize_interval.unwrap_or(10),
            enable_vacuum: t.destination.delta.enable_vacuum,
            vacuum_retention_hours: t.destination.delta.vacuum_retention_hours.unwrap_or(168),
            enable_schema_evolution: t.destination.delta.enable_schema_evolution,
            checkpoint_interval: t.destination.delta.checkpoint_interval.unwrap_or(10),
        };
        let destination = Destination {
            bucket: t.destination.bucket,
            path: t.destination.path,
            table_name: t.destination.table_name,
            partition_columns: t.destination.partition_columns,
            delta,
        };
        let processing = ProcessingPolicy {
            batch_size: t.processing.batch_size.unwrap_or(500),
            flush_interval: Duration::from_secs(t.processing.flush_interval_seconds.unwrap_or(30)),
            max_retries: t.processing.max_retries.unwrap_or(3),
        };
        let binding = TopicBinding {
            kafka_topic: t.kafka_topic.unwrap_or_else(|| name.clone()),
            schema_subject: t.schema_subject,
            destination,
            processing,
        };
        out.insert(name, Arc::new(binding));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fixture(yaml: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        f
    }

    const MINIMAL_YAML: &str = r#"
connector:
  broker.bootstrapServers: "localhost:9092"
  registry.url: "http://localhost:8081"
topics:
  orders:
    subject: "orders-value"
    destination:
      bucket: "lake"
      path: "orders"
      tableName: "orders"
"#;

    #[test]
    fn loads_minimal_valid_config() {
        let f = write_fixture(MINIMAL_YAML);
        let config = ConnectorConfig::load(f.path()).expect("config should load");
        let binding = config.topics.get("orders").expect("orders topic present");
        assert_eq!(binding.kafka_topic, "orders");
        assert_eq!(binding.processing.batch_size, 500);
    }

    #[test]
    fn rejects_empty_topics_map() {
        let f = write_fixture(
            r#"
connector:
  broker.bootstrapServers: "localhost:9092"
topics: {}
"#,
        );
        let err = ConnectorConfig::load(f.path()).unwrap_err();
        assert!(matches!(err, ConnectorError::Configuration(_)));
    }

    #[test]
    fn rejects_zero_batch_size() {
        let f = write_fixture(
            r#"
connector:
  broker.bootstrapServers: "localhost:9092"
topics:
  orders:
    subject: "orders-value"
    destination:
      bucket: "lake"
      path: "orders"
      tableName: "orders"
    processing:
      batchSize: 0
"#,
        );
        let err = ConnectorConfig::load(f.path()).unwrap_err();
        assert!(matches!(err, ConnectorError::Configuration(_)));
    }

    #[test]
    fn env_override_wins_over_file_value() {
        std::env::set_var("BROKER_BOOTSTRAP", "override:9092");
        let f = write_fixture(MINIMAL_YAML);
        let config = ConnectorConfig::load(f.path()).unwrap();
        assert_eq!(config.defaults.broker_bootstrap_servers, "override:9092");
        std::env::remove_var("BROKER_BOOTSTRAP");
    }
}
