//! Table Writer (§4.10): lands a flushed [`Batch`] as one transactional
//! append commit against a Delta-Lake-shaped table on S3-compatible
//! object storage.
//!
//! Grounded in the corpus's own Iceberg-style sink (`sink_iceberg.rs`):
//! same `object_store::aws::AmazonS3Builder` setup and `ArrowWriter`
//! buffer-then-`put` flow, but the metadata protocol here is Delta's
//! rather than Iceberg's — a flat, append-only JSON action log under
//! `_delta_log/`, committed with an optimistic-concurrency conditional
//! put instead of a metadata-pointer rewrite. See DESIGN.md for why
//! `deltalake`/`iceberg` crates aren't used directly.

use std::collections::{BTreeMap, HashSet};
use std::io::Cursor as IoCursor;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arrow::datatypes::SchemaRef;
use arrow::json::ReaderBuilder;
use arrow::record_batch::RecordBatch;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use lakesink_core::{Batch, ConnectorError, Destination, Metrics, SchemaCompatibility};
use lakesink_schema::SchemaClient;

/// A single line of the `_delta_log/NNNNN.json` commit file. Delta's
/// real log nests each action under its own single-key object per
/// line; we model only the subset this connector ever writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeltaAction {
    #[serde(rename = "metaData")]
    MetaData(MetaDataAction),
    #[serde(rename = "add")]
    Add(AddAction),
    #[serde(rename = "remove")]
    Remove(RemoveAction),
    #[serde(rename = "commitInfo")]
    CommitInfo(CommitInfoAction),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaDataAction {
    pub id: String,
    pub schema_string: String,
    pub partition_columns: Vec<String>,
    pub created_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddAction {
    pub path: String,
    pub partition_values: BTreeMap<String, String>,
    pub size: i64,
    pub modification_time: i64,
    pub data_change: bool,
    pub stats: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveAction {
    pub path: String,
    pub deletion_timestamp: i64,
    pub data_change: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfoAction {
    pub timestamp: i64,
    pub operation: String,
    pub num_records: i64,
}

/// Outcome of a successful commit, used to update per-table maintenance
/// counters and metrics.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub version: u64,
    pub files_written: usize,
    pub records_written: usize,
    pub bytes_written: u64,
}

pub struct TableWriter {
    metrics: Arc<dyn Metrics>,
    schema_client: Arc<dyn SchemaClient>,
    compatibility: SchemaCompatibility,
}

impl TableWriter {
    pub fn new(metrics: Arc<dyn Metrics>, schema_client: Arc<dyn SchemaClient>, compatibility: SchemaCompatibility) -> Self {
        Self {
            metrics,
            schema_client,
            compatibility,
        }
    }

    /// Builds the object store client for `destination`. Exposed so the
    /// Maintenance Scheduler can reuse the same S3 wiring after a commit
    /// without the caller re-deriving `AmazonS3Builder` configuration.
    pub fn store_for(&self, destination: &Destination, creds: &StoreCredentials) -> Result<Arc<dyn ObjectStore>, ConnectorError> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&destination.bucket)
            .with_allow_http(true);
        if let Some(endpoint) = &creds.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if let Some(region) = &creds.region {
            builder = builder.with_region(region);
        }
        if let Some(key) = &creds.access_key_id {
            builder = builder.with_access_key_id(key);
        }
        if let Some(secret) = &creds.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        let store = builder
            .build()
            .map_err(|e| ConnectorError::Storage(format!("building object store client: {e}")))?;
        Ok(Arc::new(store))
    }

    /// Commits `batch` as a new table version. Retries once on a
    /// version conflict by re-reading the log head and re-issuing the
    /// commit with the next version number (the outer Retry Executor
    /// handles further attempts and backoff).
    pub async fn commit_batch(&self, batch: Batch, creds: &StoreCredentials) -> Result<CommitOutcome, ConnectorError> {
        let destination = &batch.binding.destination;
        let store = self.store_for(destination, creds)?;

        let record_batch = records_to_arrow(&batch)?;
        let groups = partition_groups(&batch, destination);

        let mut add_actions = Vec::with_capacity(groups.len());
        let mut bytes_written = 0u64;
        for (partition_values, row_indices) in &groups {
            let sliced = take_rows(&record_batch, row_indices)?;
            let (path, size) = write_parquet_file(&store, destination, &sliced, partition_values).await?;
            bytes_written += size;
            add_actions.push(AddAction {
                path,
                partition_values: partition_values.clone(),
                size: size as i64,
                modification_time: now_epoch_ms(),
                data_change: true,
                stats: Some(format!("{{\"numRecords\":{}}}", sliced.num_rows())),
            });
        }

        let version = self
            .commit_actions(&store, destination, add_actions.clone(), batch.len(), record_batch.schema())
            .await?;

        self.metrics
            .incr_counter("records_written_total", &[("table", &destination.table_name)]);
        self.metrics
            .observe_histogram("bytes_written", bytes_written as f64, &[("table", &destination.table_name)]);
        self.metrics
            .incr_counter("files_created_total", &[("table", &destination.table_name)]);

        Ok(CommitOutcome {
            version,
            files_written: add_actions.len(),
            records_written: batch.len(),
            bytes_written,
        })
    }

    async fn commit_actions(
        &self,
        store: &Arc<dyn ObjectStore>,
        destination: &Destination,
        add_actions: Vec<AddAction>,
        num_records: usize,
        batch_schema: SchemaRef,
    ) -> Result<u64, ConnectorError> {
        let log_state = replay_delta_log(store, destination).await?;
        let metadata_action = self.resolve_schema_change(destination, &log_state, &batch_schema).await?;

        append_actions_with_conflict_retry(store, destination, move |_next_version| {
            let mut actions = Vec::new();
            if let Some(metadata) = &metadata_action {
                actions.push(DeltaAction::MetaData(metadata.clone()));
            }
            for add in &add_actions {
                actions.push(DeltaAction::Add(add.clone()));
            }
            actions.push(DeltaAction::CommitInfo(CommitInfoAction {
                timestamp: now_epoch_ms(),
                operation: "WRITE".to_string(),
                num_records: num_records as i64,
            }));
            actions
        })
        .await
    }

    /// Decides whether this commit needs a new `metaData` action (§4.10
    /// step 7): none if the table has no recorded schema yet, or the
    /// batch introduces no field beyond it; otherwise gated on
    /// `destination.delta.enable_schema_evolution` and, unless the
    /// connector-level policy is `NONE`, a registry compatibility check
    /// against the merged schema. Incompatible or disabled evolution is a
    /// Terminal failure — the table's schema never drifts silently.
    async fn resolve_schema_change(
        &self,
        destination: &Destination,
        log_state: &DeltaLogState,
        batch_schema: &SchemaRef,
    ) -> Result<Option<MetaDataAction>, ConnectorError> {
        let current = match &log_state.metadata {
            None => {
                return Ok(Some(MetaDataAction {
                    id: Uuid::new_v4().to_string(),
                    schema_string: schema_to_json_schema_string(batch_schema),
                    partition_columns: destination.partition_columns.clone(),
                    created_time: now_epoch_ms(),
                }))
            }
            Some(current) => current,
        };

        let current_fields = schema_field_names(&current.schema_string);
        let has_new_field = batch_schema
            .fields()
            .iter()
            .any(|f| !current_fields.contains(f.name()));
        if !has_new_field {
            return Ok(None);
        }

        if !destination.delta.enable_schema_evolution {
            return Err(ConnectorError::Validation(format!(
                "table {} received fields outside its recorded schema and schema evolution is disabled",
                destination.table_name
            )));
        }

        let merged_schema_string = merge_schema_strings(&current.schema_string, batch_schema);
        if self.compatibility != SchemaCompatibility::None {
            let subject = format!("{}-value", destination.table_name);
            let compatible = self
                .schema_client
                .test_compatibility(&subject, &merged_schema_string)
                .await
                .map_err(|e| {
                    ConnectorError::Registry(format!(
                        "checking {:?} compatibility for table {}: {e}",
                        self.compatibility, destination.table_name
                    ))
                })?;
            if !compatible {
                return Err(ConnectorError::Validation(format!(
                    "new schema for table {} fails {:?} compatibility check",
                    destination.table_name, self.compatibility
                )));
            }
        }

        Ok(Some(MetaDataAction {
            id: Uuid::new_v4().to_string(),
            schema_string: merged_schema_string,
            partition_columns: destination.partition_columns.clone(),
            created_time: now_epoch_ms(),
        }))
    }
}

/// Appends `actions_for_version(next_version)` as the next `_delta_log`
/// entry, retrying with the subsequent version on a conditional-put
/// conflict (another writer — or the Maintenance Scheduler — committed
/// first). Shared by regular batch commits and compaction's atomic
/// remove+add commit so both honor the same optimistic-concurrency
/// protocol against the same table path (I3, §4.10 step 6).
pub(crate) async fn append_actions_with_conflict_retry(
    store: &Arc<dyn ObjectStore>,
    destination: &Destination,
    actions_for_version: impl Fn(u64) -> Vec<DeltaAction>,
) -> Result<u64, ConnectorError> {
    const MAX_CONFLICT_RETRIES: u32 = 5;
    let mut attempt = 0;
    loop {
        let current_version = log_head_version(store, destination).await?;
        let next_version = current_version.map(|v| v + 1).unwrap_or(0);

        let actions = actions_for_version(next_version);
        let body = actions
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ConnectorError::Storage(format!("serializing delta log entry: {e}")))?
            .join("\n");

        let log_path = delta_log_path(destination, next_version);
        let put_opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        match store
            .put_opts(&log_path, PutPayload::from(body.into_bytes()), put_opts)
            .await
        {
            Ok(_) => return Ok(next_version),
            Err(object_store::Error::AlreadyExists { .. }) => {
                attempt += 1;
                if attempt >= MAX_CONFLICT_RETRIES {
                    return Err(ConnectorError::CommitConflict(format!(
                        "exhausted {attempt} retries committing version {next_version} for {}",
                        destination.table_name
                    )));
                }
                warn!(
                    table = %destination.table_name,
                    version = next_version,
                    attempt,
                    "commit conflict, retrying with next version"
                );
                continue;
            }
            Err(e) => return Err(ConnectorError::Storage(format!("writing delta log entry: {e}"))),
        }
    }
}

/// Credentials resolved from connector configuration, threaded through
/// rather than stored on `TableWriter` so a single writer instance can
/// serve topics bound to different buckets/endpoints.
#[derive(Debug, Clone, Default)]
pub struct StoreCredentials {
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn delta_log_path(destination: &Destination, version: u64) -> ObjectPath {
    ObjectPath::from(format!("{}/_delta_log/{:020}.json", destination.path, version))
}

async fn log_head_version(store: &Arc<dyn ObjectStore>, destination: &Destination) -> Result<Option<u64>, ConnectorError> {
    use futures::StreamExt;

    let prefix = ObjectPath::from(format!("{}/_delta_log/", destination.path));
    let mut listing = store.list(Some(&prefix));
    let mut max_version: Option<u64> = None;
    while let Some(meta) = listing.next().await {
        let meta = meta.map_err(|e| ConnectorError::Storage(format!("listing delta log: {e}")))?;
        if let Some(name) = meta.location.filename() {
            if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(v) = stem.parse::<u64>() {
                    max_version = Some(max_version.map_or(v, |m| m.max(v)));
                }
            }
        }
    }
    Ok(max_version)
}

/// Folded state of a table's `_delta_log`, used by schema evolution and
/// vacuum's referenced-file check — both need more than the bare head
/// version `log_head_version` tracks for the hot commit-retry loop, so
/// this reads and parses every log entry rather than just listing names.
pub(crate) struct DeltaLogState {
    pub head_version: Option<u64>,
    pub metadata: Option<MetaDataAction>,
    pub live_paths: HashSet<String>,
}

pub(crate) async fn replay_delta_log(store: &Arc<dyn ObjectStore>, destination: &Destination) -> Result<DeltaLogState, ConnectorError> {
    use futures::StreamExt;

    let prefix = ObjectPath::from(format!("{}/_delta_log/", destination.path));
    let mut listing = store.list(Some(&prefix));
    let mut versions: Vec<u64> = Vec::new();
    while let Some(meta) = listing.next().await {
        let meta = meta.map_err(|e| ConnectorError::Storage(format!("listing delta log: {e}")))?;
        if let Some(name) = meta.location.filename() {
            if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(v) = stem.parse::<u64>() {
                    versions.push(v);
                }
            }
        }
    }
    versions.sort_unstable();

    let mut state = DeltaLogState {
        head_version: versions.last().copied(),
        metadata: None,
        live_paths: HashSet::new(),
    };
    for version in versions {
        let path = delta_log_path(destination, version);
        let bytes = store
            .get(&path)
            .await
            .map_err(|e| ConnectorError::Storage(format!("reading delta log entry {version}: {e}")))?
            .bytes()
            .await
            .map_err(|e| ConnectorError::Storage(format!("reading delta log entry {version} body: {e}")))?;
        let text = std::str::from_utf8(&bytes)
            .map_err(|e| ConnectorError::Storage(format!("delta log entry {version} is not valid utf-8: {e}")))?;
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let action: DeltaAction = serde_json::from_str(line)
                .map_err(|e| ConnectorError::Storage(format!("parsing delta log entry {version}: {e}")))?;
            match action {
                DeltaAction::MetaData(m) => state.metadata = Some(m),
                DeltaAction::Add(add) => {
                    state.live_paths.insert(add.path);
                }
                DeltaAction::Remove(remove) => {
                    state.live_paths.remove(&remove.path);
                }
                DeltaAction::CommitInfo(_) => {}
            }
        }
    }
    Ok(state)
}

/// Renders an arrow schema as a JSON-Schema-shaped document
/// (`{"type":"object","properties":{...}}`), matching the convention
/// `field_names()` in the schema crate already reads `properties` from.
fn schema_to_json_schema_string(schema: &SchemaRef) -> String {
    let properties: serde_json::Map<String, Value> = schema
        .fields()
        .iter()
        .map(|f| (f.name().clone(), serde_json::json!({ "type": arrow_type_to_json_type(f.data_type()) })))
        .collect();
    serde_json::json!({ "type": "object", "properties": properties }).to_string()
}

/// Adds any field from `batch_schema` missing from `current_schema_string`
/// to its `properties`, leaving already-recorded field definitions
/// untouched.
fn merge_schema_strings(current_schema_string: &str, batch_schema: &SchemaRef) -> String {
    let mut properties = serde_json::from_str::<Value>(current_schema_string)
        .ok()
        .and_then(|doc| doc.get("properties").and_then(Value::as_object).cloned())
        .unwrap_or_default();
    for field in batch_schema.fields() {
        properties
            .entry(field.name().clone())
            .or_insert_with(|| serde_json::json!({ "type": arrow_type_to_json_type(field.data_type()) }));
    }
    serde_json::json!({ "type": "object", "properties": properties }).to_string()
}

fn schema_field_names(schema_string: &str) -> HashSet<String> {
    serde_json::from_str::<Value>(schema_string)
        .ok()
        .and_then(|doc| {
            doc.get("properties")
                .and_then(Value::as_object)
                .map(|props| props.keys().cloned().collect())
        })
        .unwrap_or_default()
}

fn arrow_type_to_json_type(data_type: &arrow::datatypes::DataType) -> &'static str {
    use arrow::datatypes::DataType;
    match data_type {
        DataType::Boolean => "boolean",
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => "integer",
        DataType::Float16 | DataType::Float32 | DataType::Float64 => "number",
        _ => "string",
    }
}

async fn write_parquet_file(
    store: &Arc<dyn ObjectStore>,
    destination: &Destination,
    batch: &RecordBatch,
    partition_values: &BTreeMap<String, String>,
) -> Result<(String, u64), ConnectorError> {
    let mut buffer = Vec::new();
    let props = WriterProperties::builder().build();
    {
        let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))
            .map_err(|e| ConnectorError::Storage(format!("creating parquet writer: {e}")))?;
        writer
            .write(batch)
            .map_err(|e| ConnectorError::Storage(format!("writing parquet row group: {e}")))?;
        writer
            .close()
            .map_err(|e| ConnectorError::Storage(format!("closing parquet writer: {e}")))?;
    }

    let partition_prefix: String = partition_values
        .iter()
        .map(|(k, v)| format!("{k}={v}/"))
        .collect();
    // §4.10.8: `{isoInstantNoPunct}_{8-hex-uuid}.parquet`.
    let iso_no_punct = chrono::Utc::now().format("%Y%m%dT%H%M%S%3fZ").to_string();
    let short_uuid = &Uuid::new_v4().simple().to_string()[..8];
    let file_name = format!("{iso_no_punct}_{short_uuid}.parquet");
    let relative_path = format!("{}/{partition_prefix}{file_name}", destination.path);
    let object_path = ObjectPath::from(relative_path.clone());

    let size = buffer.len() as u64;
    store
        .put(&object_path, PutPayload::from(buffer))
        .await
        .map_err(|e| ConnectorError::Storage(format!("uploading parquet file: {e}")))?;

    info!(table = %destination.table_name, path = %relative_path, bytes = size, "wrote data file");
    Ok((relative_path, size))
}

fn records_to_arrow(batch: &Batch) -> Result<RecordBatch, ConnectorError> {
    let ndjson: Vec<u8> = batch
        .records
        .iter()
        .map(|r| serde_json::to_string(&Value::Object(r.fields.clone())).map(|mut s| {
            s.push('\n');
            s
        }))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConnectorError::Storage(format!("serializing records for arrow conversion: {e}")))?
        .concat();

    let cursor = IoCursor::new(ndjson.as_slice());
    let (schema, _) = arrow::json::reader::infer_json_schema(&mut IoCursor::new(ndjson.as_slice()), None)
        .map_err(|e| ConnectorError::Storage(format!("inferring arrow schema: {e}")))?;
    let schema_ref: SchemaRef = Arc::new(schema);

    let mut reader = ReaderBuilder::new(schema_ref)
        .build(cursor)
        .map_err(|e| ConnectorError::Storage(format!("building arrow json reader: {e}")))?;
    let record_batch = reader
        .next()
        .ok_or_else(|| ConnectorError::Storage("empty record batch produced from non-empty input".to_string()))?
        .map_err(|e| ConnectorError::Storage(format!("decoding arrow record batch: {e}")))?;
    Ok(record_batch)
}

/// Groups row indices by their partition-column value tuple so each
/// distinct partition gets its own data file under `col=value/...`.
fn partition_groups(batch: &Batch, destination: &Destination) -> Vec<(BTreeMap<String, String>, Vec<usize>)> {
    if destination.partition_columns.is_empty() {
        return vec![(BTreeMap::new(), (0..batch.records.len()).collect())];
    }
    let mut groups: Vec<(BTreeMap<String, String>, Vec<usize>)> = Vec::new();
    for (idx, record) in batch.records.iter().enumerate() {
        let mut key = BTreeMap::new();
        for col in &destination.partition_columns {
            let value = record
                .fields
                .get(col)
                .map(value_to_partition_string)
                .unwrap_or_else(|| "__HIVE_DEFAULT_PARTITION__".to_string());
            key.insert(col.clone(), value);
        }
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, indices)) => indices.push(idx),
            None => groups.push((key, vec![idx])),
        }
    }
    groups
}

fn value_to_partition_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn take_rows(batch: &RecordBatch, indices: &[usize]) -> Result<RecordBatch, ConnectorError> {
    use arrow::array::UInt32Array;
    use arrow::compute::take;

    let idx_array = UInt32Array::from(indices.iter().map(|i| *i as u32).collect::<Vec<_>>());
    let columns = batch
        .columns()
        .iter()
        .map(|col| take(col.as_ref(), &idx_array, None))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConnectorError::Storage(format!("slicing arrow batch by partition group: {e}")))?;
    RecordBatch::try_new(batch.schema(), columns)
        .map_err(|e| ConnectorError::Storage(format!("rebuilding sliced record batch: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_log_paths_are_zero_padded_and_sorted_lexically() {
        let destination = Destination {
            bucket: "lake".into(),
            path: "orders".into(),
            table_name: "orders".into(),
            partition_columns: vec![],
            delta: Default::default(),
        };
        let p0 = delta_log_path(&destination, 0);
        let p1 = delta_log_path(&destination, 1);
        let p10 = delta_log_path(&destination, 10);
        assert!(p0.as_ref() < p1.as_ref());
        assert!(p1.as_ref() < p10.as_ref());
    }

    #[test]
    fn partition_groups_without_partition_columns_is_single_group() {
        let destination = Destination {
            bucket: "lake".into(),
            path: "orders".into(),
            table_name: "orders".into(),
            partition_columns: vec![],
            delta: Default::default(),
        };
        let binding = Arc::new(lakesink_core::TopicBinding {
            kafka_topic: "orders".into(),
            schema_subject: "orders-value".into(),
            destination: destination.clone(),
            processing: Default::default(),
        });
        let mut batch = Batch::new("orders:orders".into(), binding);
        for i in 0..3 {
            batch.records.push(lakesink_core::ParsedRecord::new(
                serde_json::Map::new(),
                lakesink_core::SourceMeta {
                    topic: "orders".into(),
                    partition: 0,
                    offset: i,
                    kafka_timestamp_ms: None,
                    key: None,
                },
            ));
        }
        let groups = partition_groups(&batch, &destination);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1.len(), 3);
    }
}
