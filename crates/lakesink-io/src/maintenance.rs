//! Maintenance Scheduler (§4.11): post-commit compaction (small-file
//! rewrite) and retention/vacuum (unreferenced-file deletion), each
//! running at most once in flight per table, with per-table counters
//! reset on completion regardless of outcome (I4).
//!
//! The compaction algorithm (greedy bin-packing of small files toward a
//! target size) is an implementation detail, not a contract — see
//! SPEC_FULL.md §9 open question 2.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use futures::StreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use tracing::{info, warn};

use lakesink_core::{ConnectorError, Destination, Metrics};

use crate::table_writer::{append_actions_with_conflict_retry, replay_delta_log, AddAction, DeltaAction, RemoveAction};

/// Target size, in bytes, a compacted file should grow toward. Small
/// files below this are candidates for bin-packing into one rewrite.
const TARGET_FILE_SIZE_BYTES: i64 = 64 * 1024 * 1024;
const SMALL_FILE_THRESHOLD_BYTES: i64 = 8 * 1024 * 1024;

struct TableState {
    in_flight: AtomicBool,
    batches_since_optimize: std::sync::atomic::AtomicU64,
    last_optimize_ms: std::sync::atomic::AtomicI64,
    last_vacuum_ms: std::sync::atomic::AtomicI64,
}

impl Default for TableState {
    fn default() -> Self {
        Self {
            in_flight: AtomicBool::new(false),
            batches_since_optimize: std::sync::atomic::AtomicU64::new(0),
            last_optimize_ms: std::sync::atomic::AtomicI64::new(0),
            last_vacuum_ms: std::sync::atomic::AtomicI64::new(0),
        }
    }
}

pub struct MaintenanceScheduler {
    tables: DashMap<String, Arc<TableState>>,
    metrics: Arc<dyn Metrics>,
}

impl MaintenanceScheduler {
    pub fn new(metrics: Arc<dyn Metrics>) -> Self {
        Self {
            tables: DashMap::new(),
            metrics,
        }
    }

    /// Call once per successful commit. Increments the table's
    /// batches-since-optimize counter and, if the destination's
    /// optimize interval has been reached and no compaction is already
    /// in flight for this table, spawns one.
    pub fn on_commit(&self, store: Arc<dyn ObjectStore>, destination: Destination) {
        let state = self
            .tables
            .entry(destination.table_name.clone())
            .or_insert_with(|| Arc::new(TableState::default()))
            .clone();
        let count = state.batches_since_optimize.fetch_add(1, Ordering::SeqCst) + 1;

        if destination.delta.enable_optimize && count >= destination.delta.optimize_interval {
            if state
                .in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let metrics = self.metrics.clone();
                let state_for_task = state.clone();
                tokio::spawn(async move {
                    let result = compact_table(&store, &destination).await;
                    // I4: counters reset regardless of outcome.
                    state_for_task.batches_since_optimize.store(0, Ordering::SeqCst);
                    state_for_task
                        .last_optimize_ms
                        .store(now_epoch_ms(), Ordering::SeqCst);
                    state_for_task.in_flight.store(false, Ordering::SeqCst);
                    match result {
                        Ok(outcome) => {
                            metrics.incr_counter("compactions_total", &[("table", &destination.table_name)]);
                            info!(
                                table = %destination.table_name,
                                files_removed = outcome.files_removed,
                                files_added = outcome.files_added,
                                "compaction complete"
                            );
                        }
                        Err(e) => warn!(table = %destination.table_name, error = %e, "compaction failed"),
                    }
                });
            }
        }
    }

    /// Runs a retention/vacuum pass for `destination` if due, deleting
    /// data files older than `vacuum_retention_hours` that are no
    /// longer referenced by the current table state. At most one vacuum
    /// runs per table at a time, independent of compaction's in-flight
    /// flag (they operate on disjoint file sets in practice, but never
    /// concurrently on the same table to keep listings consistent).
    pub async fn vacuum_if_due(&self, store: Arc<dyn ObjectStore>, destination: Destination) -> Result<(), ConnectorError> {
        if !destination.delta.enable_vacuum {
            return Ok(());
        }
        let state = self
            .tables
            .entry(destination.table_name.clone())
            .or_insert_with(|| Arc::new(TableState::default()))
            .clone();
        if state
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let result = vacuum_table(&store, &destination).await;
        state.last_vacuum_ms.store(now_epoch_ms(), Ordering::SeqCst);
        state.in_flight.store(false, Ordering::SeqCst);
        match &result {
            Ok(deleted) => {
                self.metrics
                    .incr_counter("vacuums_total", &[("table", &destination.table_name)]);
                info!(table = %destination.table_name, deleted, "vacuum complete");
            }
            Err(e) => warn!(table = %destination.table_name, error = %e, "vacuum failed"),
        }
        result.map(|_| ())
    }
}

struct CompactionOutcome {
    files_removed: usize,
    files_added: usize,
}

async fn compact_table(store: &Arc<dyn ObjectStore>, destination: &Destination) -> Result<CompactionOutcome, ConnectorError> {
    let data_prefix = ObjectPath::from(format!("{}/", destination.path));
    let mut listing = store.list(Some(&data_prefix));
    let mut small_files = Vec::new();
    while let Some(meta) = listing.next().await {
        let meta = meta.map_err(|e| ConnectorError::Storage(format!("listing data files: {e}")))?;
        let path_str = meta.location.to_string();
        if path_str.contains("_delta_log") || !path_str.ends_with(".parquet") {
            continue;
        }
        if meta.size as i64 <= SMALL_FILE_THRESHOLD_BYTES {
            small_files.push((meta.location.clone(), meta.size));
        }
    }

    if small_files.len() < 2 {
        return Ok(CompactionOutcome {
            files_removed: 0,
            files_added: 0,
        });
    }

    // Greedy bin-pack into groups targeting TARGET_FILE_SIZE_BYTES.
    let mut groups: Vec<Vec<ObjectPath>> = Vec::new();
    let mut current_group = Vec::new();
    let mut current_size: i64 = 0;
    for (path, size) in small_files {
        current_group.push(path);
        current_size += size as i64;
        if current_size >= TARGET_FILE_SIZE_BYTES {
            groups.push(std::mem::take(&mut current_group));
            current_size = 0;
        }
    }
    if !current_group.is_empty() {
        groups.push(current_group);
    }

    let mut removes = Vec::new();
    let mut adds = Vec::new();
    for group in &groups {
        if group.len() < 2 {
            continue;
        }
        let merged = merge_parquet_files(store, group).await?;
        let iso_no_punct = chrono::Utc::now().format("%Y%m%dT%H%M%S%3fZ").to_string();
        let short_uuid = &uuid::Uuid::new_v4().simple().to_string()[..8];
        let new_path = ObjectPath::from(format!(
            "{}/compacted_{iso_no_punct}_{short_uuid}.parquet",
            destination.path,
        ));
        store
            .put(&new_path, PutPayload::from(merged.clone()))
            .await
            .map_err(|e| ConnectorError::Storage(format!("uploading compacted file: {e}")))?;

        for old_path in group {
            removes.push(RemoveAction {
                path: old_path.to_string(),
                deletion_timestamp: now_epoch_ms(),
                data_change: false,
            });
        }
        adds.push(AddAction {
            path: new_path.to_string(),
            partition_values: BTreeMap::new(),
            size: merged.len() as i64,
            modification_time: now_epoch_ms(),
            data_change: false,
            stats: None,
        });
    }

    if adds.is_empty() {
        return Ok(CompactionOutcome {
            files_removed: 0,
            files_added: 0,
        });
    }

    commit_compaction(store, destination, removes.clone(), adds.clone()).await?;

    for remove in &removes {
        let _ = store.delete(&ObjectPath::from(remove.path.clone())).await;
    }

    Ok(CompactionOutcome {
        files_removed: removes.len(),
        files_added: adds.len(),
    })
}

async fn merge_parquet_files(store: &Arc<dyn ObjectStore>, paths: &[ObjectPath]) -> Result<Vec<u8>, ConnectorError> {
    let mut batches = Vec::new();
    let mut schema = None;
    for path in paths {
        let bytes = store
            .get(path)
            .await
            .map_err(|e| ConnectorError::Storage(format!("reading {path} for compaction: {e}")))?
            .bytes()
            .await
            .map_err(|e| ConnectorError::Storage(format!("buffering {path} for compaction: {e}")))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)
            .map_err(|e| ConnectorError::Storage(format!("opening parquet reader for {path}: {e}")))?
            .build()
            .map_err(|e| ConnectorError::Storage(format!("building parquet reader for {path}: {e}")))?;
        for batch in reader {
            let batch = batch.map_err(|e| ConnectorError::Storage(format!("reading row group from {path}: {e}")))?;
            if schema.is_none() {
                schema = Some(batch.schema());
            }
            batches.push(batch);
        }
    }
    let schema = schema.ok_or_else(|| ConnectorError::Storage("no rows found across files to compact".to_string()))?;

    let mut buffer = Vec::new();
    {
        let props = WriterProperties::builder().build();
        let mut writer = ArrowWriter::try_new(&mut buffer, schema, Some(props))
            .map_err(|e| ConnectorError::Storage(format!("creating compaction writer: {e}")))?;
        for batch in &batches {
            writer
                .write(batch)
                .map_err(|e| ConnectorError::Storage(format!("writing compacted row group: {e}")))?;
        }
        writer
            .close()
            .map_err(|e| ConnectorError::Storage(format!("closing compaction writer: {e}")))?;
    }
    Ok(buffer)
}

async fn commit_compaction(
    store: &Arc<dyn ObjectStore>,
    destination: &Destination,
    removes: Vec<RemoveAction>,
    adds: Vec<AddAction>,
) -> Result<(), ConnectorError> {
    append_actions_with_conflict_retry(store, destination, move |_next_version| {
        let mut actions: Vec<DeltaAction> = removes.iter().cloned().map(DeltaAction::Remove).collect();
        actions.extend(adds.iter().cloned().map(DeltaAction::Add));
        actions
    })
    .await
    .map(|_| ())
}

/// Deletes data files older than `vacuum_retention_hours` that are also
/// absent from the current table snapshot's referenced-file set (I4:
/// vacuum must never remove a file the `_delta_log` still points to,
/// regardless of its age — a straggling reader or an in-flight
/// compaction retry may still need it).
async fn vacuum_table(store: &Arc<dyn ObjectStore>, destination: &Destination) -> Result<usize, ConnectorError> {
    let retention = Duration::from_secs(destination.delta.vacuum_retention_hours * 3600);
    let cutoff_ms = now_epoch_ms() - retention.as_millis() as i64;

    let log_state = replay_delta_log(store, destination).await?;

    let prefix = ObjectPath::from(format!("{}/", destination.path));
    let mut listing = store.list(Some(&prefix));
    let mut deleted = 0usize;
    while let Some(meta) = listing.next().await {
        let meta = meta.map_err(|e| ConnectorError::Storage(format!("listing for vacuum: {e}")))?;
        let path_str = meta.location.to_string();
        if path_str.contains("_delta_log") || !path_str.ends_with(".parquet") {
            continue;
        }
        if log_state.live_paths.contains(&path_str) {
            continue;
        }
        let last_modified_ms = meta.last_modified.timestamp_millis();
        if last_modified_ms < cutoff_ms {
            if store.delete(&meta.location).await.is_ok() {
                deleted += 1;
            }
        }
    }
    Ok(deleted)
}

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_state_defaults_not_in_flight() {
        let state = TableState::default();
        assert!(!state.in_flight.load(Ordering::SeqCst));
        assert_eq!(state.batches_since_optimize.load(Ordering::SeqCst), 0);
    }
}
