//! Batch Buffer (§4.9): accumulates parsed, enriched records per
//! destination and flushes on whichever trigger fires first — the
//! configured batch size, or the configured flush interval elapsing
//! since the oldest record in the buffer arrived.
//!
//! Grounded in the size-or-timeout chunking shape used elsewhere in the
//! corpus (`tokio_stream::StreamExt::chunks_timeout`), but implemented
//! as an explicit accumulator rather than a stream combinator because
//! records for many destinations arrive interleaved on one partition
//! worker and must be grouped before any chunking trigger applies.

use std::sync::Arc;

use dashmap::DashMap;
use lakesink_core::{Batch, ParsedRecord, TopicBinding};

/// Maps a destination key to its in-flight accumulator. A `DashMap`
/// gives each destination its own shard lock, so flushing one
/// destination never blocks a push to another (§5).
#[derive(Default)]
pub struct BatchBuffer {
    buffers: DashMap<String, Batch>,
}

impl BatchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `record` to its destination's buffer. Returns `Some(Batch)`
    /// when the push crossed the configured batch size, handing the
    /// caller a ready-to-write batch and leaving a fresh, empty
    /// accumulator in place (I2: ordering preserved, no record
    /// duplicated across batches).
    pub fn push(&self, record: ParsedRecord, binding: Arc<TopicBinding>) -> Option<Batch> {
        let key = binding.destination_key();
        let mut entry = self
            .buffers
            .entry(key.clone())
            .or_insert_with(|| Batch::new(key.clone(), binding.clone()));
        entry.byte_size_estimate += estimate_record_size(&record);
        entry.records.push(record);
        if entry.records.len() >= entry.binding.processing.batch_size {
            let swapped = Batch::new(key, binding);
            Some(std::mem::replace(&mut *entry, swapped))
        } else {
            None
        }
    }

    /// Returns every non-empty buffer whose oldest record has aged past
    /// its destination's flush interval, swapping in a fresh empty
    /// accumulator for each one flushed.
    pub fn flush_timed_out(&self) -> Vec<Batch> {
        let mut ready = Vec::new();
        for mut entry in self.buffers.iter_mut() {
            if entry.is_empty() {
                continue;
            }
            if entry.oldest_enqueue.elapsed() >= entry.binding.processing.flush_interval {
                ready.push(take_batch(&mut entry));
            }
        }
        ready
    }

    /// Drains every non-empty buffer regardless of size or age, used
    /// during graceful shutdown so no buffered record is lost on drain.
    pub fn flush_all(&self) -> Vec<Batch> {
        let mut ready = Vec::new();
        for mut entry in self.buffers.iter_mut() {
            if entry.is_empty() {
                continue;
            }
            ready.push(take_batch(&mut entry));
        }
        ready
    }
}

fn take_batch(entry: &mut Batch) -> Batch {
    let key = entry.destination_key.clone();
    let binding = entry.binding.clone();
    std::mem::replace(entry, Batch::new(key, binding))
}

fn estimate_record_size(record: &ParsedRecord) -> usize {
    serde_json::to_vec(&record.fields).map(|v| v.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakesink_core::model::{Destination, ProcessingPolicy};
    use lakesink_core::SourceMeta;
    use serde_json::Map;
    use std::time::Duration;

    fn binding(batch_size: usize, flush_interval: Duration) -> Arc<TopicBinding> {
        Arc::new(TopicBinding {
            kafka_topic: "orders".into(),
            schema_subject: "orders-value".into(),
            destination: Destination {
                bucket: "lake".into(),
                path: "orders".into(),
                table_name: "orders".into(),
                partition_columns: vec![],
                delta: Default::default(),
            },
            processing: ProcessingPolicy {
                batch_size,
                flush_interval,
                max_retries: 3,
            },
        })
    }

    fn record(offset: i64) -> ParsedRecord {
        ParsedRecord::new(
            Map::new(),
            SourceMeta {
                topic: "orders".into(),
                partition: 0,
                offset,
                kafka_timestamp_ms: None,
                key: None,
            },
        )
    }

    #[test]
    fn flushes_on_size_trigger() {
        let buffer = BatchBuffer::new();
        let binding = binding(3, Duration::from_secs(3600));
        assert!(buffer.push(record(1), binding.clone()).is_none());
        assert!(buffer.push(record(2), binding.clone()).is_none());
        let flushed = buffer.push(record(3), binding.clone()).expect("size trigger should fire");
        assert_eq!(flushed.len(), 3);
        assert_eq!(flushed.records[0].source.offset, 1);
        assert_eq!(flushed.records[2].source.offset, 3);
    }

    #[test]
    fn records_stay_ordered_within_a_batch() {
        let buffer = BatchBuffer::new();
        let binding = binding(100, Duration::from_secs(3600));
        for i in 0..10 {
            buffer.push(record(i), binding.clone());
        }
        let flushed = buffer.flush_all();
        assert_eq!(flushed.len(), 1);
        let offsets: Vec<i64> = flushed[0].records.iter().map(|r| r.source.offset).collect();
        assert_eq!(offsets, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn flush_timed_out_ignores_fresh_buffers() {
        let buffer = BatchBuffer::new();
        let binding = binding(100, Duration::from_secs(3600));
        buffer.push(record(1), binding);
        assert!(buffer.flush_timed_out().is_empty());
    }

    #[test]
    fn flush_timed_out_drains_aged_buffer() {
        let buffer = BatchBuffer::new();
        let binding = binding(100, Duration::from_millis(1));
        buffer.push(record(1), binding);
        std::thread::sleep(Duration::from_millis(5));
        let flushed = buffer.flush_timed_out();
        assert_eq!(flushed.len(), 1);
        assert!(buffer.flush_all().is_empty());
    }

    #[test]
    fn empty_buffers_never_flush() {
        let buffer = BatchBuffer::new();
        assert!(buffer.flush_all().is_empty());
        assert!(buffer.flush_timed_out().is_empty());
    }
}
