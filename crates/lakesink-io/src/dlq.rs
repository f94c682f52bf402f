//! Dead Letter Sink (§4.8): publishes terminally-failed records to
//! `{topic}-dlq` as a JSON-encoded [`DlqEnvelope`], with origin
//! metadata carried as both payload fields and Kafka headers so
//! downstream tooling can filter on headers without deserializing the
//! payload.
//!
//! Structured the way the corpus's own DLQ module is: a bounded channel
//! feeding a single background task that owns the producer, so a
//! failing record never blocks the partition worker that discovered it.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use lakesink_core::{ConnectorError, DlqEnvelope, ParsedRecord, RawMessage, DLQ_ENVELOPE_VERSION};

/// A record handed to the Dead Letter Sink after the Retry Executor gave
/// up or the error was classified terminal.
pub struct DeadLetter {
    pub raw: RawMessage,
    pub error_reason: String,
    pub error_class: &'static str,
    pub short_stack: Option<String>,
}

impl DeadLetter {
    pub fn from_error(raw: RawMessage, err: &ConnectorError) -> Self {
        Self {
            raw,
            error_reason: err.to_string(),
            error_class: err.class_name(),
            short_stack: None,
        }
    }

    /// Builds a dead letter for a record that failed after parsing — a
    /// terminal batch-write failure, for instance — from its canonical
    /// fields rather than the original wire bytes, which don't survive
    /// past the Batch Buffer. `raw.value` is therefore a JSON
    /// re-serialization of `record.fields`, not the original payload
    /// bytes; consumers of the DLQ envelope should treat
    /// `original_value_base64` as an approximation in this path.
    pub fn from_batch_record(record: &ParsedRecord, err: &ConnectorError) -> Self {
        let value = serde_json::to_vec(&record.fields).unwrap_or_default();
        let raw = RawMessage {
            topic: record.source.topic.clone(),
            partition: record.source.partition,
            offset: record.source.offset,
            key: record.source.key.clone().map(String::into_bytes),
            value,
            kafka_timestamp_ms: record.source.kafka_timestamp_ms,
            headers: Vec::new(),
        };
        Self::from_error(raw, err)
    }

    fn into_envelope(self) -> (String, DlqEnvelope) {
        let topic = self.raw.topic.clone();
        let envelope = DlqEnvelope {
            original_topic: self.raw.topic,
            original_partition: self.raw.partition,
            original_offset: self.raw.offset,
            original_key: self.raw.key.map(|k| BASE64_STANDARD.encode(k)),
            original_value_base64: BASE64_STANDARD.encode(&self.raw.value),
            original_timestamp_ms: self.raw.kafka_timestamp_ms,
            error_reason: self.error_reason,
            error_class: self.error_class.to_string(),
            short_stack: self.short_stack,
            dlq_timestamp_ms: now_epoch_ms(),
            envelope_version: DLQ_ENVELOPE_VERSION,
        };
        (topic, envelope)
    }
}

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub type DlqChannel = mpsc::Sender<DeadLetter>;

pub struct DeadLetterSink {
    producer: FutureProducer,
    rx: mpsc::Receiver<DeadLetter>,
    cancel: CancellationToken,
}

impl DeadLetterSink {
    /// Builds the producer from `bootstrap_servers` and spawns the
    /// background publish loop, returning the channel producers push
    /// dead letters onto.
    pub fn start(bootstrap_servers: &str, cancel: CancellationToken) -> Result<DlqChannel, ConnectorError> {
        let (tx, rx) = mpsc::channel(512);
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| ConnectorError::Kafka(format!("creating dlq producer: {e}")))?;
        let sink = DeadLetterSink { producer, rx, cancel };
        tokio::spawn(sink.run());
        Ok(tx)
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                maybe_letter = self.rx.recv() => {
                    match maybe_letter {
                        Some(letter) => {
                            if let Err(e) = self.publish(letter).await {
                                error!(error = %e, "failed to publish dead letter");
                            }
                        }
                        None => {
                            warn!("dlq channel closed, stopping dead letter sink");
                            break;
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    warn!("dead letter sink cancelled, draining remaining entries");
                    self.rx.close();
                    while let Some(letter) = self.rx.recv().await {
                        if let Err(e) = self.publish(letter).await {
                            error!(error = %e, "failed to publish dead letter during drain");
                        }
                    }
                    break;
                }
            }
        }
    }

    async fn publish(&self, letter: DeadLetter) -> Result<(), ConnectorError> {
        let (origin_topic, envelope) = letter.into_envelope();
        let dlq_topic = format!("{origin_topic}-dlq");
        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| ConnectorError::Dlq(format!("serializing dlq envelope: {e}")))?;
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "dlq_topic_origin",
                value: Some(origin_topic.as_bytes()),
            })
            .insert(Header {
                key: "dlq_partition_origin",
                value: Some(envelope.original_partition.to_string().as_bytes()),
            })
            .insert(Header {
                key: "dlq_offset_origin",
                value: Some(envelope.original_offset.to_string().as_bytes()),
            })
            .insert(Header {
                key: "dlq_error_class",
                value: Some(envelope.error_class.as_bytes()),
            });
        let key = envelope.original_key.clone().unwrap_or_default();
        let record = FutureRecord::to(&dlq_topic).payload(&payload).key(&key).headers(headers);
        self.producer
            .send(record, std::time::Duration::from_secs(10))
            .await
            .map_err(|(e, _)| ConnectorError::Dlq(format!("publishing to {dlq_topic}: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_original_coordinates() {
        let raw = RawMessage {
            topic: "orders".into(),
            partition: 2,
            offset: 77,
            key: Some(b"k1".to_vec()),
            value: b"{\"bad\": true}".to_vec(),
            kafka_timestamp_ms: Some(1_700_000_000_000),
            headers: vec![],
        };
        let err = ConnectorError::Validation("missing field amount".into());
        let letter = DeadLetter::from_error(raw, &err);
        let (topic, envelope) = letter.into_envelope();
        assert_eq!(topic, "orders");
        assert_eq!(envelope.original_partition, 2);
        assert_eq!(envelope.original_offset, 77);
        assert_eq!(envelope.error_class, "validation");
        assert_eq!(envelope.envelope_version, DLQ_ENVELOPE_VERSION);
    }
}
