//! Kafka consumer plumbing (§4.12, §6 upstream broker contract): a
//! `StreamConsumer` with manual offset commit (`enable.auto.commit=false`)
//! and a rebalance-aware context that surfaces partition
//! assignment/revocation events to the Consumer Loop, which drives the
//! per-partition Assigned -> Running -> Draining -> Released state
//! machine.
//!
//! Grounded in the corpus's own Kafka source (`StreamConsumer` + a
//! spawned task feeding an mpsc channel), extended with the rebalance
//! callback and manual commit an auto-committing consumer doesn't need.

use rdkafka::client::ClientContext;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::{ClientConfig, TopicPartitionList as Tpl};
use tokio::sync::mpsc;
use tracing::{info, warn};

use lakesink_core::{ConnectorError, RawMessage};

/// A partition assignment change observed by the consumer group
/// protocol. The Consumer Loop reacts by spinning up or draining the
/// corresponding per-partition worker.
#[derive(Debug, Clone)]
pub enum RebalanceEvent {
    Assigned(Vec<(String, i32)>),
    Revoked(Vec<(String, i32)>),
}

pub struct RebalanceContext {
    events: mpsc::UnboundedSender<RebalanceEvent>,
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                let parts = tpl_to_vec(tpl);
                info!(?parts, "partitions revoked, draining workers");
                let _ = self.events.send(RebalanceEvent::Revoked(parts));
            }
            Rebalance::Error(e) => warn!(error = %e, "rebalance error during pre_rebalance"),
            Rebalance::Assign(_) => {}
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        if let Rebalance::Assign(tpl) = rebalance {
            let parts = tpl_to_vec(tpl);
            info!(?parts, "partitions assigned, starting workers");
            let _ = self.events.send(RebalanceEvent::Assigned(parts));
        }
    }
}

fn tpl_to_vec(tpl: &TopicPartitionList) -> Vec<(String, i32)> {
    tpl.elements()
        .iter()
        .map(|e| (e.topic().to_string(), e.partition()))
        .collect()
}

pub type LakesinkConsumer = StreamConsumer<RebalanceContext>;

/// Builds a consumer subscribed to `topics` with manual commit, and
/// returns the channel on which rebalance events are surfaced.
pub fn build_consumer(
    bootstrap_servers: &str,
    group_id: &str,
    topics: &[String],
) -> Result<(LakesinkConsumer, mpsc::UnboundedReceiver<RebalanceEvent>), ConnectorError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let context = RebalanceContext { events: tx };
    let consumer: LakesinkConsumer = ClientConfig::new()
        .set("bootstrap.servers", bootstrap_servers)
        .set("group.id", group_id)
        .set("enable.auto.commit", "false")
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "10000")
        .set("auto.offset.reset", "earliest")
        .create_with_context(context)
        .map_err(|e| ConnectorError::Kafka(format!("creating consumer: {e}")))?;

    let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
    consumer
        .subscribe(&topic_refs)
        .map_err(|e| ConnectorError::Kafka(format!("subscribing to {topic_refs:?}: {e}")))?;

    Ok((consumer, rx))
}

/// Commits `topic`/`partition` up through `offset` (inclusive of the
/// next offset to read, per Kafka's commit semantics) synchronously, so
/// the caller only proceeds once the broker has durably recorded
/// progress (I1: commit happens only after a successful write).
pub fn commit_offset(
    consumer: &LakesinkConsumer,
    topic: &str,
    partition: i32,
    offset: i64,
) -> KafkaResult<()> {
    let mut tpl = Tpl::new();
    tpl.add_partition_offset(topic, partition, rdkafka::Offset::Offset(offset + 1))?;
    consumer.commit(&tpl, rdkafka::consumer::CommitMode::Sync)
}

pub fn to_raw_message(msg: &rdkafka::message::BorrowedMessage<'_>) -> RawMessage {
    let headers = msg
        .headers()
        .map(|hs| {
            (0..hs.count())
                .filter_map(|i| {
                    let h = hs.get(i);
                    Some((h.key.to_string(), h.value.map(|v| v.to_vec()).unwrap_or_default()))
                })
                .collect()
        })
        .unwrap_or_default();

    RawMessage {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        key: msg.key().map(|k| k.to_vec()),
        value: msg.payload().map(|p| p.to_vec()).unwrap_or_default(),
        kafka_timestamp_ms: msg.timestamp().to_millis(),
        headers,
    }
}
