//! Consumer Loop entrypoint (§4.12): wires the Schema Resolver, Message
//! Parser, Validator, Record Enricher, Batch Buffer, Table Writer, Dead
//! Letter Sink and Maintenance Scheduler together around a single Kafka
//! consumer group, and drives partition lifecycle
//! (Assigned -> Running -> Draining -> Released) from rebalance events.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dashmap::DashMap;
use futures::StreamExt;
use rdkafka::message::Message;
use schema_registry_client::rest::client_config::ClientConfig as RegistryClientConfig;
use schema_registry_client::rest::schema_registry_client::SchemaRegistryClient;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lakesink_core::{run_with_retry, Batch, CircuitBreakerRegistry, ConnectorConfig, ConnectorError, Metrics, RetryPolicy};
use lakesink_io::dlq::DeadLetter;
use lakesink_io::{
    build_consumer, commit_offset, enrich, to_raw_message, BatchBuffer, DeadLetterSink, HealthState,
    MaintenanceScheduler, PrometheusMetrics, RebalanceEvent, StoreCredentials, TableWriter,
};
use lakesink_schema::{MessageParser, NoopValidator, RestSchemaRegistry, SchemaCache, SchemaKind, Validator};

#[derive(Parser, Debug)]
#[command(name = "lakesink-cli")]
#[command(about = "Kafka-to-lakehouse sink connector")]
struct Args {
    /// Path to the connector's YAML configuration file.
    #[arg(short, long)]
    config: PathBuf,
}

/// Exit codes per SPEC_FULL.md §6: 0 normal, 1 configuration error, 2
/// fatal init failure (anything that fails before the pipeline is
/// actually consuming, once configuration itself parsed and validated).
#[tokio::main]
async fn main() -> std::process::ExitCode {
    // `LOG_LEVEL` (§6) takes precedence over `RUST_LOG` when set; falls
    // back to the standard env-filter default otherwise.
    let env_filter = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|level| tracing_subscriber::EnvFilter::try_new(level).ok())
        .unwrap_or_else(tracing_subscriber::EnvFilter::from_default_env);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = match ConnectorConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return std::process::ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal init failure");
            std::process::ExitCode::from(2)
        }
    }
}

async fn run(config: ConnectorConfig) -> Result<()> {
    let cancel = CancellationToken::new();

    let metrics = PrometheusMetrics::install().context("installing metrics recorder")?;
    let health = HealthState::new();
    {
        let health = health.clone();
        let metrics = metrics.clone();
        let port = config.defaults.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = lakesink_io::health::serve(port, health, metrics).await {
                error!(error = %e, "health/metrics server exited");
            }
        });
    }

    let registry_client = {
        let client_config = RegistryClientConfig::new(vec![config.defaults.registry_url.clone()]);
        SchemaRegistryClient::new(client_config)
    };
    let schema_client: Arc<dyn lakesink_schema::SchemaClient> =
        Arc::new(RestSchemaRegistry::new(registry_client));
    let schema_cache = Arc::new(SchemaCache::new(schema_client.clone()));
    let parser = Arc::new(MessageParser::new(schema_cache.clone()));
    let validators: Arc<DashMap<String, Arc<dyn Validator>>> = Arc::new(DashMap::new());

    let topics: Vec<String> = config.topics.values().map(|b| b.kafka_topic.clone()).collect();
    let (consumer, mut rebalance_rx) =
        build_consumer(&config.defaults.broker_bootstrap_servers, &config.defaults.broker_group_id, &topics)
            .context("starting kafka consumer")?;
    let consumer = Arc::new(consumer);

    let dlq_tx = DeadLetterSink::start(&config.defaults.broker_bootstrap_servers, cancel.clone())
        .context("starting dead letter sink")?;

    let buffer = Arc::new(BatchBuffer::new());
    let table_writer = Arc::new(TableWriter::new(
        metrics.clone() as Arc<dyn lakesink_core::Metrics>,
        schema_client.clone(),
        config.defaults.schema_compatibility,
    ));
    let circuits = Arc::new(CircuitBreakerRegistry::new());
    let maintenance = Arc::new(MaintenanceScheduler::new(metrics.clone() as Arc<dyn lakesink_core::Metrics>));
    let store_creds = Arc::new(StoreCredentials {
        endpoint: config.defaults.s3_endpoint.clone(),
        region: config.defaults.s3_region.clone(),
        access_key_id: config.defaults.s3_access_key_id.clone(),
        secret_access_key: config.defaults.s3_secret_access_key.clone(),
    });

    // Partition lifecycle: Assigned/Running tracked implicitly by presence
    // in this set; Revoked triggers a full flush (Draining) before the
    // partition is dropped from tracking (Released).
    let assigned_partitions: Arc<DashMap<(String, i32), ()>> = Arc::new(DashMap::new());

    let rebalance_task = {
        let buffer = buffer.clone();
        let table_writer = table_writer.clone();
        let store_creds = store_creds.clone();
        let maintenance = maintenance.clone();
        let health = health.clone();
        let assigned_partitions = assigned_partitions.clone();
        let cancel = cancel.clone();
        let circuits = circuits.clone();
        let consumer = consumer.clone();
        let dlq_tx = dlq_tx.clone();
        let metrics = metrics.clone() as Arc<dyn Metrics>;
        tokio::spawn(async move {
            while let Some(event) = rebalance_rx.recv().await {
                match event {
                    RebalanceEvent::Assigned(parts) => {
                        for (topic, partition) in parts {
                            info!(topic, partition, "partition assigned, now running");
                            assigned_partitions.insert((topic.clone(), partition), ());
                            health.heartbeat(&topic, partition);
                        }
                    }
                    RebalanceEvent::Revoked(parts) => {
                        for (topic, partition) in &parts {
                            info!(topic, partition, "partition revoked, draining buffered batches");
                        }
                        for batch in buffer.flush_all() {
                            if let Err(e) = write_batch(
                                &table_writer,
                                &store_creds,
                                &maintenance,
                                &circuits,
                                &metrics,
                                &consumer,
                                &dlq_tx,
                                batch,
                                &cancel,
                            )
                            .await
                            {
                                error!(error = %e, "failed to flush batch during partition drain");
                            }
                        }
                        for (topic, partition) in parts {
                            assigned_partitions.remove(&(topic.clone(), partition));
                            health.forget(&topic, partition);
                            info!(topic, partition, "partition released");
                        }
                    }
                }
            }
        })
    };

    let timer_task = {
        let buffer = buffer.clone();
        let table_writer = table_writer.clone();
        let store_creds = store_creds.clone();
        let maintenance = maintenance.clone();
        let cancel = cancel.clone();
        let circuits = circuits.clone();
        let consumer = consumer.clone();
        let dlq_tx = dlq_tx.clone();
        let metrics = metrics.clone() as Arc<dyn Metrics>;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for batch in buffer.flush_timed_out() {
                            if let Err(e) = write_batch(
                                &table_writer,
                                &store_creds,
                                &maintenance,
                                &circuits,
                                &metrics,
                                &consumer,
                                &dlq_tx,
                                batch,
                                &cancel,
                            )
                            .await
                            {
                                error!(error = %e, "failed to flush timed-out batch");
                            }
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    };

    let consume_task = {
        let buffer = buffer.clone();
        let table_writer = table_writer.clone();
        let store_creds = store_creds.clone();
        let maintenance = maintenance.clone();
        let consumer = consumer.clone();
        let parser = parser.clone();
        let schema_cache = schema_cache.clone();
        let validators = validators.clone();
        let topic_bindings = config.topics.clone();
        let circuits = circuits.clone();
        let health = health.clone();
        let dlq_tx = dlq_tx.clone();
        let cancel = cancel.clone();
        let metrics = metrics.clone() as Arc<dyn Metrics>;
        tokio::spawn(async move {
            let mut stream = consumer.stream();
            loop {
                tokio::select! {
                    maybe_msg = stream.next() => {
                        let Some(msg) = maybe_msg else { break };
                        let msg = match msg {
                            Ok(m) => m,
                            Err(e) => {
                                warn!(error = %e, "kafka stream error");
                                continue;
                            }
                        };
                        let topic = msg.topic().to_string();
                        let partition = msg.partition();
                        let offset = msg.offset();
                        health.heartbeat(&topic, partition);
                        metrics.incr_counter("records_consumed_total", &[("topic", &topic)]);

                        let Some(binding) = topic_bindings.values().find(|b| b.kafka_topic == topic) else {
                            warn!(topic, "no topic binding configured, skipping message");
                            continue;
                        };
                        let binding = binding.clone();
                        let raw = to_raw_message(&msg);

                        match process_one(
                            raw.clone(),
                            binding.clone(),
                            &parser,
                            &schema_cache,
                            &validators,
                            &circuits,
                            &metrics,
                        )
                        .await
                        {
                            Ok(record) => {
                                let enriched = enrich(record, &binding);
                                if let Some(ready) = buffer.push(enriched, binding.clone()) {
                                    // I1: the offset(s) this batch covers are committed
                                    // inside `write_batch` itself, only once the write
                                    // (or, on terminal failure, dlq routing) succeeds —
                                    // never unconditionally here.
                                    if let Err(e) = write_batch(
                                        &table_writer,
                                        &store_creds,
                                        &maintenance,
                                        &circuits,
                                        &metrics,
                                        &consumer,
                                        &dlq_tx,
                                        ready,
                                        &cancel,
                                    )
                                    .await
                                    {
                                        error!(error = %e, "failed to write flushed batch");
                                    }
                                }
                            }
                            Err(err) => {
                                warn!(error = %err, topic, partition, offset, "record failed processing, routing to dlq");
                                metrics.incr_counter("records_dlq_total", &[("topic", &topic)]);
                                let letter = DeadLetter::from_error(raw, &err);
                                let _ = dlq_tx.send(letter).await;
                                if let Err(e) = commit_offset(&consumer, &topic, partition, offset) {
                                    warn!(error = %e, topic, partition, offset, "failed to commit offset after dlq routing");
                                }
                            }
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
            cancel.cancel();
        }
        _ = async {
            let _ = consume_task.await;
        } => {}
    }

    cancel.cancel();
    let _ = rebalance_task.await;
    let _ = timer_task.await;

    let metrics_for_shutdown = metrics.clone() as Arc<dyn Metrics>;
    for batch in buffer.flush_all() {
        if let Err(e) = write_batch(
            &table_writer,
            &store_creds,
            &maintenance,
            &circuits,
            &metrics_for_shutdown,
            &consumer,
            &dlq_tx,
            batch,
            &cancel,
        )
        .await
        {
            error!(error = %e, "failed to flush batch during shutdown");
        }
    }

    Ok(())
}

/// Resolves the schema for `binding`'s subject, parses and validates
/// `raw` against it. Schema-registry and validator-compile failures are
/// routed through the circuit breaker so a registry outage doesn't
/// retry indefinitely against a dead service.
async fn process_one(
    raw: lakesink_core::RawMessage,
    binding: Arc<lakesink_core::TopicBinding>,
    parser: &MessageParser,
    schema_cache: &Arc<SchemaCache>,
    validators: &DashMap<String, Arc<dyn Validator>>,
    circuits: &CircuitBreakerRegistry,
    metrics: &Arc<dyn Metrics>,
) -> Result<lakesink_core::ParsedRecord, ConnectorError> {
    if !circuits.allow("schema-registry") {
        metrics.incr_counter("circuit_open_total", &[("service", "schema-registry")]);
        return Err(ConnectorError::CircuitOpen("schema-registry".to_string()));
    }

    let record_result = parser.parse(raw, &binding.schema_subject).await;
    match &record_result {
        Ok(_) => circuits.record_success("schema-registry"),
        Err(e) if matches!(e, ConnectorError::Registry(_)) => circuits.record_failure("schema-registry"),
        Err(_) => {}
    }
    let record = record_result?;

    let validator = validator_for(&binding.schema_subject, schema_cache, validators).await?;
    validator.validate(&record.fields)?;
    Ok(record)
}

async fn validator_for(
    subject: &str,
    schema_cache: &Arc<SchemaCache>,
    validators: &DashMap<String, Arc<dyn Validator>>,
) -> Result<Arc<dyn Validator>, ConnectorError> {
    if let Some(existing) = validators.get(subject) {
        return Ok(existing.clone());
    }
    let resolved = schema_cache.resolve_or_fallback(subject).await;
    let validator: Arc<dyn Validator> = match resolved.kind {
        SchemaKind::Json => Arc::new(lakesink_schema::JsonSchemaValidator::compile(&resolved.raw_schema)?),
        SchemaKind::Avro => Arc::new(NoopValidator),
    };
    validators.insert(subject.to_string(), validator.clone());
    Ok(validator)
}

/// Commits `batch` under the Retry Executor and Circuit Breaker, built
/// per-batch from the destination's own `processing.max_retries` rather
/// than a connector-wide budget. On success, notifies the Maintenance
/// Scheduler and commits the batch's covered offsets; on a terminal
/// failure (including a tripped circuit), routes every record to the
/// Dead Letter Sink instead of dropping the batch (I6), committing
/// offsets only once dlq routing itself has succeeded (P1).
async fn write_batch(
    table_writer: &Arc<TableWriter>,
    store_creds: &Arc<StoreCredentials>,
    maintenance: &Arc<MaintenanceScheduler>,
    circuits: &CircuitBreakerRegistry,
    metrics: &Arc<dyn Metrics>,
    consumer: &Arc<lakesink_io::LakesinkConsumer>,
    dlq_tx: &lakesink_io::DlqChannel,
    batch: Batch,
    cancel: &CancellationToken,
) -> Result<(), ConnectorError> {
    let destination = batch.binding.destination.clone();
    let table_name = destination.table_name.clone();
    let circuit_key = format!("writer-{table_name}");
    let retry_policy = RetryPolicy::default().with_max_attempts(batch.binding.processing.max_retries.max(1));

    if !circuits.allow(&circuit_key) {
        metrics.incr_counter("circuit_open_total", &[("service", &circuit_key)]);
        return route_batch_to_dlq(&batch, dlq_tx, consumer, ConnectorError::CircuitOpen(circuit_key)).await;
    }

    let attempts = std::sync::atomic::AtomicU32::new(0);
    let outcome = match run_with_retry(&format!("write-batch:{table_name}"), retry_policy, cancel, || {
        if attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) > 0 {
            metrics.incr_counter("retry_attempts_total", &[("table", &table_name)]);
        }
        let table_writer = table_writer.clone();
        let store_creds = store_creds.clone();
        let batch = batch.clone();
        async move { table_writer.commit_batch(batch, &store_creds).await }
    })
    .await
    {
        Ok(outcome) => {
            circuits.record_success(&circuit_key);
            outcome
        }
        Err(err) => {
            circuits.record_failure(&circuit_key);
            metrics.incr_counter("write_errors_total", &[("table", &table_name)]);
            return route_batch_to_dlq(&batch, dlq_tx, consumer, err).await;
        }
    };

    metrics.incr_counter("batches_flushed_total", &[("table", &table_name)]);
    info!(
        table = %table_name,
        version = outcome.version,
        records = outcome.records_written,
        "committed batch"
    );

    let store = table_writer.store_for(&destination, store_creds)?;
    maintenance.on_commit(store, destination);
    commit_batch_offsets(consumer, &batch);
    Ok(())
}

/// Routes every record in `batch` to the Dead Letter Sink. Offsets are
/// committed only if every record is accepted onto the dlq channel —
/// a dlq send failure leaves the batch's offsets uncommitted so it is
/// redelivered on restart rather than silently lost.
async fn route_batch_to_dlq(
    batch: &Batch,
    dlq_tx: &lakesink_io::DlqChannel,
    consumer: &Arc<lakesink_io::LakesinkConsumer>,
    err: ConnectorError,
) -> Result<(), ConnectorError> {
    let mut all_sent = true;
    for record in &batch.records {
        let letter = DeadLetter::from_batch_record(record, &err);
        if dlq_tx.send(letter).await.is_err() {
            all_sent = false;
        }
    }
    if all_sent {
        commit_batch_offsets(consumer, batch);
    } else {
        warn!(
            table = %batch.binding.destination.table_name,
            "dlq routing failed for terminal batch, leaving offsets uncommitted for redelivery"
        );
    }
    Err(err)
}

/// Commits, per distinct `(topic, partition)` in `batch`, the highest
/// offset observed — covering the whole batch in one synchronous commit
/// per partition (I1: committed only after the write it covers lands,
/// whether as a table version or a dlq envelope).
fn commit_batch_offsets(consumer: &Arc<lakesink_io::LakesinkConsumer>, batch: &Batch) {
    let mut max_offsets: std::collections::HashMap<(String, i32), i64> = std::collections::HashMap::new();
    for record in &batch.records {
        let key = (record.source.topic.clone(), record.source.partition);
        max_offsets
            .entry(key)
            .and_modify(|o| *o = (*o).max(record.source.offset))
            .or_insert(record.source.offset);
    }
    for ((topic, partition), offset) in max_offsets {
        if let Err(e) = commit_offset(consumer, &topic, partition, offset) {
            warn!(error = %e, topic, partition, offset, "failed to commit offset after batch write");
        }
    }
}
