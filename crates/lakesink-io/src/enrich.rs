//! Record Enricher (§4.4): a pure, deterministic function that adds
//! Kafka-origin metadata and destination partition-key columns to a
//! parsed record before it is handed to the Batch Buffer.
//!
//! Enrichment never fails on malformed input — it degrades to a
//! wall-clock-derived partition value rather than rejecting the record,
//! since rejecting here would duplicate work the Validator already did.

use chrono::{Datelike, Timelike, Utc};
use lakesink_core::{ParsedRecord, TopicBinding};
use serde_json::Value;

const KAFKA_TOPIC_FIELD: &str = "_kafka_topic";
const KAFKA_PARTITION_FIELD: &str = "_kafka_partition";
const KAFKA_OFFSET_FIELD: &str = "_kafka_offset";
const KAFKA_KEY_FIELD: &str = "_kafka_key";
const PROCESSED_AT_FIELD: &str = "_processed_at";
const INGESTION_TIMESTAMP_FIELD: &str = "_ingestion_timestamp";

/// Enriches `record` with the four `_kafka_*` metadata columns plus
/// whichever of `year`/`month`/`day`/`hour` appear in the destination's
/// partition columns, derived from the record's COB date when present
/// and from wall-clock time at enrichment otherwise (B3). Re-enriching
/// an already-enriched record overwrites every field deterministically
/// from the same (cob, partition-column) inputs, satisfying P6 —
/// `_processed_at`/`_ingestion_timestamp` are the only fields that
/// legitimately differ between calls, and neither feeds partition-key
/// derivation.
pub fn enrich(mut record: ParsedRecord, binding: &TopicBinding) -> ParsedRecord {
    record
        .fields
        .insert(KAFKA_TOPIC_FIELD.to_string(), Value::String(record.source.topic.clone()));
    record
        .fields
        .insert(KAFKA_PARTITION_FIELD.to_string(), Value::from(record.source.partition));
    record
        .fields
        .insert(KAFKA_OFFSET_FIELD.to_string(), Value::from(record.source.offset));
    record.fields.insert(
        KAFKA_KEY_FIELD.to_string(),
        record.source.key.clone().map(Value::String).unwrap_or(Value::Null),
    );

    let now = Utc::now();
    record
        .fields
        .insert(PROCESSED_AT_FIELD.to_string(), Value::String(now.to_rfc3339()));
    record
        .fields
        .insert(INGESTION_TIMESTAMP_FIELD.to_string(), Value::from(now.timestamp_millis()));

    let basis = partition_basis(&record, now);
    for col in &binding.destination.partition_columns {
        let value = match col.as_str() {
            "year" => Some(basis.year()),
            "month" => Some(basis_month(&basis)),
            "day" => Some(basis_day(&basis)),
            "hour" => Some(basis_hour(&basis) as i32),
            _ => None,
        };
        if let Some(v) = value {
            let padded = if col == "year" {
                format!("{v:04}")
            } else {
                format!("{v:02}")
            };
            record.fields.insert(col.clone(), Value::String(padded));
        }
    }

    record
}

/// The instant driving `year`/`month`/`day`/`hour` derivation: the
/// record's COB date (midnight UTC) when carried, else wall-clock at
/// enrichment (§4.4).
enum PartitionBasis {
    Cob(chrono::NaiveDate),
    WallClock(chrono::DateTime<Utc>),
}

fn partition_basis(record: &ParsedRecord, now: chrono::DateTime<Utc>) -> PartitionBasis {
    match record.cob_date {
        Some(cob) => PartitionBasis::Cob(cob),
        None => PartitionBasis::WallClock(now),
    }
}

impl PartitionBasis {
    fn year(&self) -> i32 {
        match self {
            PartitionBasis::Cob(d) => d.year(),
            PartitionBasis::WallClock(dt) => dt.year(),
        }
    }
}

fn basis_month(basis: &PartitionBasis) -> i32 {
    (match basis {
        PartitionBasis::Cob(d) => d.month(),
        PartitionBasis::WallClock(dt) => dt.month(),
    }) as i32
}

fn basis_day(basis: &PartitionBasis) -> i32 {
    (match basis {
        PartitionBasis::Cob(d) => d.day(),
        PartitionBasis::WallClock(dt) => dt.day(),
    }) as i32
}

fn basis_hour(basis: &PartitionBasis) -> u32 {
    match basis {
        // COB is a business date with no time component; hour is
        // undefined for a COB-derived partition, so it collapses to 0
        // rather than leaking wall-clock into a deterministic key.
        PartitionBasis::Cob(_) => 0,
        PartitionBasis::WallClock(dt) => dt.hour(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakesink_core::model::{Destination, ProcessingPolicy};
    use lakesink_core::SourceMeta;
    use serde_json::Map;

    fn binding(partition_columns: Vec<String>) -> TopicBinding {
        TopicBinding {
            kafka_topic: "orders".into(),
            schema_subject: "orders-value".into(),
            destination: Destination {
                bucket: "lake".into(),
                path: "orders".into(),
                table_name: "orders".into(),
                partition_columns,
                delta: Default::default(),
            },
            processing: ProcessingPolicy::default(),
        }
    }

    fn record(cob: Option<&str>, key: Option<&str>) -> ParsedRecord {
        let mut fields = Map::new();
        if let Some(cob) = cob {
            fields.insert("cob".to_string(), Value::String(cob.to_string()));
        }
        let source = SourceMeta {
            topic: "user.events.v1".into(),
            partition: 3,
            offset: 99,
            kafka_timestamp_ms: Some(1_700_000_000_000),
            key: key.map(str::to_string),
        };
        ParsedRecord::new(fields, source)
    }

    #[test]
    fn adds_kafka_metadata_fields() {
        let enriched = enrich(record(None, Some("u1")), &binding(vec![]));
        assert_eq!(enriched.fields.get(KAFKA_TOPIC_FIELD).unwrap(), "user.events.v1");
        assert_eq!(enriched.fields.get(KAFKA_PARTITION_FIELD).unwrap(), 3);
        assert_eq!(enriched.fields.get(KAFKA_OFFSET_FIELD).unwrap(), 99);
        assert_eq!(enriched.fields.get(KAFKA_KEY_FIELD).unwrap(), "u1");
        assert!(enriched.fields.contains_key(PROCESSED_AT_FIELD));
        assert!(enriched.fields.contains_key(INGESTION_TIMESTAMP_FIELD));
    }

    #[test]
    fn null_key_when_record_has_none() {
        let enriched = enrich(record(None, None), &binding(vec![]));
        assert!(enriched.fields.get(KAFKA_KEY_FIELD).unwrap().is_null());
    }

    #[test]
    fn derives_year_month_day_from_cob_when_present() {
        let enriched = enrich(
            record(Some("2023-01-01"), None),
            &binding(vec!["year".into(), "month".into(), "day".into()]),
        );
        assert_eq!(enriched.fields.get("year").unwrap(), "2023");
        assert_eq!(enriched.fields.get("month").unwrap(), "01");
        assert_eq!(enriched.fields.get("day").unwrap(), "01");
    }

    #[test]
    fn omits_partition_columns_not_requested_by_destination() {
        let enriched = enrich(record(Some("2023-01-01"), None), &binding(vec!["year".into()]));
        assert!(enriched.fields.contains_key("year"));
        assert!(!enriched.fields.contains_key("month"));
        assert!(!enriched.fields.contains_key("day"));
    }

    #[test]
    fn falls_back_to_wall_clock_when_no_cob() {
        let enriched = enrich(record(None, None), &binding(vec!["year".into(), "hour".into()]));
        let now = Utc::now();
        assert_eq!(enriched.fields.get("year").unwrap(), &format!("{:04}", now.year()));
        assert!(enriched.fields.get("hour").unwrap().is_string());
    }

    #[test]
    fn reenrichment_is_idempotent_on_partition_columns() {
        let once = enrich(record(Some("2023-06-15"), Some("k")), &binding(vec!["year".into(), "month".into(), "day".into()]));
        let twice = enrich(once.clone(), &binding(vec!["year".into(), "month".into(), "day".into()]));
        assert_eq!(once.fields.get("year"), twice.fields.get("year"));
        assert_eq!(once.fields.get("month"), twice.fields.get("month"));
        assert_eq!(once.fields.get("day"), twice.fields.get("day"));
    }
}
