//! Message Parser (§4.1): turns a raw Kafka record into a [`ParsedRecord`]
//! in canonical field space. Format is detected from the trimmed value:
//! a leading `{`/`[` is JSON; a leading `0x00` magic byte followed by a
//! 4-byte big-endian schema id is Confluent-framed Avro, decoded against
//! the writer schema the id resolves to in the registry; anything else
//! containing a recognized separator is delimited text, bound
//! positionally to the resolved schema's field order — the
//! "registry-aware parser with permissive fallback" called for in
//! SPEC_FULL.md §9.

use std::io::Cursor;
use std::sync::Arc;

use apache_avro::types::Value as AvroValue;
use apache_avro::Schema as AvroSchema;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde_json::{Map, Value};

use lakesink_core::{ConnectorError, ParsedRecord, RawMessage, SourceMeta};

use crate::registry::{ResolvedSchema, SchemaCache, SchemaKind};

const CONFLUENT_MAGIC_BYTE: u8 = 0x00;

pub struct MessageParser {
    schemas: Arc<SchemaCache>,
}

impl MessageParser {
    pub fn new(schemas: Arc<SchemaCache>) -> Self {
        Self { schemas }
    }

    /// Parses `raw` using the schema bound to `subject`, dispatching on
    /// the detected wire format (§4.1): Confluent-framed binary, JSON,
    /// or delimited text.
    pub async fn parse(&self, raw: RawMessage, subject: &str) -> Result<ParsedRecord, ConnectorError> {
        let source = SourceMeta {
            topic: raw.topic.clone(),
            partition: raw.partition,
            offset: raw.offset,
            kafka_timestamp_ms: raw.kafka_timestamp_ms,
            key: raw.key.as_ref().map(|k| String::from_utf8_lossy(k).to_string()),
        };

        if is_confluent_framed(&raw.value) {
            let schema_id = i32::from_be_bytes(raw.value[1..5].try_into().unwrap());
            let resolved = self.schemas.resolve_by_id(schema_id).await?;
            let fields = decode_framed(&raw.value, &resolved)?;
            return Ok(ParsedRecord::new(fields, source));
        }

        let trimmed = trimmed_leading(&raw.value);
        if looks_like_json(trimmed) {
            let fields = decode_permissive_json(&raw.value)?;
            let resolved = self.schemas.resolve_or_fallback(subject).await;
            // The permissive fallback (`registry_id == -1`) carries no field
            // metadata to coerce against; only a real resolved schema drives
            // the §4.1 coercions.
            let fields = if resolved.registry_id == -1 {
                fields
            } else {
                coerce_json_fields(fields, &resolved)?
            };
            return Ok(ParsedRecord::new(fields, source));
        }

        if let Some(delimiter) = detect_delimiter(&raw.value) {
            let resolved = self.schemas.resolve_or_fallback(subject).await;
            let fields = decode_delimited(&raw.value, delimiter, &resolved)?;
            return Ok(ParsedRecord::new(fields, source));
        }

        let fields = decode_permissive_json(&raw.value)?;
        Ok(ParsedRecord::new(fields, source))
    }
}

fn is_confluent_framed(payload: &[u8]) -> bool {
    payload.len() > 5 && payload[0] == CONFLUENT_MAGIC_BYTE
}

/// `payload` with leading ASCII whitespace stripped, for format sniffing
/// only — the original bytes are still handed to the chosen decoder.
fn trimmed_leading(payload: &[u8]) -> &[u8] {
    let mut start = 0;
    while start < payload.len() && payload[start].is_ascii_whitespace() {
        start += 1;
    }
    &payload[start..]
}

fn looks_like_json(trimmed: &[u8]) -> bool {
    matches!(trimmed.first(), Some(b'{') | Some(b'['))
}

const DELIMITER_CANDIDATES: &[u8] = b",|\t";

/// The separator byte used for delimited text, chosen as the first
/// recognized candidate present in the payload (§4.1: "contains
/// separators but no brace/bracket").
fn detect_delimiter(payload: &[u8]) -> Option<u8> {
    DELIMITER_CANDIDATES.iter().copied().find(|d| payload.contains(d))
}

/// Binds `payload` positionally to the resolved schema's field order.
/// Fields beyond the resolved schema's known names (or when the schema
/// carries none, e.g. the permissive fallback) are bound to synthetic
/// `field_N` names rather than dropped, so no data is lost.
fn decode_delimited(payload: &[u8], delimiter: u8, resolved: &ResolvedSchema) -> Result<Map<String, Value>, ConnectorError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| ConnectorError::Parse(format!("delimited payload is not valid utf-8: {e}")))?;
    let sep = delimiter as char;
    let names = field_names(resolved);
    let mut fields = Map::new();
    for (idx, part) in text.trim_end_matches(['\r', '\n']).split(sep).enumerate() {
        let name = names.get(idx).cloned().unwrap_or_else(|| format!("field_{idx}"));
        fields.insert(name, Value::String(part.to_string()));
    }
    Ok(fields)
}

/// Ordered field names for a resolved schema, used to bind delimited
/// text positionally. Returns an empty list when the schema carries no
/// discoverable field order (e.g. the permissive fallback).
fn field_names(resolved: &ResolvedSchema) -> Vec<String> {
    match resolved.kind {
        SchemaKind::Avro => AvroSchema::parse_str(&resolved.raw_schema)
            .ok()
            .and_then(|schema| match schema {
                AvroSchema::Record(r) => Some(r.fields.iter().map(|f| f.name.clone()).collect()),
                _ => None,
            })
            .unwrap_or_default(),
        SchemaKind::Json => serde_json::from_str::<Value>(&resolved.raw_schema)
            .ok()
            .and_then(|doc| doc.get("properties").and_then(Value::as_object).map(|props| props.keys().cloned().collect()))
            .unwrap_or_default(),
    }
}

fn decode_framed(payload: &[u8], resolved: &ResolvedSchema) -> Result<Map<String, Value>, ConnectorError> {
    let body = &payload[5..];
    match resolved.kind {
        SchemaKind::Avro => decode_avro_body(body, &resolved.raw_schema),
        SchemaKind::Json => coerce_json_fields(decode_permissive_json(body)?, resolved),
    }
}

/// Applies §4.1's JSON-path coercions to `fields` using `resolved`'s JSON
/// Schema `properties` map for per-field type/format: an ISO-instant or
/// local-datetime string under a `date-time`-formatted field becomes
/// epoch milliseconds, a `byte`-formatted field is checked (not
/// re-encoded) as base64, a bare epoch integer is left untouched, and a
/// `null` value always passes through regardless of the field's declared
/// type (the union null-branch wins, mirroring the Avro decoder's
/// `Union` handling).
fn coerce_json_fields(mut fields: Map<String, Value>, resolved: &ResolvedSchema) -> Result<Map<String, Value>, ConnectorError> {
    let properties = match serde_json::from_str::<Value>(&resolved.raw_schema)
        .ok()
        .and_then(|doc| doc.get("properties").cloned())
    {
        Some(Value::Object(props)) => props,
        _ => return Ok(fields),
    };
    for (name, field_schema) in &properties {
        if let Some(value) = fields.get(name).cloned() {
            let coerced = coerce_json_value(value, field_schema)?;
            fields.insert(name.clone(), coerced);
        }
    }
    Ok(fields)
}

fn coerce_json_value(value: Value, field_schema: &Value) -> Result<Value, ConnectorError> {
    if value.is_null() {
        return Ok(value);
    }
    let format = field_schema.get("format").and_then(Value::as_str);
    match (&value, format) {
        (Value::String(s), Some("date-time")) => Ok(Value::from(coerce_temporal_string(s)?)),
        (Value::String(s), Some("byte")) => {
            BASE64_STANDARD
                .decode(s.as_bytes())
                .map_err(|e| ConnectorError::Parse(format!("field declared format \"byte\" is not valid base64: {e}")))?;
            Ok(value)
        }
        // Epoch integers under a date-time field are already canonical
        // (§4.1: "epoch int accepted alongside ISO-instant strings").
        _ => Ok(value),
    }
}

/// Parses `s` as either an RFC 3339 instant or a local (offset-less)
/// datetime, treating the latter as UTC, and returns epoch milliseconds
/// (§4.1).
fn coerce_temporal_string(s: &str) -> Result<i64, ConnectorError> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive.and_utc().timestamp_millis());
    }
    Err(ConnectorError::Parse(format!(
        "field declared format \"date-time\" is not a recognized ISO instant or local datetime: {s}"
    )))
}

fn decode_avro_body(body: &[u8], schema_text: &str) -> Result<Map<String, Value>, ConnectorError> {
    let schema = AvroSchema::parse_str(schema_text)
        .map_err(|e| ConnectorError::Parse(format!("invalid writer schema: {e}")))?;
    let mut cursor = Cursor::new(body);
    let avro_value = apache_avro::from_avro_datum(&schema, &mut cursor, None)
        .map_err(|e| ConnectorError::Parse(format!("avro decode failed: {e}")))?;
    avro_to_json_object(avro_value)
}

fn avro_to_json_object(value: AvroValue) -> Result<Map<String, Value>, ConnectorError> {
    let json = avro_value_to_json(value)?;
    match json {
        Value::Object(map) => Ok(map),
        other => Err(ConnectorError::Parse(format!(
            "decoded avro value is not a record: {other}"
        ))),
    }
}

fn avro_value_to_json(value: AvroValue) -> Result<Value, ConnectorError> {
    Ok(match value {
        AvroValue::Null => Value::Null,
        AvroValue::Boolean(b) => Value::Bool(b),
        AvroValue::Int(i) => Value::from(i),
        AvroValue::Long(i) => Value::from(i),
        AvroValue::Float(f) => serde_json::Number::from_f64(f as f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        AvroValue::Double(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        AvroValue::Bytes(b) | AvroValue::Fixed(_, b) => Value::String(BASE64_STANDARD.encode(b)),
        AvroValue::String(s) | AvroValue::Enum(_, s) => Value::String(s),
        AvroValue::Union(_, inner) => avro_value_to_json(*inner)?,
        AvroValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(avro_value_to_json(item)?);
            }
            Value::Array(out)
        }
        AvroValue::Map(entries) => {
            let mut out = Map::new();
            for (k, v) in entries {
                out.insert(k, avro_value_to_json(v)?);
            }
            Value::Object(out)
        }
        AvroValue::Record(fields) => {
            let mut out = Map::new();
            for (k, v) in fields {
                out.insert(k, avro_value_to_json(v)?);
            }
            Value::Object(out)
        }
        // Logical types decode to their underlying representation
        // (epoch-relative integer, or a base64 string for arbitrary
        // precision), matching the canonical field space the JSON and
        // delimited decoders already emit rather than a richer native
        // temporal type (§4.1: canonical field space is JSON scalars).
        AvroValue::Date(days) => Value::from(days),
        AvroValue::TimeMillis(ms) => Value::from(ms),
        AvroValue::TimeMicros(us) => Value::from(us),
        AvroValue::TimestampMillis(ms) => Value::from(ms),
        AvroValue::TimestampMicros(us) => Value::from(us),
        AvroValue::LocalTimestampMillis(ms) => Value::from(ms),
        AvroValue::LocalTimestampMicros(us) => Value::from(us),
        AvroValue::Duration(d) => Value::String(format!("{d:?}")),
        AvroValue::Decimal(d) => Value::String(format!("{d:?}")),
        AvroValue::Uuid(u) => Value::String(u.to_string()),
        other => {
            return Err(ConnectorError::Parse(format!(
                "unsupported avro value variant: {other:?}"
            )))
        }
    })
}

fn decode_permissive_json(body: &[u8]) -> Result<Map<String, Value>, ConnectorError> {
    let parsed: Value = serde_json::from_slice(body)
        .map_err(|e| ConnectorError::Parse(format!("payload is neither avro-framed nor valid json: {e}")))?;
    match parsed {
        Value::Object(map) => Ok(map),
        other => Err(ConnectorError::Parse(format!(
            "top-level json payload must be an object, got: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SchemaClient;
    use async_trait::async_trait;

    struct StaticClient(ResolvedSchema);

    #[async_trait]
    impl SchemaClient for StaticClient {
        async fn get_latest(&self, _subject: &str) -> anyhow::Result<ResolvedSchema> {
            Ok(self.0.clone())
        }
        async fn get_version(&self, _subject: &str, _version: i32) -> anyhow::Result<ResolvedSchema> {
            Ok(self.0.clone())
        }
        async fn get_by_id(&self, _id: i32) -> anyhow::Result<ResolvedSchema> {
            Ok(self.0.clone())
        }
        async fn register(&self, _subject: &str, _schema: &str) -> anyhow::Result<i32> {
            Ok(1)
        }
        async fn test_compatibility(&self, _subject: &str, _schema: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    fn raw(topic: &str, value: Vec<u8>) -> RawMessage {
        RawMessage {
            topic: topic.to_string(),
            partition: 0,
            offset: 42,
            key: Some(b"k1".to_vec()),
            value,
            kafka_timestamp_ms: Some(1_700_000_000_000),
            headers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn parses_plain_json_payload() {
        let client: Arc<dyn SchemaClient> = Arc::new(StaticClient(ResolvedSchema {
            subject: "orders-value".into(),
            registry_id: 1,
            version: 1,
            kind: SchemaKind::Json,
            raw_schema: "{}".into(),
        }));
        let parser = MessageParser::new(Arc::new(SchemaCache::new(client)));
        let payload = br#"{"order_id": "o-1", "amount": 10}"#.to_vec();
        let record = parser.parse(raw("orders", payload), "orders-value").await.unwrap();
        assert_eq!(record.fields.get("order_id").unwrap(), "o-1");
        assert_eq!(record.source.offset, 42);
    }

    #[tokio::test]
    async fn rejects_non_object_json_payload() {
        let client: Arc<dyn SchemaClient> = Arc::new(StaticClient(ResolvedSchema {
            subject: "orders-value".into(),
            registry_id: 1,
            version: 1,
            kind: SchemaKind::Json,
            raw_schema: "{}".into(),
        }));
        let parser = MessageParser::new(Arc::new(SchemaCache::new(client)));
        let payload = br#"[1,2,3]"#.to_vec();
        let err = parser.parse(raw("orders", payload), "orders-value").await.unwrap_err();
        assert!(matches!(err, ConnectorError::Parse(_)));
    }

    #[tokio::test]
    async fn decodes_confluent_framed_avro_record() {
        let schema_text = r#"{
            "type": "record",
            "name": "Order",
            "fields": [
                {"name": "order_id", "type": "string"},
                {"name": "amount", "type": "double"}
            ]
        }"#;
        let schema = AvroSchema::parse_str(schema_text).unwrap();
        let mut record = apache_avro::types::Record::new(&schema).unwrap();
        record.put("order_id", "o-42");
        record.put("amount", 19.99);
        let body = apache_avro::to_avro_datum(&schema, record).unwrap();

        let mut payload = vec![CONFLUENT_MAGIC_BYTE];
        payload.extend_from_slice(&1i32.to_be_bytes());
        payload.extend_from_slice(&body);

        let client: Arc<dyn SchemaClient> = Arc::new(StaticClient(ResolvedSchema {
            subject: "orders-value".into(),
            registry_id: 1,
            version: 1,
            kind: SchemaKind::Avro,
            raw_schema: schema_text.into(),
        }));
        let parser = MessageParser::new(Arc::new(SchemaCache::new(client)));
        let parsed = parser.parse(raw("orders", payload), "orders-value").await.unwrap();
        assert_eq!(parsed.fields.get("order_id").unwrap(), "o-42");
    }

    #[tokio::test]
    async fn json_path_coerces_date_time_fields_against_resolved_schema() {
        let schema_doc = r#"{
            "type": "object",
            "properties": {
                "order_id": {"type": "string"},
                "placed_at": {"type": "string", "format": "date-time"},
                "local_at": {"type": "string", "format": "date-time"}
            }
        }"#;
        let client: Arc<dyn SchemaClient> = Arc::new(StaticClient(ResolvedSchema {
            subject: "orders-value".into(),
            registry_id: 3,
            version: 1,
            kind: SchemaKind::Json,
            raw_schema: schema_doc.into(),
        }));
        let parser = MessageParser::new(Arc::new(SchemaCache::new(client)));
        let payload = br#"{"order_id": "o-9", "placed_at": "2024-01-15T10:00:00Z", "local_at": "2024-01-15T10:00:00"}"#.to_vec();
        let parsed = parser.parse(raw("orders", payload), "orders-value").await.unwrap();
        assert_eq!(parsed.fields.get("placed_at").unwrap(), &serde_json::json!(1705312800000i64));
        assert_eq!(parsed.fields.get("local_at").unwrap(), &serde_json::json!(1705312800000i64));
    }

    #[tokio::test]
    async fn json_path_rejects_invalid_base64_in_byte_field() {
        let schema_doc = r#"{
            "type": "object",
            "properties": {"payload": {"type": "string", "format": "byte"}}
        }"#;
        let client: Arc<dyn SchemaClient> = Arc::new(StaticClient(ResolvedSchema {
            subject: "orders-value".into(),
            registry_id: 4,
            version: 1,
            kind: SchemaKind::Json,
            raw_schema: schema_doc.into(),
        }));
        let parser = MessageParser::new(Arc::new(SchemaCache::new(client)));
        let payload = br#"{"payload": "not-base64!!"}"#.to_vec();
        let err = parser.parse(raw("orders", payload), "orders-value").await.unwrap_err();
        assert!(matches!(err, ConnectorError::Parse(_)));
    }

    #[tokio::test]
    async fn json_path_skips_coercion_under_permissive_fallback() {
        struct AlwaysFails;
        #[async_trait]
        impl SchemaClient for AlwaysFails {
            async fn get_latest(&self, _subject: &str) -> anyhow::Result<ResolvedSchema> {
                Err(anyhow::anyhow!("registry unreachable"))
            }
            async fn get_version(&self, _subject: &str, _version: i32) -> anyhow::Result<ResolvedSchema> {
                Err(anyhow::anyhow!("registry unreachable"))
            }
            async fn get_by_id(&self, _id: i32) -> anyhow::Result<ResolvedSchema> {
                Err(anyhow::anyhow!("registry unreachable"))
            }
            async fn register(&self, _subject: &str, _schema: &str) -> anyhow::Result<i32> {
                Err(anyhow::anyhow!("registry unreachable"))
            }
            async fn test_compatibility(&self, _subject: &str, _schema: &str) -> anyhow::Result<bool> {
                Err(anyhow::anyhow!("registry unreachable"))
            }
        }
        let parser = MessageParser::new(Arc::new(SchemaCache::new(Arc::new(AlwaysFails))));
        let payload = br#"{"placed_at": "not-a-real-instant"}"#.to_vec();
        let parsed = parser.parse(raw("orders", payload), "orders-value").await.unwrap();
        assert_eq!(parsed.fields.get("placed_at").unwrap(), "not-a-real-instant");
    }

    #[tokio::test]
    async fn binds_delimited_text_positionally_to_schema_fields() {
        let schema_doc = r#"{
            "type": "object",
            "properties": {
                "order_id": {"type": "string"},
                "amount": {"type": "string"},
                "status": {"type": "string"}
            }
        }"#;
        let client: Arc<dyn SchemaClient> = Arc::new(StaticClient(ResolvedSchema {
            subject: "orders-value".into(),
            registry_id: 2,
            version: 1,
            kind: SchemaKind::Json,
            raw_schema: schema_doc.into(),
        }));
        let parser = MessageParser::new(Arc::new(SchemaCache::new(client)));
        let payload = b"o-7,19.99,FILLED".to_vec();
        let parsed = parser.parse(raw("orders", payload), "orders-value").await.unwrap();
        assert_eq!(parsed.fields.get("order_id").unwrap(), "o-7");
        assert_eq!(parsed.fields.get("amount").unwrap(), "19.99");
        assert_eq!(parsed.fields.get("status").unwrap(), "FILLED");
    }

    #[tokio::test]
    async fn delimited_text_without_resolvable_schema_uses_synthetic_field_names() {
        struct AlwaysFails;
        #[async_trait]
        impl SchemaClient for AlwaysFails {
            async fn get_latest(&self, _subject: &str) -> anyhow::Result<ResolvedSchema> {
                Err(anyhow::anyhow!("registry unreachable"))
            }
            async fn get_version(&self, _subject: &str, _version: i32) -> anyhow::Result<ResolvedSchema> {
                Err(anyhow::anyhow!("registry unreachable"))
            }
            async fn get_by_id(&self, _id: i32) -> anyhow::Result<ResolvedSchema> {
                Err(anyhow::anyhow!("registry unreachable"))
            }
            async fn register(&self, _subject: &str, _schema: &str) -> anyhow::Result<i32> {
                Err(anyhow::anyhow!("registry unreachable"))
            }
            async fn test_compatibility(&self, _subject: &str, _schema: &str) -> anyhow::Result<bool> {
                Err(anyhow::anyhow!("registry unreachable"))
            }
        }
        let parser = MessageParser::new(Arc::new(SchemaCache::new(Arc::new(AlwaysFails))));
        let payload = b"a|b|c".to_vec();
        let parsed = parser.parse(raw("orders", payload), "orders-value").await.unwrap();
        assert_eq!(parsed.fields.get("field_0").unwrap(), "a");
        assert_eq!(parsed.fields.get("field_1").unwrap(), "b");
        assert_eq!(parsed.fields.get("field_2").unwrap(), "c");
    }
}
