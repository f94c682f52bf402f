//! Schema Validator (§4.3): checks a parsed record's fields against the
//! structural contract for its topic before it is handed to the
//! Enricher.
//!
//! Avro-encoded topics are already structurally validated by a
//! successful Avro decode (the wire format *is* the schema), so
//! [`NoopValidator`] covers them. JSON-encoded topics carry their own
//! JSON Schema document, compiled once and evaluated per record via the
//! `jsonschema` crate.

use jsonschema::JSONSchema;
use serde_json::{Map, Value};

use lakesink_core::ConnectorError;

pub trait Validator: Send + Sync {
    fn validate(&self, fields: &Map<String, Value>) -> Result<(), ConnectorError>;
}

/// Validator for topics whose wire format already guarantees structural
/// conformity (Avro).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopValidator;

impl Validator for NoopValidator {
    fn validate(&self, _fields: &Map<String, Value>) -> Result<(), ConnectorError> {
        Ok(())
    }
}

/// Validator backed by a compiled JSON Schema document. `jsonschema`
/// owns its compiled representation internally, so this holds no
/// borrowed state back to the source document.
pub struct JsonSchemaValidator {
    compiled: JSONSchema,
}

impl JsonSchemaValidator {
    pub fn compile(schema_text: &str) -> Result<Self, ConnectorError> {
        let schema_doc: Value = serde_json::from_str(schema_text)
            .map_err(|e| ConnectorError::Validation(format!("invalid JSON schema document: {e}")))?;
        let compiled = JSONSchema::options()
            .with_draft(jsonschema::Draft::Draft7)
            .compile(&schema_doc)
            .map_err(|e| ConnectorError::Validation(format!("failed to compile JSON schema: {e}")))?;
        Ok(Self { compiled })
    }
}

impl Validator for JsonSchemaValidator {
    fn validate(&self, fields: &Map<String, Value>) -> Result<(), ConnectorError> {
        let instance = Value::Object(fields.clone());
        let result = self.compiled.validate(&instance);
        if let Err(errors) = result {
            let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
            return Err(ConnectorError::Validation(messages.join("; ")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(json: &str) -> Map<String, Value> {
        match serde_json::from_str(json).unwrap() {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn accepts_conforming_record() {
        let schema = r#"{
            "type": "object",
            "required": ["order_id", "amount"],
            "properties": {
                "order_id": {"type": "string"},
                "amount": {"type": "number"}
            }
        }"#;
        let validator = JsonSchemaValidator::compile(schema).unwrap();
        let fields = obj(r#"{"order_id": "abc-1", "amount": 42.5}"#);
        assert!(validator.validate(&fields).is_ok());
    }

    #[test]
    fn rejects_missing_required_field() {
        let schema = r#"{
            "type": "object",
            "required": ["order_id", "amount"]
        }"#;
        let validator = JsonSchemaValidator::compile(schema).unwrap();
        let fields = obj(r#"{"order_id": "abc-1"}"#);
        let err = validator.validate(&fields).unwrap_err();
        assert!(matches!(err, ConnectorError::Validation(_)));
    }

    #[test]
    fn rejects_wrong_field_type() {
        let schema = r#"{
            "type": "object",
            "properties": {"amount": {"type": "number"}}
        }"#;
        let validator = JsonSchemaValidator::compile(schema).unwrap();
        let fields = obj(r#"{"amount": "not-a-number"}"#);
        assert!(validator.validate(&fields).is_err());
    }

    #[test]
    fn noop_validator_accepts_anything() {
        let validator = NoopValidator;
        let fields = obj(r#"{"whatever": [1,2,3]}"#);
        assert!(validator.validate(&fields).is_ok());
    }
}
