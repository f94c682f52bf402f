//! Message parsing, schema registry client, and JSON schema validation.

pub mod parser;
pub mod registry;
pub mod validator;

pub use parser::MessageParser;
pub use registry::{ResolvedSchema, RestSchemaRegistry, SchemaCache, SchemaClient, SchemaKind};
pub use validator::{JsonSchemaValidator, NoopValidator, Validator};
