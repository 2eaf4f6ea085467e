//! Document encoding collaborator.
//!
//! The driver never inspects encoded bytes directly; it hands documents to a
//! [`DocumentCodec`] and frames whatever comes back.

use serde_json::{Map, Value};

use crate::error::{WireError, WireResult};

/// An ordered command or reply document.
pub type Document = Map<String, Value>;

/// Encodes command documents to bytes and decodes reply bytes back.
pub trait DocumentCodec: Send + Sync + std::fmt::Debug {
    /// Encode a document to its wire representation.
    fn encode(&self, document: &Document) -> WireResult<Vec<u8>>;
    /// Decode a document from its wire representation.
    fn decode(&self, bytes: &[u8]) -> WireResult<Document>;
}

/// JSON document codec.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl DocumentCodec for JsonCodec {
    fn encode(&self, document: &Document) -> WireResult<Vec<u8>> {
        serde_json::to_vec(document).map_err(|e| WireError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> WireResult<Document> {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(WireError::Codec(format!(
                "expected a document, got {}",
                kind_of(&other)
            ))),
            Err(e) => Err(WireError::Codec(e.to_string())),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "document",
    }
}
