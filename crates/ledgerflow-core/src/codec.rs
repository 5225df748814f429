//! Versioned serialization for everything that crosses a durability or
//! network boundary.
//!
//! Checkpoints, wire envelopes and notarisation messages are encoded as a
//! canonical JSON document wrapped in a schema envelope:
//!
//! ```json
//! {"body": {...}, "v": 2}
//! ```
//!
//! Canonical form sorts object keys at every level, so encoding the same
//! logical value always yields the same bytes. That determinism is what
//! makes content hashes (transaction identifiers) stable across nodes.
//!
//! Decoding accepts any version in the supported window and rejects
//! everything else, so a node never misinterprets data written by a newer
//! release.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Schema version this build writes.
pub const SCHEMA_VERSION: u32 = 2;

/// Oldest schema version this build still reads.
pub const MIN_SUPPORTED_VERSION: u32 = 1;

/// Errors raised while encoding or decoding versioned documents.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The document's schema version lies outside the supported window.
    #[error("Unsupported schema version {version}: this node reads {min} through {max}")]
    UnsupportedSchema {
        /// Version found in the document.
        version: u64,
        /// Oldest accepted version.
        min: u32,
        /// Newest accepted version.
        max: u32,
    },

    /// The bytes are not a well-formed versioned document, or the body does
    /// not match the expected shape.
    #[error("Malformed document: {0}")]
    Malformed(String),
}

impl From<CodecError> for crate::error::CoreError {
    fn from(err: CodecError) -> Self {
        crate::error::CoreError::SerializationError(err.to_string())
    }
}

/// Encoder/decoder for versioned canonical JSON documents.
#[derive(Debug, Clone)]
pub struct Codec {
    write_version: u32,
}

impl Codec {
    /// Codec writing the current schema version.
    pub fn new() -> Self {
        Codec {
            write_version: SCHEMA_VERSION,
        }
    }

    /// Codec writing an older (still supported) schema version. Used to
    /// exercise mixed-version interop.
    pub fn with_write_version(version: u32) -> Result<Self, CodecError> {
        if !(MIN_SUPPORTED_VERSION..=SCHEMA_VERSION).contains(&version) {
            return Err(CodecError::UnsupportedSchema {
                version: version as u64,
                min: MIN_SUPPORTED_VERSION,
                max: SCHEMA_VERSION,
            });
        }
        Ok(Codec {
            write_version: version,
        })
    }

    /// Encodes a value into canonical bytes under the schema envelope.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let body =
            serde_json::to_value(value).map_err(|e| CodecError::Malformed(e.to_string()))?;
        let document = serde_json::json!({
            "v": self.write_version,
            "body": body,
        });
        canonical_bytes(&document)
    }

    /// Decodes canonical bytes, checking the schema envelope and the body
    /// shape.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let document: Value =
            serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;
        let object = document
            .as_object()
            .ok_or_else(|| CodecError::Malformed("document is not a JSON object".into()))?;

        let version = object
            .get("v")
            .and_then(Value::as_u64)
            .ok_or_else(|| CodecError::Malformed("missing or non-integer `v` field".into()))?;
        if version < MIN_SUPPORTED_VERSION as u64 || version > SCHEMA_VERSION as u64 {
            return Err(CodecError::UnsupportedSchema {
                version,
                min: MIN_SUPPORTED_VERSION,
                max: SCHEMA_VERSION,
            });
        }

        let body = object
            .get("body")
            .ok_or_else(|| CodecError::Malformed("missing `body` field".into()))?;
        if object.len() != 2 {
            return Err(CodecError::Malformed(
                "unexpected fields beside `v` and `body`".into(),
            ));
        }

        serde_json::from_value(body.clone()).map_err(|e| CodecError::Malformed(e.to_string()))
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders a JSON value in canonical form: object keys sorted at every
/// nesting level, no insignificant whitespace.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, CodecError> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out.into_bytes())
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), CodecError> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, entry)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(
                    &serde_json::to_string(key).map_err(|e| CodecError::Malformed(e.to_string()))?,
                );
                out.push(':');
                write_canonical(entry, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => {
            out.push_str(
                &serde_json::to_string(scalar).map_err(|e| CodecError::Malformed(e.to_string()))?,
            );
        }
    }
    Ok(())
}
