//! Shared value types.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// A unit of application data moving through the platform: message bodies,
/// output states, flow parameters and flow results.
///
/// Payloads are JSON documents. Typed access goes through [`Payload::parse`]
/// and construction from typed values through [`Payload::from_serialize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload(Value);

impl Payload {
    /// Wraps a JSON value.
    pub fn new(value: Value) -> Self {
        Payload(value)
    }

    /// The null payload, used by control frames and parameterless flows.
    pub fn null() -> Self {
        Payload(Value::Null)
    }

    /// True when the payload is JSON null.
    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    /// Serializes a typed value into a payload.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, CoreError> {
        Ok(Payload(serde_json::to_value(value)?))
    }

    /// Deserializes the payload into a typed value.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, CoreError> {
        Ok(serde_json::from_value(self.0.clone())?)
    }

    /// Borrows the underlying JSON value.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Consumes the payload, returning the underlying JSON value.
    pub fn into_value(self) -> Value {
        self.0
    }

    /// Borrows the payload as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }

    /// Reads the payload as an integer, if it is one.
    pub fn as_i64(&self) -> Option<i64> {
        self.0.as_i64()
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::null()
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload(value)
    }
}
