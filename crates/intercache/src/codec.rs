//! String codec for cached values
//!
//! Turns a [`Value`] into a `(payload, tag)` pair that string-only storage
//! (web storage areas, cookies) can hold, and back again.

use std::fmt;
use std::sync::Arc;

use crate::error::{CacheError, Result};
use crate::value::{TypeTag, Value};

/// Payload written for values that have no textual form
pub const OPAQUE_PLACEHOLDER: &str = "$";

/// Serializer used for `Value::Json` payloads
pub type JsonSerializer = Arc<dyn Fn(&serde_json::Value) -> String + Send + Sync>;

/// An encoded value and the tag needed to restore it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedEntry {
    pub payload: String,
    pub tag: TypeTag,
}

impl EncodedEntry {
    fn new(payload: impl Into<String>, tag: TypeTag) -> Self {
        Self {
            payload: payload.into(),
            tag,
        }
    }
}

/// Value codec with a pluggable JSON serializer
#[derive(Clone)]
pub struct Codec {
    serializer: JsonSerializer,
}

impl Codec {
    pub fn new() -> Self {
        Self {
            serializer: Arc::new(|v: &serde_json::Value| v.to_string()),
        }
    }

    /// Use a custom serializer for structured values
    ///
    /// The output must still be parseable as JSON, decoding always parses.
    pub fn with_serializer(serializer: JsonSerializer) -> Self {
        Self { serializer }
    }

    /// Encode a value into its payload and tag
    pub fn encode(&self, value: &Value) -> EncodedEntry {
        match value {
            Value::String(s) => EncodedEntry::new(s.clone(), TypeTag::String),
            Value::Date(d) => EncodedEntry::new(d.timestamp_millis().to_string(), TypeTag::Date),
            Value::Number(n) if n.is_nan() => EncodedEntry::new("", TypeTag::Nan),
            Value::Number(n) => EncodedEntry::new(number_to_text(*n), TypeTag::Number),
            Value::Boolean(b) => EncodedEntry::new(b.to_string(), TypeTag::Boolean),
            Value::Undefined => EncodedEntry::new("", TypeTag::Undefined),
            Value::Null => EncodedEntry::new("", TypeTag::Null),
            Value::RegExp(source) => EncodedEntry::new(source.clone(), TypeTag::RegExp),
            Value::Function(source) => EncodedEntry::new(source.clone(), TypeTag::Function),
            Value::Json(json) => EncodedEntry::new((self.serializer)(json), TypeTag::Json),
            Value::Opaque => EncodedEntry::new(OPAQUE_PLACEHOLDER, TypeTag::String),
        }
    }

    /// Decode a payload according to its tag
    ///
    /// Fails with [`CacheError::Deserialization`] when the payload does not
    /// parse as the tagged type.
    pub fn decode(&self, payload: &str, tag: TypeTag) -> Result<Value> {
        let value = match tag {
            TypeTag::String => Value::String(payload.to_string()),
            TypeTag::Date => {
                let millis: i64 = payload.trim().parse().map_err(|_| {
                    CacheError::deserialization(format!("invalid date payload: {payload}"))
                })?;
                Value::date_millis(millis).ok_or_else(|| {
                    CacheError::deserialization(format!("date out of range: {millis}"))
                })?
            }
            TypeTag::Number => Value::Number(text_to_number(payload).ok_or_else(|| {
                CacheError::deserialization(format!("invalid number payload: {payload}"))
            })?),
            TypeTag::Boolean => Value::Boolean(payload == "true"),
            TypeTag::Undefined => Value::Undefined,
            TypeTag::Null => Value::Null,
            TypeTag::Nan => Value::nan(),
            TypeTag::RegExp => Value::RegExp(payload.to_string()),
            TypeTag::Function => Value::Function(payload.to_string()),
            TypeTag::Json => {
                let json: serde_json::Value = serde_json::from_str(payload)
                    .map_err(|e| CacheError::deserialization(e.to_string()))?;
                Value::Json(json)
            }
        };
        Ok(value)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec").finish_non_exhaustive()
    }
}

/// Text form of a number; keeps `-0` and spells infinities out
pub(crate) fn number_to_text(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        let text = if n > 0.0 { "Infinity" } else { "-Infinity" };
        text.to_string()
    } else {
        n.to_string()
    }
}

pub(crate) fn text_to_number(text: &str) -> Option<f64> {
    match text.trim() {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}
