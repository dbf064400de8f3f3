//! Dynamic values held by the cache
//!
//! Getters return loosely typed data, so the cache stores a small dynamic
//! value model rather than a generic `T`. Every variant has a dedicated
//! [`TypeTag`] so string-based backends can restore it exactly.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// A value stored in the cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    String(String),
    /// IEEE-754 number; NaN and negative zero are legal payloads
    Number(#[serde(with = "number_text")] f64),
    Boolean(bool),
    Date(DateTime<Utc>),
    Undefined,
    Null,
    /// Regular expression source pattern, flags are not kept
    RegExp(String),
    /// Source text of a function; restoring it yields the text, not a closure
    Function(String),
    /// Structured object or array data
    Json(serde_json::Value),
    /// A host value with no textual representation
    Opaque,
}

impl Value {
    /// A NaN number
    pub fn nan() -> Self {
        Value::Number(f64::NAN)
    }

    /// Date from a millisecond epoch timestamp
    pub fn date_millis(millis: i64) -> Option<Self> {
        Utc.timestamp_millis_opt(millis).single().map(Value::Date)
    }

    /// True for `Null` and `Undefined`
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Null | Value::Undefined)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Observational equality
    ///
    /// NaN equals NaN, `0` and `-0` are distinct, dates compare at
    /// millisecond precision.
    pub fn same_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => {
                if a.is_nan() && b.is_nan() {
                    true
                } else {
                    a == b && a.is_sign_negative() == b.is_sign_negative()
                }
            }
            (Value::Date(a), Value::Date(b)) => a.timestamp_millis() == b.timestamp_millis(),
            (Value::String(a), Value::String(b))
            | (Value::RegExp(a), Value::RegExp(b))
            | (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            (Value::Undefined, Value::Undefined)
            | (Value::Null, Value::Null)
            | (Value::Opaque, Value::Opaque) => true,
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.same_value(other)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Value::Date(d)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Number(n) => n.as_f64().map_or(Value::nan(), Value::Number),
            other => Value::Json(other),
        }
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Structured storage for numbers JSON cannot express (NaN, infinities, `-0`)
mod number_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(n: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if n.is_finite() && !(*n == 0.0 && n.is_sign_negative()) {
            serializer.serialize_f64(*n)
        } else {
            serializer.serialize_str(&crate::codec::number_to_text(*n))
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Num(n) => Ok(n),
            Repr::Text(text) => crate::codec::text_to_number(&text)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid number: {text}"))),
        }
    }
}

/// Type tag stored next to an encoded payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeTag {
    String,
    Number,
    Boolean,
    Date,
    Undefined,
    Null,
    Nan,
    RegExp,
    Function,
    Json,
}

impl TypeTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeTag::String => "string",
            TypeTag::Number => "number",
            TypeTag::Boolean => "boolean",
            TypeTag::Date => "date",
            TypeTag::Undefined => "undefined",
            TypeTag::Null => "null",
            TypeTag::Nan => "nan",
            TypeTag::RegExp => "regexp",
            TypeTag::Function => "function",
            TypeTag::Json => "json",
        }
    }
}

impl FromStr for TypeTag {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = match s {
            "string" => TypeTag::String,
            "number" => TypeTag::Number,
            "boolean" => TypeTag::Boolean,
            "date" => TypeTag::Date,
            "undefined" => TypeTag::Undefined,
            "null" => TypeTag::Null,
            "nan" => TypeTag::Nan,
            "regexp" => TypeTag::RegExp,
            "function" => TypeTag::Function,
            "json" => TypeTag::Json,
            other => {
                return Err(CacheError::deserialization(format!("unknown type tag: {other}")))
            }
        };
        Ok(tag)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_value_nan_and_negative_zero() {
        assert!(Value::nan().same_value(&Value::nan()));
        assert!(!Value::Number(0.0).same_value(&Value::Number(-0.0)));
        assert!(Value::Number(-0.0).same_value(&Value::Number(-0.0)));
    }

    #[test]
    fn test_from_json_scalars() {
        assert_eq!(Value::from(serde_json::json!(null)), Value::Null);
        assert_eq!(Value::from(serde_json::json!("a")), Value::from("a"));
        assert_eq!(Value::from(serde_json::json!(2)), Value::from(2));
        assert_eq!(
            Value::from(serde_json::json!([1, 2])),
            Value::Json(serde_json::json!([1, 2]))
        );
    }

    #[test]
    fn test_type_tag_parses_its_own_name() {
        for tag in [TypeTag::RegExp, TypeTag::Nan, TypeTag::Json, TypeTag::Undefined] {
            assert_eq!(tag.as_str().parse::<TypeTag>().unwrap(), tag);
        }
        assert!("symbol".parse::<TypeTag>().is_err());
    }

    #[test]
    fn test_is_nil() {
        assert!(Value::Null.is_nil());
        assert!(Value::Undefined.is_nil());
        assert!(!Value::from("").is_nil());
        assert!(!Value::Boolean(false).is_nil());
    }
}
