//! Array metadata: `{id, primary_attributes, custom_attributes}`.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use num_complex::Complex64;
use regex::Regex;
use serde_json::{Map, Value};

use crate::dtype::DType;
use crate::error::{Error, Result};

/// A single attribute value, typed according to its schema's declared dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// An integer-typed attribute value.
    Int(i64),
    /// A float-typed attribute value.
    Float(f64),
    /// A complex-typed attribute value, serialized as `"(re+imj)"`.
    Complex(Complex64),
    /// A string-typed attribute value.
    Str(String),
    /// A datetime attribute value, always carried and serialized in UTC.
    DateTime(DateTime<Utc>),
    /// A tuple attribute value, serialized as a nested JSON array.
    Tuple(Vec<AttributeValue>),
}

impl AttributeValue {
    /// Serialize to the JSON representation used in persisted metadata.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => Value::from(*f),
            Self::Complex(c) => Value::String(format_complex(*c)),
            Self::Str(s) => Value::String(s.clone()),
            Self::DateTime(dt) => Value::String(dt.to_rfc3339()),
            Self::Tuple(items) => Value::Array(items.iter().map(Self::to_json).collect()),
        }
    }

    /// Deserialize a JSON value into a typed attribute, using `dtype` to
    /// disambiguate (e.g. a JSON string that is a datetime vs. a plain
    /// string, or a tuple element typed as string vs. a complex number).
    ///
    /// # Errors
    /// Returns [`Error::MetaData`] if `value`'s JSON shape does not match
    /// what `dtype` expects.
    pub fn from_json(value: &Value, dtype: DType) -> Result<Self> {
        match dtype {
            DType::I8 | DType::I16 | DType::I32 | DType::I64 => value
                .as_i64()
                .map(Self::Int)
                .ok_or_else(|| Error::MetaData(format!("expected integer, found {value}"))),
            DType::F16 | DType::F32 | DType::F64 => value
                .as_f64()
                .map(Self::Float)
                .ok_or_else(|| Error::MetaData(format!("expected float, found {value}"))),
            DType::C64 | DType::C128 | DType::C256 => {
                let s = value
                    .as_str()
                    .ok_or_else(|| Error::MetaData(format!("expected complex string, found {value}")))?;
                parse_complex(s)
                    .map(Self::Complex)
                    .ok_or_else(|| Error::MetaData(format!("malformed complex literal: {s}")))
            }
            DType::Str => {
                let s = value
                    .as_str()
                    .ok_or_else(|| Error::MetaData(format!("expected string, found {value}")))?;
                // A string-typed tuple element may still encode a complex
                // literal; detect it via regex rather than trusting dtype alone,
                // mirroring the source codec's fallback detection.
                if let Some(c) = detect_complex(s) {
                    Ok(Self::Complex(c))
                } else {
                    Ok(Self::Str(s.to_string()))
                }
            }
            DType::DateTime => {
                let s = value
                    .as_str()
                    .ok_or_else(|| Error::MetaData(format!("expected RFC-3339 string, found {value}")))?;
                DateTime::parse_from_rfc3339(s)
                    .map(|dt| Self::DateTime(dt.with_timezone(&Utc)))
                    .map_err(|e| Error::MetaData(format!("invalid datetime {s}: {e}")))
            }
            DType::Tuple => {
                let arr = value
                    .as_array()
                    .ok_or_else(|| Error::MetaData(format!("expected tuple array, found {value}")))?;
                let items = arr
                    .iter()
                    .map(|v| Self::from_json(v, infer_scalar_dtype(v)))
                    .collect::<Result<_>>()?;
                Ok(Self::Tuple(items))
            }
        }
    }
}

fn infer_scalar_dtype(value: &Value) -> DType {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => DType::I64,
        Value::Number(_) => DType::F64,
        Value::String(_) => DType::Str,
        _ => DType::Str,
    }
}

fn format_complex(c: Complex64) -> String {
    if c.im >= 0.0 {
        format!("({}+{}j)", c.re, c.im)
    } else {
        format!("({}{}j)", c.re, c.im)
    }
}

fn complex_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\(([+-]?[0-9.eE+-]+)([+-][0-9.eE]+)j\)$").expect("static regex is valid")
    })
}

/// Parse a `"(re+imj)"`-style literal, returning `None` if it does not match.
#[must_use]
pub fn detect_complex(s: &str) -> Option<Complex64> {
    parse_complex(s)
}

fn parse_complex(s: &str) -> Option<Complex64> {
    let caps = complex_regex().captures(s)?;
    let re: f64 = caps.get(1)?.as_str().parse().ok()?;
    let im: f64 = caps.get(2)?.as_str().parse().ok()?;
    Some(Complex64::new(re, im))
}

/// An ordered map of attribute name to value; insertion order is preserved
/// (relying on `serde_json`'s `preserve_order` feature) because primary
/// attribute order is schema-defined and participates in path construction.
pub type AttributeMap = Vec<(String, AttributeValue)>;

/// The metadata persisted alongside (or embedded in) an Array/VArray payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayMetadata {
    /// The array's stable id.
    pub id: String,
    /// Ordered primary attributes (insertion order per schema).
    pub primary_attributes: AttributeMap,
    /// Unordered custom attributes.
    pub custom_attributes: AttributeMap,
}

impl ArrayMetadata {
    /// Serialize to the JSON object form described in §6.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".to_string(), Value::String(self.id.clone()));
        obj.insert(
            "primary_attributes".to_string(),
            attrs_to_json(&self.primary_attributes),
        );
        obj.insert(
            "custom_attributes".to_string(),
            attrs_to_json(&self.custom_attributes),
        );
        Value::Object(obj)
    }

    /// Deserialize from JSON bytes, given the dtype of each named attribute.
    ///
    /// # Errors
    /// Returns [`Error::MetaData`] if the bytes are not valid JSON, the
    /// expected keys are missing, or an attribute value's shape mismatches
    /// its `dtype_lookup` entry.
    pub fn from_slice(bytes: &[u8], dtype_lookup: impl Fn(&str) -> Option<DType>) -> Result<Self> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| Error::MetaData(format!("invalid JSON: {e}")))?;
        let obj = value
            .as_object()
            .ok_or_else(|| Error::MetaData("array metadata must be a JSON object".into()))?;
        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MetaData("array metadata missing \"id\"".into()))?
            .to_string();
        let primary_attributes = attrs_from_json(obj.get("primary_attributes"), &dtype_lookup)?;
        let custom_attributes = attrs_from_json(obj.get("custom_attributes"), &dtype_lookup)?;
        Ok(Self {
            id,
            primary_attributes,
            custom_attributes,
        })
    }
}

fn attrs_to_json(attrs: &AttributeMap) -> Value {
    let mut obj = Map::new();
    for (name, value) in attrs {
        obj.insert(name.clone(), value.to_json());
    }
    Value::Object(obj)
}

fn attrs_from_json(
    value: Option<&Value>,
    dtype_lookup: &impl Fn(&str) -> Option<DType>,
) -> Result<AttributeMap> {
    let Some(Value::Object(obj)) = value else {
        return Ok(Vec::new());
    };
    obj.iter()
        .map(|(name, v)| {
            let dtype = dtype_lookup(name).unwrap_or(DType::Str);
            AttributeValue::from_json(v, dtype).map(|av| (name.clone(), av))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_complex_literal() {
        let c = Complex64::new(1.5, -2.0);
        let s = format_complex(c);
        assert_eq!(parse_complex(&s), Some(c));
    }

    #[test]
    fn round_trips_array_metadata() {
        let meta = ArrayMetadata {
            id: "abc-123".into(),
            primary_attributes: vec![("x".into(), AttributeValue::Int(3))],
            custom_attributes: vec![("note".into(), AttributeValue::Str("hi".into()))],
        };
        let json = meta.to_json();
        let bytes = serde_json::to_vec(&json).unwrap();
        let lookup = |name: &str| match name {
            "x" => Some(DType::I64),
            "note" => Some(DType::Str),
            _ => None,
        };
        let decoded = ArrayMetadata::from_slice(&bytes, lookup).unwrap();
        assert_eq!(decoded, meta);
    }
}
