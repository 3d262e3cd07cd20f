//! Collection metadata: name, type, storage adapter, schema, with
//! forward-compatible version handling.

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Map, Value};

use crate::config::CURRENT_METADATA_VERSION;
use crate::dtype::{DType, FillValue};
use crate::error::{Error, Result};
use crate::schema::dimension::{Labels, Scale, TimeStart};
use crate::schema::{ArraySchema, AttributeSchema, DimensionSchema, VArraySchema};

/// Whether a Collection's schema describes plain Arrays or VArrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionType {
    /// The collection holds plain Arrays.
    Array,
    /// The collection holds VArrays (tiled into Array tiles on write).
    VArray,
}

impl CollectionType {
    fn as_tag(self) -> &'static str {
        match self {
            Self::Array => "array",
            Self::VArray => "varray",
        }
    }
}

/// A Collection's persisted metadata record.
#[derive(Debug, Clone)]
pub struct CollectionMetadata {
    /// The collection's unique name.
    pub name: String,
    /// Whether this is an array- or varray-typed collection.
    pub collection_type: CollectionType,
    /// The storage adapter tag (driver name) this collection was created with.
    pub storage_adapter: String,
    /// Opaque chunking/compression options, serialized verbatim.
    pub options: Option<Value>,
    /// The on-disk metadata schema version.
    pub metadata_version: String,
    /// The array schema (for array collections), or the underlying
    /// (untiled) array schema of the VArray (for varray collections) --
    /// callers needing the full [`VArraySchema`] should use
    /// [`CollectionMetadata::varray_schema`], and callers needing a VArray
    /// tile's own schema should use [`VArraySchema::tile_schema`].
    pub array_schema: ArraySchema,
    /// Present only for varray-typed collections.
    pub varray_vgrid: Option<Vec<u64>>,
}

impl CollectionMetadata {
    /// Serialize to the JSON object form described in §6.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("name".to_string(), Value::String(self.name.clone()));
        obj.insert(
            "type".to_string(),
            Value::String(self.collection_type.as_tag().to_string()),
        );
        obj.insert(
            "storage_adapter".to_string(),
            Value::String(self.storage_adapter.clone()),
        );
        obj.insert(
            "metadata_version".to_string(),
            Value::String(self.metadata_version.clone()),
        );
        obj.insert("options".to_string(), self.options.clone().unwrap_or(Value::Null));

        let mut schema = Map::new();
        schema.insert(
            "dtype".to_string(),
            Value::String(self.array_schema.dtype().tag().to_string()),
        );
        schema.insert(
            "fill_value".to_string(),
            Value::String(crate::path::fill_value_to_string(self.array_schema.fill_value())),
        );
        schema.insert(
            "attributes".to_string(),
            Value::Array(
                self.array_schema
                    .attributes()
                    .iter()
                    .map(attribute_to_json)
                    .collect(),
            ),
        );
        schema.insert(
            "dimensions".to_string(),
            Value::Array(
                self.array_schema
                    .dimensions()
                    .iter()
                    .map(dimension_to_json)
                    .collect(),
            ),
        );
        if let Some(vgrid) = &self.varray_vgrid {
            schema.insert(
                "vgrid".to_string(),
                Value::Array(vgrid.iter().map(|v| Value::from(*v)).collect()),
            );
        }
        obj.insert("schema".to_string(), Value::Object(schema));
        Value::Object(obj)
    }

    /// Deserialize from JSON bytes.
    ///
    /// Forward-compatibility rule per §4.4: `labels`, `scale`, `fill_value`,
    /// `attributes`, and `options` default to null/empty when absent; a
    /// missing `metadata_version` defaults to `"0.0.0"` (pre-versioned); a
    /// version strictly greater than [`CURRENT_METADATA_VERSION`] is rejected.
    ///
    /// # Errors
    /// Returns [`Error::MetaData`] if the bytes are not valid JSON, required
    /// keys (`name`, `type`, `schema.dtype`, `schema.dimensions`) are
    /// missing, or the on-disk `metadata_version` exceeds the engine's.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| Error::MetaData(format!("invalid JSON: {e}")))?;
        let obj = value
            .as_object()
            .ok_or_else(|| Error::MetaData("collection metadata must be a JSON object".into()))?;

        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MetaData("collection metadata missing \"name\"".into()))?
            .to_string();

        let collection_type = match obj.get("type").and_then(Value::as_str) {
            Some("varray") => CollectionType::VArray,
            Some("array") | None => CollectionType::Array,
            Some(other) => return Err(Error::MetaData(format!("unknown collection type: {other}"))),
        };

        let storage_adapter = obj
            .get("storage_adapter")
            .and_then(Value::as_str)
            .unwrap_or("filesystem")
            .to_string();

        let metadata_version = obj
            .get("metadata_version")
            .and_then(Value::as_str)
            .unwrap_or("0.0.0")
            .to_string();
        if version_tuple(&metadata_version)? > version_tuple(CURRENT_METADATA_VERSION)? {
            return Err(Error::MetaData(format!(
                "collection metadata version {metadata_version} exceeds engine version {CURRENT_METADATA_VERSION}"
            )));
        }

        let options = obj.get("options").cloned().filter(|v| !v.is_null());

        let schema = obj
            .get("schema")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::MetaData("collection metadata missing \"schema\"".into()))?;

        let dtype_tag = schema
            .get("dtype")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MetaData("schema missing \"dtype\"".into()))?;
        let dtype = DType::normalize(dtype_tag)?;

        let fill_value = schema
            .get("fill_value")
            .and_then(Value::as_str)
            .map(|s| parse_fill_value(s, dtype))
            .transpose()?;

        let attributes = schema
            .get("attributes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
            .iter()
            .map(attribute_from_json)
            .collect::<Result<Vec<_>>>()?;

        let dimensions_json = schema
            .get("dimensions")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::MetaData("schema missing \"dimensions\"".into()))?;
        let dimensions = dimensions_json
            .iter()
            .map(dimension_from_json)
            .collect::<Result<Vec<_>>>()?;

        let varray_vgrid = schema
            .get("vgrid")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .map(|v| v.as_u64().ok_or_else(|| Error::MetaData("vgrid entry not an integer".into())))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;

        let array_schema = ArraySchema::new(dtype, fill_value, dimensions, attributes)
            .map_err(|e| Error::MetaData(format!("invalid persisted schema: {e}")))?;

        Ok(Self {
            name,
            collection_type,
            storage_adapter,
            options,
            metadata_version,
            array_schema,
            varray_vgrid,
        })
    }

    /// Reconstruct the full [`VArraySchema`] for a varray-typed collection.
    ///
    /// # Errors
    /// Returns [`Error::MetaData`] if this is not a varray-typed collection
    /// or `varray_vgrid` is absent.
    pub fn varray_schema(&self) -> Result<VArraySchema> {
        let vgrid = self
            .varray_vgrid
            .clone()
            .ok_or_else(|| Error::MetaData("collection is not varray-typed".into()))?;
        VArraySchema::new(
            self.array_schema.dtype(),
            Some(self.array_schema.fill_value()),
            self.array_schema.dimensions().to_vec(),
            self.array_schema.attributes().to_vec(),
            vgrid,
        )
        .map_err(|e| Error::MetaData(format!("invalid persisted varray schema: {e}")))
    }
}

fn version_tuple(v: &str) -> Result<(u32, u32, u32)> {
    let mut parts = v.split('.');
    let mut next = || -> Result<u32> {
        parts
            .next()
            .unwrap_or("0")
            .parse()
            .map_err(|_| Error::MetaData(format!("malformed metadata version: {v}")))
    };
    Ok((next()?, next()?, next()?))
}

fn parse_fill_value(s: &str, dtype: DType) -> Result<FillValue> {
    if dtype.is_numeric() {
        if let Ok(i) = s.parse::<i64>() {
            return Ok(FillValue::Int(i));
        }
        if let Ok(f) = s.parse::<f64>() {
            return Ok(FillValue::Float(f));
        }
        if s == "nan" || s == "NaN" {
            return Ok(FillValue::Float(f64::NAN));
        }
    }
    Err(Error::MetaData(format!("malformed fill value: {s}")))
}

fn attribute_to_json(attr: &AttributeSchema) -> Value {
    let mut obj = Map::new();
    obj.insert("name".to_string(), Value::String(attr.name().to_string()));
    obj.insert("dtype".to_string(), Value::String(attr.dtype().tag().to_string()));
    obj.insert("primary".to_string(), Value::Bool(attr.is_primary()));
    Value::Object(obj)
}

fn attribute_from_json(value: &Value) -> Result<AttributeSchema> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::MetaData("attribute schema must be an object".into()))?;
    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MetaData("attribute schema missing \"name\"".into()))?;
    let dtype = obj
        .get("dtype")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MetaData("attribute schema missing \"dtype\"".into()))?;
    let primary = obj.get("primary").and_then(Value::as_bool).unwrap_or(false);
    AttributeSchema::new(name, DType::normalize(dtype)?, primary)
}

fn dimension_to_json(dim: &DimensionSchema) -> Value {
    let mut obj = Map::new();
    match dim {
        DimensionSchema::Generic {
            name,
            size,
            labels,
            scale,
        } => {
            obj.insert("type".to_string(), Value::String("generic".to_string()));
            obj.insert("name".to_string(), Value::String(name.clone()));
            obj.insert("size".to_string(), Value::from(*size));
            obj.insert(
                "labels".to_string(),
                match labels {
                    None => Value::Null,
                    Some(Labels::Strings(v)) => {
                        Value::Array(v.iter().map(|s| Value::String(s.clone())).collect())
                    }
                    Some(Labels::Floats(v)) => Value::Array(v.iter().map(|f| Value::from(*f)).collect()),
                },
            );
            obj.insert(
                "scale".to_string(),
                match scale {
                    None => Value::Null,
                    Some(scale) => serde_json::to_value(scale).unwrap_or(Value::Null),
                },
            );
        }
        DimensionSchema::Time {
            name,
            size,
            step,
            start_value,
        } => {
            obj.insert("type".to_string(), Value::String("time".to_string()));
            obj.insert("name".to_string(), Value::String(name.clone()));
            obj.insert("size".to_string(), Value::from(*size));
            obj.insert(
                "step".to_string(),
                Value::from(step.num_microseconds().unwrap_or(0)),
            );
            obj.insert(
                "start_value".to_string(),
                match start_value {
                    TimeStart::Explicit(dt) => Value::String(dt.to_rfc3339()),
                    TimeStart::Ref(name) => Value::String(format!("${name}")),
                },
            );
        }
    }
    Value::Object(obj)
}

fn dimension_from_json(value: &Value) -> Result<DimensionSchema> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::MetaData("dimension schema must be an object".into()))?;
    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MetaData("dimension schema missing \"name\"".into()))?;
    let size = obj
        .get("size")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::MetaData("dimension schema missing \"size\"".into()))?;

    match obj.get("type").and_then(Value::as_str) {
        Some("time") => {
            let step_us = obj.get("step").and_then(Value::as_i64).unwrap_or(0);
            let step = TimeDelta::microseconds(step_us);
            let start_value = obj
                .get("start_value")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::MetaData("time dimension missing \"start_value\"".into()))?;
            let start_value = if let Some(ref_name) = start_value.strip_prefix('$') {
                TimeStart::Ref(ref_name.to_string())
            } else {
                let dt: DateTime<Utc> = DateTime::parse_from_rfc3339(start_value)
                    .map_err(|e| Error::MetaData(format!("invalid start_value: {e}")))?
                    .with_timezone(&Utc);
                TimeStart::Explicit(dt)
            };
            DimensionSchema::time(name, size, step, start_value)
        }
        _ => {
            // Forward-compatible: a missing "labels"/"scale" defaults to None (§4.4).
            let labels = match obj.get("labels") {
                None | Some(Value::Null) => None,
                Some(Value::Array(arr)) if arr.iter().all(Value::is_string) => Some(Labels::Strings(
                    arr.iter().map(|v| v.as_str().unwrap().to_string()).collect(),
                )),
                Some(Value::Array(arr)) => Some(Labels::Floats(
                    arr.iter()
                        .map(|v| v.as_f64().ok_or_else(|| Error::MetaData("invalid label".into())))
                        .collect::<Result<_>>()?,
                )),
                Some(_) => return Err(Error::MetaData("invalid \"labels\"".into())),
            };
            let scale = match obj.get("scale") {
                None | Some(Value::Null) => None,
                Some(v) => Some(
                    serde_json::from_value::<Scale>(v.clone())
                        .map_err(|e| Error::MetaData(format!("invalid scale: {e}")))?,
                ),
            };
            DimensionSchema::generic(name, size, labels, scale)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_compat_defaults_missing_fields() {
        let json = serde_json::json!({
            "name": "weather",
            "schema": {
                "dtype": "float",
                "dimensions": [{"type": "generic", "name": "x", "size": 4}]
            }
        });
        let bytes = serde_json::to_vec(&json).unwrap();
        let meta = CollectionMetadata::from_slice(&bytes).unwrap();
        assert_eq!(meta.metadata_version, "0.0.0");
        assert!(meta.options.is_none());
        assert_eq!(meta.collection_type, CollectionType::Array);
    }

    #[test]
    fn rejects_future_version() {
        let json = serde_json::json!({
            "name": "weather",
            "metadata_version": "99.0.0",
            "schema": {
                "dtype": "float",
                "dimensions": [{"type": "generic", "name": "x", "size": 4}]
            }
        });
        let bytes = serde_json::to_vec(&json).unwrap();
        assert!(CollectionMetadata::from_slice(&bytes).is_err());
    }
}
