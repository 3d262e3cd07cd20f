//! Array Engine (C7): lifecycle and operations on single Arrays and
//! Subsets.
//!
//! An [`Array`] is a small cheaply-clonable handle, not an owning pointer
//! into its Collection: per §9's "cyclic object graphs" design note, it
//! holds a shared [`ClientContext`] (config, adapter registry, pool) and
//! the bits of its Collection it actually needs (schema, data/symlink
//! directories), rather than a back-reference to the Collection itself.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::client::ClientContext;
use crate::config::check_memory;
use crate::dtype::{Buffer, DType, FillValue};
use crate::error::{Error, Result};
use crate::indexing::{self, AxisIndex, IndexLike};
use crate::lock::{CreateArrayGuard, ReadArrayGuard, UpdateMetaGuard, WriteArrayGuard};
use crate::metadata::{ArrayMetadata, AttributeMap, AttributeValue};
use crate::path::{self, AttributeValue as PathAttributeValue};
use crate::schema::ArraySchema;
use crate::storage_adapter::StorageAdapter;

/// Generate a stable id per §3: a UUIDv5 over a fixed namespace and
/// `"array"`/`"varray"` plus a nanosecond timestamp, salted with a random
/// UUID so that two calls within the same clock tick never collide.
#[must_use]
pub(crate) fn generate_id(kind: &str) -> String {
    let now = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
    let salt = Uuid::new_v4();
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{kind}:{now}:{salt}").as_bytes()).to_string()
}

pub(crate) fn check_value_dtype(name: &str, dtype: DType, value: &AttributeValue) -> Result<()> {
    let ok = matches!(
        (dtype, value),
        (DType::I8 | DType::I16 | DType::I32 | DType::I64, AttributeValue::Int(_))
            | (DType::F16 | DType::F32 | DType::F64, AttributeValue::Float(_))
            | (DType::C64 | DType::C128 | DType::C256, AttributeValue::Complex(_))
            | (DType::Str, AttributeValue::Str(_))
            | (DType::DateTime, AttributeValue::DateTime(_))
            | (DType::Tuple, AttributeValue::Tuple(_))
    );
    if ok {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "attribute {name} expects dtype {dtype:?}, found {value:?}"
        )))
    }
}

/// Validate that `primary` supplies exactly the schema's declared primary
/// attributes, each with a value matching its declared dtype.
///
/// # Errors
/// Returns [`Error::Validation`] on a missing, extra, or mistyped attribute.
pub(crate) fn validate_primary_attributes(schema: &ArraySchema, primary: &AttributeMap) -> Result<()> {
    let declared = schema.primary_attributes();
    if declared.len() != primary.len() {
        return Err(Error::Validation(format!(
            "expected {} primary attributes, found {}",
            declared.len(),
            primary.len()
        )));
    }
    for attr in declared {
        let Some((_, value)) = primary.iter().find(|(n, _)| n == attr.name()) else {
            return Err(Error::Validation(format!("missing primary attribute {}", attr.name())));
        };
        check_value_dtype(attr.name(), attr.dtype(), value)?;
    }
    Ok(())
}

/// Validate that every entry of `custom` names a declared, non-primary
/// attribute with a value matching its declared dtype.
///
/// # Errors
/// Returns [`Error::Validation`] on an unknown, primary, or mistyped attribute.
pub(crate) fn validate_custom_attributes(schema: &ArraySchema, custom: &AttributeMap) -> Result<()> {
    for (name, value) in custom {
        let attr = schema
            .attributes()
            .iter()
            .find(|a| a.name() == name)
            .ok_or_else(|| Error::Validation(format!("unknown custom attribute {name}")))?;
        if attr.is_primary() {
            return Err(Error::Validation(format!(
                "{name} is a primary attribute and cannot be supplied as custom"
            )));
        }
        check_value_dtype(name, attr.dtype(), value)?;
    }
    Ok(())
}

fn dtype_lookup(schema: &ArraySchema, name: &str) -> Option<DType> {
    schema.attributes().iter().find(|a| a.name() == name).map(|a| a.dtype())
}

pub(crate) fn ordered_primary_values(schema: &ArraySchema, primary: &AttributeMap) -> Vec<PathAttributeValue> {
    schema
        .primary_attributes()
        .iter()
        .filter_map(|attr| primary.iter().find(|(n, _)| n == attr.name()))
        .map(|(_, value)| to_path_value(value))
        .collect()
}

fn to_path_value(value: &AttributeValue) -> PathAttributeValue {
    match value {
        AttributeValue::Int(i) => PathAttributeValue::Int(*i),
        AttributeValue::Float(f) => PathAttributeValue::Float(*f),
        AttributeValue::Str(s) => PathAttributeValue::Str(s.clone()),
        AttributeValue::DateTime(dt) => PathAttributeValue::DateTime(*dt),
        AttributeValue::Complex(c) => PathAttributeValue::Str(format!("({}+{}j)", c.re, c.im)),
        AttributeValue::Tuple(items) => PathAttributeValue::Tuple(items.iter().map(scalar_string).collect()),
    }
}

fn scalar_string(value: &AttributeValue) -> String {
    match value {
        AttributeValue::Int(i) => i.to_string(),
        AttributeValue::Float(f) => f.to_string(),
        AttributeValue::Str(s) => s.clone(),
        AttributeValue::DateTime(dt) => dt.to_rfc3339(),
        AttributeValue::Complex(c) => format!("({}+{}j)", c.re, c.im),
        AttributeValue::Tuple(items) => items.iter().map(scalar_string).collect::<Vec<_>>().join("-"),
    }
}

/// The directories a single Array (or VArray tile) entity is rooted at
/// within its owning Collection: the main payload tree and the attribute
/// symlink index tree.
#[derive(Debug, Clone)]
pub(crate) struct ArrayLocation {
    pub collection_root: PathBuf,
    pub data_dir: PathBuf,
    pub symlinks_dir: PathBuf,
}

/// A handle to a single N-dimensional typed payload, identified by a
/// stable id (§3).
#[derive(Debug, Clone)]
pub struct Array {
    pub(crate) ctx: Arc<ClientContext>,
    pub(crate) adapter: Arc<dyn StorageAdapter>,
    pub(crate) collection: String,
    pub(crate) schema: ArraySchema,
    pub(crate) location: ArrayLocation,
    pub(crate) id: String,
    pub(crate) primary_attributes: AttributeMap,
    pub(crate) custom_attributes: AttributeMap,
    pub(crate) deleted: Arc<AtomicBool>,
}

impl Array {
    /// Create a new Array under `location`, validating `primary`/`custom`
    /// against `schema`, assigning a fresh id, and persisting empty payload
    /// and symlink index entries.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] on a schema mismatch or a symlink
    /// collision, [`Error::Memory`] if the array's shape exceeds the
    /// configured memory limit, [`Error::Locked`] if the creation lock
    /// cannot be acquired, or [`Error::Io`] on an underlying I/O failure.
    /// `memory_check_shape` is the shape the pre-flight memory check is run
    /// against: the schema's own full shape for a plain Array, or a
    /// VArray's tile shape when this is used to create a VArray's header
    /// entity (whose logical shape is virtual and never materialized at once).
    pub(crate) fn create(
        ctx: Arc<ClientContext>,
        adapter: Arc<dyn StorageAdapter>,
        collection: String,
        schema: ArraySchema,
        location: ArrayLocation,
        id_kind: &str,
        primary: AttributeMap,
        custom: AttributeMap,
        memory_check_shape: &[u64],
    ) -> Result<Self> {
        validate_primary_attributes(&schema, &primary)?;
        validate_custom_attributes(&schema, &custom)?;
        check_memory(memory_check_shape, schema.dtype().size_of(), ctx.config.memory_limit())?;

        let id = generate_id(id_kind);
        let _create_guard = CreateArrayGuard::acquire(&location.collection_root, &id, &ctx.config)?;

        let payload_path = path::payload_path(&location.data_dir, &id);
        let meta = ArrayMetadata {
            id: id.clone(),
            primary_attributes: primary.clone(),
            custom_attributes: custom.clone(),
        };
        adapter.create(&payload_path, &meta)?;

        let ordered = ordered_primary_values(&schema, &primary);
        let symlink_dir = path::symlink_dir(&location.symlinks_dir, &ordered);
        let symlink_file = path::symlink_path(&location.symlinks_dir, &ordered, &id);
        if symlink_file.exists() {
            let _ = std::fs::remove_file(&payload_path);
            return Err(Error::Validation(format!(
                "an array with these primary attributes already exists: {}",
                symlink_file.display()
            )));
        }
        std::fs::create_dir_all(&symlink_dir).map_err(|e| Error::io(&symlink_dir, e))?;
        let relative_target = pathdiff::diff_paths(&payload_path, &symlink_dir).unwrap_or(payload_path.clone());
        #[cfg(unix)]
        std::os::unix::fs::symlink(&relative_target, &symlink_file).map_err(|e| Error::io(&symlink_file, e))?;
        #[cfg(not(unix))]
        std::fs::write(&symlink_file, relative_target.to_string_lossy().as_bytes())
            .map_err(|e| Error::io(&symlink_file, e))?;

        tracing::debug!(collection = %collection, id = %id, "created array");

        Ok(Self {
            ctx,
            adapter,
            collection,
            schema,
            location,
            id,
            primary_attributes: primary,
            custom_attributes: custom,
            deleted: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Reconstruct a handle for an existing `id` by reading its persisted metadata.
    ///
    /// # Errors
    /// Returns [`Error::Io`]/[`Error::MetaData`] if the payload cannot be read or parsed.
    pub(crate) fn open(
        ctx: Arc<ClientContext>,
        adapter: Arc<dyn StorageAdapter>,
        collection: String,
        schema: ArraySchema,
        location: ArrayLocation,
        id: String,
    ) -> Result<Self> {
        let payload_path = path::payload_path(&location.data_dir, &id);
        let meta = adapter.read_meta(&payload_path, &|name| dtype_lookup(&schema, name))?;
        Ok(Self {
            ctx,
            adapter,
            collection,
            schema,
            location,
            id: meta.id,
            primary_attributes: meta.primary_attributes,
            custom_attributes: meta.custom_attributes,
            deleted: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Wrap an already-resolved [`ArrayMetadata`] (avoids a redundant read, used by the VArray engine).
    pub(crate) fn from_meta(
        ctx: Arc<ClientContext>,
        adapter: Arc<dyn StorageAdapter>,
        collection: String,
        schema: ArraySchema,
        location: ArrayLocation,
        meta: ArrayMetadata,
    ) -> Self {
        Self {
            ctx,
            adapter,
            collection,
            schema,
            location,
            id: meta.id,
            primary_attributes: meta.primary_attributes,
            custom_attributes: meta.custom_attributes,
            deleted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn ensure_alive(&self) -> Result<()> {
        if self.deleted.load(Ordering::SeqCst) {
            return Err(Error::InstanceNotExists(format!("array {} does not exist", self.id)));
        }
        Ok(())
    }

    /// The array's stable id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The owning collection's name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The array's declared schema.
    #[must_use]
    pub fn schema(&self) -> &ArraySchema {
        &self.schema
    }

    /// The array's declared shape.
    #[must_use]
    pub fn shape(&self) -> Vec<u64> {
        self.schema.shape()
    }

    /// Ordered primary attribute values.
    #[must_use]
    pub fn primary_attributes(&self) -> &AttributeMap {
        &self.primary_attributes
    }

    /// Custom (mutable) attribute values.
    #[must_use]
    pub fn custom_attributes(&self) -> &AttributeMap {
        &self.custom_attributes
    }

    pub(crate) fn payload_path(&self) -> PathBuf {
        path::payload_path(&self.location.data_dir, &self.id)
    }

    /// Re-read this array's metadata from its payload.
    ///
    /// # Errors
    /// Returns [`Error::InstanceNotExists`] if this handle has been
    /// deleted, or [`Error::Io`]/[`Error::MetaData`] on a read/parse failure.
    pub fn read_meta(&self) -> Result<ArrayMetadata> {
        self.ensure_alive()?;
        self.adapter
            .read_meta(&self.payload_path(), &|name| dtype_lookup(&self.schema, name))
    }

    /// Update this array's custom (mutable) attributes, merging `attrs`
    /// into the existing set.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] if an entry names a primary or unknown
    /// attribute or a value of the wrong dtype, [`Error::InstanceNotExists`]
    /// if this handle has been deleted, or [`Error::Locked`]/[`Error::Io`]
    /// on a lock/I/O failure.
    pub fn update_custom_attributes(&mut self, attrs: AttributeMap) -> Result<()> {
        self.ensure_alive()?;
        validate_custom_attributes(&self.schema, &attrs)?;
        let payload_path = self.payload_path();
        let _guard = UpdateMetaGuard::acquire(&payload_path, &self.ctx.config)?;
        let updated =
            self.adapter
                .update_meta_custom_attributes(&payload_path, &attrs, &|name| dtype_lookup(&self.schema, name))?;
        self.custom_attributes = updated.custom_attributes;
        Ok(())
    }

    /// Delete this array: removes its payload and symlink, then marks this
    /// (and any cloned) handle as deleted.
    ///
    /// # Errors
    /// Returns [`Error::InstanceNotExists`] if already deleted, or
    /// [`Error::Locked`]/[`Error::Io`] on a lock/I/O failure.
    pub fn delete(&self) -> Result<()> {
        self.ensure_alive()?;
        let payload_path = self.payload_path();
        {
            // A write lock guarantees no concurrent reader/writer is mid-operation.
            let _guard = WriteArrayGuard::acquire(&payload_path, &self.ctx.config)?;
        }
        let ordered = ordered_primary_values(&self.schema, &self.primary_attributes);
        let symlink_file = path::symlink_path(&self.location.symlinks_dir, &ordered, &self.id);
        let _ = std::fs::remove_file(&symlink_file);
        remove_empty_ancestors(&symlink_file, &self.location.symlinks_dir);
        let _ = std::fs::remove_file(&payload_path);
        remove_empty_ancestors(&payload_path, &self.location.data_dir);
        self.deleted.store(true, Ordering::SeqCst);
        tracing::debug!(collection = %self.collection, id = %self.id, "deleted array");
        Ok(())
    }

    /// Resolve a heterogeneous indexer against this array's schema.
    ///
    /// # Errors
    /// Returns [`Error::Index`] if the indexer is malformed or out of
    /// range, or [`Error::Memory`] if the resulting subset exceeds the
    /// configured memory limit.
    pub fn index(&self, indexers: &[IndexLike]) -> Result<Subset> {
        self.ensure_alive()?;
        let axes = indexing::resolve(indexers, self.schema.dimensions())?;
        let shape = indexing::result_shape(&axes)?;
        check_memory(&shape, self.schema.dtype().size_of(), self.ctx.config.memory_limit())?;
        Ok(Subset {
            array: self.clone(),
            axes,
            shape,
        })
    }

    /// Build a subset from already-resolved axes, skipping indexer
    /// resolution: used by the VArray engine, which resolves axes once
    /// against the virtual shape and then maps each tile's slice of them
    /// directly onto that tile's own (real, per-tile) array.
    ///
    /// # Errors
    /// Returns [`Error::Memory`] if the resulting subset exceeds the
    /// configured memory limit.
    pub(crate) fn subset_from_axes(&self, axes: Vec<AxisIndex>) -> Result<Subset> {
        let shape = indexing::result_shape(&axes)?;
        check_memory(&shape, self.schema.dtype().size_of(), self.ctx.config.memory_limit())?;
        Ok(Subset {
            array: self.clone(),
            axes,
            shape,
        })
    }
}

fn remove_empty_ancestors(leaf: &std::path::Path, stop_at: &std::path::Path) {
    let mut dir = leaf.parent();
    while let Some(d) = dir {
        if d == stop_at || !d.starts_with(stop_at) {
            break;
        }
        if std::fs::read_dir(d).map(|mut it| it.next().is_none()).unwrap_or(false) {
            let _ = std::fs::remove_dir(d);
            dir = d.parent();
        } else {
            break;
        }
    }
}

/// A lazy cursor over a region of an [`Array`] (§3): canonical integer
/// bounds and the resulting shape, with no buffered data until `read` is
/// called.
#[derive(Debug, Clone)]
pub struct Subset {
    array: Array,
    axes: Vec<AxisIndex>,
    shape: Vec<u64>,
}

impl Subset {
    /// The subset's resulting shape (integer axes are dropped).
    #[must_use]
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// The array this subset is a region of.
    #[must_use]
    pub fn array(&self) -> &Array {
        &self.array
    }

    /// Read this region, filling any untouched cells with the array's fill value.
    ///
    /// # Errors
    /// Returns [`Error::InstanceNotExists`] if the array has been deleted,
    /// or [`Error::Locked`]/[`Error::Io`] on a lock/I/O failure.
    pub fn read(&self) -> Result<Buffer> {
        self.array.ensure_alive()?;
        let payload_path = self.array.payload_path();
        let _guard = ReadArrayGuard::acquire(&payload_path)?;
        self.array.adapter.read_data(
            &payload_path,
            &self.axes,
            &self.array.schema.shape(),
            self.array.schema.dtype(),
            self.array.schema.fill_value(),
        )
    }

    /// Write `data` into this region.
    ///
    /// `data` must match this subset's dtype and shape exactly (scalars are
    /// accepted only when [`Subset::shape`] is empty).
    ///
    /// # Errors
    /// Returns [`Error::Array`] on a shape mismatch, [`Error::ArrayType`]
    /// on a dtype mismatch, [`Error::InstanceNotExists`] if the array has
    /// been deleted, or [`Error::Locked`]/[`Error::Io`] on a lock/I/O failure.
    pub fn update(&self, data: &Buffer) -> Result<()> {
        self.array.ensure_alive()?;
        self.validate_data(data)?;
        let payload_path = self.array.payload_path();
        let _guard = WriteArrayGuard::acquire(&payload_path, &self.array.ctx.config)?;
        self.array.adapter.update_data(
            &payload_path,
            &self.axes,
            &self.array.schema.shape(),
            self.array.schema.dtype(),
            self.array.schema.fill_value(),
            data,
        )
    }

    /// Reset this region to the array's fill value.
    ///
    /// Returns `true` if the payload's whole data body is now uniformly
    /// fill-valued (the adapter may have dropped it; see §9's Open Question).
    ///
    /// # Errors
    /// Returns [`Error::InstanceNotExists`] if the array has been deleted,
    /// or [`Error::Locked`]/[`Error::Io`] on a lock/I/O failure.
    pub fn clear(&self) -> Result<bool> {
        self.array.ensure_alive()?;
        let payload_path = self.array.payload_path();
        let _guard = WriteArrayGuard::acquire(&payload_path, &self.array.ctx.config)?;
        self.array.adapter.clear_data(
            &payload_path,
            &self.axes,
            &self.array.schema.shape(),
            self.array.schema.dtype(),
            self.array.schema.fill_value(),
        )
    }

    fn validate_data(&self, data: &Buffer) -> Result<()> {
        if data.dtype() != self.array.schema.dtype() {
            return Err(Error::ArrayType {
                expected: format!("{:?}", self.array.schema.dtype()),
                found: format!("{:?}", data.dtype()),
            });
        }
        let expected: usize = if self.shape.is_empty() {
            1
        } else {
            self.shape.iter().product::<u64>() as usize
        };
        if data.len() != expected {
            return Err(Error::Array(format!(
                "update data has {} elements, expected {expected} for shape {:?}",
                data.len(),
                self.shape
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::dtype::FillValue;
    use crate::schema::{ArraySchema, AttributeSchema, DimensionSchema};

    fn test_schema() -> ArraySchema {
        ArraySchema::new(
            DType::F64,
            None,
            vec![
                DimensionSchema::generic("y", 2, None, None).unwrap(),
                DimensionSchema::generic("x", 2, None, None).unwrap(),
            ],
            vec![AttributeSchema::new("key", DType::I64, true).unwrap()],
        )
        .unwrap()
    }

    #[test]
    fn create_read_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::open(&format!("file://{}", dir.path().display())).unwrap();
        let collection = client
            .create_collection("grid", test_schema(), None)
            .unwrap();
        let array = collection
            .create(vec![("key".into(), AttributeValue::Int(1))], vec![])
            .unwrap();

        let subset = array.index(&[]).unwrap();
        assert_eq!(subset.shape(), &[2, 2]);
        let data = Buffer::F64(vec![1.0, 2.0, 3.0, 4.0]);
        subset.update(&data).unwrap();
        assert_eq!(subset.read().unwrap(), data);
    }

    #[test]
    fn deleted_handle_refuses_further_operations() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::open(&format!("file://{}", dir.path().display())).unwrap();
        let collection = client.create_collection("grid", test_schema(), None).unwrap();
        let array = collection
            .create(vec![("key".into(), AttributeValue::Int(1))], vec![])
            .unwrap();
        array.delete().unwrap();
        let err = array.index(&[]).unwrap_err();
        assert!(matches!(err, Error::InstanceNotExists(_)));
    }

    #[test]
    fn duplicate_primary_attributes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::open(&format!("file://{}", dir.path().display())).unwrap();
        let collection = client.create_collection("grid", test_schema(), None).unwrap();
        collection
            .create(vec![("key".into(), AttributeValue::Int(1))], vec![])
            .unwrap();
        let err = collection
            .create(vec![("key".into(), AttributeValue::Int(1))], vec![])
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn fill_value_is_returned_for_untouched_region() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::open(&format!("file://{}", dir.path().display())).unwrap();
        let collection = client.create_collection("grid", test_schema(), None).unwrap();
        let array = collection
            .create(vec![("key".into(), AttributeValue::Int(1))], vec![])
            .unwrap();
        let subset = array.index(&[]).unwrap();
        let Buffer::F64(values) = subset.read().unwrap() else {
            panic!("wrong buffer variant")
        };
        assert!(values.iter().all(|v| v.is_nan()));
        let _ = FillValue::Float(f64::NAN);
    }
}
