//! Storage Adapter (C6): the opaque driver for a single Array's payload
//! file.
//!
//! Grounded on the teacher's `storage/store/filesystem.rs` raw `std::fs`
//! idioms, but storing a flat dense binary payload (row-major bytes, via
//! `bytemuck`) preceded by a small JSON metadata header, instead of the
//! teacher's chunked/compressed Zarr array-store abstraction -- chunking
//! and compression are explicitly out of scope (§1).

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use itertools::Itertools;
use tracing::{debug, trace};

use crate::dtype::{Buffer, DType, FillValue};
use crate::error::{Error, Result};
use crate::indexing::{bounds_as_ranges, AxisIndex};
use crate::metadata::{ArrayMetadata, AttributeMap};

/// A function mapping an attribute name to its declared dtype, used when
/// deserializing persisted attribute values (the dtype disambiguates, e.g.,
/// a complex literal from a plain string).
pub type DTypeLookup<'a> = dyn Fn(&str) -> Option<DType> + 'a;

/// The opaque per-array payload driver the core depends on.
///
/// Parameterized per-call by `(dtype, shape, fill_value)`, mirroring §4.6;
/// a single adapter instance is reused across every Array and tile in a
/// Collection, keyed only by the `path` argument.
pub trait StorageAdapter: std::fmt::Debug + Send + Sync {
    /// Write an empty payload (header only, no data body) at `path`.
    ///
    /// # Errors
    /// Returns [`Error::Array`] if a payload already exists at `path`, or
    /// [`Error::Io`] on an underlying I/O failure.
    fn create(&self, path: &Path, meta: &ArrayMetadata) -> Result<()>;

    /// Read the region `bounds` (within `shape`), filling absent data with `fill_value`.
    ///
    /// # Errors
    /// Returns [`Error::Io`] on an underlying I/O failure, or
    /// [`Error::MetaData`] if the payload's header cannot be parsed.
    fn read_data(
        &self,
        path: &Path,
        bounds: &[AxisIndex],
        shape: &[u64],
        dtype: DType,
        fill_value: FillValue,
    ) -> Result<Buffer>;

    /// Write `data` into the region `bounds` (within `shape`).
    ///
    /// # Errors
    /// Returns [`Error::ArrayType`] if `data`'s dtype does not match
    /// `dtype`, or [`Error::Io`]/[`Error::MetaData`] on I/O/header failure.
    fn update_data(
        &self,
        path: &Path,
        bounds: &[AxisIndex],
        shape: &[u64],
        dtype: DType,
        fill_value: FillValue,
        data: &Buffer,
    ) -> Result<()>;

    /// Reset the region `bounds` (within `shape`) to `fill_value`.
    ///
    /// Returns `true` if the whole payload body is now uniformly
    /// `fill_value`, in which case the adapter drops the body (retaining
    /// only metadata) per §4.6.
    ///
    /// # Errors
    /// Returns [`Error::Io`]/[`Error::MetaData`] on I/O/header failure.
    fn clear_data(
        &self,
        path: &Path,
        bounds: &[AxisIndex],
        shape: &[u64],
        dtype: DType,
        fill_value: FillValue,
    ) -> Result<bool>;

    /// Read and parse the payload's embedded metadata header.
    ///
    /// # Errors
    /// Returns [`Error::Io`]/[`Error::MetaData`] on I/O/parse failure.
    fn read_meta(&self, path: &Path, dtype_lookup: &DTypeLookup) -> Result<ArrayMetadata>;

    /// Merge `attrs` into the payload's custom attributes and persist, leaving the data body untouched.
    ///
    /// # Errors
    /// Returns [`Error::Io`]/[`Error::MetaData`] on I/O/parse failure.
    fn update_meta_custom_attributes(
        &self,
        path: &Path,
        attrs: &AttributeMap,
        dtype_lookup: &DTypeLookup,
    ) -> Result<ArrayMetadata>;
}

/// A factory constructing a boxed [`StorageAdapter`] from a Collection's
/// opaque `options` JSON, keyed by the Collection metadata's
/// `storage_adapter` tag.
pub type StorageAdapterFactory = fn(options: Option<&serde_json::Value>) -> Box<dyn StorageAdapter>;

/// A registry of [`StorageAdapterFactory`] functions keyed by driver tag,
/// mirroring the teacher's `plugin.rs`/`inventory`-based store registration
/// but simplified to a plain map, since this crate ships exactly one
/// built-in driver and has no dynamic-loading ABI to register others.
#[derive(Default)]
pub struct StorageAdapterRegistry {
    factories: HashMap<&'static str, StorageAdapterFactory>,
}

impl std::fmt::Debug for StorageAdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAdapterRegistry")
            .field("drivers", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StorageAdapterRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The default registry: just the built-in `"filesystem"` driver.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("filesystem", |_options| {
            Box::new(FilesystemStorageAdapter) as Box<dyn StorageAdapter>
        });
        registry
    }

    /// Register a driver under `tag`, replacing any existing registration.
    pub fn register(&mut self, tag: &'static str, factory: StorageAdapterFactory) {
        self.factories.insert(tag, factory);
    }

    /// Construct an adapter instance for `tag`.
    ///
    /// # Errors
    /// Returns [`Error::Client`] if no driver is registered under `tag`.
    pub fn build(&self, tag: &str, options: Option<&serde_json::Value>) -> Result<Box<dyn StorageAdapter>> {
        let factory = self
            .factories
            .get(tag)
            .ok_or_else(|| Error::Client(format!("no storage adapter registered for {tag:?}")))?;
        Ok(factory(options))
    }
}

/// The built-in driver: a flat dense binary payload behind a small JSON
/// metadata header.
///
/// File layout: an 8-byte little-endian header length, that many bytes of
/// JSON (the embedded [`ArrayMetadata`]), then either zero bytes (no data
/// written yet -- reads as entirely `fill_value`) or exactly
/// `prod(shape) * size_of(dtype)` bytes of row-major native-endian data.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilesystemStorageAdapter;

impl FilesystemStorageAdapter {
    fn write_whole(path: &Path, meta_bytes: &[u8], body: &[u8]) -> Result<()> {
        let mut file = File::create(path).map_err(|e| Error::io(path, e))?;
        file.write_all(&(meta_bytes.len() as u64).to_le_bytes())
            .map_err(|e| Error::io(path, e))?;
        file.write_all(meta_bytes).map_err(|e| Error::io(path, e))?;
        file.write_all(body).map_err(|e| Error::io(path, e))?;
        Ok(())
    }

    fn read_whole(path: &Path) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes).map_err(|e| Error::io(path, e))?;
        let meta_len = u64::from_le_bytes(len_bytes) as usize;
        let mut meta_bytes = vec![0u8; meta_len];
        file.read_exact(&mut meta_bytes).map_err(|e| Error::io(path, e))?;
        let mut body = Vec::new();
        file.read_to_end(&mut body).map_err(|e| Error::io(path, e))?;
        Ok((meta_bytes, body))
    }

    fn read_meta_bytes(path: &Path) -> Result<Vec<u8>> {
        Self::read_whole(path).map(|(meta, _)| meta)
    }
}

fn strides(shape: &[u64]) -> Vec<u64> {
    let mut strides = vec![1u64; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Flat row-major indices into a `shape`-shaped buffer covered by `ranges`,
/// in the order the subset's elements are produced (last axis fastest).
fn flat_indices(shape: &[u64], ranges: &[(u64, u64)]) -> Vec<usize> {
    let strides = strides(shape);
    if ranges.is_empty() {
        return vec![0];
    }
    ranges
        .iter()
        .map(|(start, stop)| (*start..*stop))
        .multi_cartesian_product()
        .map(|coords| {
            coords
                .iter()
                .zip(&strides)
                .map(|(c, s)| c * s)
                .sum::<u64>() as usize
        })
        .collect()
}

fn full_len(shape: &[u64]) -> usize {
    shape.iter().product::<u64>() as usize
}

fn load_full_buffer(body: &[u8], shape: &[u64], dtype: DType, fill_value: FillValue) -> Result<Buffer> {
    if body.is_empty() {
        Buffer::filled(dtype, full_len(shape), &fill_value)
    } else {
        Buffer::from_bytes(dtype, body)
    }
}

impl StorageAdapter for FilesystemStorageAdapter {
    fn create(&self, path: &Path, meta: &ArrayMetadata) -> Result<()> {
        if path.exists() {
            return Err(Error::Array(format!(
                "payload already exists at {}",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let meta_bytes = serde_json::to_vec(&meta.to_json())
            .map_err(|e| Error::MetaData(format!("could not serialize array metadata: {e}")))?;
        debug!(path = %path.display(), "creating payload");
        Self::write_whole(path, &meta_bytes, &[])
    }

    fn read_data(
        &self,
        path: &Path,
        bounds: &[AxisIndex],
        shape: &[u64],
        dtype: DType,
        fill_value: FillValue,
    ) -> Result<Buffer> {
        let (_, body) = Self::read_whole(path)?;
        let full = load_full_buffer(&body, shape, dtype, fill_value)?;
        let ranges = bounds_as_ranges(bounds);
        let indices = flat_indices(shape, &ranges);
        trace!(path = %path.display(), elements = indices.len(), "read_data");
        Ok(full.gather(&indices))
    }

    fn update_data(
        &self,
        path: &Path,
        bounds: &[AxisIndex],
        shape: &[u64],
        dtype: DType,
        fill_value: FillValue,
        data: &Buffer,
    ) -> Result<()> {
        if data.dtype() != dtype {
            return Err(Error::ArrayType {
                expected: format!("{dtype:?}"),
                found: format!("{:?}", data.dtype()),
            });
        }
        let (meta_bytes, body) = Self::read_whole(path)?;
        let mut full = load_full_buffer(&body, shape, dtype, fill_value)?;
        let ranges = bounds_as_ranges(bounds);
        let indices = flat_indices(shape, &ranges);
        full.scatter(&indices, data)?;
        debug!(path = %path.display(), elements = indices.len(), "update_data");
        Self::write_whole(path, &meta_bytes, full.as_bytes())
    }

    fn clear_data(
        &self,
        path: &Path,
        bounds: &[AxisIndex],
        shape: &[u64],
        dtype: DType,
        fill_value: FillValue,
    ) -> Result<bool> {
        let (meta_bytes, body) = Self::read_whole(path)?;
        if body.is_empty() {
            // Already entirely fill-valued; clearing any region is a no-op.
            return Ok(true);
        }
        let mut full = load_full_buffer(&body, shape, dtype, fill_value)?;
        let ranges = bounds_as_ranges(bounds);
        let indices = flat_indices(shape, &ranges);
        let fill_region = Buffer::filled(dtype, indices.len(), &fill_value)?;
        full.scatter(&indices, &fill_region)?;

        if full.is_all_fill(&fill_value) {
            debug!(path = %path.display(), "clear_data dropped payload body");
            Self::write_whole(path, &meta_bytes, &[])?;
            Ok(true)
        } else {
            debug!(path = %path.display(), "clear_data reset region");
            Self::write_whole(path, &meta_bytes, full.as_bytes())?;
            Ok(false)
        }
    }

    fn read_meta(&self, path: &Path, dtype_lookup: &DTypeLookup) -> Result<ArrayMetadata> {
        let meta_bytes = Self::read_meta_bytes(path)?;
        ArrayMetadata::from_slice(&meta_bytes, dtype_lookup)
    }

    fn update_meta_custom_attributes(
        &self,
        path: &Path,
        attrs: &AttributeMap,
        dtype_lookup: &DTypeLookup,
    ) -> Result<ArrayMetadata> {
        let (meta_bytes, body) = Self::read_whole(path)?;
        let mut meta = ArrayMetadata::from_slice(&meta_bytes, dtype_lookup)?;
        for (name, value) in attrs {
            if let Some(existing) = meta.custom_attributes.iter_mut().find(|(n, _)| n == name) {
                existing.1 = value.clone();
            } else {
                meta.custom_attributes.push((name.clone(), value.clone()));
            }
        }
        let new_meta_bytes = serde_json::to_vec(&meta.to_json())
            .map_err(|e| Error::MetaData(format!("could not serialize array metadata: {e}")))?;
        Self::write_whole(path, &new_meta_bytes, &body)?;
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str) -> ArrayMetadata {
        ArrayMetadata {
            id: id.to_string(),
            primary_attributes: vec![],
            custom_attributes: vec![],
        }
    }

    fn lookup(_name: &str) -> Option<DType> {
        None
    }

    #[test]
    fn read_untouched_payload_returns_fill_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.gv");
        let adapter = FilesystemStorageAdapter;
        adapter.create(&path, &meta("a")).unwrap();

        let bounds = vec![AxisIndex::Range { start: 0, stop: 2 }, AxisIndex::Range { start: 0, stop: 2 }];
        let data = adapter
            .read_data(&path, &bounds, &[2, 2], DType::F64, FillValue::Float(f64::NAN))
            .unwrap();
        let Buffer::F64(values) = data else { panic!("wrong buffer variant") };
        assert!(values.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn update_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.gv");
        let adapter = FilesystemStorageAdapter;
        adapter.create(&path, &meta("a")).unwrap();

        let shape = [2u64, 2];
        let fill = FillValue::Float(0.0);
        let bounds = vec![AxisIndex::Range { start: 0, stop: 2 }, AxisIndex::Range { start: 0, stop: 2 }];
        let data = Buffer::F64(vec![1.0, 2.0, 3.0, 4.0]);
        adapter
            .update_data(&path, &bounds, &shape, DType::F64, fill, &data)
            .unwrap();

        let read_back = adapter.read_data(&path, &bounds, &shape, DType::F64, fill).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn clear_whole_payload_drops_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.gv");
        let adapter = FilesystemStorageAdapter;
        adapter.create(&path, &meta("a")).unwrap();

        let shape = [2u64];
        let fill = FillValue::Int(0);
        let bounds = vec![AxisIndex::Range { start: 0, stop: 2 }];
        adapter
            .update_data(&path, &bounds, &shape, DType::I64, fill, &Buffer::I64(vec![5, 6]))
            .unwrap();

        let fully_cleared = adapter.clear_data(&path, &bounds, &shape, DType::I64, fill).unwrap();
        assert!(fully_cleared);

        let read_back = adapter.read_data(&path, &bounds, &shape, DType::I64, fill).unwrap();
        assert_eq!(read_back, Buffer::I64(vec![0, 0]));
    }

    #[test]
    fn update_meta_custom_attributes_preserves_data_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.gv");
        let adapter = FilesystemStorageAdapter;
        adapter.create(&path, &meta("a")).unwrap();

        let shape = [1u64];
        let fill = FillValue::Int(0);
        let bounds = vec![AxisIndex::Range { start: 0, stop: 1 }];
        adapter
            .update_data(&path, &bounds, &shape, DType::I64, fill, &Buffer::I64(vec![42]))
            .unwrap();

        use crate::metadata::AttributeValue;
        let attrs = vec![("note".to_string(), AttributeValue::Str("hi".to_string()))];
        let updated = adapter.update_meta_custom_attributes(&path, &attrs, &lookup).unwrap();
        assert_eq!(updated.custom_attributes, attrs);

        let read_back = adapter.read_data(&path, &bounds, &shape, DType::I64, fill).unwrap();
        assert_eq!(read_back, Buffer::I64(vec![42]));
    }
}
