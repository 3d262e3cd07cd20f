//! VArray Engine (C8): a logical Array tiled into a regular vgrid of
//! physical Array tiles, fanned out across the shared worker pool.
//!
//! A [`VArray`] is a header entity (its own small Array, carrying the
//! VArray's own primary/custom attributes) plus a vgrid of tile Arrays
//! created on demand. Tiles are addressed by `{vid, v_position}` through
//! the same symlink index mechanism C3 already provides for plain Arrays,
//! so the tile lookup/creation path reuses [`Array`] directly rather than
//! duplicating it.

/// VArray slice tiling: mapping a VArray slice into per-tile work items.
pub mod tiling;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use itertools::Itertools;

use crate::array::{Array, ArrayLocation};
use crate::client::ClientContext;
use crate::config::check_memory;
use crate::dtype::Buffer;
use crate::error::{Error, Result, TileError};
use crate::indexing::{self, AxisIndex, IndexLike};
use crate::lock::WriteVArrayGuard;
use crate::metadata::{ArrayMetadata, AttributeMap, AttributeValue};
use crate::path;
use crate::schema::dimension::{DimensionSchema, TimeStart};
use crate::schema::{ArraySchema, VArraySchema};
use crate::storage_adapter::StorageAdapter;
use crate::varray::tiling::ArrayPosition;

/// A handle to a logical, tiled N-dimensional array (§3, §4.8).
#[derive(Debug, Clone)]
pub struct VArray {
    ctx: Arc<ClientContext>,
    adapter: Arc<dyn StorageAdapter>,
    collection: String,
    schema: VArraySchema,
    location: ArrayLocation,
    id: String,
    primary_attributes: AttributeMap,
    custom_attributes: AttributeMap,
    deleted: Arc<AtomicBool>,
}

impl VArray {
    /// Create a new VArray header. Tiles are not materialized here; they
    /// are created on demand by the first write that touches them.
    ///
    /// # Errors
    /// Returns the same errors as [`Array::create`].
    pub(crate) fn create(
        ctx: Arc<ClientContext>,
        adapter: Arc<dyn StorageAdapter>,
        collection: String,
        schema: VArraySchema,
        location: ArrayLocation,
        primary: AttributeMap,
        custom: AttributeMap,
    ) -> Result<Self> {
        let tile_shape = schema.tile_shape();
        let header = Array::create(
            ctx.clone(),
            adapter.clone(),
            collection.clone(),
            schema.array_schema().clone(),
            location.clone(),
            "varray",
            primary,
            custom,
            &tile_shape,
        )?;
        tracing::debug!(collection = %collection, id = %header.id(), "created varray header");
        Ok(Self::from_parts(ctx, adapter, collection, schema, location, header))
    }

    /// Reconstruct a handle for an existing `id`.
    ///
    /// # Errors
    /// Returns [`Error::Io`]/[`Error::MetaData`] if the header payload
    /// cannot be read or parsed.
    pub(crate) fn open(
        ctx: Arc<ClientContext>,
        adapter: Arc<dyn StorageAdapter>,
        collection: String,
        schema: VArraySchema,
        location: ArrayLocation,
        id: String,
    ) -> Result<Self> {
        let header = Array::open(
            ctx.clone(),
            adapter.clone(),
            collection.clone(),
            schema.array_schema().clone(),
            location.clone(),
            id,
        )?;
        Ok(Self::from_parts(ctx, adapter, collection, schema, location, header))
    }

    /// Wrap an already-resolved header [`ArrayMetadata`] (avoids a redundant read).
    pub(crate) fn from_meta(
        ctx: Arc<ClientContext>,
        adapter: Arc<dyn StorageAdapter>,
        collection: String,
        schema: VArraySchema,
        location: ArrayLocation,
        meta: ArrayMetadata,
    ) -> Self {
        let header = Array::from_meta(
            ctx.clone(),
            adapter.clone(),
            collection.clone(),
            schema.array_schema().clone(),
            location.clone(),
            meta,
        );
        Self::from_parts(ctx, adapter, collection, schema, location, header)
    }

    fn from_parts(
        ctx: Arc<ClientContext>,
        adapter: Arc<dyn StorageAdapter>,
        collection: String,
        schema: VArraySchema,
        location: ArrayLocation,
        header: Array,
    ) -> Self {
        Self {
            ctx,
            adapter,
            collection,
            id: header.id().to_string(),
            primary_attributes: header.primary_attributes().clone(),
            custom_attributes: header.custom_attributes().clone(),
            schema,
            location,
            deleted: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.deleted.load(Ordering::SeqCst) {
            return Err(Error::InstanceNotExists(format!("varray {} does not exist", self.id)));
        }
        Ok(())
    }

    /// The VArray's stable id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The owning collection's name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The VArray's declared schema.
    #[must_use]
    pub fn schema(&self) -> &VArraySchema {
        &self.schema
    }

    /// The VArray's logical (full, untiled) shape.
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

    /// Resolve a heterogeneous indexer against the VArray's logical shape.
    ///
    /// # Errors
    /// Returns [`Error::Index`] if the indexer is malformed or out of
    /// range, or [`Error::Memory`] if the resulting subset exceeds the
    /// configured memory limit.
    pub fn index(&self, indexers: &[IndexLike]) -> Result<VSubset> {
        self.ensure_alive()?;
        let axes = indexing::resolve(indexers, self.schema.array_schema().dimensions())?;
        let shape = indexing::result_shape(&axes)?;
        check_memory(&shape, self.schema.array_schema().dtype().size_of(), self.ctx.config.memory_limit())?;
        Ok(VSubset {
            varray: self.clone(),
            axes,
            shape,
        })
    }

    /// Delete this VArray: every materialized tile, then the header itself.
    ///
    /// # Errors
    /// Returns [`Error::InstanceNotExists`] if already deleted, or
    /// [`Error::Locked`]/[`Error::Io`] on a lock/I/O failure.
    pub fn delete(&self) -> Result<()> {
        self.ensure_alive()?;
        for tile in self.all_tiles()? {
            tile.delete()?;
        }
        self.header()?.delete()?;
        self.deleted.store(true, Ordering::SeqCst);
        tracing::debug!(collection = %self.collection, id = %self.id, "deleted varray");
        Ok(())
    }

    fn header(&self) -> Result<Array> {
        Array::open(
            self.ctx.clone(),
            self.adapter.clone(),
            self.collection.clone(),
            self.schema.array_schema().clone(),
            self.location.clone(),
            self.id.clone(),
        )
    }

    fn all_tiles(&self) -> Result<Vec<Array>> {
        let tile_schema = self.schema.tile_schema()?;
        let mut tiles = Vec::new();
        for payload_path in path::walk_payload_paths(&self.location.data_dir)? {
            let meta = self.adapter.read_meta(&payload_path, &|name| dtype_lookup(&tile_schema, name))?;
            let belongs = meta
                .primary_attributes
                .iter()
                .any(|(n, v)| n == "vid" && matches!(v, AttributeValue::Str(s) if s == &self.id));
            if !belongs {
                continue;
            }
            tiles.push(Array::from_meta(
                self.ctx.clone(),
                self.adapter.clone(),
                self.collection.clone(),
                tile_schema.clone(),
                self.location.clone(),
                meta,
            ));
        }
        Ok(tiles)
    }

    fn tile_shape(&self) -> Vec<u64> {
        self.schema.tile_shape()
    }

    fn vgrid(&self) -> &[u64] {
        self.schema.vgrid()
    }

    /// The time dimensions' `$ref` attribute names: these are declared
    /// primary (or custom) on the header but are downgraded to non-primary,
    /// computed custom attributes on each tile (see
    /// [`VArraySchema::tile_schema`]).
    fn time_ref_names(&self) -> std::collections::HashSet<&str> {
        self.schema
            .array_schema()
            .dimensions()
            .iter()
            .filter_map(DimensionSchema::time_ref)
            .collect()
    }

    /// A tile's primary attribute map: the header's own primary attributes
    /// (excluding any `$ref` target, which the tile carries as a custom
    /// attribute instead) plus the implicit `vid`/`v_position` pair.
    fn tile_primary_key(&self, v_position: &[i64]) -> AttributeMap {
        let time_refs = self.time_ref_names();
        let mut primary: AttributeMap = self
            .primary_attributes
            .iter()
            .filter(|(name, _)| !time_refs.contains(name.as_str()))
            .cloned()
            .collect();
        primary.push(("vid".to_string(), AttributeValue::Str(self.id.clone())));
        primary.push((
            "v_position".to_string(),
            AttributeValue::Tuple(v_position.iter().map(|i| AttributeValue::Int(*i)).collect()),
        ));
        primary
    }

    fn lookup_tile(&self, tile_schema: &ArraySchema, v_position: &[i64]) -> Result<Option<Array>> {
        let primary = self.tile_primary_key(v_position);
        let ordered = crate::array::ordered_primary_values(tile_schema, &primary);
        match path::lookup_symlink(&self.location.symlinks_dir, &ordered)? {
            None => Ok(None),
            Some((id, _)) => Ok(Some(Array::open(
                self.ctx.clone(),
                self.adapter.clone(),
                self.collection.clone(),
                tile_schema.clone(),
                self.location.clone(),
                id,
            )?)),
        }
    }

    /// Create a tile at `v_position`, resolving any `$ref` time-dimension
    /// start value into the tile's custom attributes (§4.8): the tile's
    /// origin is the VArray's own declared start (read off its header, by
    /// the referenced attribute's name) offset by its tile index.
    fn create_tile(&self, tile_schema: &ArraySchema, v_position: &[i64]) -> Result<Array> {
        let primary = self.tile_primary_key(v_position);
        let tile_shape = self.tile_shape();
        let custom = self.resolve_tile_custom_attributes(v_position, &tile_shape)?;
        Array::create(
            self.ctx.clone(),
            self.adapter.clone(),
            self.collection.clone(),
            tile_schema.clone(),
            self.location.clone(),
            "tile",
            primary,
            custom,
            &tile_shape,
        )
    }

    fn resolve_tile_custom_attributes(&self, v_position: &[i64], tile_shape: &[u64]) -> Result<AttributeMap> {
        let mut custom = Vec::new();
        for (axis, dim) in self.schema.array_schema().dimensions().iter().enumerate() {
            let DimensionSchema::Time {
                step,
                start_value: TimeStart::Ref(ref_name),
                ..
            } = dim
            else {
                continue;
            };
            let base = self.header_time_ref_value(ref_name)?;
            let offset = *step
                * i32::try_from(tile_shape[axis]).unwrap_or(i32::MAX)
                * i32::try_from(v_position[axis]).unwrap_or(0);
            custom.push((ref_name.clone(), AttributeValue::DateTime(base + offset)));
        }
        Ok(custom)
    }

    fn header_time_ref_value(&self, ref_name: &str) -> Result<chrono::DateTime<chrono::Utc>> {
        let value = self
            .primary_attributes
            .iter()
            .chain(self.custom_attributes.iter())
            .find(|(n, _)| n == ref_name)
            .map(|(_, v)| v)
            .ok_or_else(|| {
                Error::Validation(format!("varray header is missing its time-reference attribute {ref_name}"))
            })?;
        match value {
            AttributeValue::DateTime(dt) => Ok(*dt),
            other => Err(Error::Validation(format!(
                "time-reference attribute {ref_name} must be a datetime, found {other:?}"
            ))),
        }
    }

    fn positions_for(&self, axes: &[AxisIndex]) -> Result<Vec<ArrayPosition>> {
        tiling::compute_positions(axes, &self.schema.shape(), self.vgrid())
    }
}

fn dtype_lookup(schema: &ArraySchema, name: &str) -> Option<crate::dtype::DType> {
    schema.attributes().iter().find(|a| a.name() == name).map(|a| a.dtype())
}

/// A lazy cursor over a region of a [`VArray`] (§4.8): fanned out, on
/// access, into one [`crate::array::Subset`] operation per overlapping tile.
#[derive(Debug, Clone)]
pub struct VSubset {
    varray: VArray,
    axes: Vec<AxisIndex>,
    shape: Vec<u64>,
}

impl VSubset {
    /// The subset's resulting shape (integer axes are dropped).
    #[must_use]
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// The VArray this subset is a region of.
    #[must_use]
    pub fn varray(&self) -> &VArray {
        &self.varray
    }

    /// Read this region, gathering across overlapping tiles in parallel.
    /// Untouched tiles (and cells within partially-written tiles) read as
    /// the VArray's fill value.
    ///
    /// # Errors
    /// Returns [`Error::InstanceNotExists`] if the VArray has been deleted,
    /// or [`Error::Io`]/[`Error::Locked`] if a tile read fails.
    pub fn read(&self) -> Result<Buffer> {
        self.varray.ensure_alive()?;
        let tile_schema = self.varray.schema.tile_schema()?;
        let positions = self.varray.positions_for(&self.axes)?;
        let fill_value = self.varray.schema.array_schema().fill_value();
        let dtype = self.varray.schema.array_schema().dtype();
        let total: usize = self.shape.iter().product::<u64>().max(1) as usize;

        let mut full = Buffer::filled(dtype, total, &fill_value)?;

        let varray = self.varray.clone();
        let tile_schema_for_pool = tile_schema.clone();
        let results: Vec<Result<(ArrayPosition, Option<Buffer>)>> = varray.ctx.pool.map(positions, move |position| {
            let tile = varray.lookup_tile(&tile_schema_for_pool, &position.v_position)?;
            match tile {
                None => Ok((position, None)),
                Some(tile) => {
                    let subset = tile.subset_from_axes(position.tile_bounds.clone())?;
                    let data = subset.read()?;
                    Ok((position, Some(data)))
                }
            }
        });

        for result in results {
            let (position, data) = result?;
            let Some(data) = data else { continue };
            scatter_region(&mut full, &self.shape, &position.data_slice, &data)?;
        }
        Ok(full)
    }

    /// Write `data` into this region, creating any touched tile that does
    /// not yet exist, under a [`WriteVArrayGuard`] spanning every
    /// already-existing affected tile.
    ///
    /// # Errors
    /// Returns [`Error::ArrayType`]/[`Error::Array`] on a shape/dtype
    /// mismatch, [`Error::InstanceNotExists`] if the VArray has been
    /// deleted, or [`Error::VSubset`] if one or more tile writes failed
    /// (tiles not named in the failure list were written successfully).
    pub fn update(&self, data: &Buffer) -> Result<()> {
        self.varray.ensure_alive()?;
        self.validate_data(data)?;
        let tile_schema = self.varray.schema.tile_schema()?;
        let positions = self.varray.positions_for(&self.axes)?;

        let payload_paths = self.existing_tile_paths(&tile_schema, &positions)?;
        let _guard = WriteVArrayGuard::acquire(&payload_paths, &self.varray.ctx.config)?;

        let varray = self.varray.clone();
        let data = data.clone();
        let shape = self.shape.clone();
        let tile_schema_for_pool = tile_schema.clone();
        let results: Vec<std::result::Result<(), TileError>> = varray.ctx.pool.map(positions, move |position| {
            write_one_tile(&varray, &tile_schema_for_pool, &position, &data, &shape)
                .map_err(|source| TileError { position, source })
        });

        let failures: Vec<TileError> = results.into_iter().filter_map(std::result::Result::err).collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::VSubset(failures))
        }
    }

    /// Reset this region to the VArray's fill value. A tile fully covered
    /// by the operation is deleted outright; a partially-covered tile has
    /// only the covered region cleared.
    ///
    /// # Errors
    /// Returns [`Error::InstanceNotExists`] if the VArray has been deleted,
    /// or [`Error::VSubset`] if one or more tile clears failed.
    pub fn clear(&self) -> Result<()> {
        self.varray.ensure_alive()?;
        let tile_schema = self.varray.schema.tile_schema()?;
        let positions = self.varray.positions_for(&self.axes)?;
        let tile_shape = self.varray.tile_shape();

        let payload_paths = self.existing_tile_paths(&tile_schema, &positions)?;
        let _guard = WriteVArrayGuard::acquire(&payload_paths, &self.varray.ctx.config)?;

        let varray = self.varray.clone();
        let tile_schema_for_pool = tile_schema.clone();
        let results: Vec<std::result::Result<(), TileError>> = varray.ctx.pool.map(positions, move |position| {
            clear_one_tile(&varray, &tile_schema_for_pool, &position, &tile_shape)
                .map_err(|source| TileError { position, source })
        });

        let failures: Vec<TileError> = results.into_iter().filter_map(std::result::Result::err).collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::VSubset(failures))
        }
    }

    fn existing_tile_paths(&self, tile_schema: &ArraySchema, positions: &[ArrayPosition]) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::with_capacity(positions.len());
        for position in positions {
            // A tile not yet created has nothing to lock ahead of creation;
            // Array::create's own creation guard covers that race.
            if let Some(tile) = self.varray.lookup_tile(tile_schema, &position.v_position)? {
                paths.push(tile.payload_path());
            }
        }
        Ok(paths)
    }

    fn validate_data(&self, data: &Buffer) -> Result<()> {
        if data.dtype() != self.varray.schema.array_schema().dtype() {
            return Err(Error::ArrayType {
                expected: format!("{:?}", self.varray.schema.array_schema().dtype()),
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

fn write_one_tile(
    varray: &VArray,
    tile_schema: &ArraySchema,
    position: &ArrayPosition,
    data: &Buffer,
    source_shape: &[u64],
) -> Result<()> {
    let tile = match varray.lookup_tile(tile_schema, &position.v_position)? {
        Some(tile) => tile,
        None => varray.create_tile(tile_schema, &position.v_position)?,
    };
    let subset = tile.subset_from_axes(position.tile_bounds.clone())?;
    let slice = gather_region(data, source_shape, &position.data_slice);
    subset.update(&slice)
}

fn clear_one_tile(
    varray: &VArray,
    tile_schema: &ArraySchema,
    position: &ArrayPosition,
    tile_shape: &[u64],
) -> Result<()> {
    let Some(tile) = varray.lookup_tile(tile_schema, &position.v_position)? else {
        return Ok(());
    };
    let fully_covered = position.tile_bounds.iter().zip(tile_shape).all(|(bound, &size)| match bound {
        AxisIndex::Range { start, stop } => *start == 0 && *stop as u64 == size,
        AxisIndex::Point(_) => false,
    });
    if fully_covered {
        tile.delete()
    } else {
        let subset = tile.subset_from_axes(position.tile_bounds.clone())?;
        subset.clear().map(|_| ())
    }
}

/// Row-major strides for `shape`.
fn strides_of(shape: &[u64]) -> Vec<u64> {
    let mut strides = vec![1u64; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Flat row-major indices into a `shape`-shaped buffer covered by the
/// per-axis half-open `[start, stop)` ranges in `data_slice`.
fn region_indices(shape: &[u64], data_slice: &[(u64, u64)]) -> Vec<usize> {
    if data_slice.is_empty() {
        return vec![0];
    }
    let strides = strides_of(shape);
    data_slice
        .iter()
        .map(|(start, stop)| *start..*stop)
        .multi_cartesian_product()
        .map(|coords| coords.iter().zip(&strides).map(|(c, s)| c * s).sum::<u64>() as usize)
        .collect()
}

/// Gather the sub-region of `source` (shaped per `source_shape`) bound for
/// one tile, per `data_slice`'s per-axis ranges.
fn gather_region(source: &Buffer, source_shape: &[u64], data_slice: &[(u64, u64)]) -> Buffer {
    let indices = region_indices(source_shape, data_slice);
    source.gather(&indices)
}

/// Scatter a tile's read result into the VSubset's full result buffer.
fn scatter_region(full: &mut Buffer, full_shape: &[u64], data_slice: &[(u64, u64)], tile_data: &Buffer) -> Result<()> {
    let indices = region_indices(full_shape, data_slice);
    full.scatter(&indices, tile_data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::dtype::DType;
    use crate::schema::{ArraySchema, AttributeSchema, DimensionSchema};

    fn test_varray_schema() -> VArraySchema {
        VArraySchema::new(
            DType::F64,
            None,
            vec![
                DimensionSchema::generic("y", 4, None, None).unwrap(),
                DimensionSchema::generic("x", 4, None, None).unwrap(),
            ],
            vec![AttributeSchema::new("key", DType::I64, true).unwrap()],
            vec![2, 2],
        )
        .unwrap()
    }

    #[test]
    fn write_spanning_multiple_tiles_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::open(&format!("file://{}", dir.path().display())).unwrap();
        let collection = client
            .create_varray_collection("grid", test_varray_schema(), None)
            .unwrap();
        let varray = collection
            .create_varray(vec![("key".into(), AttributeValue::Int(1))], vec![])
            .unwrap();

        let subset = varray.index(&[]).unwrap();
        assert_eq!(subset.shape(), &[4, 4]);
        let data = Buffer::F64((0..16).map(f64::from).collect());
        subset.update(&data).unwrap();
        assert_eq!(subset.read().unwrap(), data);
    }

    #[test]
    fn untouched_region_reads_as_fill_value() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::open(&format!("file://{}", dir.path().display())).unwrap();
        let collection = client
            .create_varray_collection("grid", test_varray_schema(), None)
            .unwrap();
        let varray = collection
            .create_varray(vec![("key".into(), AttributeValue::Int(1))], vec![])
            .unwrap();
        let subset = varray.index(&[]).unwrap();
        let Buffer::F64(values) = subset.read().unwrap() else {
            panic!("wrong buffer variant")
        };
        assert!(values.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn clear_drops_fully_covered_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::open(&format!("file://{}", dir.path().display())).unwrap();
        let collection = client
            .create_varray_collection("grid", test_varray_schema(), None)
            .unwrap();
        let varray = collection
            .create_varray(vec![("key".into(), AttributeValue::Int(1))], vec![])
            .unwrap();
        let subset = varray.index(&[]).unwrap();
        let data = Buffer::F64((0..16).map(f64::from).collect());
        subset.update(&data).unwrap();
        subset.clear().unwrap();
        let Buffer::F64(values) = subset.read().unwrap() else {
            panic!("wrong buffer variant")
        };
        assert!(values.iter().all(|v| v.is_nan()));
    }
}
