//! Collection & Client (C9): a named, schema-typed group of Arrays or
//! VArrays (§4.9), grounded on the teacher's `Group`
//! (`storage/store/filesystem.rs`'s directory-per-entity layout) but
//! specialized to this engine's flat payload/symlink-index split instead of
//! a nested Zarr node hierarchy.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::array::{self, Array, ArrayLocation};
use crate::client::ClientContext;
use crate::config::{ARRAY_DATA_DIRECTORY, ARRAY_SYMLINKS_DIRECTORY, COLLECTIONS_DIRECTORY, VARRAY_DATA_DIRECTORY, VARRAY_SYMLINKS_DIRECTORY};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::metadata::{AttributeMap, AttributeValue, CollectionMetadata, CollectionType};
use crate::path;
use crate::schema::{ArraySchema, VArraySchema};
use crate::storage_adapter::StorageAdapter;
use crate::varray::VArray;

fn dtype_lookup(schema: &ArraySchema, name: &str) -> Option<DType> {
    schema.attributes().iter().find(|a| a.name() == name).map(|a| a.dtype())
}

/// A named group of Arrays (or VArrays) sharing one schema and storage adapter.
#[derive(Debug, Clone)]
pub struct Collection {
    ctx: Arc<ClientContext>,
    meta: CollectionMetadata,
    root: PathBuf,
    adapter: Arc<dyn StorageAdapter>,
}

impl Collection {
    pub(crate) fn open(ctx: Arc<ClientContext>, meta: CollectionMetadata) -> Result<Self> {
        let root = ctx.root.join(COLLECTIONS_DIRECTORY).join(&meta.name);
        let adapter: Arc<dyn StorageAdapter> = ctx
            .adapter_registry
            .build(&meta.storage_adapter, meta.options.as_ref())?
            .into();
        Ok(Self { ctx, meta, root, adapter })
    }

    /// This collection's unique name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Whether this collection holds plain Arrays or VArrays.
    #[must_use]
    pub fn collection_type(&self) -> CollectionType {
        self.meta.collection_type
    }

    /// The collection's (untiled) array schema.
    #[must_use]
    pub fn schema(&self) -> &ArraySchema {
        &self.meta.array_schema
    }

    /// The full VArray schema.
    ///
    /// # Errors
    /// Returns [`Error::MetaData`] if this is not a varray-typed collection.
    pub fn varray_schema(&self) -> Result<VArraySchema> {
        self.meta.varray_schema()
    }

    fn array_location(&self) -> ArrayLocation {
        ArrayLocation {
            collection_root: self.root.clone(),
            data_dir: self.root.join(ARRAY_DATA_DIRECTORY),
            symlinks_dir: self.root.join(ARRAY_SYMLINKS_DIRECTORY),
        }
    }

    fn varray_location(&self) -> ArrayLocation {
        ArrayLocation {
            collection_root: self.root.clone(),
            data_dir: self.root.join(VARRAY_DATA_DIRECTORY),
            symlinks_dir: self.root.join(VARRAY_SYMLINKS_DIRECTORY),
        }
    }

    /// Create a new Array (only valid on an array-typed collection).
    ///
    /// # Errors
    /// Returns [`Error::InvalidManagerCall`] if this is a varray-typed
    /// collection; otherwise as [`Array::create`].
    pub fn create(&self, primary: AttributeMap, custom: AttributeMap) -> Result<Array> {
        if self.meta.collection_type != CollectionType::Array {
            return Err(Error::InvalidManagerCall(
                "create() is only valid on an array-typed collection; use create_varray()".into(),
            ));
        }
        let schema = self.meta.array_schema.clone();
        let shape = schema.shape();
        Array::create(
            self.ctx.clone(),
            self.adapter.clone(),
            self.meta.name.clone(),
            schema,
            self.array_location(),
            "array",
            primary,
            custom,
            &shape,
        )
    }

    /// Create a new VArray header (only valid on a varray-typed collection);
    /// tiles are created on demand by the first write that touches them (§4.8).
    ///
    /// # Errors
    /// Returns [`Error::InvalidManagerCall`] if this is an array-typed
    /// collection; otherwise as [`Array::create`].
    pub fn create_varray(&self, primary: AttributeMap, custom: AttributeMap) -> Result<VArray> {
        if self.meta.collection_type != CollectionType::VArray {
            return Err(Error::InvalidManagerCall(
                "create_varray() is only valid on a varray-typed collection; use create()".into(),
            ));
        }
        let varray_schema = self.meta.varray_schema()?;
        VArray::create(
            self.ctx.clone(),
            self.adapter.clone(),
            self.meta.name.clone(),
            varray_schema,
            self.varray_location(),
            primary,
            custom,
        )
    }

    /// Begin a filter query by id or complete primary-attribute key (§4.9).
    #[must_use]
    pub fn filter(&self, criteria: AttributeMap) -> Filter<'_> {
        Filter { collection: self, criteria }
    }

    /// Every Array in this collection (only valid on an array-typed collection).
    ///
    /// # Errors
    /// Returns [`Error::InvalidManagerCall`] if this is a varray-typed
    /// collection, or [`Error::Io`]/[`Error::MetaData`] on a read failure.
    pub fn arrays(&self) -> Result<Vec<Array>> {
        if self.meta.collection_type != CollectionType::Array {
            return Err(Error::InvalidManagerCall(
                "arrays() is only valid on an array-typed collection".into(),
            ));
        }
        let location = self.array_location();
        let schema = self.meta.array_schema.clone();
        path::walk_payload_paths(&location.data_dir)?
            .into_iter()
            .map(|payload_path| {
                let meta = self.adapter.read_meta(&payload_path, &|name| dtype_lookup(&schema, name))?;
                Ok(Array::from_meta(
                    self.ctx.clone(),
                    self.adapter.clone(),
                    self.meta.name.clone(),
                    schema.clone(),
                    location.clone(),
                    meta,
                ))
            })
            .collect()
    }

    /// Every VArray header in this collection (only valid on a varray-typed
    /// collection); tile Arrays sharing the same data tree are not listed here.
    ///
    /// # Errors
    /// Returns [`Error::InvalidManagerCall`] if this is an array-typed
    /// collection, or [`Error::Io`]/[`Error::MetaData`] on a read failure.
    pub fn varrays(&self) -> Result<Vec<VArray>> {
        if self.meta.collection_type != CollectionType::VArray {
            return Err(Error::InvalidManagerCall(
                "varrays() is only valid on a varray-typed collection".into(),
            ));
        }
        let varray_schema = self.meta.varray_schema()?;
        let tile_schema = varray_schema.tile_schema()?;
        let location = self.varray_location();
        let mut out = Vec::new();
        for payload_path in path::walk_payload_paths(&location.data_dir)? {
            let meta = self.adapter.read_meta(&payload_path, &|name| dtype_lookup(&tile_schema, name))?;
            // A tile carries "vid" among its own primary attributes; a header never does.
            if meta.primary_attributes.iter().any(|(n, _)| n == "vid") {
                continue;
            }
            out.push(VArray::from_meta(
                self.ctx.clone(),
                self.adapter.clone(),
                self.meta.name.clone(),
                varray_schema.clone(),
                location.clone(),
                meta,
            ));
        }
        Ok(out)
    }

    /// Reset every Array/VArray in this collection to its fill value,
    /// preserving metadata.
    ///
    /// # Errors
    /// Returns [`Error::Io`]/[`Error::Locked`] on a read/lock failure.
    pub fn clear(&self) -> Result<()> {
        match self.meta.collection_type {
            CollectionType::Array => {
                for a in self.arrays()? {
                    a.index(&[])?.clear()?;
                }
            }
            CollectionType::VArray => {
                for v in self.varrays()? {
                    v.index(&[])?.clear()?;
                }
            }
        }
        Ok(())
    }

    /// Remove this collection entirely: all payloads, symlinks, metadata,
    /// and its permanent creation-lock sentinel.
    ///
    /// # Errors
    /// Returns [`Error::Io`] on an underlying removal failure.
    pub fn delete(&self) -> Result<()> {
        std::fs::remove_dir_all(&self.root).map_err(|e| Error::io(&self.root, e))?;
        let lock_path = self.ctx.root.join(COLLECTIONS_DIRECTORY).join(format!("{}.lock", self.meta.name));
        let _ = std::fs::remove_file(&lock_path);
        Ok(())
    }

    fn resolve_array_filter(&self, criteria: &AttributeMap) -> Result<Option<Array>> {
        if self.meta.collection_type != CollectionType::Array {
            return Err(Error::InvalidManagerCall(
                "filter() on this query is only valid on an array-typed collection".into(),
            ));
        }
        let location = self.array_location();
        if let Some(id) = id_only_criteria(criteria)? {
            let payload_path = path::payload_path(&location.data_dir, &id);
            if !payload_path.is_file() {
                return Ok(None);
            }
            return Ok(Some(Array::open(
                self.ctx.clone(),
                self.adapter.clone(),
                self.meta.name.clone(),
                self.meta.array_schema.clone(),
                location,
                id,
            )?));
        }
        ensure_complete_primary_key(&self.meta.array_schema, criteria)?;
        let ordered = array::ordered_primary_values(&self.meta.array_schema, criteria);
        match path::lookup_symlink(&location.symlinks_dir, &ordered)? {
            None => Ok(None),
            Some((id, _)) => Ok(Some(Array::open(
                self.ctx.clone(),
                self.adapter.clone(),
                self.meta.name.clone(),
                self.meta.array_schema.clone(),
                location,
                id,
            )?)),
        }
    }

    fn resolve_varray_filter(&self, criteria: &AttributeMap) -> Result<Option<VArray>> {
        if self.meta.collection_type != CollectionType::VArray {
            return Err(Error::InvalidManagerCall(
                "filter() on this query is only valid on a varray-typed collection".into(),
            ));
        }
        let varray_schema = self.meta.varray_schema()?;
        let location = self.varray_location();
        if let Some(id) = id_only_criteria(criteria)? {
            let payload_path = path::payload_path(&location.data_dir, &id);
            if !payload_path.is_file() {
                return Ok(None);
            }
            return Ok(Some(VArray::open(
                self.ctx.clone(),
                self.adapter.clone(),
                self.meta.name.clone(),
                varray_schema,
                location,
                id,
            )?));
        }
        ensure_complete_primary_key(varray_schema.array_schema(), criteria)?;
        let ordered = array::ordered_primary_values(varray_schema.array_schema(), criteria);
        match path::lookup_symlink(&location.symlinks_dir, &ordered)? {
            None => Ok(None),
            Some((id, _)) => Ok(Some(VArray::open(
                self.ctx.clone(),
                self.adapter.clone(),
                self.meta.name.clone(),
                varray_schema,
                location,
                id,
            )?)),
        }
    }
}

fn id_only_criteria(criteria: &AttributeMap) -> Result<Option<String>> {
    if criteria.len() != 1 || criteria[0].0 != "id" {
        return Ok(None);
    }
    match &criteria[0].1 {
        AttributeValue::Str(id) => Ok(Some(id.clone())),
        _ => Err(Error::Filter("\"id\" filter value must be a string".into())),
    }
}

fn ensure_complete_primary_key(schema: &ArraySchema, criteria: &AttributeMap) -> Result<()> {
    let declared: HashSet<&str> = schema.primary_attributes().iter().map(|a| a.name()).collect();
    let supplied: HashSet<&str> = criteria.iter().map(|(n, _)| n.as_str()).collect();
    if declared != supplied {
        return Err(Error::Filter(
            "filter() requires either {\"id\": <string>} or a complete set of primary attribute values".into(),
        ));
    }
    Ok(())
}

/// A filter query built by [`Collection::filter`]: supports only an id
/// lookup or a complete primary-attribute key lookup (§4.9); partial or
/// custom-attribute filtering fails with [`Error::Filter`].
#[derive(Debug)]
pub struct Filter<'c> {
    collection: &'c Collection,
    criteria: AttributeMap,
}

impl Filter<'_> {
    /// Resolve the matching Array, if this is an array-typed collection.
    ///
    /// # Errors
    /// Returns [`Error::Filter`] if the criteria are neither an id lookup
    /// nor a complete primary-attribute key, or [`Error::InvalidManagerCall`]
    /// if this is a varray-typed collection.
    pub fn first(&self) -> Result<Option<Array>> {
        self.collection.resolve_array_filter(&self.criteria)
    }

    /// Identical to [`Filter::first`]: an id or complete primary-key lookup
    /// addresses at most one entity, so there is no meaningful "last" distinct from "first".
    ///
    /// # Errors
    /// See [`Filter::first`].
    pub fn last(&self) -> Result<Option<Array>> {
        self.first()
    }

    /// Resolve the matching VArray header, if this is a varray-typed collection.
    ///
    /// # Errors
    /// See [`Filter::first`], but for [`VArray`] and requiring a varray-typed collection.
    pub fn first_varray(&self) -> Result<Option<VArray>> {
        self.collection.resolve_varray_filter(&self.criteria)
    }

    /// See [`Filter::first_varray`].
    ///
    /// # Errors
    /// See [`Filter::first_varray`].
    pub fn last_varray(&self) -> Result<Option<VArray>> {
        self.first_varray()
    }
}
