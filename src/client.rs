//! Collection & Client (C9): the top-level handle opened against a storage
//! root URI, owning the shared [`Config`], worker pool, and storage-adapter
//! registry every [`Collection`]/[`Array`](crate::array::Array)/
//! [`VArray`](crate::varray::VArray) handle borrows -- per §9's "no
//! process-global state" design note, mirrored from the teacher's
//! `Store`-holding root object but without its chunk-key storage trait,
//! since this engine's payload driver lives in [`StorageAdapterRegistry`] instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::collection::Collection;
use crate::config::{Config, COLLECTIONS_DIRECTORY, CURRENT_METADATA_VERSION};
use crate::error::{Error, Result};
use crate::integrity::{self, IntegrityLevel, IntegrityReport};
use crate::lock::{self, CollectionCreateGuard, LockDescriptor, LockKind};
use crate::metadata::{CollectionMetadata, CollectionType};
use crate::pool::Pool;
use crate::schema::{ArraySchema, VArraySchema};
use crate::storage_adapter::StorageAdapterRegistry;

/// Shared state every Collection/Array/VArray handle borrows: the resolved
/// config, the worker pool used for `VArray` tile fan-out, and the
/// storage-adapter registry.
#[derive(Debug)]
pub struct ClientContext {
    pub(crate) root: PathBuf,
    pub(crate) config: Config,
    pub(crate) adapter_registry: StorageAdapterRegistry,
    pub(crate) pool: Pool,
}

/// The top-level handle opened against a storage root (§4.9, §6).
#[derive(Debug, Clone)]
pub struct Client {
    ctx: Arc<ClientContext>,
    closed: Arc<AtomicBool>,
}

impl Client {
    /// Open (initializing if necessary) the storage root named by `uri`.
    ///
    /// Only the `file://<absolute path>` scheme is supported; see
    /// [`Client::open_with`] to register additional storage-adapter drivers
    /// or override the engine's default [`Config`].
    ///
    /// # Errors
    /// Returns [`Error::Client`] if `uri` does not use the `file://` scheme
    /// or names a non-absolute path, or [`Error::Io`] if the root cannot be
    /// created/accessed.
    pub fn open(uri: &str) -> Result<Self> {
        Self::open_with(uri, StorageAdapterRegistry::with_builtins(), Config::builder().build()?)
    }

    /// Open a storage root with an explicit adapter registry and config.
    ///
    /// # Errors
    /// See [`Client::open`].
    pub fn open_with(uri: &str, adapter_registry: StorageAdapterRegistry, config: Config) -> Result<Self> {
        let root = parse_storage_root(uri)?;
        let collections_root = root.join(COLLECTIONS_DIRECTORY);
        std::fs::create_dir_all(&collections_root).map_err(|e| Error::io(&collections_root, e))?;
        let pool = Pool::new(config.workers())?;
        let ctx = Arc::new(ClientContext {
            root,
            config,
            adapter_registry,
            pool,
        });
        tracing::info!(root = %ctx.root.display(), "opened client");
        Ok(Self {
            ctx,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub(crate) fn context(&self) -> Arc<ClientContext> {
        self.ctx.clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Client("client is closed".into()));
        }
        Ok(())
    }

    fn collections_root(&self) -> PathBuf {
        self.ctx.root.join(COLLECTIONS_DIRECTORY)
    }

    fn collection_root(&self, name: &str) -> PathBuf {
        self.collections_root().join(name)
    }

    /// Create a new array-typed collection.
    ///
    /// # Errors
    /// Returns [`Error::CollectionAlreadyExists`] if `name` is already
    /// taken, [`Error::Locked`] if the creation lock cannot be acquired, or
    /// [`Error::Io`]/[`Error::MetaData`] on a persistence failure.
    pub fn create_collection(
        &self,
        name: &str,
        schema: ArraySchema,
        options: Option<serde_json::Value>,
    ) -> Result<Collection> {
        self.create_collection_meta(
            name,
            CollectionMetadata {
                name: name.to_string(),
                collection_type: CollectionType::Array,
                storage_adapter: "filesystem".to_string(),
                options,
                metadata_version: CURRENT_METADATA_VERSION.to_string(),
                array_schema: schema,
                varray_vgrid: None,
            },
        )
    }

    /// Create a new varray-typed collection.
    ///
    /// # Errors
    /// See [`Client::create_collection`].
    pub fn create_varray_collection(
        &self,
        name: &str,
        schema: VArraySchema,
        options: Option<serde_json::Value>,
    ) -> Result<Collection> {
        self.create_collection_meta(
            name,
            CollectionMetadata {
                name: name.to_string(),
                collection_type: CollectionType::VArray,
                storage_adapter: "filesystem".to_string(),
                options,
                metadata_version: CURRENT_METADATA_VERSION.to_string(),
                array_schema: schema.array_schema().clone(),
                varray_vgrid: Some(schema.vgrid().to_vec()),
            },
        )
    }

    fn create_collection_meta(&self, name: &str, meta: CollectionMetadata) -> Result<Collection> {
        self.ensure_open()?;
        if name.trim().is_empty() {
            return Err(Error::Validation("collection name must be non-blank".into()));
        }
        let collections_root = self.collections_root();
        let _guard = CollectionCreateGuard::acquire(&collections_root, name, &self.ctx.config)?;

        let collection_root = self.collection_root(name);
        let meta_path = collection_root.join("collection.json");
        if meta_path.exists() {
            return Err(Error::CollectionAlreadyExists(name.to_string()));
        }
        std::fs::create_dir_all(&collection_root).map_err(|e| Error::io(&collection_root, e))?;
        let bytes = serde_json::to_vec_pretty(&meta.to_json())
            .map_err(|e| Error::MetaData(format!("could not serialize collection metadata: {e}")))?;
        std::fs::write(&meta_path, bytes).map_err(|e| Error::io(&meta_path, e))?;

        tracing::info!(collection = %name, "created collection");
        Collection::open(self.ctx.clone(), meta)
    }

    /// Open an existing collection by name.
    ///
    /// # Errors
    /// Returns [`Error::CollectionNotExists`] if no collection with this
    /// name exists, or [`Error::MetaData`] if its metadata cannot be parsed.
    pub fn get_collection(&self, name: &str) -> Result<Collection> {
        self.ensure_open()?;
        let meta_path = self.collection_root(name).join("collection.json");
        let bytes = std::fs::read(&meta_path).map_err(|_| Error::CollectionNotExists(name.to_string()))?;
        let meta = CollectionMetadata::from_slice(&bytes)?;
        Collection::open(self.ctx.clone(), meta)
    }

    /// Reconstruct a [`Collection`] handle directly from an already-parsed
    /// metadata record, used to round-trip a collection description
    /// obtained out of band.
    ///
    /// # Errors
    /// Returns [`Error::CollectionNotExists`] if this storage root has no
    /// directory for `meta.name`.
    pub fn collection_from_dict(&self, meta: CollectionMetadata) -> Result<Collection> {
        self.ensure_open()?;
        if !self.collection_root(&meta.name).is_dir() {
            return Err(Error::CollectionNotExists(meta.name.clone()));
        }
        Collection::open(self.ctx.clone(), meta)
    }

    /// Every collection under this storage root, in directory-listing order.
    ///
    /// # Errors
    /// Returns [`Error::Io`] on a directory read failure, or
    /// [`Error::MetaData`] if a collection's metadata cannot be parsed.
    pub fn collections(&self) -> Result<Vec<Collection>> {
        self.ensure_open()?;
        let root = self.collections_root();
        let mut out = Vec::new();
        if !root.is_dir() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(&root).map_err(|e| Error::io(&root, e))? {
            let entry = entry.map_err(|e| Error::io(&root, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let meta_path = entry.path().join("collection.json");
            if !meta_path.is_file() {
                continue;
            }
            let bytes = std::fs::read(&meta_path).map_err(|e| Error::io(&meta_path, e))?;
            let meta = CollectionMetadata::from_slice(&bytes)?;
            out.push(Collection::open(self.ctx.clone(), meta)?);
        }
        Ok(out)
    }

    /// Run the integrity checker (§4.10) up to `level`, over either a single
    /// named collection or every collection on this storage root.
    ///
    /// # Errors
    /// Returns [`Error::Integrity`] in `stop_on_error` mode on the first
    /// inconsistency found, or [`Error::Io`] if `report_path` could not be written.
    pub fn check_integrity(
        &self,
        level: IntegrityLevel,
        stop_on_error: bool,
        report_path: Option<&Path>,
        collection: Option<&str>,
    ) -> Result<IntegrityReport> {
        self.ensure_open()?;
        let collections = match collection {
            Some(name) => vec![self.get_collection(name)?],
            None => self.collections()?,
        };
        let report = integrity::check(&self.ctx, &collections, level, stop_on_error)?;
        if let Some(path) = report_path {
            std::fs::write(path, report.to_string()).map_err(|e| Error::io(path, e))?;
        }
        Ok(report)
    }

    /// Sum payload file sizes under each collection's data directories.
    ///
    /// # Errors
    /// Returns [`Error::Io`] on a directory walk failure.
    pub fn calculate_storage_size(&self, collection: Option<&str>) -> Result<HashMap<String, u64>> {
        self.ensure_open()?;
        let names: Vec<String> = match collection {
            Some(name) => vec![name.to_string()],
            None => self.collections()?.into_iter().map(|c| c.name().to_string()).collect(),
        };
        let mut sizes = HashMap::new();
        for name in names {
            let total = collection_storage_size(&self.collection_root(&name))?;
            sizes.insert(name, total);
        }
        Ok(sizes)
    }

    /// Discover lock files under this storage root (or a single collection).
    ///
    /// # Errors
    /// Returns [`Error::Io`] on a directory walk failure.
    pub fn get_locks(&self, collection: Option<&str>, kind: Option<LockKind>) -> Result<Vec<LockDescriptor>> {
        self.ensure_open()?;
        let root = match collection {
            Some(name) => self.collection_root(name),
            None => self.collections_root(),
        };
        lock::scan_locks(&root, kind)
    }

    /// Remove every stale lock file under this storage root (or a single
    /// collection) that no live process holds.
    ///
    /// # Errors
    /// Returns [`Error::Io`] on an unexpected I/O failure.
    pub fn clear_locks(&self, collection: Option<&str>) -> Result<usize> {
        self.ensure_open()?;
        let root = match collection {
            Some(name) => self.collection_root(name),
            None => self.collections_root(),
        };
        lock::clear_stale_locks(&root)
    }

    /// Close this client. Further calls on it, or any of its clones, fail
    /// with [`Error::Client`]; handles already obtained from it
    /// (Collections, Arrays, Subsets) remain usable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        tracing::info!(root = %self.ctx.root.display(), "closed client");
    }
}

fn collection_storage_size(collection_root: &Path) -> Result<u64> {
    use crate::config::{ARRAY_DATA_DIRECTORY, VARRAY_DATA_DIRECTORY};
    let mut total = 0u64;
    for dir in [ARRAY_DATA_DIRECTORY, VARRAY_DATA_DIRECTORY] {
        for payload in crate::path::walk_payload_paths(&collection_root.join(dir))? {
            total += std::fs::metadata(&payload).map_err(|e| Error::io(&payload, e))?.len();
        }
    }
    Ok(total)
}

fn parse_storage_root(uri: &str) -> Result<PathBuf> {
    let path_str = uri
        .strip_prefix("file://")
        .ok_or_else(|| Error::Client(format!("unsupported storage URI scheme: {uri}")))?;
    let path = PathBuf::from(path_str);
    if !path.is_absolute() {
        return Err(Error::Client(format!(
            "storage root must be an absolute path: {path_str}"
        )));
    }
    std::fs::create_dir_all(&path).map_err(|e| Error::io(&path, e))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_and_non_file_uris() {
        assert!(matches!(Client::open("relative/path").unwrap_err(), Error::Client(_)));
        assert!(matches!(Client::open("http://example.com").unwrap_err(), Error::Client(_)));
    }

    #[test]
    fn closed_client_refuses_further_collection_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::open(&format!("file://{}", dir.path().display())).unwrap();
        client.close();
        assert!(matches!(client.collections().unwrap_err(), Error::Client(_)));
    }

    #[test]
    fn duplicate_collection_name_is_rejected() {
        use crate::dtype::DType;
        use crate::schema::{ArraySchema, AttributeSchema, DimensionSchema};

        let dir = tempfile::tempdir().unwrap();
        let client = Client::open(&format!("file://{}", dir.path().display())).unwrap();
        let schema = || {
            ArraySchema::new(
                DType::F64,
                None,
                vec![DimensionSchema::generic("x", 4, None, None).unwrap()],
                vec![AttributeSchema::new("key", DType::I64, true).unwrap()],
            )
            .unwrap()
        };
        client.create_collection("weather", schema(), None).unwrap();
        let err = client.create_collection("weather", schema(), None).unwrap_err();
        assert!(matches!(err, Error::CollectionAlreadyExists(_)));
    }
}
