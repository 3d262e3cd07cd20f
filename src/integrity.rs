//! Integrity Checker (C10): a four-level chain of responsibility walking a
//! storage root's on-disk state independently of any handle's in-memory
//! view, grounded on the teacher's own consistency-checking instincts in
//! `storage/store/filesystem.rs` (stray lock/temp-file cleanup) but widened
//! into an explicit, levelled sweep since this engine's on-disk layout
//! (symlink index, advisory lock sentinels, per-entity payload headers) has
//! more ways to drift from a handle's expectations than a content-addressed
//! chunk store does.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::array::ordered_primary_values;
use crate::client::ClientContext;
use crate::collection::Collection;
use crate::config::{
    ARRAY_DATA_DIRECTORY, ARRAY_SYMLINKS_DIRECTORY, COLLECTIONS_DIRECTORY, VARRAY_DATA_DIRECTORY,
    VARRAY_SYMLINKS_DIRECTORY,
};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::indexing::AxisIndex;
use crate::lock::{self, LockKind};
use crate::metadata::{AttributeMap, CollectionType};
use crate::path;
use crate::schema::ArraySchema;
use crate::storage_adapter::{FilesystemStorageAdapter, StorageAdapter};

/// How far [`check`] walks its chain of responsibility; each level only
/// runs if the requested level is at least as deep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IntegrityLevel {
    /// Every collection has its lock sentinel and vice versa.
    Collections,
    /// No stray create-locks, leftover read-locks, or foreign varray-locks;
    /// every payload's metadata deserializes.
    Arrays,
    /// Every Array/tile's symlink index entry resolves back to its payload.
    Paths,
    /// Each payload's last cell reads back with the schema's declared dtype.
    Data,
}

/// A single inconsistency accumulated by [`check`] in `stop_on_error=false`
/// mode; in `stop_on_error=true` mode the first one is raised directly as
/// [`Error::Integrity`] instead.
#[derive(Debug, Clone)]
pub struct IntegrityIssue {
    /// The collection this issue belongs to (an orphaned collection lock is
    /// attributed to the name it names, even though no such collection exists).
    pub collection: String,
    /// Which level of the chain raised this issue.
    pub category: &'static str,
    /// A human-readable description of the inconsistency.
    pub message: String,
}

/// The accumulated result of a non-stopping [`check`] run.
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    /// Whether the checked levels found nothing wrong.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    /// Every accumulated issue, in the order the chain discovered them.
    #[must_use]
    pub fn issues(&self) -> &[IntegrityIssue] {
        &self.issues
    }
}

impl fmt::Display for IntegrityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.issues.is_empty() {
            return writeln!(f, "integrity check passed: no issues found");
        }
        let mut collections: Vec<&str> = Vec::new();
        for issue in &self.issues {
            if !collections.contains(&issue.collection.as_str()) {
                collections.push(&issue.collection);
            }
        }
        for collection in collections {
            writeln!(f, "collection {collection}:")?;
            for category in ["collections", "arrays", "paths", "data"] {
                let matching: Vec<&IntegrityIssue> = self
                    .issues
                    .iter()
                    .filter(|i| i.collection == collection && i.category == category)
                    .collect();
                if matching.is_empty() {
                    continue;
                }
                writeln!(f, "  {category}:")?;
                for issue in matching {
                    writeln!(f, "    - {}", issue.message)?;
                }
            }
        }
        Ok(())
    }
}

fn record(
    stop_on_error: bool,
    issues: &mut Vec<IntegrityIssue>,
    collection: &str,
    category: &'static str,
    message: impl Into<String>,
) -> Result<()> {
    let message = message.into();
    if stop_on_error {
        return Err(Error::Integrity(format!("[{collection}:{category}] {message}")));
    }
    issues.push(IntegrityIssue {
        collection: collection.to_string(),
        category,
        message,
    });
    Ok(())
}

/// Run the chain of responsibility up to `level` over `collections`.
///
/// # Errors
/// In `stop_on_error` mode, returns [`Error::Integrity`] on the first
/// inconsistency found; otherwise only returns an error on an underlying
/// I/O or metadata failure unrelated to the condition being checked.
pub fn check(
    ctx: &Arc<ClientContext>,
    collections: &[Collection],
    level: IntegrityLevel,
    stop_on_error: bool,
) -> Result<IntegrityReport> {
    let mut issues = Vec::new();

    check_collections(ctx, collections, stop_on_error, &mut issues)?;

    if level >= IntegrityLevel::Arrays {
        for collection in collections {
            check_stray_locks(ctx, collection, stop_on_error, &mut issues)?;
            let entities = gather_entities(ctx, collection, stop_on_error, &mut issues)?;

            if level >= IntegrityLevel::Paths {
                for entity in &entities {
                    check_path(ctx, collection, entity, stop_on_error, &mut issues)?;
                }
            }
            if level >= IntegrityLevel::Data {
                for entity in &entities {
                    check_data(entity, collection.name(), stop_on_error, &mut issues)?;
                }
            }
        }
    }

    Ok(IntegrityReport { issues })
}

fn dtype_lookup(schema: &ArraySchema, name: &str) -> Option<DType> {
    schema.attributes().iter().find(|a| a.name() == name).map(|a| a.dtype())
}

/// Level 1: every collection has a `<name>.lock` sentinel, and every
/// `*.lock` file under the collections root names a real collection.
fn check_collections(
    ctx: &ClientContext,
    collections: &[Collection],
    stop_on_error: bool,
    issues: &mut Vec<IntegrityIssue>,
) -> Result<()> {
    let collections_root = ctx.root.join(COLLECTIONS_DIRECTORY);
    let names: HashSet<&str> = collections.iter().map(Collection::name).collect();

    for name in &names {
        let lock_path = collections_root.join(format!("{name}.lock"));
        if !lock_path.is_file() {
            record(
                stop_on_error,
                issues,
                name,
                "collections",
                format!("missing sentinel lock {}", lock_path.display()),
            )?;
        }
    }

    if collections_root.is_dir() {
        for entry in std::fs::read_dir(&collections_root).map_err(|e| Error::io(&collections_root, e))? {
            let entry = entry.map_err(|e| Error::io(&collections_root, e))?;
            let file_name = entry.file_name();
            let entry_name = file_name.to_string_lossy();
            if let Some(stem) = entry_name.strip_suffix(".lock") {
                if !names.contains(stem) {
                    record(
                        stop_on_error,
                        issues,
                        stem,
                        "collections",
                        "lock sentinel has no corresponding collection",
                    )?;
                }
            }
        }
    }
    Ok(())
}

/// Level 2 (locks): no stray create-locks, leftover read-locks, or foreign
/// varray-locks -- a lock sentinel naming a pid that is no longer alive.
fn check_stray_locks(
    ctx: &ClientContext,
    collection: &Collection,
    stop_on_error: bool,
    issues: &mut Vec<IntegrityIssue>,
) -> Result<()> {
    let collection_root = ctx.root.join(COLLECTIONS_DIRECTORY).join(collection.name());
    for (kind, label) in [
        (LockKind::CreateArray, "stray create-lock"),
        (LockKind::ReadArray, "leftover read-lock"),
        (LockKind::WriteVArray, "foreign varray-lock"),
    ] {
        for descriptor in lock::scan_locks(&collection_root, Some(kind))? {
            let stale = descriptor.pid.map_or(true, |pid| !lock::process_is_alive(pid));
            if stale {
                record(
                    stop_on_error,
                    issues,
                    collection.name(),
                    "arrays",
                    format!("{label} at {}", descriptor.path.display()),
                )?;
            }
        }
    }
    Ok(())
}

/// A single discovered payload, resolved enough to drive the Paths/Data levels.
struct Entity {
    id: String,
    payload_path: PathBuf,
    primary: AttributeMap,
    schema: ArraySchema,
    /// A VArray header's declared shape is virtual and never materialized
    /// at once (its own payload body stays empty); the Data level only
    /// makes sense against a real, single-tile-sized payload.
    is_varray_header: bool,
}

/// Level 2 (metadata): walk every payload under the collection and attempt
/// to deserialize its metadata, recording a failure per payload that does
/// not parse rather than aborting the whole collection.
fn gather_entities(
    ctx: &ClientContext,
    collection: &Collection,
    stop_on_error: bool,
    issues: &mut Vec<IntegrityIssue>,
) -> Result<Vec<Entity>> {
    let collection_root = ctx.root.join(COLLECTIONS_DIRECTORY).join(collection.name());
    let adapter = FilesystemStorageAdapter;
    let mut entities = Vec::new();

    match collection.collection_type() {
        CollectionType::Array => {
            let schema = collection.schema().clone();
            let data_dir = collection_root.join(ARRAY_DATA_DIRECTORY);
            for payload_path in path::walk_payload_paths(&data_dir)? {
                match adapter.read_meta(&payload_path, &|name| dtype_lookup(&schema, name)) {
                    Ok(meta) => entities.push(Entity {
                        id: meta.id,
                        payload_path,
                        primary: meta.primary_attributes,
                        schema: schema.clone(),
                        is_varray_header: false,
                    }),
                    Err(e) => record(
                        stop_on_error,
                        issues,
                        collection.name(),
                        "arrays",
                        format!("{}: metadata does not deserialize: {e}", payload_path.display()),
                    )?,
                }
            }
        }
        CollectionType::VArray => {
            let varray_schema = collection.varray_schema()?;
            let tile_schema = varray_schema.tile_schema()?;
            let data_dir = collection_root.join(VARRAY_DATA_DIRECTORY);
            for payload_path in path::walk_payload_paths(&data_dir)? {
                match adapter.read_meta(&payload_path, &|name| dtype_lookup(&tile_schema, name)) {
                    Ok(meta) => {
                        let is_tile = meta.primary_attributes.iter().any(|(n, _)| n == "vid");
                        let schema = if is_tile {
                            tile_schema.clone()
                        } else {
                            varray_schema.array_schema().clone()
                        };
                        entities.push(Entity {
                            id: meta.id,
                            payload_path,
                            primary: meta.primary_attributes,
                            schema,
                            is_varray_header: !is_tile,
                        });
                    }
                    Err(e) => record(
                        stop_on_error,
                        issues,
                        collection.name(),
                        "arrays",
                        format!("{}: metadata does not deserialize: {e}", payload_path.display()),
                    )?,
                }
            }
        }
    }
    Ok(entities)
}

/// Level 3: an Array with no primary attributes needs only one resolvable
/// symlink to its payload; one with primary attributes needs its symlink
/// directory to hold exactly one entry, and that entry to resolve to it.
fn check_path(
    ctx: &ClientContext,
    collection: &Collection,
    entity: &Entity,
    stop_on_error: bool,
    issues: &mut Vec<IntegrityIssue>,
) -> Result<()> {
    let collection_root = ctx.root.join(COLLECTIONS_DIRECTORY).join(collection.name());
    let symlinks_dir = match collection.collection_type() {
        CollectionType::Array => collection_root.join(ARRAY_SYMLINKS_DIRECTORY),
        CollectionType::VArray => collection_root.join(VARRAY_SYMLINKS_DIRECTORY),
    };

    if entity.schema.primary_attributes().is_empty() {
        let expected = path::symlink_path(&symlinks_dir, &[], &entity.id);
        if !symlink_resolves_to(&expected, &entity.payload_path) {
            record(
                stop_on_error,
                issues,
                collection.name(),
                "paths",
                format!("{}: no resolvable symlink at {}", entity.id, expected.display()),
            )?;
        }
        return Ok(());
    }

    let ordered = ordered_primary_values(&entity.schema, &entity.primary);
    let dir = path::symlink_dir(&symlinks_dir, &ordered);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries.collect::<std::io::Result<Vec<_>>>().map_err(|e| Error::io(&dir, e))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            record(
                stop_on_error,
                issues,
                collection.name(),
                "paths",
                format!("{}: missing symlink directory {}", entity.id, dir.display()),
            )?;
            return Ok(());
        }
        Err(e) => return Err(Error::io(&dir, e)),
    };
    let gv_entries: Vec<_> = entries
        .into_iter()
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some(path::PAYLOAD_EXT))
        .collect();
    if gv_entries.len() != 1 {
        record(
            stop_on_error,
            issues,
            collection.name(),
            "paths",
            format!(
                "{}: symlink directory {} contains {} entries, expected exactly 1",
                entity.id,
                dir.display(),
                gv_entries.len()
            ),
        )?;
        return Ok(());
    }

    let expected = path::symlink_path(&symlinks_dir, &ordered, &entity.id);
    if !symlink_resolves_to(&expected, &entity.payload_path) {
        record(
            stop_on_error,
            issues,
            collection.name(),
            "paths",
            format!("{}: symlink {} does not resolve to its payload", entity.id, expected.display()),
        )?;
    }
    Ok(())
}

fn symlink_resolves_to(symlink_file: &Path, payload_path: &Path) -> bool {
    let Ok(target) = std::fs::read_link(symlink_file) else {
        return false;
    };
    let resolved = symlink_file.parent().unwrap_or_else(|| Path::new(".")).join(target);
    match (std::fs::canonicalize(&resolved), std::fs::canonicalize(payload_path)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Level 4: reading the last cell of the payload returns a buffer whose
/// dtype matches the schema.
fn check_data(
    entity: &Entity,
    collection_name: &str,
    stop_on_error: bool,
    issues: &mut Vec<IntegrityIssue>,
) -> Result<()> {
    if entity.is_varray_header {
        return Ok(());
    }
    let shape = entity.schema.shape();
    if shape.iter().any(|&n| n == 0) {
        return Ok(());
    }
    let bounds: Vec<AxisIndex> = shape
        .iter()
        .map(|&n| AxisIndex::Range {
            start: (n - 1) as i64,
            stop: n as i64,
        })
        .collect();
    let dtype = entity.schema.dtype();
    let fill_value = entity.schema.fill_value();
    let adapter = FilesystemStorageAdapter;
    match adapter.read_data(&entity.payload_path, &bounds, &shape, dtype, fill_value) {
        Ok(buffer) => {
            if buffer.dtype() != dtype {
                record(
                    stop_on_error,
                    issues,
                    collection_name,
                    "data",
                    format!(
                        "{}: last-cell read returned dtype {:?}, expected {:?}",
                        entity.id,
                        buffer.dtype(),
                        dtype
                    ),
                )?;
            }
        }
        Err(e) => record(
            stop_on_error,
            issues,
            collection_name,
            "data",
            format!("{}: could not read last cell: {e}", entity.id),
        )?,
    }
    Ok(())
}
