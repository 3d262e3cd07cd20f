//! Path & Id (C3): deterministic main/symlink paths from id and key
//! attributes, grounded on `deker.tools.path`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::dtype::FillValue;
use crate::error::{Error, Result};

/// The file extension used for payload files.
pub const PAYLOAD_EXT: &str = "gv";

/// A primary attribute's serialized path component, in schema declaration order.
#[derive(Debug, Clone)]
pub enum AttributeValue {
    /// Stored as a plain integer string.
    Int(i64),
    /// Stored as a plain float string.
    Float(f64),
    /// Stored verbatim.
    Str(String),
    /// Stored as RFC-3339 UTC.
    DateTime(DateTime<Utc>),
    /// Stored as dash-joined stringified elements.
    Tuple(Vec<String>),
}

impl AttributeValue {
    /// Render this value the way it appears as a path component.
    #[must_use]
    pub fn to_path_component(&self) -> String {
        match self {
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Str(s) => s.clone(),
            Self::DateTime(dt) => dt.to_rfc3339(),
            Self::Tuple(parts) => parts.join("-"),
        }
    }
}

/// Split an id at its first `-`, treating the first component
/// character-by-character as nested directories and keeping the remainder
/// as a single folder name.
///
/// This produces the filesystem fan-out index described in §4.3: e.g. id
/// `ab12-cdef...` yields directories `a/b/1/2` then folder `cdef...`.
#[must_use]
pub fn main_path(root: &Path, id: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    let (head, rest) = id.split_once('-').unwrap_or((id, ""));
    for ch in head.chars() {
        path.push(ch.to_string());
    }
    path.push(rest);
    path
}

/// The payload file path for an id rooted at `data_dir` (the `array_data`
/// or `varray_data` directory).
#[must_use]
pub fn payload_path(data_dir: &Path, id: &str) -> PathBuf {
    main_path(data_dir, id).join(format!("{id}.{PAYLOAD_EXT}"))
}

/// The symlink path for a set of primary attribute values, ordered by
/// schema declaration order, rooted at `symlinks_dir` (the
/// `array_symlinks`/`varray_symlinks` directory).
#[must_use]
pub fn symlink_dir(symlinks_dir: &Path, ordered_values: &[AttributeValue]) -> PathBuf {
    let mut path = symlinks_dir.to_path_buf();
    for value in ordered_values {
        path.push(value.to_path_component());
    }
    path
}

/// The symlink file path (the symlink directory plus the payload's file name).
#[must_use]
pub fn symlink_path(symlinks_dir: &Path, ordered_values: &[AttributeValue], id: &str) -> PathBuf {
    symlink_dir(symlinks_dir, ordered_values).join(format!("{id}.{PAYLOAD_EXT}"))
}

/// Resolve an existing Array/tile by its full ordered primary-attribute key,
/// via the symlink index: used by Collection's full-primary-key filter
/// fast-path and the VArray engine's tile lookup.
///
/// Returns `Ok(None)` if no entry directory exists for this key. A matching
/// directory is expected to contain exactly one `.gv` entry (the id is not
/// known in advance, only the ordered key); any entry found is used.
///
/// # Errors
/// Returns [`Error::Io`] if the directory exists but cannot be read.
pub fn lookup_symlink(symlinks_dir: &Path, ordered_values: &[AttributeValue]) -> Result<Option<(String, PathBuf)>> {
    let dir = symlink_dir(symlinks_dir, ordered_values);
    if !dir.is_dir() {
        return Ok(None);
    }
    for entry in std::fs::read_dir(&dir).map_err(|e| Error::io(&dir, e))? {
        let entry = entry.map_err(|e| Error::io(&dir, e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(PAYLOAD_EXT) {
            let id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(ToString::to_string)
                .unwrap_or_default();
            return Ok(Some((id, path)));
        }
    }
    Ok(None)
}

/// Walk `data_dir` collecting every payload file path (the `.gv` extension),
/// used by Collection's `arrays`/`varrays` managers, the VArray engine's
/// tile deletion fan-out, and the integrity checker's per-Array sweep.
///
/// # Errors
/// Returns [`Error::Io`] on a directory walk failure.
pub fn walk_payload_paths(data_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    if !data_dir.is_dir() {
        return Ok(paths);
    }
    for entry in walkdir::WalkDir::new(data_dir) {
        let entry = entry.map_err(|e| {
            Error::io(
                e.path().unwrap_or(data_dir).to_path_buf(),
                std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            )
        })?;
        if entry.file_type().is_file() && entry.path().extension().and_then(|e| e.to_str()) == Some(PAYLOAD_EXT) {
            paths.push(entry.path().to_path_buf());
        }
    }
    Ok(paths)
}

/// Render a fill value as its path-safe stringified form (used for the
/// `options`/`fill_value` metadata tag, not for symlink attribute values).
#[must_use]
pub fn fill_value_to_string(fill_value: FillValue) -> String {
    match fill_value {
        FillValue::Int(i) => i.to_string(),
        FillValue::Float(f) => f.to_string(),
        FillValue::Complex(c) => format!("({}+{}j)", c.re, c.im),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_id_character_by_character() {
        let root = Path::new("/root");
        let path = main_path(root, "ab12-cdef0001");
        assert_eq!(path, Path::new("/root/a/b/1/2/cdef0001"));
    }

    #[test]
    fn id_without_dash_is_kept_whole_with_empty_remainder() {
        let root = Path::new("/root");
        let path = main_path(root, "abcd");
        assert_eq!(path, Path::new("/root/a/b/c/d/"));
    }

    #[test]
    fn symlink_path_orders_attributes_and_appends_filename() {
        let dir = Path::new("/root/array_symlinks");
        let values = vec![AttributeValue::Int(3), AttributeValue::Str("x".into())];
        let path = symlink_path(dir, &values, "myid");
        assert_eq!(path, Path::new("/root/array_symlinks/3/x/myid.gv"));
    }
}
