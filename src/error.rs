//! The crate's unified error type.

use std::path::PathBuf;

use crate::varray::tiling::ArrayPosition;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A single tile failure collected during a `VArray` fan-out operation.
#[derive(Debug, thiserror::Error)]
#[error("tile {position:?}: {source}")]
pub struct TileError {
    /// The tile that failed.
    pub position: ArrayPosition,
    /// The underlying failure.
    #[source]
    pub source: Error,
}

/// All errors raised by the engine.
///
/// Every public operation fails with one of these variants rather than a
/// bare string; callers can match on kind instead of parsing a message.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Client construction, URI parsing, plugin discovery, or use of a closed client.
    #[error("client error: {0}")]
    Client(String),

    /// A schema, attribute, name, dtype, or shape input failed validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// A declared schema is malformed.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// Persisted metadata is malformed or carries an unsupported version.
    #[error("metadata error: {0}")]
    MetaData(String),

    /// A collection with this name already exists at the storage root.
    #[error("collection already exists: {0}")]
    CollectionAlreadyExists(String),

    /// No collection with this name exists at the storage root.
    #[error("collection does not exist: {0}")]
    CollectionNotExists(String),

    /// Invalid subset input data for an Array operation.
    #[error("array error: {0}")]
    Array(String),

    /// A buffer's dtype is incompatible with the array's declared dtype.
    #[error("array type error: expected {expected}, found {found}")]
    ArrayType {
        /// The dtype declared by the schema.
        expected: String,
        /// The dtype actually supplied.
        found: String,
    },

    /// A filter expression used unknown keys, or a shape not supported by the engine.
    #[error("filter error: {0}")]
    Filter(String),

    /// A lock could not be acquired within the configured timeout.
    #[error("locked: {0}")]
    Locked(String),

    /// An operation was attempted on a handle whose entity has been deleted.
    #[error("instance does not exist: {0}")]
    InstanceNotExists(String),

    /// A manager was accessed on a collection that does not support it (e.g. `.varrays()` on an array-only collection).
    #[error("invalid manager call: {0}")]
    InvalidManagerCall(String),

    /// A Subset operation failed.
    #[error("subset error: {0}")]
    Subset(String),

    /// A VSubset operation failed; some tiles may have already been written.
    #[error("vsubset error: operation may have partially applied ({} tile failures)", .0.len())]
    VSubset(Vec<TileError>),

    /// The pre-flight memory check exceeded the configured limit.
    #[error("memory error: requested {requested} bytes exceeds limit of {limit} bytes")]
    Memory {
        /// Bytes the operation would have required.
        requested: u64,
        /// The limit it was checked against.
        limit: u64,
    },

    /// The integrity checker found an inconsistency (stop-on-error mode).
    #[error("integrity error: {0}")]
    Integrity(String),

    /// An indexer was malformed or out of range.
    #[error("index error: {0}")]
    Index(String),

    /// An I/O failure not otherwise classified above.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// The path the failing operation targeted.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Wrap a [`std::io::Error`] with the path that produced it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
