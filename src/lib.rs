//! gridvault is a storage engine for collections of multidimensional
//! arrays and virtual (tiled) arrays, built for scientific and gridded
//! data (weather, geospatial, time series) where arrays share a common
//! schema and are addressable by semantic attributes rather than just
//! position.
//!
//! A storage root holds a set of named [`Collection`](crate::collection::Collection)s, each
//! backed by either plain [`Array`](crate::array::Array)s or [`VArray`](crate::varray::VArray)s --
//! logical arrays transparently tiled into a regular grid of physical
//! [`Array`](crate::array::Array) tiles. All access goes through a [`Client`](crate::client::Client),
//! which owns the resolved [`Config`](crate::config::Config), the storage-adapter registry, and the
//! shared worker [`Pool`](crate::pool::Pool) used to fan `VArray` operations out across tiles.
//!
//! ## Layout
//! - [`schema`] -- dimension/attribute/array/varray schemas (C1).
//! - [`indexing`] -- fancy-indexer resolution and shape arithmetic (C2).
//! - [`path`] -- deterministic id/attribute-driven on-disk paths (C3).
//! - [`metadata`] -- collection and array metadata codecs (C4).
//! - [`lock`] -- the six advisory file-lock kinds (C5).
//! - [`storage_adapter`] -- the payload-driver interface and its filesystem implementation (C6).
//! - [`array`] -- single-Array lifecycle and [`Subset`](crate::array::Subset) operations (C7).
//! - [`varray`] -- `VArray` tile fan-out and `VSubset` operations (C8).
//! - [`collection`] and [`client`] -- Collection lifecycle and the top-level entry point (C9).
//! - [`integrity`] -- the multi-level integrity checker (C10).
//!
//! ## Example
//! ```no_run
//! use gridvault::client::Client;
//! use gridvault::dtype::DType;
//! use gridvault::schema::{ArraySchema, AttributeSchema, DimensionSchema};
//!
//! # fn main() -> gridvault::error::Result<()> {
//! let client = Client::open("file:///tmp/gridvault-example")?;
//! let schema = ArraySchema::new(
//!     DType::F64,
//!     None,
//!     vec![DimensionSchema::generic("x", 360, None, None)?],
//!     vec![AttributeSchema::new("station", DType::Str, true)?],
//! )?;
//! let collection = client.create_collection("stations", schema, None)?;
//! # Ok(())
//! # }
//! ```

#![warn(unused_variables)]
#![warn(dead_code)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![deny(clippy::missing_panics_doc)]

/// Array Engine (C7): single-Array lifecycle and `Subset` operations.
pub mod array;
/// Collection & Client (C9): the top-level storage-root handle.
pub mod client;
/// Collection & Client (C9): named, schema-typed groups of Arrays/VArrays.
pub mod collection;
/// Engine-wide configuration: worker count, lock timeouts, memory limit.
pub mod config;
/// Normalized element types and the typed buffers that carry array data.
pub mod dtype;
/// The crate's unified error type.
pub mod error;
/// Addressing & Slicer (C2): fancy-indexer resolution and shape arithmetic.
pub mod indexing;
/// Integrity Checker (C10): the multi-level chain-of-responsibility validator.
pub mod integrity;
/// Lock Manager (C5): the six advisory file-lock kinds.
pub mod lock;
/// Metadata Codec (C4): Collection and Array metadata serialization.
pub mod metadata;
/// Path & Id (C3): deterministic main/symlink paths from id and key attributes.
pub mod path;
/// A small worker pool abstraction used for `VArray` tile fan-out.
pub mod pool;
/// Schema & Dimensions (C1): dimensions, attributes, array and varray schemas.
pub mod schema;
/// Storage Adapter (C6): the payload-driver interface and filesystem implementation.
pub mod storage_adapter;
/// VArray Engine (C8): tile fan-out and `VSubset` operations.
pub mod varray;
