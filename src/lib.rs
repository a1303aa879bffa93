#![deny(missing_docs)]
//! Timestamped sparse array fragments with consolidation, vacuum and
//! time-travel reads.
//!
//! An array is a directory of immutable fragments, each stamped with the
//! timestamp range it was written in. Reads open the array at a timestamp
//! window and merge the visible fragments in global cell order. Consolidation
//! merges runs of fragments into one, keeping per-cell write timestamps so
//! that older windows stay readable after the merge. Vacuum deletes what a
//! consolidation superseded.

mod observability;

/// Array handle.
pub mod array;

/// Typed configuration over the `sm.*` keys.
pub mod config;

/// Fragment and array-metadata consolidation.
pub mod consolidator;

/// Tile encryption.
pub mod crypto;

/// Directory snapshot and fragment visibility.
pub mod directory;

/// Error umbrella and taxonomy.
pub mod error;

/// Fragment naming, metadata and writing.
pub mod fragment;

/// Fragment identifiers.
pub mod id;

/// Array key/value metadata.
pub mod metadata;

/// Sparse global-order reads.
pub mod reader;

/// Array schema and cell order.
pub mod schema;

/// Tile records, filters and generic tiles.
pub mod tile;

/// Write timestamps and windows.
pub mod timestamp;

/// Deletion of superseded files.
pub mod vacuum;

/// Storage abstraction.
pub mod vfs;

pub use crate::{
    array::Array,
    config::Config,
    consolidator::{ConsolidationReport, Consolidator},
    directory::{ArrayDirectory, DirectoryMode},
    error::{Error, ErrorClass, Result},
    fragment::FragmentName,
    reader::{Query, QueryBuffers, QueryStatus, ReadLayout, ReadRequest},
    schema::{ArraySchema, Attribute, Datatype, Dimension, Layout, Subarray},
    timestamp::{Timestamp, TimestampRange},
    vacuum::{Vacuum, VacuumReport},
    vfs::{FusioVfs, Path, Vfs},
};
