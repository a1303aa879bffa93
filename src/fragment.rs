//! Fragments: immutable, timestamp-ranged units of array data.
//!
//! A fragment lives in `__fragments/<name>/` and becomes visible only once its
//! commit marker `__commits/<name>.wrt` exists. Names encode the fragment's
//! timestamp range, a ULID and the format version:
//! `__<t_start>_<t_end>_<uuid>_<version>`.

mod cells;
mod metadata;
mod writer;

use std::{cmp::Ordering, fmt};

use thiserror::Error;

pub use self::cells::CellColumns;
pub(crate) use self::cells::column_array;
pub use self::metadata::{FragmentMetadata, TileLocation};
pub(crate) use self::metadata::FragmentHandle;
pub(crate) use self::writer::{FragmentWriter, PendingFragment};
use crate::{
    error::{ErrorClass, FormatError},
    id::{FragmentId, next_fragment_id},
    schema::SchemaError,
    tile::TileError,
    timestamp::{Timestamp, TimestampRange},
    vfs::{Path, StorageError},
};

/// Format version written by this build.
pub const FORMAT_VERSION: u32 = 3;
/// First format version whose fragments may carry per-cell timestamps and may
/// therefore be read with partial window overlap.
pub const TIMESTAMPS_MIN_VERSION: u32 = 2;
/// Version assumed for names without a version suffix.
pub const LEGACY_VERSION: u32 = 1;

/// Directory of schema documents.
pub const SCHEMA_DIR: &str = "__schema";
/// Directory of fragment data directories.
pub const FRAGMENTS_DIR: &str = "__fragments";
/// Directory of commit and vacuum markers.
pub const COMMITS_DIR: &str = "__commits";
/// Directory of array metadata documents.
pub const META_DIR: &str = "__meta";
/// Fragment metadata file inside a fragment directory.
pub const METADATA_FILE: &str = "__fragment_metadata.tdb";
/// Commit marker extension.
pub const WRT_SUFFIX: &str = "wrt";
/// Vacuum marker extension.
pub const VAC_SUFFIX: &str = "vac";

/// Errors raised while writing or loading a fragment.
#[derive(Debug, Error)]
pub enum FragmentError {
    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Tile failure on a data tile.
    #[error(transparent)]
    Tile(#[from] TileError),
    /// Malformed name or unsupported version.
    #[error(transparent)]
    Format(#[from] FormatError),
    /// Fragment metadata failed validation.
    #[error("corrupt metadata for fragment `{fragment}`: {reason}")]
    CorruptMetadata {
        /// Fragment name.
        fragment: String,
        /// Validation failure.
        reason: String,
    },
    /// Input batch does not match the schema.
    #[error("input does not match the array schema: {0}")]
    SchemaMismatch(String),
    /// Schema failure.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// Two cells in one write share coordinates on a no-dups array.
    #[error("duplicate coordinates {0:?} in a write to an array without duplicates")]
    DuplicateCoordinates(Vec<i128>),
    /// Coordinate outside the dimension domain.
    #[error("coordinate {value} of dimension `{dimension}` is outside the domain")]
    OutOfDomain {
        /// Dimension name.
        dimension: String,
        /// Offending value.
        value: i128,
    },
    /// Cells handed to the global-order writer were not in global order.
    #[error("cells are not in global order")]
    UnsortedInput,
}

impl FragmentError {
    /// Taxonomy class of this failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            FragmentError::Storage(_) => ErrorClass::StorageIo,
            FragmentError::Tile(err) => err.class(),
            FragmentError::Format(_) => ErrorClass::Format,
            FragmentError::CorruptMetadata { .. } => ErrorClass::CorruptMetadata,
            FragmentError::SchemaMismatch(_)
            | FragmentError::Schema(_)
            | FragmentError::DuplicateCoordinates(_)
            | FragmentError::OutOfDomain { .. }
            | FragmentError::UnsortedInput => ErrorClass::Invalid,
        }
    }
}

/// Split `name.ext` into stem and extension.
pub(crate) fn split_suffix(file_name: &str) -> (&str, Option<&str>) {
    match file_name.split_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (file_name, None),
    }
}

/// Parsed `__<t_start>_<t_end>_<uuid>[_<version>]` name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FragmentName {
    range: TimestampRange,
    uuid: String,
    version: u32,
}

impl FragmentName {
    /// Fresh name with a new ULID at the current format version.
    pub fn generate(range: TimestampRange) -> Self {
        Self::with_id(range, next_fragment_id())
    }

    /// Name with an explicit id.
    pub fn with_id(range: TimestampRange, id: FragmentId) -> Self {
        Self {
            range,
            uuid: id.to_string(),
            version: FORMAT_VERSION,
        }
    }

    /// Override the format version, used for legacy fixtures.
    #[must_use]
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Parse a name without extension.
    pub fn parse(name: &str) -> Result<Self, FormatError> {
        let malformed = |reason| FormatError::MalformedName {
            name: name.to_string(),
            reason,
        };
        let body = name.strip_prefix("__").ok_or_else(|| malformed("missing `__` prefix"))?;
        let parts: Vec<&str> = body.split('_').collect();
        if parts.len() != 3 && parts.len() != 4 {
            return Err(malformed("expected `<t_start>_<t_end>_<uuid>[_<version>]`"));
        }
        let start: u64 = parts[0].parse().map_err(|_| malformed("bad start timestamp"))?;
        let end: u64 = parts[1].parse().map_err(|_| malformed("bad end timestamp"))?;
        if start > end {
            return Err(malformed("start timestamp after end timestamp"));
        }
        let uuid = parts[2];
        if uuid.is_empty() || !uuid.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(malformed("bad uuid"));
        }
        let version = match parts.get(3) {
            Some(raw) => raw.parse().map_err(|_| malformed("bad format version"))?,
            None => LEGACY_VERSION,
        };
        if version > FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion {
                found: version,
                supported: FORMAT_VERSION,
            });
        }
        Ok(Self {
            range: TimestampRange::new(start, end),
            uuid: uuid.to_string(),
            version,
        })
    }

    /// Timestamp range encoded in the name.
    pub fn range(&self) -> TimestampRange {
        self.range
    }

    /// First timestamp.
    pub fn start(&self) -> Timestamp {
        self.range.start
    }

    /// Last timestamp.
    pub fn end(&self) -> Timestamp {
        self.range.end
    }

    /// Unique id.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Format version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Whether the fragment's format supports per-cell timestamps.
    pub fn supports_timestamps(&self) -> bool {
        self.version >= TIMESTAMPS_MIN_VERSION
    }

    /// Name of the commit marker.
    pub fn commit_file(&self) -> String {
        format!("{self}.{WRT_SUFFIX}")
    }

    /// Name of the vacuum marker.
    pub fn vac_file(&self) -> String {
        format!("{self}.{VAC_SUFFIX}")
    }

    /// Fragment data directory under an array root.
    pub fn data_dir(&self, array: &Path) -> Path {
        array.child(FRAGMENTS_DIR).child(self.to_string().as_str())
    }
}

impl fmt::Display for FragmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "__{}_{}_{}_{}",
            self.range.start, self.range.end, self.uuid, self.version
        )
    }
}

impl Ord for FragmentName {
    /// `(t_start, t_end, uuid)`: ULIDs break ties in write order.
    fn cmp(&self, other: &Self) -> Ordering {
        self.range
            .start
            .cmp(&other.range.start)
            .then(self.range.end.cmp(&other.range.end))
            .then_with(|| self.uuid.cmp(&other.uuid))
            .then(self.version.cmp(&other.version))
    }
}

impl PartialOrd for FragmentName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
