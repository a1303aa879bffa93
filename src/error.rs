//! Crate-level error umbrella and the shared on-disk format error.

use thiserror::Error;

use crate::{
    config::ConfigError,
    consolidator::{ConsolidationError, ConsolidationPlanError},
    crypto::CryptoError,
    directory::DirectoryError,
    fragment::FragmentError,
    reader::ReadError,
    schema::SchemaError,
    tile::TileError,
    vacuum::VacuumError,
    vfs::StorageError,
};

/// Malformed names, corrupt tile preambles and unsupported format versions.
/// Never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// A file name does not follow `__<t_start>_<t_end>_<uuid>[_<version>]`.
    #[error("malformed name `{name}`: {reason}")]
    MalformedName {
        /// Offending name.
        name: String,
        /// What failed to parse.
        reason: &'static str,
    },
    /// A tile record could not be decoded.
    #[error("corrupt tile: {0}")]
    CorruptTile(&'static str),
    /// A tile exceeds the `u32` size fields of the preamble.
    #[error("tile of {0} bytes exceeds the preamble size limit")]
    TileTooLarge(usize),
    /// A format version newer than this build understands.
    #[error("unsupported format version {found} (newest supported is {supported})")]
    UnsupportedVersion {
        /// Version found on disk.
        found: u32,
        /// Newest version this build reads.
        supported: u32,
    },
}

/// Coarse classification of failures, following the storage engine's
/// error taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed name, corrupt tile, unsupported version.
    Format,
    /// Filesystem or object-store failure.
    StorageIo,
    /// Wrong or missing encryption key.
    Crypto,
    /// Fragment metadata failed structural or checksum validation.
    CorruptMetadata,
    /// Output buffer cannot hold a single cell.
    BufferUndersized,
    /// Consolidation inputs are inconsistent.
    ConsolidationPlan,
    /// The operation observed its cancellation token.
    Cancelled,
    /// Invalid arguments, schema or configuration.
    Invalid,
}

/// Any error surfaced by the public API.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Format failure.
    #[error(transparent)]
    Format(#[from] FormatError),
    /// Encryption failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// Tile decode failure.
    #[error(transparent)]
    Tile(#[from] TileError),
    /// Fragment read/write failure.
    #[error(transparent)]
    Fragment(#[from] FragmentError),
    /// Directory listing or classification failure.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    /// Query failure.
    #[error(transparent)]
    Read(#[from] ReadError),
    /// Consolidation failure.
    #[error(transparent)]
    Consolidation(#[from] ConsolidationError),
    /// Vacuum failure.
    #[error(transparent)]
    Vacuum(#[from] VacuumError),
    /// Schema failure.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Array metadata document failure.
    #[error("malformed array metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl Error {
    /// Classify the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Storage(_) => ErrorClass::StorageIo,
            Error::Format(_) => ErrorClass::Format,
            Error::Crypto(_) => ErrorClass::Crypto,
            Error::Tile(err) => err.class(),
            Error::Fragment(err) => err.class(),
            Error::Directory(err) => err.class(),
            Error::Read(err) => err.class(),
            Error::Consolidation(err) => err.class(),
            Error::Vacuum(err) => err.class(),
            Error::Schema(_) | Error::Config(_) => ErrorClass::Invalid,
            Error::Metadata(_) => ErrorClass::Format,
        }
    }
}

impl From<ConsolidationPlanError> for Error {
    fn from(err: ConsolidationPlanError) -> Self {
        Error::Consolidation(ConsolidationError::Plan(err))
    }
}

/// Result alias used by the public API.
pub type Result<T, E = Error> = std::result::Result<T, E>;
