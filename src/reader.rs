//! Sparse reads across many fragments.
//!
//! A read is driven through [`Query::submit`]: each call fills the caller's
//! [`QueryBuffers`] with the next cells in output order and reports
//! [`QueryStatus::Incomplete`] until every visible cell has been returned. The
//! resumable position lives in an explicit [`ReadState`] token, advanced by
//! [`SparseGlobalOrderReader::advance`].

mod buffers;
mod global_order;
mod merge;
mod state;

use thiserror::Error;

pub use self::buffers::{FieldBuffer, QueryBuffers};
pub use self::global_order::SparseGlobalOrderReader;
pub use self::state::ReadState;
use crate::{
    config::{Config, ReaderVariant},
    error::ErrorClass,
    fragment::FragmentError,
    schema::Subarray,
};

/// Failures of a read.
#[derive(Debug, Error)]
pub enum ReadError {
    /// Loading fragment metadata or a tile failed.
    #[error(transparent)]
    Fragment(#[from] FragmentError),
    /// A buffer cannot hold a single cell of its field.
    #[error("buffer for `{field}` holds {capacity} bytes, one cell needs {cell_size}")]
    BufferUndersized {
        /// Field name.
        field: String,
        /// Bytes per cell.
        cell_size: usize,
        /// Buffer capacity in bytes.
        capacity: usize,
    },
    /// A buffer names a field the schema does not define, or one that was not
    /// part of the first submit.
    #[error("unknown field `{0}`")]
    UnknownField(String),
    /// A fragment overlaps the window only partially and carries no
    /// per-cell timestamps to filter by.
    #[error("fragment `{fragment}` partially overlaps the read window but has no timestamps tile")]
    MissingTimestamps {
        /// Fragment name.
        fragment: String,
    },
    /// The read observed its cancellation token.
    #[error("read cancelled")]
    Cancelled,
    /// Submit was called after the query completed.
    #[error("query already completed")]
    Completed,
}

impl ReadError {
    /// Taxonomy class of this failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            ReadError::Fragment(err) => err.class(),
            ReadError::BufferUndersized { .. } => ErrorClass::BufferUndersized,
            ReadError::UnknownField(_) | ReadError::Completed => ErrorClass::Invalid,
            ReadError::MissingTimestamps { .. } => ErrorClass::Format,
            ReadError::Cancelled => ErrorClass::Cancelled,
        }
    }
}

/// Lifecycle of a read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStatus {
    /// Nothing planned yet.
    Uninitialized,
    /// Tile lists planned, no cells returned.
    Initialized,
    /// More cells remain; submit again.
    Incomplete,
    /// Every visible cell has been returned.
    Complete,
}

/// Order of returned cells.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadLayout {
    /// Canonical global order across all fragments.
    #[default]
    GlobalOrder,
    /// No order guarantee. Arrays with duplicates return fragment by fragment.
    Unordered,
}

/// What a query should return.
#[derive(Clone, Debug, Default)]
pub struct ReadRequest {
    /// Output order.
    pub layout: ReadLayout,
    /// Also return per-cell write timestamps.
    pub timestamps: bool,
    /// Coordinate restriction.
    pub subarray: Option<Subarray>,
}

impl ReadRequest {
    /// Global-order read of everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the output order.
    #[must_use]
    pub fn layout(mut self, layout: ReadLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Return per-cell timestamps.
    #[must_use]
    pub fn with_timestamps(mut self) -> Self {
        self.timestamps = true;
        self
    }

    /// Restrict coordinates.
    #[must_use]
    pub fn subarray(mut self, subarray: Subarray) -> Self {
        self.subarray = Some(subarray);
        self
    }
}

/// Tunables of one reader instance.
#[derive(Clone, Debug)]
pub struct ReaderOptions {
    /// Bytes of loaded tiles shared by all fragments.
    pub tile_budget: u64,
    /// Budgeted multi-pass reader or single-pass legacy reader.
    pub variant: ReaderVariant,
    /// Coalesce overlapping subarray ranges before filtering.
    pub merge_overlapping_ranges: bool,
    /// Concurrent tile loads.
    pub io_concurrency: usize,
    /// Reading on behalf of a consolidation: timestamps are always loaded.
    pub consolidation: bool,
}

impl ReaderOptions {
    /// Options for an ordinary read.
    pub fn from_config(config: &Config) -> Self {
        Self {
            tile_budget: config.reader_tile_budget(),
            variant: config.sparse_global_order_reader,
            merge_overlapping_ranges: config.merge_overlapping_ranges,
            io_concurrency: config.io_concurrency_level.max(1),
            consolidation: false,
        }
    }

    /// Options for the read side of a consolidation.
    pub fn for_consolidation(config: &Config) -> Self {
        Self {
            tile_budget: config.consolidation_reader_budget(),
            consolidation: true,
            ..Self::from_config(config)
        }
    }
}

/// A read in progress: a reader plus its resumable state.
pub struct Query {
    reader: SparseGlobalOrderReader,
    state: Option<ReadState>,
    status: QueryStatus,
}

impl Query {
    /// Wrap a reader.
    pub fn new(reader: SparseGlobalOrderReader) -> Self {
        Self {
            reader,
            state: Some(ReadState::new()),
            status: QueryStatus::Uninitialized,
        }
    }

    /// Current status.
    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// Fill `buffers` with the next cells. Buffers are cleared first, so each
    /// call returns only new cells. A failed submit ends the query.
    pub async fn submit(&mut self, buffers: &mut QueryBuffers) -> Result<QueryStatus, ReadError> {
        let state = self.state.take().ok_or(ReadError::Completed)?;
        let (state, status) = self.reader.advance(state, buffers).await?;
        self.status = status;
        if status != QueryStatus::Complete {
            self.state = Some(state);
        }
        Ok(status)
    }
}
