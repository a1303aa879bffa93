//! The resumable read position.

use std::collections::VecDeque;

use super::QueryStatus;
use crate::schema::{FieldId, Subarray};

/// Opaque resumption token of a read.
///
/// Holds, per fragment, the planned tile list, the index of the next tile to
/// load and the tiles currently loaded with an intra-tile cell cursor. The
/// reader never keeps a position anywhere else.
#[derive(Debug, Default)]
pub struct ReadState {
    pub(super) status: Option<QueryStatus>,
    pub(super) plan: Option<ReadPlan>,
    pub(super) cursors: Vec<FragmentCursor>,
    /// Newest version seen so far of the coordinates being deduplicated.
    pub(super) pending: Option<PendingCell>,
}

impl ReadState {
    /// State of a read that has not started.
    pub fn new() -> Self {
        Self::default()
    }

    /// Status reached by the last advance.
    pub fn status(&self) -> QueryStatus {
        self.status.unwrap_or(QueryStatus::Uninitialized)
    }

    /// Tiles currently held in memory across all fragments.
    pub fn loaded_tiles(&self) -> usize {
        self.cursors.iter().map(|c| c.loaded.len()).sum()
    }
}

/// Decisions fixed at initialization.
#[derive(Debug)]
pub(super) struct ReadPlan {
    /// Fields loaded from every tile, dimensions first.
    pub(super) fields: Vec<FieldId>,
    pub(super) subarray: Option<Subarray>,
    /// Fragments whose cells are merged in global order. When false cells are
    /// returned fragment by fragment.
    pub(super) merge: bool,
    pub(super) dedup: bool,
}

#[derive(Debug, Default)]
pub(super) struct FragmentCursor {
    /// Planned tile indices after MBR pruning.
    pub(super) tiles: Vec<usize>,
    /// Position in `tiles` of the next tile to load.
    pub(super) next: usize,
    pub(super) loaded: VecDeque<LoadedTile>,
    pub(super) loaded_bytes: u64,
    /// Timestamps must be compared against the window cell by cell.
    pub(super) filter_timestamps: bool,
    pub(super) load_timestamps: bool,
}

impl FragmentCursor {
    pub(super) fn has_unloaded(&self) -> bool {
        self.next < self.tiles.len()
    }

    pub(super) fn is_done(&self) -> bool {
        self.loaded.is_empty() && !self.has_unloaded()
    }

    /// Drop the front tile once every cell has been consumed.
    pub(super) fn release_consumed(&mut self) {
        while let Some(front) = self.loaded.front() {
            if front.pos < front.len {
                break;
            }
            self.loaded_bytes = self.loaded_bytes.saturating_sub(front.bytes);
            self.loaded.pop_front();
        }
    }
}

/// A cell held back until every version of its coordinates has been seen.
#[derive(Debug)]
pub(super) struct PendingCell {
    pub(super) key: Vec<i128>,
    /// One cell of every loaded field, in the plan's field order.
    pub(super) columns: Vec<Vec<u8>>,
    pub(super) timestamp: u64,
}

/// One decoded tile with its cell cursor.
#[derive(Debug)]
pub(super) struct LoadedTile {
    /// Raw columns by field, in the plan's field order.
    pub(super) columns: Vec<Vec<u8>>,
    /// Coordinates widened to `i128`, `dim_num` per cell.
    pub(super) coords: Vec<i128>,
    pub(super) timestamps: Option<Vec<u64>>,
    pub(super) len: usize,
    pub(super) pos: usize,
    /// Persisted bytes charged against the budget.
    pub(super) bytes: u64,
}

impl LoadedTile {
    pub(super) fn coords_at(&self, row: usize, dim_num: usize) -> &[i128] {
        &self.coords[row * dim_num..(row + 1) * dim_num]
    }
}
