//! Merge step over loaded tiles.
//!
//! The merge is a synchronous pass over fully loaded tiles: it never waits on
//! I/O. It stops when the output buffers are full, when every cell is
//! consumed, or when a fragment that still has unloaded tiles runs out of
//! loaded cells, since that fragment could hold the next cell in order.

use std::{cmp::Ordering, collections::BinaryHeap};

use super::{
    QueryBuffers,
    state::{FragmentCursor, LoadedTile, PendingCell, ReadPlan},
};
use crate::{schema::GlobalOrder, timestamp::TimestampRange};

/// Where an output buffer's bytes come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Output {
    /// Column `index` of the plan's loaded fields, `size` bytes per cell.
    Column { index: usize, size: usize },
    /// Per-cell write timestamp.
    Timestamps,
}

impl Output {
    fn size(self) -> usize {
        match self {
            Output::Column { size, .. } => size,
            Output::Timestamps => 8,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum MergeStop {
    BufferFull,
    NeedTiles,
    Exhausted,
}

/// Read-only inputs of a merge pass.
pub(super) struct MergeInput<'a> {
    pub(super) order: &'a GlobalOrder,
    pub(super) dim_num: usize,
    pub(super) window: TimestampRange,
    /// `t_start` of every fragment, the timestamp of cells without a
    /// timestamps tile.
    pub(super) starts: &'a [u64],
    pub(super) plan: &'a ReadPlan,
    pub(super) outputs: &'a [Output],
}

impl MergeInput<'_> {
    fn timestamp(&self, fragment: usize, tile: &LoadedTile, row: usize) -> u64 {
        tile.timestamps
            .as_ref()
            .map_or(self.starts[fragment], |ts| ts[row])
    }

    fn passes(&self, fragment: usize, cursor: &FragmentCursor, tile: &LoadedTile, row: usize) -> bool {
        if let Some(subarray) = &self.plan.subarray {
            if !subarray.contains(tile.coords_at(row, self.dim_num)) {
                return false;
            }
        }
        !cursor.filter_timestamps
            || self
                .window
                .contains(crate::timestamp::Timestamp::new(self.timestamp(fragment, tile, row)))
    }

    /// Skip filtered cells and consumed tiles. `true` when a cell is ready.
    fn seek(&self, fragment: usize, cursor: &mut FragmentCursor) -> bool {
        loop {
            cursor.release_consumed();
            let Some(tile) = cursor.loaded.front() else {
                return false;
            };
            if self.passes(fragment, cursor, tile, tile.pos) {
                return true;
            }
            if let Some(tile) = cursor.loaded.front_mut() {
                tile.pos += 1;
            }
        }
    }

    fn front_key(&self, cursor: &FragmentCursor) -> Vec<i128> {
        match cursor.loaded.front() {
            Some(tile) => self.order.key(tile.coords_at(tile.pos, self.dim_num)),
            None => Vec::new(),
        }
    }

    fn front_timestamp(&self, fragment: usize, cursor: &FragmentCursor) -> u64 {
        cursor
            .loaded
            .front()
            .map_or(0, |tile| self.timestamp(fragment, tile, tile.pos))
    }

    fn entry(&self, fragment: usize, cursor: &FragmentCursor) -> HeapEntry {
        HeapEntry {
            key: self.front_key(cursor),
            timestamp: self.front_timestamp(fragment, cursor),
            fragment,
        }
    }

    fn has_room(&self, buffers: &mut QueryBuffers) -> bool {
        buffers
            .fields_mut()
            .zip(self.outputs)
            .all(|((_, buffer), output)| buffer.has_room(output.size()))
    }

    fn copy_front(&self, fragment: usize, cursor: &FragmentCursor, buffers: &mut QueryBuffers) {
        let Some(tile) = cursor.loaded.front() else {
            return;
        };
        let row = tile.pos;
        for ((_, buffer), output) in buffers.fields_mut().zip(self.outputs) {
            match *output {
                Output::Column { index, size } => {
                    buffer.push(&tile.columns[index][row * size..(row + 1) * size]);
                }
                Output::Timestamps => {
                    buffer.push(&self.timestamp(fragment, tile, row).to_le_bytes());
                }
            }
        }
        buffers.add_cell();
    }

    /// Detach the front cell so it outlives its tile.
    fn take_front(&self, fragment: usize, cursor: &FragmentCursor, key: Vec<i128>) -> Option<PendingCell> {
        let tile = cursor.loaded.front()?;
        let row = tile.pos;
        let columns = tile
            .columns
            .iter()
            .map(|column| {
                let size = column.len() / tile.len.max(1);
                column[row * size..(row + 1) * size].to_vec()
            })
            .collect();
        Some(PendingCell {
            key,
            columns,
            timestamp: self.timestamp(fragment, tile, row),
        })
    }

    fn copy_pending(&self, cell: &PendingCell, buffers: &mut QueryBuffers) {
        for ((_, buffer), output) in buffers.fields_mut().zip(self.outputs) {
            match *output {
                Output::Column { index, .. } => buffer.push(&cell.columns[index]),
                Output::Timestamps => buffer.push(&cell.timestamp.to_le_bytes()),
            }
        }
        buffers.add_cell();
    }
}

fn step(cursor: &mut FragmentCursor) {
    if let Some(tile) = cursor.loaded.front_mut() {
        tile.pos += 1;
    }
}

fn starved(cursors: &[FragmentCursor]) -> bool {
    cursors.iter().any(|c| c.loaded.is_empty() && c.has_unloaded())
}

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    key: Vec<i128>,
    timestamp: u64,
    fragment: usize,
}

impl Ord for HeapEntry {
    /// Min-heap on `(key, timestamp, fragment)`: among equal coordinates the
    /// oldest write surfaces first and the most recent fragment last.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.timestamp.cmp(&self.timestamp))
            .then_with(|| other.fragment.cmp(&self.fragment))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// K-way merge in global order.
///
/// Cells sharing coordinates surface in `(timestamp, fragment)` order. On
/// arrays without duplicates each such cell replaces `pending`, and
/// `pending` is emitted once the next cell has other coordinates, so the
/// newest write wins even when its versions span tiles or submits.
pub(super) fn merge_global(
    input: &MergeInput<'_>,
    cursors: &mut [FragmentCursor],
    pending: &mut Option<PendingCell>,
    buffers: &mut QueryBuffers,
) -> (usize, MergeStop) {
    let mut heap = BinaryHeap::with_capacity(cursors.len());
    for (fragment, cursor) in cursors.iter_mut().enumerate() {
        if input.seek(fragment, cursor) {
            heap.push(input.entry(fragment, cursor));
        }
    }
    let mut emitted = 0;
    loop {
        if starved(cursors) {
            return (emitted, MergeStop::NeedTiles);
        }
        if let Some(cell) = pending.as_ref() {
            if heap.peek().is_none_or(|next| next.key != cell.key) {
                if !input.has_room(buffers) {
                    return (emitted, MergeStop::BufferFull);
                }
                input.copy_pending(cell, buffers);
                *pending = None;
                emitted += 1;
                continue;
            }
        }
        let Some(top) = heap.pop() else {
            return (emitted, MergeStop::Exhausted);
        };
        let cursor = &mut cursors[top.fragment];
        if input.plan.dedup {
            *pending = input.take_front(top.fragment, cursor, top.key);
        } else {
            if !input.has_room(buffers) {
                heap.push(top);
                return (emitted, MergeStop::BufferFull);
            }
            input.copy_front(top.fragment, cursor, buffers);
            emitted += 1;
        }
        step(cursor);
        if input.seek(top.fragment, cursor) {
            heap.push(input.entry(top.fragment, cursor));
        }
    }
}

/// Fragment-then-cell order, used for unordered reads of arrays with
/// duplicates.
pub(super) fn merge_sequential(
    input: &MergeInput<'_>,
    cursors: &mut [FragmentCursor],
    buffers: &mut QueryBuffers,
) -> (usize, MergeStop) {
    let mut emitted = 0;
    loop {
        let Some(fragment) = cursors.iter().position(|c| !c.is_done()) else {
            return (emitted, MergeStop::Exhausted);
        };
        let cursor = &mut cursors[fragment];
        if !input.seek(fragment, cursor) {
            if cursor.has_unloaded() {
                return (emitted, MergeStop::NeedTiles);
            }
            continue;
        }
        if !input.has_room(buffers) {
            return (emitted, MergeStop::BufferFull);
        }
        input.copy_front(fragment, cursor, buffers);
        emitted += 1;
        step(cursor);
    }
}
