//! Budgeted multi-pass reader.
//!
//! Each pass loads tiles for the fragments whose loaded cells ran low, within
//! a per-fragment share of the tile budget, then merges what is in memory
//! until the buffers fill or some fragment needs its next tile.

use std::sync::Arc;

use futures::{StreamExt, TryStreamExt, future::try_join_all, stream};
use tokio_util::sync::CancellationToken;

use super::{
    QueryBuffers, QueryStatus, ReadError, ReadLayout, ReadRequest, ReaderOptions,
    merge::{self, MergeInput, MergeStop, Output},
    state::{FragmentCursor, LoadedTile, ReadPlan, ReadState},
};
use crate::{
    config::ReaderVariant,
    crypto::EncryptionKey,
    fragment::{FragmentError, FragmentMetadata},
    observability::{log_debug, log_warn},
    schema::{ArraySchema, FieldId, GlobalOrder},
    tile::{FilterPipeline, decode_timestamps},
    timestamp::TimestampRange,
    vfs::{Path, Vfs},
};

/// Reads cells of many fragments in global order under a memory budget.
///
/// The reader is stateless between calls: every position lives in the
/// [`ReadState`] passed to [`advance`](Self::advance).
pub struct SparseGlobalOrderReader {
    vfs: Arc<dyn Vfs>,
    array_uri: Path,
    schema: Arc<ArraySchema>,
    fragments: Vec<Arc<FragmentMetadata>>,
    window: TimestampRange,
    request: ReadRequest,
    options: ReaderOptions,
    key: Option<EncryptionKey>,
    cancel: CancellationToken,
    order: GlobalOrder,
    starts: Vec<u64>,
}

/// One tile scheduled for loading.
struct TileJob {
    fragment: usize,
    tile: usize,
    bytes: u64,
}

impl SparseGlobalOrderReader {
    /// Reader over `fragments`, which must be sorted oldest first.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vfs: Arc<dyn Vfs>,
        array_uri: Path,
        schema: Arc<ArraySchema>,
        fragments: Vec<Arc<FragmentMetadata>>,
        window: TimestampRange,
        request: ReadRequest,
        options: ReaderOptions,
        key: Option<EncryptionKey>,
        cancel: CancellationToken,
    ) -> Self {
        let order = schema.global_order();
        let starts = fragments
            .iter()
            .map(|f| f.timestamp_range().start.get())
            .collect();
        Self {
            vfs,
            array_uri,
            schema,
            fragments,
            window,
            request,
            options,
            key,
            cancel,
            order,
            starts,
        }
    }

    /// Array the reader reads from.
    pub fn array_uri(&self) -> &Path {
        &self.array_uri
    }

    /// Schema of the array.
    pub fn schema(&self) -> &Arc<ArraySchema> {
        &self.schema
    }

    /// Fill `buffers` with the next cells after `state` and return the
    /// advanced state.
    pub async fn advance(
        &self,
        mut state: ReadState,
        buffers: &mut QueryBuffers,
    ) -> Result<(ReadState, QueryStatus), ReadError> {
        if state.status == Some(QueryStatus::Complete) {
            return Err(ReadError::Completed);
        }
        buffers.clear();
        if state.plan.is_none() {
            self.initialize(&mut state, buffers)?;
            state.status = Some(QueryStatus::Initialized);
        }
        let outputs = self.resolve_outputs(&state, buffers)?;

        loop {
            if self.cancel.is_cancelled() {
                return Err(ReadError::Cancelled);
            }
            let loaded = self.load_tiles(&mut state).await?;
            let Some(plan) = state.plan.as_ref() else {
                return Err(ReadError::Completed);
            };
            let input = MergeInput {
                order: &self.order,
                dim_num: self.schema.dim_num(),
                window: self.window,
                starts: &self.starts,
                plan,
                outputs: &outputs,
            };
            let (emitted, stop) = if plan.merge {
                merge::merge_global(&input, &mut state.cursors, &mut state.pending, buffers)
            } else {
                merge::merge_sequential(&input, &mut state.cursors, buffers)
            };
            log_debug!(
                "reader",
                "read_pass",
                tiles_loaded = loaded,
                cells = emitted,
                stop = ?stop,
            );
            let status = match stop {
                MergeStop::Exhausted => QueryStatus::Complete,
                MergeStop::BufferFull => QueryStatus::Incomplete,
                MergeStop::NeedTiles if emitted > 0 => QueryStatus::Incomplete,
                MergeStop::NeedTiles => continue,
            };
            state.status = Some(status);
            return Ok((state, status));
        }
    }

    /// Fix the field set, the window handling of every fragment and the tile
    /// lists.
    fn initialize(&self, state: &mut ReadState, buffers: &QueryBuffers) -> Result<(), ReadError> {
        let mut requested = Vec::new();
        let mut timestamps = self.request.timestamps;
        for name in buffers.names() {
            match self.schema.field(name) {
                Some(FieldId::Timestamps) => timestamps = true,
                Some(field) => requested.push(field),
                None => return Err(ReadError::UnknownField(name.to_string())),
            }
        }
        let fields: Vec<FieldId> = (0..self.schema.dim_num())
            .map(FieldId::Dimension)
            .chain(
                (0..self.schema.attributes.len())
                    .map(FieldId::Attribute)
                    .filter(|field| requested.contains(field)),
            )
            .collect();

        let mut subarray = self.request.subarray.clone();
        if self.options.merge_overlapping_ranges {
            if let Some(subarray) = subarray.as_mut() {
                subarray.coalesce();
            }
        }
        // A consolidation that keeps timestamps keeps every version so older
        // windows stay readable.
        let dedup = !self.schema.allows_dups && !(self.options.consolidation && timestamps);
        let merge = !(self.request.layout == ReadLayout::Unordered && self.schema.allows_dups);

        let mut cursors = Vec::with_capacity(self.fragments.len());
        for fragment in &self.fragments {
            let range = fragment.timestamp_range();
            let partial = !range.is_within(&self.window);
            if partial && !fragment.has_timestamps() {
                return Err(ReadError::MissingTimestamps {
                    fragment: fragment.name().to_string(),
                });
            }
            let load_timestamps = fragment.has_timestamps()
                && (partial
                    || timestamps
                    || self.options.consolidation
                    || (dedup && self.fragments.len() > 1));
            let tiles = (0..fragment.tile_num())
                .filter(|&tile| {
                    subarray
                        .as_ref()
                        .is_none_or(|subarray| subarray.intersects(fragment.mbr(tile)))
                })
                .collect();
            cursors.push(FragmentCursor {
                tiles,
                filter_timestamps: partial,
                load_timestamps,
                ..FragmentCursor::default()
            });
        }

        state.cursors = cursors;
        state.plan = Some(ReadPlan {
            fields,
            subarray,
            merge,
            dedup,
        });
        Ok(())
    }

    /// Map every buffer onto a loaded column and check it holds one cell.
    fn resolve_outputs(&self, state: &ReadState, buffers: &QueryBuffers) -> Result<Vec<Output>, ReadError> {
        let Some(plan) = state.plan.as_ref() else {
            return Err(ReadError::Completed);
        };
        let mut outputs = Vec::new();
        for name in buffers.names() {
            let field = self
                .schema
                .field(name)
                .ok_or_else(|| ReadError::UnknownField(name.to_string()))?;
            let output = match field {
                FieldId::Timestamps => Output::Timestamps,
                field => {
                    let index = plan
                        .fields
                        .iter()
                        .position(|f| *f == field)
                        .ok_or_else(|| ReadError::UnknownField(name.to_string()))?;
                    Output::Column {
                        index,
                        size: self.schema.cell_size(field),
                    }
                }
            };
            let cell_size = self.schema.cell_size(field);
            let capacity = buffers.buffer(name).map_or(0, |b| b.capacity());
            if capacity < cell_size {
                return Err(ReadError::BufferUndersized {
                    field: name.to_string(),
                    cell_size,
                    capacity,
                });
            }
            outputs.push(output);
        }
        Ok(outputs)
    }

    fn tile_fields(plan: &ReadPlan, cursor: &FragmentCursor) -> Vec<FieldId> {
        let mut fields = plan.fields.clone();
        if cursor.load_timestamps {
            fields.push(FieldId::Timestamps);
        }
        fields
    }

    /// Load the next tiles of every fragment that may contribute to the next
    /// merge. Returns the number of tiles loaded.
    async fn load_tiles(&self, state: &mut ReadState) -> Result<usize, ReadError> {
        let Some(plan) = state.plan.as_ref() else {
            return Ok(0);
        };
        let active: Vec<usize> = if plan.merge {
            (0..state.cursors.len())
                .filter(|&idx| state.cursors[idx].has_unloaded())
                .collect()
        } else {
            state
                .cursors
                .iter()
                .position(|c| !c.is_done())
                .filter(|&idx| state.cursors[idx].has_unloaded())
                .into_iter()
                .collect()
        };
        if active.is_empty() {
            return Ok(0);
        }
        let budget = match self.options.variant {
            ReaderVariant::Legacy => u64::MAX,
            ReaderVariant::Refactored => self.options.tile_budget / active.len() as u64,
        };

        let mut jobs = Vec::new();
        for idx in active {
            let cursor = &state.cursors[idx];
            let fragment = &self.fragments[idx];
            let fields = Self::tile_fields(plan, cursor);
            let mut bytes = cursor.loaded_bytes;
            for (scheduled, &tile) in cursor.tiles[cursor.next..].iter().enumerate() {
                let size = fragment.tile_size(&fields, tile);
                if bytes.saturating_add(size) > budget {
                    if !cursor.loaded.is_empty() || scheduled > 0 {
                        break;
                    }
                    log_warn!(
                        "reader",
                        "tile_budget_exceeded",
                        fragment = %fragment.name(),
                        tile,
                        tile_bytes = size,
                        budget,
                    );
                }
                jobs.push(TileJob {
                    fragment: idx,
                    tile,
                    bytes: size,
                });
                bytes = bytes.saturating_add(size);
            }
        }

        let count = jobs.len();
        let loaded: Vec<(usize, LoadedTile)> = stream::iter(jobs.into_iter().map(|job| {
            let fields = Self::tile_fields(plan, &state.cursors[job.fragment]);
            async move {
                let tile = self.load_tile(job.fragment, job.tile, &fields, job.bytes).await?;
                Ok::<_, ReadError>((job.fragment, tile))
            }
        }))
        .buffered(self.options.io_concurrency.max(1))
        .try_collect()
        .await?;

        if self.cancel.is_cancelled() {
            return Err(ReadError::Cancelled);
        }
        for (idx, tile) in loaded {
            let cursor = &mut state.cursors[idx];
            cursor.next += 1;
            cursor.loaded_bytes += tile.bytes;
            cursor.loaded.push_back(tile);
        }
        Ok(count)
    }

    /// Read and decode one tile of every field in `fields`.
    async fn load_tile(
        &self,
        fragment_idx: usize,
        tile: usize,
        fields: &[FieldId],
        bytes: u64,
    ) -> Result<LoadedTile, ReadError> {
        let fragment = &self.fragments[fragment_idx];
        let mut columns = try_join_all(fields.iter().map(|&field| async move {
            let pipeline = FilterPipeline::new(self.schema.filters(field));
            fragment
                .load_tile(self.vfs.as_ref(), field, tile, &pipeline, self.key.as_ref())
                .await
        }))
        .await?;

        let len = fragment.tile_cell_num(tile) as usize;
        let corrupt = |reason: String| {
            ReadError::Fragment(FragmentError::CorruptMetadata {
                fragment: fragment.name().to_string(),
                reason,
            })
        };
        let timestamps = if fields.last() == Some(&FieldId::Timestamps) {
            let raw = columns.pop().unwrap_or_default();
            let timestamps = decode_timestamps(&raw).map_err(FragmentError::from)?;
            if timestamps.len() != len {
                return Err(corrupt(format!(
                    "tile {tile} holds {} timestamps, expected {len}",
                    timestamps.len()
                )));
            }
            Some(timestamps)
        } else {
            None
        };
        for (field, column) in fields.iter().zip(&columns) {
            if column.len() != len * self.schema.cell_size(*field) {
                return Err(corrupt(format!("tile {tile} of {field:?} has {} bytes", column.len())));
            }
        }

        let dim_num = self.schema.dim_num();
        let mut coords = Vec::with_capacity(len * dim_num);
        for row in 0..len {
            for dim in 0..dim_num {
                let datatype = self.schema.datatype(FieldId::Dimension(dim));
                let size = datatype.size();
                let value = datatype
                    .decode_int(&columns[dim][row * size..(row + 1) * size])
                    .ok_or_else(|| corrupt(format!("dimension {dim} is not an integer")))?;
                coords.push(value);
            }
        }
        Ok(LoadedTile {
            columns,
            coords,
            timestamps,
            len,
            pos: 0,
            bytes,
        })
    }
}
