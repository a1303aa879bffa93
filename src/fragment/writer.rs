//! Global-order fragment writer.
//!
//! Cells arrive already sorted. The writer cuts a tile every `capacity` cells,
//! frames each field's slice as a tile record and streams the records to the
//! per-field files, flushing whenever the buffered bytes reach the writer
//! budget. Nothing is visible until [`PendingFragment::commit`] writes the
//! commit marker.

use std::{collections::BTreeMap, sync::Arc};

use super::{
    COMMITS_DIR, CellColumns, FragmentError, FragmentMetadata, FragmentName, METADATA_FILE,
    TileLocation,
};
use crate::{
    crypto::EncryptionKey,
    observability::{log_debug, log_info, log_warn},
    schema::{ArraySchema, FieldId, GlobalOrder},
    tile::{FilterPipeline, GenericTile, encode_record, encode_timestamps},
    vfs::{AppendFile, Path, Vfs},
};

struct FieldSink {
    field: FieldId,
    pipeline: FilterPipeline,
    file: Box<dyn AppendFile>,
    offset: u64,
    buffered: Vec<u8>,
    locations: Vec<TileLocation>,
}

/// Streams globally ordered cells into a new, uncommitted fragment.
pub(crate) struct FragmentWriter {
    vfs: Arc<dyn Vfs>,
    schema: Arc<ArraySchema>,
    array_uri: Path,
    name: FragmentName,
    dir: Path,
    key: Option<EncryptionKey>,
    order: GlobalOrder,
    sinks: Vec<FieldSink>,
    with_timestamps: bool,
    pending: CellColumns,
    buffered_bytes: u64,
    flush_threshold: u64,
    last_key: Option<Vec<i128>>,
    cell_num: u64,
    mbrs: Vec<Vec<(i128, i128)>>,
    non_empty_domain: Vec<(i128, i128)>,
}

impl FragmentWriter {
    /// Create the fragment directory and open one file per stored field.
    pub(crate) async fn create(
        vfs: Arc<dyn Vfs>,
        array_uri: &Path,
        schema: Arc<ArraySchema>,
        name: FragmentName,
        with_timestamps: bool,
        key: Option<EncryptionKey>,
        flush_threshold: u64,
    ) -> Result<Self, FragmentError> {
        if with_timestamps && !name.supports_timestamps() {
            return Err(FragmentError::SchemaMismatch(format!(
                "format version {} cannot carry timestamps",
                name.version()
            )));
        }
        let dir = name.data_dir(array_uri);
        vfs.create_dir(&dir).await?;
        let mut fields: Vec<FieldId> = schema.fields().collect();
        if with_timestamps {
            fields.push(FieldId::Timestamps);
        }
        let mut sinks = Vec::with_capacity(fields.len());
        for field in fields {
            let file = vfs.open_append(&dir.child(field.file_name().as_str())).await?;
            sinks.push(FieldSink {
                field,
                pipeline: FilterPipeline::new(schema.filters(field)),
                file,
                offset: 0,
                buffered: Vec::new(),
                locations: Vec::new(),
            });
        }
        log_debug!(
            "writer",
            "fragment_created",
            fragment = %name,
            fields = sinks.len(),
            has_timestamps = with_timestamps,
        );
        Ok(Self {
            order: schema.global_order(),
            pending: CellColumns::new(&schema, with_timestamps),
            vfs,
            array_uri: array_uri.clone(),
            name,
            dir,
            key,
            sinks,
            with_timestamps,
            buffered_bytes: 0,
            flush_threshold: flush_threshold.max(1),
            last_key: None,
            cell_num: 0,
            mbrs: Vec::new(),
            non_empty_domain: Vec::new(),
            schema,
        })
    }

    /// Append cells that continue the global order of earlier calls.
    pub(crate) async fn write(&mut self, cells: &CellColumns) -> Result<(), FragmentError> {
        for row in 0..cells.len() {
            let coords = cells.coords(row);
            self.check_domain(&coords)?;
            let key = self.order.key(&coords);
            if let Some(last) = &self.last_key {
                if key < *last {
                    return Err(FragmentError::UnsortedInput);
                }
                if key == *last && !self.schema.allows_dups && !self.with_timestamps {
                    return Err(FragmentError::DuplicateCoordinates(coords));
                }
            }
            self.last_key = Some(key);
            let ts = self.name.start().get();
            self.pending.push_from(cells, row, ts);
            if self.pending.len() as u64 >= self.schema.capacity {
                let tile = self.pending.split_front(self.schema.capacity as usize);
                self.emit_tile(tile)?;
                if self.buffered_bytes >= self.flush_threshold {
                    self.flush().await?;
                }
            }
        }
        Ok(())
    }

    fn check_domain(&self, coords: &[i128]) -> Result<(), FragmentError> {
        for (dim, value) in self.schema.dimensions.iter().zip(coords) {
            if *value < dim.domain[0] as i128 || *value > dim.domain[1] as i128 {
                return Err(FragmentError::OutOfDomain {
                    dimension: dim.name.clone(),
                    value: *value,
                });
            }
        }
        Ok(())
    }

    fn emit_tile(&mut self, tile: CellColumns) -> Result<(), FragmentError> {
        let mut mbr: Vec<(i128, i128)> = Vec::with_capacity(self.schema.dim_num());
        for row in 0..tile.len() {
            for (dim, value) in tile.coords(row).into_iter().enumerate() {
                match mbr.get_mut(dim) {
                    Some(range) => *range = (range.0.min(value), range.1.max(value)),
                    None => mbr.push((value, value)),
                }
            }
        }
        if self.non_empty_domain.is_empty() {
            self.non_empty_domain = mbr.clone();
        } else {
            for (domain, range) in self.non_empty_domain.iter_mut().zip(&mbr) {
                *domain = (domain.0.min(range.0), domain.1.max(range.1));
            }
        }
        let fill = self.name.start().get();
        for sink in &mut self.sinks {
            let raw = match sink.field {
                FieldId::Timestamps => match tile.timestamps() {
                    Some(ts) => encode_timestamps(ts),
                    None => encode_timestamps(&vec![fill; tile.len()]),
                },
                field => tile.column(field).map(<[u8]>::to_vec).unwrap_or_default(),
            };
            let record = encode_record(raw, &sink.pipeline, self.key.as_ref())?;
            sink.locations.push(TileLocation {
                offset: sink.offset,
                size: record.len() as u64,
            });
            sink.offset += record.len() as u64;
            self.buffered_bytes += record.len() as u64;
            sink.buffered.extend_from_slice(&record);
        }
        self.cell_num += tile.len() as u64;
        self.mbrs.push(mbr);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), FragmentError> {
        for sink in &mut self.sinks {
            if !sink.buffered.is_empty() {
                sink.file.append(std::mem::take(&mut sink.buffered)).await?;
            }
        }
        self.buffered_bytes = 0;
        Ok(())
    }

    /// Emit the trailing partial tile, close every file and persist the
    /// fragment metadata.
    pub(crate) async fn finish(mut self) -> Result<PendingFragment, FragmentError> {
        if !self.pending.is_empty() {
            let len = self.pending.len();
            let tile = self.pending.split_front(len);
            self.emit_tile(tile)?;
        }
        self.flush().await?;
        let mut tiles = BTreeMap::new();
        let mut files = Vec::with_capacity(self.sinks.len() + 1);
        for sink in self.sinks {
            sink.file.close().await?;
            files.push(self.dir.child(sink.field.file_name().as_str()));
            tiles.insert(sink.field, sink.locations);
        }
        let metadata = FragmentMetadata {
            name: self.name.clone(),
            uri: self.dir.clone(),
            allows_dups: self.schema.allows_dups,
            has_timestamps: self.with_timestamps,
            cell_num: self.cell_num,
            capacity: self.schema.capacity,
            non_empty_domain: self.non_empty_domain,
            mbrs: self.mbrs,
            tiles,
        };
        let metadata_uri = self.dir.child(METADATA_FILE);
        GenericTile::store(
            self.vfs.as_ref(),
            &metadata_uri,
            metadata.encode(),
            self.key.as_ref(),
        )
        .await?;
        files.push(metadata_uri);
        Ok(PendingFragment {
            vfs: self.vfs,
            array_uri: self.array_uri,
            files,
            metadata,
        })
    }

    /// Remove every file written so far.
    pub(crate) async fn abort(self) {
        let files: Vec<Path> = self
            .sinks
            .iter()
            .map(|sink| self.dir.child(sink.field.file_name().as_str()))
            .collect();
        drop(self.sinks);
        remove_all(self.vfs.as_ref(), &self.name, &files).await;
    }
}

async fn remove_all(vfs: &dyn Vfs, name: &FragmentName, files: &[Path]) {
    for file in files {
        if let Err(err) = vfs.remove(file).await {
            log_warn!(
                "writer",
                "fragment_abort_remove_failed",
                fragment = %name,
                file = %file,
                error = %err,
            );
        }
    }
    log_warn!(
        "writer",
        "fragment_aborted",
        fragment = %name,
        files = files.len(),
    );
}

/// A fully written fragment awaiting its commit marker.
pub(crate) struct PendingFragment {
    vfs: Arc<dyn Vfs>,
    array_uri: Path,
    files: Vec<Path>,
    metadata: FragmentMetadata,
}

impl PendingFragment {
    pub(crate) fn name(&self) -> &FragmentName {
        &self.metadata.name
    }

    #[cfg(test)]
    pub(crate) fn metadata(&self) -> &FragmentMetadata {
        &self.metadata
    }

    /// Write the commit marker, making the fragment visible.
    pub(crate) async fn commit(self) -> Result<FragmentMetadata, FragmentError> {
        let commits = self.array_uri.child(COMMITS_DIR);
        self.vfs.create_dir(&commits).await?;
        self.vfs
            .write(&commits.child(self.metadata.name.commit_file().as_str()), Vec::new())
            .await?;
        log_info!(
            "writer",
            "fragment_committed",
            fragment = %self.metadata.name,
            cells = self.metadata.cell_num,
            tiles = self.metadata.tile_num(),
            has_timestamps = self.metadata.has_timestamps,
        );
        Ok(self.metadata)
    }

    /// Remove the uncommitted fragment's files.
    pub(crate) async fn abort(self) {
        remove_all(self.vfs.as_ref(), &self.metadata.name, &self.files).await;
    }
}
