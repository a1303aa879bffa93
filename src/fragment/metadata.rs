//! Fragment metadata: the structural description of one fragment.
//!
//! The on-disk body is versioned. Every version decodes into the same
//! [`FragmentMetadata`], so nothing downstream branches on the format.
//!
//! ```text
//! u32 format_version
//! u64 t_start | u64 t_end
//! [v2] u8 allows_dups | u8 has_timestamps
//! u64 cell_num | u64 capacity
//! u32 dim_num  | dim_num x (i128 low, i128 high)      non-empty domain
//! u64 tile_num
//! [v2] tile_num x dim_num x (i128 low, i128 high)     MBRs
//! u32 field_num | per field: u32 field key, tile_num x (u64 offset, u64 size)
//! ```

use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::OnceCell;

use super::{FragmentError, FragmentName, METADATA_FILE, TIMESTAMPS_MIN_VERSION};
use crate::{
    crypto::EncryptionKey,
    schema::{ArraySchema, FieldId},
    tile::{FilterPipeline, GenericTile, TileError, decode_record},
    timestamp::TimestampRange,
    vfs::{Path, Vfs},
};

/// Position of one persisted tile record inside a field file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileLocation {
    /// Byte offset of the record.
    pub offset: u64,
    /// Persisted record size, preamble included.
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MetadataFormat {
    V1,
    V2,
}

impl MetadataFormat {
    fn for_version(version: u32) -> Self {
        if version >= TIMESTAMPS_MIN_VERSION {
            MetadataFormat::V2
        } else {
            MetadataFormat::V1
        }
    }
}

/// Normalized, immutable metadata of one committed fragment.
#[derive(Clone, Debug, PartialEq)]
pub struct FragmentMetadata {
    pub(super) name: FragmentName,
    pub(super) uri: Path,
    pub(super) allows_dups: bool,
    pub(super) has_timestamps: bool,
    pub(super) cell_num: u64,
    pub(super) capacity: u64,
    pub(super) non_empty_domain: Vec<(i128, i128)>,
    pub(super) mbrs: Vec<Vec<(i128, i128)>>,
    pub(super) tiles: BTreeMap<FieldId, Vec<TileLocation>>,
}

impl FragmentMetadata {
    /// Fragment name.
    pub fn name(&self) -> &FragmentName {
        &self.name
    }

    /// Fragment data directory.
    pub fn uri(&self) -> &Path {
        &self.uri
    }

    /// Format version of the fragment.
    pub fn format_version(&self) -> u32 {
        self.name.version()
    }

    /// Timestamp range from the fragment name.
    pub fn timestamp_range(&self) -> TimestampRange {
        self.name.range()
    }

    /// Whether duplicates were allowed when the fragment was written.
    pub fn allows_dups(&self) -> bool {
        self.allows_dups
    }

    /// Whether the fragment carries a per-cell timestamps tile.
    pub fn has_timestamps(&self) -> bool {
        self.has_timestamps
    }

    /// Total number of cells.
    pub fn cell_num(&self) -> u64 {
        self.cell_num
    }

    /// Cells per full tile.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Number of data tiles.
    pub fn tile_num(&self) -> usize {
        self.mbrs.len()
    }

    /// Cells held by tile `tile`; every tile but the last is full.
    pub fn tile_cell_num(&self, tile: usize) -> u64 {
        let tile_num = self.tile_num() as u64;
        if tile as u64 + 1 < tile_num {
            self.capacity
        } else {
            self.cell_num - self.capacity * tile_num.saturating_sub(1)
        }
    }

    /// Bounding box of the written coordinates.
    pub fn non_empty_domain(&self) -> &[(i128, i128)] {
        &self.non_empty_domain
    }

    /// Minimum bounding rectangle of one tile.
    pub fn mbr(&self, tile: usize) -> &[(i128, i128)] {
        self.mbrs.get(tile).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Location of one tile record.
    pub fn tile_location(&self, field: FieldId, tile: usize) -> Option<TileLocation> {
        self.tiles.get(&field)?.get(tile).copied()
    }

    /// Persisted bytes of one tile summed over `fields`.
    pub fn tile_size(&self, fields: &[FieldId], tile: usize) -> u64 {
        fields
            .iter()
            .filter_map(|field| self.tile_location(*field, tile))
            .map(|loc| loc.size)
            .sum()
    }

    /// Persisted bytes of every tile of the fragment.
    pub fn fragment_size(&self) -> u64 {
        self.tiles.values().flatten().map(|loc| loc.size).sum()
    }

    /// Load and decode the metadata tile of a committed fragment.
    pub async fn load(
        vfs: &dyn Vfs,
        array_uri: &Path,
        name: &FragmentName,
        schema: &ArraySchema,
        key: Option<&EncryptionKey>,
    ) -> Result<Self, FragmentError> {
        let uri = name.data_dir(array_uri);
        let corrupt = |reason: String| FragmentError::CorruptMetadata {
            fragment: name.to_string(),
            reason,
        };
        let body = match GenericTile::load(vfs, &uri.child(METADATA_FILE), key).await {
            Ok(body) => body,
            Err(TileError::Storage(err)) => return Err(err.into()),
            Err(TileError::Crypto(err)) => return Err(TileError::Crypto(err).into()),
            Err(err @ (TileError::Format(_) | TileError::Filter(_))) => {
                return Err(corrupt(err.to_string()));
            }
        };
        let has_ts_file = if MetadataFormat::for_version(name.version()) == MetadataFormat::V1 {
            vfs.exists(&uri.child(FieldId::Timestamps.file_name().as_str())).await?
        } else {
            false
        };
        Self::decode(&body, name.clone(), uri, schema, has_ts_file).map_err(|reason| corrupt(reason.to_string()))
    }

    pub(super) fn encode(&self) -> Vec<u8> {
        let format = MetadataFormat::for_version(self.name.version());
        let mut out = Vec::new();
        out.extend_from_slice(&self.name.version().to_le_bytes());
        out.extend_from_slice(&self.name.start().get().to_le_bytes());
        out.extend_from_slice(&self.name.end().get().to_le_bytes());
        if format == MetadataFormat::V2 {
            out.push(u8::from(self.allows_dups));
            out.push(u8::from(self.has_timestamps));
        }
        out.extend_from_slice(&self.cell_num.to_le_bytes());
        out.extend_from_slice(&self.capacity.to_le_bytes());
        out.extend_from_slice(&(self.non_empty_domain.len() as u32).to_le_bytes());
        push_ranges(&mut out, &self.non_empty_domain);
        out.extend_from_slice(&(self.mbrs.len() as u64).to_le_bytes());
        if format == MetadataFormat::V2 {
            for mbr in &self.mbrs {
                push_ranges(&mut out, mbr);
            }
        }
        out.extend_from_slice(&(self.tiles.len() as u32).to_le_bytes());
        for (field, locations) in &self.tiles {
            out.extend_from_slice(&field.encode().to_le_bytes());
            for loc in locations {
                out.extend_from_slice(&loc.offset.to_le_bytes());
                out.extend_from_slice(&loc.size.to_le_bytes());
            }
        }
        out
    }

    fn decode(
        body: &[u8],
        name: FragmentName,
        uri: Path,
        schema: &ArraySchema,
        has_ts_file: bool,
    ) -> Result<Self, &'static str> {
        let mut cursor = Cursor::new(body);
        let version = cursor.u32()?;
        if version != name.version() {
            return Err("format version does not match the fragment name");
        }
        let format = MetadataFormat::for_version(version);
        let start = cursor.u64()?;
        let end = cursor.u64()?;
        if TimestampRange::new(start, end) != name.range() {
            return Err("timestamp range does not match the fragment name");
        }
        let (allows_dups, flagged_timestamps) = match format {
            MetadataFormat::V2 => (cursor.u8()? != 0, Some(cursor.u8()? != 0)),
            MetadataFormat::V1 => (schema.allows_dups, None),
        };
        let cell_num = cursor.u64()?;
        let capacity = cursor.u64()?;
        if capacity == 0 {
            return Err("zero tile capacity");
        }
        let dim_num = cursor.u32()? as usize;
        if dim_num != schema.dim_num() {
            return Err("dimension count does not match the schema");
        }
        let non_empty_domain = cursor.ranges(dim_num)?;
        let tile_num = cursor.u64()?;
        if tile_num != cell_num.div_ceil(capacity) {
            return Err("tile count does not match cell count and capacity");
        }
        let tile_num = usize::try_from(tile_num).map_err(|_| "tile count overflow")?;
        let mbrs = match format {
            MetadataFormat::V2 => (0..tile_num)
                .map(|_| cursor.ranges(dim_num))
                .collect::<Result<Vec<_>, _>>()?,
            MetadataFormat::V1 => vec![non_empty_domain.clone(); tile_num],
        };
        let field_num = cursor.u32()?;
        let mut tiles = BTreeMap::new();
        for _ in 0..field_num {
            let field = FieldId::decode(cursor.u32()?).ok_or("unknown field key")?;
            let mut locations = Vec::with_capacity(tile_num);
            for _ in 0..tile_num {
                locations.push(TileLocation {
                    offset: cursor.u64()?,
                    size: cursor.u64()?,
                });
            }
            if tiles.insert(field, locations).is_some() {
                return Err("duplicate field table");
            }
        }
        if !cursor.is_empty() {
            return Err("trailing bytes");
        }
        let has_timestamps = flagged_timestamps.unwrap_or(has_ts_file);
        for field in schema.fields() {
            if !tiles.contains_key(&field) {
                return Err("missing field table");
            }
        }
        if tiles.contains_key(&FieldId::Timestamps) != has_timestamps {
            return Err("timestamps flag disagrees with the field tables");
        }
        if tiles.len() != schema.fields().count() + usize::from(has_timestamps) {
            return Err("field tables do not match the schema");
        }
        Ok(Self {
            name,
            uri,
            allows_dups,
            has_timestamps,
            cell_num,
            capacity,
            non_empty_domain,
            mbrs,
            tiles,
        })
    }

    /// Read and unfilter one tile.
    pub(crate) async fn load_tile(
        &self,
        vfs: &dyn Vfs,
        field: FieldId,
        tile: usize,
        pipeline: &FilterPipeline,
        key: Option<&EncryptionKey>,
    ) -> Result<Vec<u8>, FragmentError> {
        let loc = self
            .tile_location(field, tile)
            .ok_or_else(|| FragmentError::CorruptMetadata {
                fragment: self.name.to_string(),
                reason: format!("no tile {tile} for {field:?}"),
            })?;
        let bytes = vfs
            .read(&self.uri.child(field.file_name().as_str()), loc.offset, loc.size)
            .await?;
        Ok(decode_record(&bytes, pipeline, key)?)
    }
}

fn push_ranges(out: &mut Vec<u8>, ranges: &[(i128, i128)]) {
    for (lo, hi) in ranges {
        out.extend_from_slice(&lo.to_le_bytes());
        out.extend_from_slice(&hi.to_le_bytes());
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], &'static str> {
        if self.bytes.len() < N {
            return Err("metadata body truncated");
        }
        let (head, rest) = self.bytes.split_at(N);
        self.bytes = rest;
        let mut out = [0u8; N];
        out.copy_from_slice(head);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, &'static str> {
        Ok(self.take::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32, &'static str> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn u64(&mut self) -> Result<u64, &'static str> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    fn i128(&mut self) -> Result<i128, &'static str> {
        Ok(i128::from_le_bytes(self.take()?))
    }

    fn ranges(&mut self, n: usize) -> Result<Vec<(i128, i128)>, &'static str> {
        (0..n).map(|_| Ok((self.i128()?, self.i128()?))).collect()
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A committed fragment whose metadata is loaded on first use and shared by
/// every reader of the handle.
#[derive(Debug)]
pub(crate) struct FragmentHandle {
    name: FragmentName,
    metadata: OnceCell<Arc<FragmentMetadata>>,
}

impl FragmentHandle {
    pub(crate) fn new(name: FragmentName) -> Self {
        Self {
            name,
            metadata: OnceCell::new(),
        }
    }

    pub(crate) async fn metadata(
        &self,
        vfs: &dyn Vfs,
        array_uri: &Path,
        schema: &ArraySchema,
        key: Option<&EncryptionKey>,
    ) -> Result<Arc<FragmentMetadata>, FragmentError> {
        self.metadata
            .get_or_try_init(|| async {
                FragmentMetadata::load(vfs, array_uri, &self.name, schema, key)
                    .await
                    .map(Arc::new)
            })
            .await
            .cloned()
    }
}
