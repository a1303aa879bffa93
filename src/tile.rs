//! Tile records: the unit of persisted column data.
//!
//! Every data file (`d<i>.tdb`, `a<i>.tdb`, `t.tdb`) is a concatenation of
//! tile records, each addressed by an `(offset, size)` pair from fragment
//! metadata. A record is
//!
//! ```text
//! u64 num_chunks
//! per chunk:
//!   u32 filtered_size
//!   u32 unfiltered_size
//!   u32 metadata_size      (always 0 when written)
//!   [metadata_size bytes]
//!   [filtered_size bytes]  pipeline output, encrypted when a key is set
//! ```
//!
//! Writers emit one chunk per tile.

mod filter;
mod generic;
mod timestamps;

use thiserror::Error;

pub use self::filter::{Filter, FilterError, FilterPipeline, FilterType};
pub(crate) use self::generic::GenericTile;
pub(crate) use self::timestamps::{decode_timestamps, encode_timestamps};
use crate::{
    crypto::{CryptoError, EncryptionKey},
    error::{ErrorClass, FormatError},
    vfs::StorageError,
};

/// Bytes of the record header preceding the first chunk.
pub const RECORD_HEADER_LEN: usize = 8;
/// Bytes of each chunk header.
pub const CHUNK_HEADER_LEN: usize = 12;

/// Failures while persisting or loading tiles.
#[derive(Debug, Error)]
pub enum TileError {
    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Malformed record.
    #[error(transparent)]
    Format(#[from] FormatError),
    /// Encryption failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// Filter reverse failure (checksum mismatch).
    #[error("filter pipeline rejected tile: {0}")]
    Filter(#[from] FilterError),
}

impl TileError {
    /// Taxonomy class of this failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            TileError::Storage(_) => ErrorClass::StorageIo,
            TileError::Format(_) | TileError::Filter(_) => ErrorClass::Format,
            TileError::Crypto(_) => ErrorClass::Crypto,
        }
    }
}

/// Header of one chunk inside a tile record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Bytes of persisted payload.
    pub filtered_size: u32,
    /// Bytes of the raw tile.
    pub unfiltered_size: u32,
    /// Bytes of chunk metadata.
    pub metadata_size: u32,
}

impl ChunkHeader {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.filtered_size.to_le_bytes());
        buf.extend_from_slice(&self.unfiltered_size.to_le_bytes());
        buf.extend_from_slice(&self.metadata_size.to_le_bytes());
    }

    fn decode_from(bytes: &[u8]) -> Result<(Self, &[u8]), FormatError> {
        if bytes.len() < CHUNK_HEADER_LEN {
            return Err(FormatError::CorruptTile("chunk header truncated"));
        }
        let (header, rest) = bytes.split_at(CHUNK_HEADER_LEN);
        Ok((
            Self {
                filtered_size: read_u32(&header[0..4]),
                unfiltered_size: read_u32(&header[4..8]),
                metadata_size: read_u32(&header[8..12]),
            },
            rest,
        ))
    }
}

pub(crate) fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}

fn size_u32(len: usize) -> Result<u32, FormatError> {
    u32::try_from(len).map_err(|_| FormatError::TileTooLarge(len))
}

/// Filter, optionally encrypt, and frame one raw tile.
pub fn encode_record(
    raw: Vec<u8>,
    pipeline: &FilterPipeline,
    key: Option<&EncryptionKey>,
) -> Result<Vec<u8>, TileError> {
    let unfiltered_size = size_u32(raw.len())?;
    let mut payload = pipeline.run_forward(raw);
    if let Some(key) = key {
        payload = key.encrypt(&payload)?;
    }
    let header = ChunkHeader {
        filtered_size: size_u32(payload.len())?,
        unfiltered_size,
        metadata_size: 0,
    };
    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + CHUNK_HEADER_LEN + payload.len());
    record.extend_from_slice(&1u64.to_le_bytes());
    header.encode_into(&mut record);
    record.extend_from_slice(&payload);
    Ok(record)
}

/// Parse, decrypt and unfilter one tile record. The record must span `bytes`
/// exactly.
pub fn decode_record(
    bytes: &[u8],
    pipeline: &FilterPipeline,
    key: Option<&EncryptionKey>,
) -> Result<Vec<u8>, TileError> {
    if bytes.len() < RECORD_HEADER_LEN {
        return Err(FormatError::CorruptTile("record header truncated").into());
    }
    let num_chunks = read_u64(bytes);
    let mut rest = &bytes[RECORD_HEADER_LEN..];
    if num_chunks > (rest.len() / CHUNK_HEADER_LEN) as u64 {
        return Err(FormatError::CorruptTile("chunk count exceeds record size").into());
    }
    let mut tile = Vec::new();
    for _ in 0..num_chunks {
        let (header, after) = ChunkHeader::decode_from(rest)?;
        let meta_len = header.metadata_size as usize;
        let payload_len = header.filtered_size as usize;
        if after.len() < meta_len + payload_len {
            return Err(FormatError::CorruptTile("chunk payload truncated").into());
        }
        let payload = &after[meta_len..meta_len + payload_len];
        let filtered = match key {
            Some(key) => key.decrypt(payload)?,
            None => payload.to_vec(),
        };
        let chunk = pipeline.run_reverse(filtered)?;
        if chunk.len() != header.unfiltered_size as usize {
            return Err(FormatError::CorruptTile("unfiltered size mismatch").into());
        }
        tile.extend_from_slice(&chunk);
        rest = &after[meta_len + payload_len..];
    }
    if !rest.is_empty() {
        return Err(FormatError::CorruptTile("trailing bytes after last chunk").into());
    }
    Ok(tile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_LEN;

    #[test]
    fn unfiltered_record_layout() {
        let raw: Vec<u8> = [5u64, 9].iter().flat_map(|v| v.to_le_bytes()).collect();
        let record = encode_record(raw.clone(), &FilterPipeline::default(), None).expect("encode");
        assert_eq!(read_u64(&record[0..8]), 1);
        assert_eq!(read_u32(&record[8..12]), 16);
        assert_eq!(read_u32(&record[12..16]), 16);
        assert_eq!(read_u32(&record[16..20]), 0);
        assert_eq!(&record[20..], raw.as_slice());
        assert_eq!(
            decode_record(&record, &FilterPipeline::default(), None).expect("decode"),
            raw
        );
    }

    #[test]
    fn encrypted_checksummed_record() {
        let key = EncryptionKey::new([3u8; KEY_LEN]);
        let pipeline = FilterPipeline::new(&[FilterType::ChecksumCrc32]);
        let record = encode_record(vec![1, 2, 3], &pipeline, Some(&key)).expect("encode");
        assert_eq!(
            decode_record(&record, &pipeline, Some(&key)).expect("decode"),
            vec![1, 2, 3]
        );
        let wrong = EncryptionKey::new([4u8; KEY_LEN]);
        assert!(matches!(
            decode_record(&record, &pipeline, Some(&wrong)),
            Err(TileError::Crypto(CryptoError::DecryptFailed))
        ));
    }

    #[test]
    fn rejects_truncated_and_trailing() {
        let record = encode_record(vec![7; 10], &FilterPipeline::default(), None).expect("encode");
        assert!(matches!(
            decode_record(&record[..record.len() - 1], &FilterPipeline::default(), None),
            Err(TileError::Format(FormatError::CorruptTile(_)))
        ));
        let mut padded = record.clone();
        padded.push(0);
        assert!(decode_record(&padded, &FilterPipeline::default(), None).is_err());
        assert!(decode_record(&record[..4], &FilterPipeline::default(), None).is_err());
    }
}
