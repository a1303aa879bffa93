//! Generic tiles: self-contained, checksummed single-record files used for
//! fragment metadata.
//!
//! Layout: `u8 encryption type` followed by one tile record whose pipeline is
//! a CRC32 checksum.

use super::{FilterPipeline, FilterType, TileError, decode_record, encode_record};
use crate::{
    crypto::{CryptoError, EncryptionKey, EncryptionType, encryption_type},
    error::FormatError,
    vfs::{Path, Vfs},
};

pub(crate) struct GenericTile;

impl GenericTile {
    fn pipeline() -> FilterPipeline {
        FilterPipeline::new(&[FilterType::ChecksumCrc32])
    }

    /// Frame `payload` as a generic tile.
    pub(crate) fn encode(payload: Vec<u8>, key: Option<&EncryptionKey>) -> Result<Vec<u8>, TileError> {
        let record = encode_record(payload, &Self::pipeline(), key)?;
        let mut out = Vec::with_capacity(1 + record.len());
        out.push(encryption_type(key).as_u8());
        out.extend_from_slice(&record);
        Ok(out)
    }

    /// Undo [`GenericTile::encode`], checking the key against the header.
    pub(crate) fn decode(bytes: &[u8], key: Option<&EncryptionKey>) -> Result<Vec<u8>, TileError> {
        let (&tag, record) = bytes
            .split_first()
            .ok_or(FormatError::CorruptTile("empty generic tile"))?;
        match (EncryptionType::from_u8(tag)?, key) {
            (EncryptionType::None, None) | (EncryptionType::Aes256Gcm, Some(_)) => {}
            (EncryptionType::None, Some(_)) => return Err(CryptoError::UnexpectedKey.into()),
            (kind @ EncryptionType::Aes256Gcm, None) => {
                return Err(CryptoError::MissingKey(kind).into());
            }
        }
        decode_record(record, &Self::pipeline(), key)
    }

    /// Persist a generic tile, returning its size in bytes.
    pub(crate) async fn store(
        vfs: &dyn Vfs,
        uri: &Path,
        payload: Vec<u8>,
        key: Option<&EncryptionKey>,
    ) -> Result<u64, TileError> {
        let bytes = Self::encode(payload, key)?;
        let size = bytes.len() as u64;
        vfs.write(uri, bytes).await?;
        Ok(size)
    }

    /// Load and decode a generic tile.
    pub(crate) async fn load(
        vfs: &dyn Vfs,
        uri: &Path,
        key: Option<&EncryptionKey>,
    ) -> Result<Vec<u8>, TileError> {
        let bytes = vfs.read_all(uri).await?;
        Self::decode(&bytes, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto::KEY_LEN, tile::FilterError};

    #[test]
    fn key_must_match_header() {
        let key = EncryptionKey::new([1u8; KEY_LEN]);
        let plain = GenericTile::encode(b"meta".to_vec(), None).expect("plain");
        let sealed = GenericTile::encode(b"meta".to_vec(), Some(&key)).expect("sealed");

        assert_eq!(GenericTile::decode(&plain, None).expect("plain"), b"meta");
        assert_eq!(GenericTile::decode(&sealed, Some(&key)).expect("sealed"), b"meta");
        assert!(matches!(
            GenericTile::decode(&plain, Some(&key)),
            Err(TileError::Crypto(CryptoError::UnexpectedKey))
        ));
        assert!(matches!(
            GenericTile::decode(&sealed, None),
            Err(TileError::Crypto(CryptoError::MissingKey(_)))
        ));
    }

    #[test]
    fn corruption_fails_checksum() {
        let mut bytes = GenericTile::encode(b"metadata body".to_vec(), None).expect("encode");
        let last = bytes.len() - 6;
        bytes[last] ^= 0x55;
        assert!(matches!(
            GenericTile::decode(&bytes, None),
            Err(TileError::Filter(FilterError::ChecksumMismatch { .. }))
        ));
    }
}
