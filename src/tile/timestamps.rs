//! Raw layout of the per-cell timestamps tile (`t.tdb`): one little-endian
//! `u64` per cell, in the storage order of the fragment's other tiles.

use crate::error::FormatError;

pub(crate) fn encode_timestamps(values: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub(crate) fn decode_timestamps(raw: &[u8]) -> Result<Vec<u64>, FormatError> {
    if raw.len() % 8 != 0 {
        return Err(FormatError::CorruptTile("timestamps tile is not a multiple of 8 bytes"));
    }
    Ok(raw.chunks_exact(8).map(super::read_u64).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::{FilterPipeline, decode_record, encode_record};

    #[test]
    fn framed_timestamps_match_documented_layout() {
        let values = [1u64, 3, 3, 7];
        let record =
            encode_record(encode_timestamps(&values), &FilterPipeline::default(), None).expect("encode");
        // num_chunks | filtered | unfiltered | metadata | payload
        assert_eq!(record.len(), 8 + 4 + 4 + 4 + 32);
        let raw = decode_record(&record, &FilterPipeline::default(), None).expect("decode");
        assert_eq!(decode_timestamps(&raw).expect("values"), values);
        assert!(decode_timestamps(&raw[..5]).is_err());
    }
}
