//! Tile filter pipeline.
//!
//! Filters are byte-to-byte transforms applied when a tile is persisted
//! (`run_forward`) and undone when it is loaded (`run_reverse`). The tile
//! layer never interprets filtered bytes beyond handing them back to the
//! pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure while reversing a filter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// Stored checksum does not match the payload.
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// Checksum recorded at write time.
        stored: u32,
        /// Checksum of the loaded payload.
        computed: u32,
    },
    /// Input too short for the filter's framing.
    #[error("filtered input too short for {0}")]
    Truncated(&'static str),
}

/// Declarable filter kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    /// Appends a CRC32 of the payload and verifies it on reverse.
    ChecksumCrc32,
}

/// A single reversible transform.
pub trait Filter: Send + Sync {
    /// Transform raw bytes into their persisted form.
    fn forward(&self, input: Vec<u8>) -> Vec<u8>;

    /// Restore raw bytes from their persisted form.
    fn reverse(&self, input: Vec<u8>) -> Result<Vec<u8>, FilterError>;
}

struct Crc32Checksum;

impl Filter for Crc32Checksum {
    fn forward(&self, mut input: Vec<u8>) -> Vec<u8> {
        let checksum = crc32fast::hash(&input);
        input.extend_from_slice(&checksum.to_le_bytes());
        input
    }

    fn reverse(&self, mut input: Vec<u8>) -> Result<Vec<u8>, FilterError> {
        if input.len() < 4 {
            return Err(FilterError::Truncated("crc32 checksum"));
        }
        let split = input.len() - 4;
        let mut stored = [0u8; 4];
        stored.copy_from_slice(&input[split..]);
        let stored = u32::from_le_bytes(stored);
        input.truncate(split);
        let computed = crc32fast::hash(&input);
        if stored != computed {
            return Err(FilterError::ChecksumMismatch { stored, computed });
        }
        Ok(input)
    }
}

impl FilterType {
    fn filter(self) -> &'static dyn Filter {
        match self {
            FilterType::ChecksumCrc32 => &Crc32Checksum,
        }
    }
}

/// Ordered list of filters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterPipeline {
    filters: Vec<FilterType>,
}

impl FilterPipeline {
    /// Build a pipeline from declared filters, applied in order on write.
    pub fn new(filters: &[FilterType]) -> Self {
        Self {
            filters: filters.to_vec(),
        }
    }

    /// `true` when no filter is declared.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Filter a raw tile.
    pub fn run_forward(&self, tile: Vec<u8>) -> Vec<u8> {
        self.filters
            .iter()
            .fold(tile, |bytes, filter| filter.filter().forward(bytes))
    }

    /// Undo [`FilterPipeline::run_forward`].
    pub fn run_reverse(&self, filtered: Vec<u8>) -> Result<Vec<u8>, FilterError> {
        self.filters
            .iter()
            .rev()
            .try_fold(filtered, |bytes, filter| filter.filter().reverse(bytes))
    }
}
