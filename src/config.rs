//! Storage-manager configuration recognized by directory, reader,
//! consolidator and vacuum.
//!
//! Options are typed fields on [`Config`]; the string-keyed API mirrors the
//! `sm.*` parameter names so configuration can be passed through as
//! key/value pairs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::timestamp::TimestampRange;

/// Key: consolidation window start.
pub const CONSOLIDATION_TIMESTAMP_START: &str = "sm.consolidation.timestamp_start";
/// Key: consolidation window end.
pub const CONSOLIDATION_TIMESTAMP_END: &str = "sm.consolidation.timestamp_end";
/// Key: explicit per-field consolidation copy buffer size in bytes.
pub const CONSOLIDATION_BUFFER_SIZE: &str = "sm.consolidation.buffer_size";
/// Key: maximum consolidation steps per call.
pub const CONSOLIDATION_STEPS: &str = "sm.consolidation.steps";
/// Key: minimum number of fragments merged in one step.
pub const CONSOLIDATION_STEP_MIN_FRAGS: &str = "sm.consolidation.step_min_frags";
/// Key: maximum number of fragments merged in one step.
pub const CONSOLIDATION_STEP_MAX_FRAGS: &str = "sm.consolidation.step_max_frags";
/// Key: minimum size ratio between adjacent fragments in one step.
pub const CONSOLIDATION_STEP_SIZE_RATIO: &str = "sm.consolidation.step_size_ratio";
/// Key: total memory budget in bytes.
pub const MEM_TOTAL_BUDGET: &str = "sm.mem.total_budget";
/// Key: share of the budget available to loaded tiles in the global-order reader.
pub const MEM_READER_RATIO_COORDS: &str = "sm.mem.reader.sparse_global_order.ratio_coords";
/// Key: consolidation copy-buffer weight.
pub const MEM_CONSOLIDATION_BUFFERS_WEIGHT: &str = "sm.mem.consolidation.buffers_weight";
/// Key: consolidation reader weight.
pub const MEM_CONSOLIDATION_READER_WEIGHT: &str = "sm.mem.consolidation.reader_weight";
/// Key: consolidation writer weight.
pub const MEM_CONSOLIDATION_WRITER_WEIGHT: &str = "sm.mem.consolidation.writer_weight";
/// Key: sparse global-order reader variant.
pub const QUERY_SPARSE_GLOBAL_ORDER_READER: &str = "sm.query.sparse_global_order.reader";
/// Key: coalesce overlapping subarray ranges.
pub const MERGE_OVERLAPPING_RANGES: &str = "sm.merge_overlapping_ranges_experimental";
/// Key: fan-out width for parallel I/O.
pub const IO_CONCURRENCY_LEVEL: &str = "sm.io_concurrency_level";

const ALL_KEYS: &[&str] = &[
    CONSOLIDATION_TIMESTAMP_START,
    CONSOLIDATION_TIMESTAMP_END,
    CONSOLIDATION_BUFFER_SIZE,
    CONSOLIDATION_STEPS,
    CONSOLIDATION_STEP_MIN_FRAGS,
    CONSOLIDATION_STEP_MAX_FRAGS,
    CONSOLIDATION_STEP_SIZE_RATIO,
    MEM_TOTAL_BUDGET,
    MEM_READER_RATIO_COORDS,
    MEM_CONSOLIDATION_BUFFERS_WEIGHT,
    MEM_CONSOLIDATION_READER_WEIGHT,
    MEM_CONSOLIDATION_WRITER_WEIGHT,
    QUERY_SPARSE_GLOBAL_ORDER_READER,
    MERGE_OVERLAPPING_RANGES,
    IO_CONCURRENCY_LEVEL,
];

/// Errors raised while parsing or validating configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// The key is not a recognized option.
    #[error("unknown configuration key `{0}`")]
    UnknownKey(String),
    /// The value could not be parsed for the key.
    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue {
        /// Offending key.
        key: String,
        /// Raw value supplied.
        value: String,
    },
    /// The combination of options is inconsistent.
    #[error("invalid configuration: {0}")]
    Inconsistent(&'static str),
}

/// Which sparse global-order merge algorithm serves reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderVariant {
    /// Budgeted multi-pass merge returning `Incomplete` under memory pressure.
    #[default]
    Refactored,
    /// Loads every eligible tile in a single pass, ignoring the budget.
    Legacy,
}

impl ReaderVariant {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "refactored" => Some(Self::Refactored),
            "legacy" => Some(Self::Legacy),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Refactored => "refactored",
            Self::Legacy => "legacy",
        }
    }
}

/// Typed storage-manager configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Consolidation window start.
    pub consolidation_timestamp_start: u64,
    /// Consolidation window end.
    pub consolidation_timestamp_end: u64,
    /// Explicit copy-buffer size per field; `0` derives it from the weights.
    pub consolidation_buffer_size: u64,
    /// Maximum consolidation steps per call.
    pub consolidation_steps: u32,
    /// Minimum fragments per step (clamped to the candidate count).
    pub consolidation_step_min_frags: u32,
    /// Maximum fragments per step (clamped to the candidate count).
    pub consolidation_step_max_frags: u32,
    /// Minimum smaller/larger size ratio of adjacent fragments in a step.
    pub consolidation_step_size_ratio: f64,
    /// Total memory budget in bytes.
    pub mem_total_budget: u64,
    /// Share of the total budget the global-order reader may hold in tiles.
    pub mem_reader_ratio_coords: f64,
    /// Consolidation copy-buffer weight.
    pub mem_consolidation_buffers_weight: u64,
    /// Consolidation reader weight.
    pub mem_consolidation_reader_weight: u64,
    /// Consolidation writer weight.
    pub mem_consolidation_writer_weight: u64,
    /// Global-order reader variant.
    pub sparse_global_order_reader: ReaderVariant,
    /// Coalesce overlapping subarray ranges before filtering.
    pub merge_overlapping_ranges: bool,
    /// Fan-out width for parallel tile loads and deletions.
    pub io_concurrency_level: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            consolidation_timestamp_start: 0,
            consolidation_timestamp_end: u64::MAX,
            consolidation_buffer_size: 0,
            consolidation_steps: u32::MAX,
            consolidation_step_min_frags: u32::MAX,
            consolidation_step_max_frags: u32::MAX,
            consolidation_step_size_ratio: 0.0,
            mem_total_budget: 10 * 1024 * 1024 * 1024,
            mem_reader_ratio_coords: 0.5,
            mem_consolidation_buffers_weight: 1,
            mem_consolidation_reader_weight: 3,
            mem_consolidation_writer_weight: 2,
            sparse_global_order_reader: ReaderVariant::Refactored,
            merge_overlapping_ranges: true,
            io_concurrency_level: 8,
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

impl Config {
    /// Build a configuration from `(key, value)` pairs applied over the defaults.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.set(key.as_ref(), value.as_ref())?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Set one option by its `sm.*` key.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            CONSOLIDATION_TIMESTAMP_START => self.consolidation_timestamp_start = parse(key, value)?,
            CONSOLIDATION_TIMESTAMP_END => self.consolidation_timestamp_end = parse(key, value)?,
            CONSOLIDATION_BUFFER_SIZE => self.consolidation_buffer_size = parse(key, value)?,
            CONSOLIDATION_STEPS => self.consolidation_steps = parse(key, value)?,
            CONSOLIDATION_STEP_MIN_FRAGS => self.consolidation_step_min_frags = parse(key, value)?,
            CONSOLIDATION_STEP_MAX_FRAGS => self.consolidation_step_max_frags = parse(key, value)?,
            CONSOLIDATION_STEP_SIZE_RATIO => {
                self.consolidation_step_size_ratio = parse(key, value)?
            }
            MEM_TOTAL_BUDGET => self.mem_total_budget = parse(key, value)?,
            MEM_READER_RATIO_COORDS => self.mem_reader_ratio_coords = parse(key, value)?,
            MEM_CONSOLIDATION_BUFFERS_WEIGHT => {
                self.mem_consolidation_buffers_weight = parse(key, value)?
            }
            MEM_CONSOLIDATION_READER_WEIGHT => {
                self.mem_consolidation_reader_weight = parse(key, value)?
            }
            MEM_CONSOLIDATION_WRITER_WEIGHT => {
                self.mem_consolidation_writer_weight = parse(key, value)?
            }
            QUERY_SPARSE_GLOBAL_ORDER_READER => {
                self.sparse_global_order_reader =
                    ReaderVariant::parse(value.trim()).ok_or_else(|| ConfigError::InvalidValue {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?
            }
            MERGE_OVERLAPPING_RANGES => self.merge_overlapping_ranges = parse(key, value)?,
            IO_CONCURRENCY_LEVEL => self.io_concurrency_level = parse(key, value)?,
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    /// Current value of an option rendered as a string.
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            CONSOLIDATION_TIMESTAMP_START => self.consolidation_timestamp_start.to_string(),
            CONSOLIDATION_TIMESTAMP_END => self.consolidation_timestamp_end.to_string(),
            CONSOLIDATION_BUFFER_SIZE => self.consolidation_buffer_size.to_string(),
            CONSOLIDATION_STEPS => self.consolidation_steps.to_string(),
            CONSOLIDATION_STEP_MIN_FRAGS => self.consolidation_step_min_frags.to_string(),
            CONSOLIDATION_STEP_MAX_FRAGS => self.consolidation_step_max_frags.to_string(),
            CONSOLIDATION_STEP_SIZE_RATIO => self.consolidation_step_size_ratio.to_string(),
            MEM_TOTAL_BUDGET => self.mem_total_budget.to_string(),
            MEM_READER_RATIO_COORDS => self.mem_reader_ratio_coords.to_string(),
            MEM_CONSOLIDATION_BUFFERS_WEIGHT => self.mem_consolidation_buffers_weight.to_string(),
            MEM_CONSOLIDATION_READER_WEIGHT => self.mem_consolidation_reader_weight.to_string(),
            MEM_CONSOLIDATION_WRITER_WEIGHT => self.mem_consolidation_writer_weight.to_string(),
            QUERY_SPARSE_GLOBAL_ORDER_READER => self.sparse_global_order_reader.as_str().to_string(),
            MERGE_OVERLAPPING_RANGES => self.merge_overlapping_ranges.to_string(),
            IO_CONCURRENCY_LEVEL => self.io_concurrency_level.to_string(),
            _ => return None,
        };
        Some(value)
    }

    /// Every recognized key.
    pub fn keys() -> &'static [&'static str] {
        ALL_KEYS
    }

    /// Check cross-option constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consolidation_step_min_frags > self.consolidation_step_max_frags {
            return Err(ConfigError::Inconsistent(
                "step_min_frags must not exceed step_max_frags",
            ));
        }
        if !(0.0..=1.0).contains(&self.consolidation_step_size_ratio) {
            return Err(ConfigError::Inconsistent("step_size_ratio must be in [0, 1]"));
        }
        if !(self.mem_reader_ratio_coords > 0.0 && self.mem_reader_ratio_coords <= 1.0) {
            return Err(ConfigError::Inconsistent("ratio_coords must be in (0, 1]"));
        }
        if self.weight_sum() == 0 {
            return Err(ConfigError::Inconsistent("consolidation weights are all zero"));
        }
        if self.consolidation_timestamp_start > self.consolidation_timestamp_end {
            return Err(ConfigError::Inconsistent(
                "consolidation timestamp_start exceeds timestamp_end",
            ));
        }
        if self.io_concurrency_level == 0 {
            return Err(ConfigError::Inconsistent("io_concurrency_level must be at least 1"));
        }
        Ok(())
    }

    /// Set the consolidation window.
    #[must_use]
    pub fn with_consolidation_window(mut self, start: u64, end: u64) -> Self {
        self.consolidation_timestamp_start = start;
        self.consolidation_timestamp_end = end;
        self
    }

    /// Set the total memory budget.
    #[must_use]
    pub fn with_total_budget(mut self, bytes: u64) -> Self {
        self.mem_total_budget = bytes;
        self
    }

    /// Set the reader tile share.
    #[must_use]
    pub fn with_ratio_coords(mut self, ratio: f64) -> Self {
        self.mem_reader_ratio_coords = ratio;
        self
    }

    /// Set an explicit per-field consolidation buffer size.
    #[must_use]
    pub fn with_buffer_size(mut self, bytes: u64) -> Self {
        self.consolidation_buffer_size = bytes;
        self
    }

    /// Set the step limits for multi-step consolidation.
    #[must_use]
    pub fn with_steps(mut self, steps: u32, min_frags: u32, max_frags: u32, size_ratio: f64) -> Self {
        self.consolidation_steps = steps;
        self.consolidation_step_min_frags = min_frags;
        self.consolidation_step_max_frags = max_frags;
        self.consolidation_step_size_ratio = size_ratio;
        self
    }

    /// Select the global-order reader variant.
    #[must_use]
    pub fn with_reader_variant(mut self, variant: ReaderVariant) -> Self {
        self.sparse_global_order_reader = variant;
        self
    }

    /// Consolidation window as a [`TimestampRange`].
    pub fn consolidation_window(&self) -> TimestampRange {
        TimestampRange::new(self.consolidation_timestamp_start, self.consolidation_timestamp_end)
    }

    /// Bytes of loaded tiles the global-order reader may hold across all fragments.
    pub fn reader_tile_budget(&self) -> u64 {
        (self.mem_total_budget as f64 * self.mem_reader_ratio_coords) as u64
    }

    fn weight_sum(&self) -> u64 {
        self.mem_consolidation_buffers_weight
            + self.mem_consolidation_reader_weight
            + self.mem_consolidation_writer_weight
    }

    fn weighted_share(&self, weight: u64) -> u64 {
        let sum = self.weight_sum().max(1);
        ((self.mem_total_budget as u128 * weight as u128) / sum as u128) as u64
    }

    /// Budget partition for consolidation copy buffers.
    pub fn consolidation_buffers_budget(&self) -> u64 {
        self.weighted_share(self.mem_consolidation_buffers_weight)
    }

    /// Budget partition for the consolidation read side.
    pub fn consolidation_reader_budget(&self) -> u64 {
        self.weighted_share(self.mem_consolidation_reader_weight)
    }

    /// Budget partition for the consolidation write side.
    pub fn consolidation_writer_budget(&self) -> u64 {
        self.weighted_share(self.mem_consolidation_writer_weight)
    }
}
