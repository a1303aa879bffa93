use std::sync::{LazyLock, Mutex};

use ulid::{Generator, Ulid};

/// Identifier embedded in fragment, schema and metadata file names.
pub type FragmentId = Ulid;

/// Thread-safe ULID generator.
///
/// ULIDs produced by one generator sort lexicographically in generation order,
/// which is the tie-break between fragments sharing a timestamp range.
pub struct FragmentIdGenerator {
    inner: Mutex<Generator>,
}

impl FragmentIdGenerator {
    /// Create a new generator seeded with the current time.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Generator::new()),
        }
    }

    /// Produce the next [`FragmentId`] in a monotonic, time-ordered sequence.
    pub fn generate(&self) -> FragmentId {
        let mut guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Random-part overflow within one millisecond: fall back to a fresh ULID,
        // which still sorts after everything generated in earlier milliseconds.
        guard.generate().unwrap_or_else(|_| Ulid::new())
    }
}

impl Default for FragmentIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

static PROCESS_GENERATOR: LazyLock<FragmentIdGenerator> = LazyLock::new(FragmentIdGenerator::new);

/// Next id from the process-wide generator shared by every array handle.
pub(crate) fn next_fragment_id() -> FragmentId {
    PROCESS_GENERATOR.generate()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_sort_in_generation_order() {
        let generator = FragmentIdGenerator::new();
        let ids: Vec<String> = (0..64).map(|_| generator.generate().to_string()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
