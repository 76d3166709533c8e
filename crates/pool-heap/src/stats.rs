//! Diagnostic counters.
//!
//! Releases of null or foreign pointers are not errors for the caller, but
//! they usually point at a bug elsewhere in the firmware. They are counted
//! here so they stay observable.

/// Event counters since the last initialization.
///
/// Counters saturate instead of wrapping.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Successful allocations.
    pub allocations: u64,
    /// Successful releases.
    pub releases: u64,
    /// Allocation requests that returned no block.
    pub failed_allocations: u64,
    /// Allocations served by a larger class than the ideal one.
    pub escalations: u64,
    /// Releases of a null pointer (ignored).
    pub null_releases: u64,
    /// Releases of a pointer outside the heap (ignored).
    pub out_of_range_releases: u64,
    /// Releases of a pointer inside the heap but not at a block start
    /// (rejected).
    pub misaligned_releases: u64,
    /// Releases of a block that was already free (rejected).
    pub double_frees: u64,
}

impl HeapStats {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocations: 0,
            releases: 0,
            failed_allocations: 0,
            escalations: 0,
            null_releases: 0,
            out_of_range_releases: 0,
            misaligned_releases: 0,
            double_frees: 0,
        }
    }

    pub(crate) fn bump(counter: &mut u64) {
        *counter = counter.saturating_add(1);
    }

    /// Releases that were ignored or rejected.
    #[must_use]
    pub fn bad_releases(&self) -> u64 {
        self.null_releases
            .saturating_add(self.out_of_range_releases)
            .saturating_add(self.misaligned_releases)
            .saturating_add(self.double_frees)
    }
}

/// Occupancy of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolUsage {
    pub block_size: usize,
    pub block_count: usize,
    pub free: usize,
}

impl PoolUsage {
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.block_count - self.free
    }
}
