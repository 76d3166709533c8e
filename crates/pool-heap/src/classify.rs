//! Maps addresses to the pool and block that own them.
//!
//! At initialization the heap records, for every pool, the byte offset range
//! it occupies and the global index of its first block. Classifying an
//! address is then a binary search over the pools followed by one division,
//! independent of how many blocks the pools hold.

use core::ops::Range;

use snafu::ensure;

use crate::{
    error::{ClassifyError, MisalignedSnafu, OutOfRangeSnafu},
    layout::PoolLayout,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PoolSpan {
    /// Offset of the first byte from the heap base.
    start: usize,
    /// Offset one past the last byte.
    end: usize,
    block_size: usize,
    /// Global index of the first block.
    first_index: usize,
}

impl PoolSpan {
    const EMPTY: Self = Self {
        start: 0,
        end: 0,
        block_size: 0,
        first_index: 0,
    };
}

/// Where a block lives in the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLocation {
    /// Address of the block.
    pub addr: usize,
    /// Index of the owning pool.
    pub pool: usize,
    /// Index of the block within its pool.
    pub index_in_pool: usize,
    /// Rank of the block among all blocks of all pools, in address order.
    pub global_index: usize,
}

/// Precomputed offset table of a heap region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolMap<const N: usize> {
    base: usize,
    size: usize,
    spans: [PoolSpan; N],
}

impl<const N: usize> PoolMap<N> {
    /// A map of a heap that has not been placed yet: every address is out of
    /// range.
    pub(crate) const fn unplaced() -> Self {
        Self {
            base: 0,
            size: 0,
            spans: [PoolSpan::EMPTY; N],
        }
    }

    /// Builds the table for a heap at `base`.
    ///
    /// `layout` must have passed [`PoolLayout::validate`].
    pub(crate) fn new(base: usize, layout: &PoolLayout<N>) -> Self {
        let mut spans = [PoolSpan::EMPTY; N];
        let mut offset = 0;
        let mut first_index = 0;
        for (span, class) in spans.iter_mut().zip(layout.classes()) {
            let bytes = class.block_size() * class.block_count();
            *span = PoolSpan {
                start: offset,
                end: offset + bytes,
                block_size: class.block_size(),
                first_index,
            };
            offset += bytes;
            first_index += class.block_count();
        }
        Self {
            base,
            size: layout.total_size(),
            spans,
        }
    }

    /// Address range covered by the heap.
    #[must_use]
    pub fn heap_range(&self) -> Range<usize> {
        self.base..self.base + self.size
    }

    /// Address range covered by pool `pool`.
    #[must_use]
    pub fn pool_range(&self, pool: usize) -> Option<Range<usize>> {
        let span = self.spans.get(pool)?;
        Some(self.base + span.start..self.base + span.end)
    }

    /// Global block indices belonging to pool `pool`.
    pub(crate) fn index_range(&self, pool: usize) -> Range<usize> {
        let span = &self.spans[pool];
        let count = (span.end - span.start) / span.block_size;
        span.first_index..span.first_index + count
    }

    /// Global index of `addr`, known to be a block start in `pool`.
    pub(crate) fn global_index(&self, pool: usize, addr: usize) -> usize {
        let span = &self.spans[pool];
        span.first_index + (addr - self.base - span.start) / span.block_size
    }

    /// Resolves `addr` to the block starting there.
    pub fn classify(&self, addr: usize) -> Result<BlockLocation, ClassifyError> {
        ensure!(
            addr >= self.base && addr - self.base < self.size,
            OutOfRangeSnafu { addr }
        );
        let offset = addr - self.base;

        let pool = self.spans.partition_point(|span| span.end <= offset);
        let Some(span) = self.spans.get(pool) else {
            return OutOfRangeSnafu { addr }.fail();
        };

        let within = offset - span.start;
        ensure!(
            within.is_multiple_of(span.block_size),
            MisalignedSnafu { addr, pool }
        );
        let index_in_pool = within / span.block_size;

        Ok(BlockLocation {
            addr,
            pool,
            index_in_pool,
            global_index: span.first_index + index_in_pool,
        })
    }
}
