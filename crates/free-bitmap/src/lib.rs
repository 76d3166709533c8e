//! A fixed-capacity bitmap recording the free/allocated state of blocks.
//!
//! `FreeBitmap` packs one bit per block, eight blocks per storage byte. A set
//! bit means the block is **free**; a cleared bit means it is **allocated**.
//! Bit `k` lives in byte `k / 8` at bit position `k % 8`.
//!
//! The storage size is a const generic so the bitmap can be embedded in a
//! statically allocated heap context without any dynamic memory. Only the
//! first [`len`](FreeBitmap::len) bits are tracked; bits past the tracked
//! length are kept cleared.
//!
//! # Examples
//!
//! ```
//! use free_bitmap::FreeBitmap;
//!
//! let mut map = FreeBitmap::<2>::new();
//! map.fill_free(10);
//!
//! assert_eq!(map.is_free(3), Some(true));
//! assert!(map.mark_allocated(3));
//! assert_eq!(map.is_free(3), Some(false));
//! assert_eq!(map.count_free(0..10), 9);
//!
//! // out-of-range indices are not tracked
//! assert_eq!(map.is_free(10), None);
//! ```
//!
//! # Performance
//!
//! - Query/update: O(1)
//! - Counting free blocks in a range: O(range length / 8)

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use core::ops::Range;

/// Number of storage bytes required to track `blocks` blocks.
///
/// # Examples
///
/// ```
/// assert_eq!(free_bitmap::bytes_for(0), 0);
/// assert_eq!(free_bitmap::bytes_for(8), 1);
/// assert_eq!(free_bitmap::bytes_for(9), 2);
/// ```
#[must_use]
pub const fn bytes_for(blocks: usize) -> usize {
    blocks.div_ceil(8)
}

/// A packed free/allocated bitmap with `BYTES` bytes of storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeBitmap<const BYTES: usize> {
    bits: [u8; BYTES],
    len: usize,
}

impl<const BYTES: usize> Default for FreeBitmap<BYTES> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const BYTES: usize> FreeBitmap<BYTES> {
    /// Maximum number of blocks this bitmap can track.
    pub const CAPACITY: usize = BYTES * 8;

    /// Creates a bitmap tracking no blocks.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bits: [0; BYTES],
            len: 0,
        }
    }

    /// Returns the number of tracked blocks.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no blocks are tracked.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Starts tracking `len` blocks and marks all of them free.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [`CAPACITY`](Self::CAPACITY).
    pub fn fill_free(&mut self, len: usize) {
        assert!(
            len <= Self::CAPACITY,
            "bitmap of {BYTES} bytes cannot track {len} blocks"
        );
        self.bits = [0; BYTES];
        let full = len / 8;
        self.bits[..full].fill(u8::MAX);
        let rest = len % 8;
        if rest != 0 {
            self.bits[full] = (1 << rest) - 1;
        }
        self.len = len;
    }

    /// Starts tracking `len` blocks and marks all of them allocated.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [`CAPACITY`](Self::CAPACITY).
    pub fn fill_allocated(&mut self, len: usize) {
        assert!(
            len <= Self::CAPACITY,
            "bitmap of {BYTES} bytes cannot track {len} blocks"
        );
        self.bits = [0; BYTES];
        self.len = len;
    }

    /// Returns whether block `index` is free, or `None` if it is not tracked.
    #[must_use]
    pub fn is_free(&self, index: usize) -> Option<bool> {
        (index < self.len).then(|| self.bits[index / 8] & bit(index) != 0)
    }

    /// Marks block `index` free and returns whether it was already free.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not tracked.
    pub fn mark_free(&mut self, index: usize) -> bool {
        let was_free = self.lookup(index);
        self.bits[index / 8] |= bit(index);
        was_free
    }

    /// Marks block `index` allocated and returns whether it was free before.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not tracked.
    pub fn mark_allocated(&mut self, index: usize) -> bool {
        let was_free = self.lookup(index);
        self.bits[index / 8] &= !bit(index);
        was_free
    }

    /// Counts the free blocks whose index lies in `range`.
    ///
    /// The range is clamped to the tracked length.
    #[must_use]
    pub fn count_free(&self, range: Range<usize>) -> usize {
        let end = range.end.min(self.len);
        let mut index = range.start;
        let mut count = 0;
        while index < end {
            if index.is_multiple_of(8) && index + 8 <= end {
                count += self.bits[index / 8].count_ones() as usize;
                index += 8;
            } else {
                if self.bits[index / 8] & bit(index) != 0 {
                    count += 1;
                }
                index += 1;
            }
        }
        count
    }

    /// Returns an iterator over the indices of all free blocks, in ascending
    /// order.
    pub fn free_indices(&self) -> FreeIndices<'_, BYTES> {
        FreeIndices {
            map: self,
            next: 0,
        }
    }

    #[cfg(test)]
    fn as_bytes(&self) -> &[u8; BYTES] {
        &self.bits
    }

    fn lookup(&self, index: usize) -> bool {
        match self.is_free(index) {
            Some(free) => free,
            None => panic!("block index {index} out of range (len {})", self.len),
        }
    }
}

const fn bit(index: usize) -> u8 {
    1 << (index % 8)
}

/// Iterator over the free block indices of a [`FreeBitmap`].
///
/// Created by [`FreeBitmap::free_indices`].
#[derive(Debug, Clone)]
pub struct FreeIndices<'a, const BYTES: usize> {
    map: &'a FreeBitmap<BYTES>,
    next: usize,
}

impl<const BYTES: usize> Iterator for FreeIndices<'_, BYTES> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < self.map.len {
            let index = self.next;
            // whole empty bytes are skipped at once
            if index.is_multiple_of(8) && self.map.bits[index / 8] == 0 {
                self.next += 8;
                continue;
            }
            self.next += 1;
            if self.map.bits[index / 8] & bit(index) != 0 {
                return Some(index);
            }
        }
        None
    }
}
